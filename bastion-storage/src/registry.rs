//! Table registry.
//!
//! Process-wide set of table names owned by one [`crate::Database`]. Names
//! are reserved before any network activity and stay reserved for the life
//! of the database, even when initialization fails.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use bastion_core::TableError;

use crate::lock;

/// Check that a table name is usable as an anchor header and attachment
/// filename: non-empty, lowercase ASCII letters, digits, `_` and `-`.
pub fn validate_table_name(name: &str) -> Result<(), TableError> {
    let invalid = |reason: &str| TableError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-'))
    {
        return Err(invalid(&format!("unsupported character {:?}", c)));
    }
    Ok(())
}

/// Reserved table names.
#[derive(Debug, Default)]
pub struct TableRegistry {
    names: Mutex<HashSet<String>>,
    closed: AtomicBool,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `name`. Fails on an invalid name, a name already reserved, or
    /// once the registry is closed.
    pub fn register(&self, name: &str) -> Result<(), TableError> {
        validate_table_name(name)?;
        if self.closed.load(Ordering::Acquire) {
            return Err(TableError::ShuttingDown {
                name: name.to_string(),
            });
        }
        if !lock(&self.names).insert(name.to_string()) {
            return Err(TableError::Duplicate {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        lock(&self.names).contains(name)
    }

    /// Reserved names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.names).iter().cloned().collect();
        names.sort();
        names
    }

    /// Refuse any further registrations.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
