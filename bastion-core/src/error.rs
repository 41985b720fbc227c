//! Error types for Bastion operations

use crate::UserId;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Errors reported by the chat-platform transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The target (message, thread, attachment) no longer exists.
    #[error("Remote {what} not found")]
    NotFound { what: String },

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Missing permission for {action}")]
    PermissionDenied { action: String },

    #[error("Network failure: {reason}")]
    Network { reason: String },

    #[error("Transport error: {reason}")]
    Other { reason: String },
}

impl TransportError {
    /// Whether this error means the addressed object was destroyed.
    pub fn is_not_found(&self) -> bool {
        matches!(self, TransportError::NotFound { .. })
    }
}

/// Row codec errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Attachment is missing required column {column}")]
    MissingColumn { column: String },

    #[error("Invalid value for column {column}: {value:?} - {reason}")]
    InvalidValue {
        column: String,
        value: String,
        reason: String,
    },

    #[error("Unterminated quoted field starting on line {line}")]
    UnterminatedQuote { line: usize },

    #[error("Line {line} has {got} fields, header has {expected}")]
    RowWidth {
        line: usize,
        expected: usize,
        got: usize,
    },

    #[error("Attachment is not valid UTF-8")]
    InvalidUtf8,
}

/// Table lifecycle errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TableError {
    /// A second table was constructed under an already registered name.
    #[error("Table {name} is already registered in this process")]
    Duplicate { name: String },

    #[error("Invalid table name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    /// Data or extra was accessed before `init`.
    #[error("Table {name} accessed before init")]
    NotInitialized { name: String },

    #[error("Failed to initialize table {name}: {reason}")]
    Initialization { name: String, reason: String },

    /// The administrative thread cannot be resolved; persistence cannot run.
    #[error("Administrative thread {thread_id} unavailable: {reason}")]
    AdminThreadUnavailable { thread_id: u64, reason: String },

    #[error("Database is shutting down, cannot register table {name}")]
    ShuttingDown { name: String },
}

/// Errors raised while persisting a table snapshot.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PersistError {
    /// The anchor vanished again after it had already been recreated once.
    #[error("Anchor for table {table} missing after recreation")]
    AnchorMissing { table: String },

    /// The persisted bytes differ from what was written.
    #[error(
        "Write verification failed for table {table}: intended {} bytes, observed {} bytes",
        payload_len(.intended),
        payload_len(.observed)
    )]
    Verification {
        table: String,
        intended: Option<Vec<u8>>,
        observed: Option<Vec<u8>>,
    },

    #[error("Transport failure while persisting table {table}: {source}")]
    Transport {
        table: String,
        #[source]
        source: TransportError,
    },

    #[error("Failed to encode table {table}: {source}")]
    Codec {
        table: String,
        #[source]
        source: CodecError,
    },
}

fn payload_len(payload: &Option<Vec<u8>>) -> usize {
    payload.as_ref().map_or(0, Vec::len)
}

impl PersistError {
    /// Name of the table whose write failed.
    pub fn table(&self) -> &str {
        match self {
            PersistError::AnchorMissing { table }
            | PersistError::Verification { table, .. }
            | PersistError::Transport { table, .. }
            | PersistError::Codec { table, .. } => table,
        }
    }
}

/// Moderation workflow errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModerationError {
    #[error("Missing permission to {action} user {user_id}")]
    PermissionDenied { action: String, user_id: UserId },

    #[error("No strike matches {query}")]
    StrikeNotFound { query: String },

    #[error("Moderation gateway error: {reason}")]
    Gateway { reason: String },
}

/// Master error type for all Bastion errors.
#[derive(Debug, Clone, Error)]
pub enum BastionError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Table error: {0}")]
    Table(#[from] TableError),

    #[error("Persist error: {0}")]
    Persist(#[from] PersistError),

    #[error("Moderation error: {0}")]
    Moderation(#[from] ModerationError),
}

/// Result type alias for Bastion operations.
pub type BastionResult<T> = Result<T, BastionError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_not_found_classification() {
        let err = TransportError::NotFound {
            what: "message".to_string(),
        };
        assert!(err.is_not_found());
        assert!(!TransportError::RateLimited { retry_after_ms: 10 }.is_not_found());
    }

    #[test]
    fn test_verification_error_display_reports_both_sizes() {
        let err = PersistError::Verification {
            table: "xp".to_string(),
            intended: Some(b"user,xp\n1,5\n".to_vec()),
            observed: None,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("xp"));
        assert!(msg.contains("intended 12 bytes"));
        assert!(msg.contains("observed 0 bytes"));
        assert_eq!(err.table(), "xp");
    }

    #[test]
    fn test_table_error_display_duplicate() {
        let err = TableError::Duplicate {
            name: "strikes".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("strikes"));
        assert!(msg.contains("already registered"));
    }

    #[test]
    fn test_codec_error_display_row_width() {
        let err = CodecError::RowWidth {
            line: 3,
            expected: 2,
            got: 4,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Line 3"));
        assert!(msg.contains("4 fields"));
    }

    #[test]
    fn test_bastion_error_from_variants() {
        let config = BastionError::from(ConfigError::MissingRequired {
            field: "admin_thread_id".to_string(),
        });
        assert!(matches!(config, BastionError::Config(_)));

        let transport = BastionError::from(TransportError::Network {
            reason: "reset".to_string(),
        });
        assert!(matches!(transport, BastionError::Transport(_)));

        let table = BastionError::from(TableError::NotInitialized {
            name: "xp".to_string(),
        });
        assert!(matches!(table, BastionError::Table(_)));

        let persist = BastionError::from(PersistError::AnchorMissing {
            table: "xp".to_string(),
        });
        assert!(matches!(persist, BastionError::Persist(_)));

        let moderation = BastionError::from(ModerationError::StrikeNotFound {
            query: "zz".to_string(),
        });
        assert!(matches!(moderation, BastionError::Moderation(_)));
    }
}
