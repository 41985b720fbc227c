//! Strike rows.

use bastion_core::{CodecError, MessageId, Timestamp, UserId};
use bastion_storage::{Column, ColumnKind, Record, RowValues, Value};
use chrono::{Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::strike_id;

/// One recorded warning against a user.
///
/// Strikes are never deleted; removal only sets `removed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strike {
    pub user: UserId,
    /// Short id derived from the audit-log message id.
    pub id: String,
    pub time: Timestamp,
    /// Weight in quarter steps, at least 0.25.
    pub count: f64,
    pub removed: bool,
}

impl Strike {
    /// Build a strike from the audit-log message that recorded it.
    pub fn new(user: UserId, audit_message: MessageId, time: Timestamp, count: f64) -> Self {
        Self {
            user,
            id: strike_id::encode(audit_message),
            time,
            count,
            removed: false,
        }
    }

    /// The audit-log message id this strike was derived from.
    pub fn audit_message_id(&self) -> Option<MessageId> {
        strike_id::decode(&self.id)
    }

    /// Less than a full strike.
    pub fn is_verbal(&self) -> bool {
        self.count < 1.0
    }

    /// Older than the expiry window at `now`.
    pub fn is_expired(&self, now: Timestamp, expiry: Duration) -> bool {
        now - self.time > expiry
    }

    /// Counts toward the user's running total at `now`.
    pub fn is_active(&self, now: Timestamp, expiry: Duration) -> bool {
        !self.removed && !self.is_expired(now, expiry)
    }
}

impl Record for Strike {
    const COLUMNS: &'static [Column] = &[
        Column::required("user", ColumnKind::Id),
        Column::required("id", ColumnKind::Text),
        Column::required("time", ColumnKind::Integer),
        Column::required("count", ColumnKind::Float),
        Column::required("removed", ColumnKind::Boolean),
    ];

    fn to_values(&self) -> Vec<Value> {
        vec![
            Value::Id(self.user),
            self.id.clone().into(),
            self.time.timestamp_millis().into(),
            self.count.into(),
            self.removed.into(),
        ]
    }

    fn from_values(row: RowValues<'_>) -> Result<Self, CodecError> {
        let millis = row.integer("time")?;
        let time = Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| CodecError::InvalidValue {
                column: "time".to_string(),
                value: millis.to_string(),
                reason: "timestamp out of range".to_string(),
            })?;
        Ok(Self {
            user: row.id("user")?,
            id: row.text("id")?,
            time,
            count: row.float("count")?,
            removed: row.boolean("removed")?,
        })
    }
}
