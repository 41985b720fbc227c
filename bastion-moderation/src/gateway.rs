//! Moderation side effects consumed from the chat platform.

use std::fmt;

use async_trait::async_trait;
use bastion_core::{MessageId, ModerationError, Timestamp, UserId};
use serde::{Deserialize, Serialize};

/// Who issued a warning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Attribution {
    /// A moderator acting by hand.
    Moderator(UserId),
    /// An automated source, e.g. "automod: spam filter".
    Context(String),
}

impl fmt::Display for Attribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attribution::Moderator(id) => write!(f, "<@{}>", id),
            Attribution::Context(text) => f.write_str(text),
        }
    }
}

/// Audit-log entry describing a new strike.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub user: UserId,
    pub reason: String,
    /// Normalized strike weight.
    pub weight: f64,
    /// Active total including this strike.
    pub total: f64,
    pub attribution: Attribution,
}

/// What the bot may do to a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TargetCapabilities {
    /// The bot may ban the member.
    pub bannable: bool,
    /// The bot may time out the member.
    pub moderatable: bool,
    /// The member ranks above the baseline role.
    pub outranks_baseline_role: bool,
}

/// Platform operations the escalation ledger needs.
///
/// `apply_timeout` and `apply_ban` report missing permissions as
/// [`ModerationError::PermissionDenied`]; the ledger turns those into
/// moderation-log reports.
#[async_trait]
pub trait ModerationGateway: Send + Sync {
    /// Post an audit entry and return the id of the posted message.
    async fn post_audit_log(&self, entry: &AuditEntry) -> Result<MessageId, ModerationError>;

    /// Post a note to the moderation log.
    async fn post_mod_log(&self, text: &str) -> Result<(), ModerationError>;

    /// Direct-message a member.
    async fn send_dm(&self, user: UserId, text: &str) -> Result<(), ModerationError>;

    async fn capabilities(&self, user: UserId) -> Result<TargetCapabilities, ModerationError>;

    /// End of the member's current timeout, if one is active.
    async fn current_timeout(&self, user: UserId) -> Result<Option<Timestamp>, ModerationError>;

    async fn apply_timeout(
        &self,
        user: UserId,
        until: Timestamp,
        reason: &str,
    ) -> Result<(), ModerationError>;

    async fn apply_ban(&self, user: UserId, reason: &str) -> Result<(), ModerationError>;
}
