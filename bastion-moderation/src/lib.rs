//! Bastion Moderation - Escalation Ledger
//!
//! Progressive discipline on top of bastion-storage tables:
//! - Strike rows with short ids derived from audit-log messages
//! - Mute ladder arithmetic
//! - Warn workflow with mute and ban escalation
//! - Strike lookup, removal and history

pub mod gateway;
pub mod ladder;
pub mod ledger;
pub mod strike;
pub mod strike_id;

pub use gateway::{Attribution, AuditEntry, ModerationGateway, TargetCapabilities};
pub use ladder::{
    added_mute_hours, crosses_last_rung, exceeds_ban_threshold, mute_hours, mute_rung,
    normalize_weight, MIN_STRIKE_WEIGHT,
};
pub use ledger::{Escalation, EscalationLedger, StrikeEntry, WarnOutcome, STRIKE_TABLE};
pub use strike::Strike;
