//! Bastion Core - Shared Types
//!
//! Identifiers, the error taxonomy and configuration shared by the storage
//! engine and the moderation ledger.

pub mod config;
pub mod error;
pub mod identity;

pub use config::{
    EscalationPolicy, StorageConfig, DEFAULT_BOOTSTRAP_SCAN_LIMIT, DEFAULT_MUTE_LADDER_HOURS,
    DEFAULT_STRIKES_PER_MUTE, DEFAULT_STRIKE_EXPIRY_DAYS, DEFAULT_WRITE_QUIESCENCE_MS,
};
pub use error::{
    BastionError, BastionResult, CodecError, ConfigError, ModerationError, PersistError,
    TableError, TransportError,
};
pub use identity::{
    snowflake_timestamp, ChannelId, MessageId, Snowflake, Timestamp, UserId, SNOWFLAKE_EPOCH_MS,
};
