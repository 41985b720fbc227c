//! Identity types for chat-platform entities

use chrono::{DateTime, TimeZone, Utc};

/// Platform snowflake identifier (users, channels, threads, messages).
pub type Snowflake = u64;

/// Identifier of a guild member.
pub type UserId = Snowflake;

/// Identifier of a message.
pub type MessageId = Snowflake;

/// Identifier of a channel or thread.
pub type ChannelId = Snowflake;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Milliseconds between the Unix epoch and the platform snowflake epoch (2015-01-01).
pub const SNOWFLAKE_EPOCH_MS: i64 = 1_420_070_400_000;

/// Extract the creation time embedded in a snowflake.
pub fn snowflake_timestamp(id: Snowflake) -> Timestamp {
    let millis = (id >> 22) as i64 + SNOWFLAKE_EPOCH_MS;
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
