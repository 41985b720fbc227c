//! Configuration types
//!
//! Configuration is loaded from environment variables with defaults that
//! match the reference moderation setup.

use crate::{BastionError, BastionResult, ChannelId, ConfigError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default delay after the last mutation before a table is written.
pub const DEFAULT_WRITE_QUIESCENCE_MS: u64 = 15_000;

/// Default number of recent admin-thread messages scanned for anchors.
pub const DEFAULT_BOOTSTRAP_SCAN_LIMIT: usize = 100;

/// Default strikes needed per mute rung.
pub const DEFAULT_STRIKES_PER_MUTE: u32 = 3;

/// Default mute-length ladder, in hours.
pub const DEFAULT_MUTE_LADDER_HOURS: [u64; 3] = [6, 12, 24];

/// Default age after which a strike stops counting toward totals.
pub const DEFAULT_STRIKE_EXPIRY_DAYS: u64 = 90;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

// ============================================================================
// STORAGE CONFIGURATION
// ============================================================================

/// Settings for the chat-hosted table storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Bot name written into every anchor header.
    pub bot_name: String,
    /// Thread holding one anchor message per table.
    pub admin_thread_id: ChannelId,
    /// Quiescence window for coalesced writes.
    pub quiescence: Duration,
    /// How many recent messages to scan when looking for an existing anchor.
    pub bootstrap_scan_limit: usize,
    /// File extension of the table attachment.
    pub attachment_extension: String,
}

impl StorageConfig {
    /// Create a storage config with default timings.
    pub fn new(bot_name: impl Into<String>, admin_thread_id: ChannelId) -> Self {
        Self {
            bot_name: bot_name.into(),
            admin_thread_id,
            quiescence: Duration::from_millis(DEFAULT_WRITE_QUIESCENCE_MS),
            bootstrap_scan_limit: DEFAULT_BOOTSTRAP_SCAN_LIMIT,
            attachment_extension: "csv".to_string(),
        }
    }

    /// Override the quiescence window.
    pub fn with_quiescence(mut self, quiescence: Duration) -> Self {
        self.quiescence = quiescence;
        self
    }

    /// Override the bootstrap scan limit.
    pub fn with_scan_limit(mut self, limit: usize) -> Self {
        self.bootstrap_scan_limit = limit;
        self
    }

    /// Create StorageConfig from environment variables.
    ///
    /// Environment variables:
    /// - `BASTION_BOT_NAME`: Name in anchor headers (default: "BASTION")
    /// - `BASTION_ADMIN_THREAD_ID`: Administrative thread id (required)
    /// - `BASTION_WRITE_QUIESCENCE_MS`: Write debounce window (default: 15000)
    /// - `BASTION_BOOTSTRAP_SCAN_LIMIT`: Messages scanned for anchors (default: 100)
    pub fn from_env() -> BastionResult<Self> {
        let bot_name =
            std::env::var("BASTION_BOT_NAME").unwrap_or_else(|_| "BASTION".to_string());

        let raw_thread = std::env::var("BASTION_ADMIN_THREAD_ID").map_err(|_| {
            ConfigError::MissingRequired {
                field: "BASTION_ADMIN_THREAD_ID".to_string(),
            }
        })?;
        let admin_thread_id = parse_field("BASTION_ADMIN_THREAD_ID", &raw_thread)?;

        let quiescence = Duration::from_millis(env_or(
            "BASTION_WRITE_QUIESCENCE_MS",
            DEFAULT_WRITE_QUIESCENCE_MS,
        )?);
        let bootstrap_scan_limit =
            env_or("BASTION_BOOTSTRAP_SCAN_LIMIT", DEFAULT_BOOTSTRAP_SCAN_LIMIT)?;

        let config = Self {
            bot_name,
            admin_thread_id,
            quiescence,
            bootstrap_scan_limit,
            attachment_extension: "csv".to_string(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> BastionResult<()> {
        if self.bot_name.trim().is_empty() {
            return Err(invalid("bot_name", &self.bot_name, "must not be empty"));
        }
        if self.bot_name.contains('\n') {
            return Err(invalid("bot_name", &self.bot_name, "must be a single line"));
        }
        if self.admin_thread_id == 0 {
            return Err(invalid("admin_thread_id", "0", "must be a real snowflake"));
        }
        if self.bootstrap_scan_limit == 0 {
            return Err(invalid("bootstrap_scan_limit", "0", "must be positive"));
        }
        if self.attachment_extension.is_empty() || self.attachment_extension.contains('.') {
            return Err(invalid(
                "attachment_extension",
                &self.attachment_extension,
                "must be a bare extension",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// ESCALATION POLICY
// ============================================================================

/// Progressive-discipline thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationPolicy {
    /// Strikes per mute rung.
    pub strikes_per_mute: u32,
    /// Additional mute length for each rung, in hours.
    pub mute_ladder_hours: Vec<u64>,
    /// Strikes older than this no longer count toward totals.
    pub strike_expiry: Duration,
    /// Production mode disables the baseline-role safety guard on bans.
    pub production: bool,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            strikes_per_mute: DEFAULT_STRIKES_PER_MUTE,
            mute_ladder_hours: DEFAULT_MUTE_LADDER_HOURS.to_vec(),
            strike_expiry: Duration::from_secs(DEFAULT_STRIKE_EXPIRY_DAYS * SECS_PER_DAY),
            production: false,
        }
    }
}

impl EscalationPolicy {
    /// Create EscalationPolicy from environment variables.
    ///
    /// Environment variables:
    /// - `BASTION_STRIKES_PER_MUTE`: Strikes per mute rung (default: 3)
    /// - `BASTION_MUTE_LADDER_HOURS`: Comma-separated ladder (default: "6,12,24")
    /// - `BASTION_STRIKE_EXPIRY_DAYS`: Strike expiry window (default: 90)
    /// - `BASTION_ENV`: "production" enables production mode
    pub fn from_env() -> BastionResult<Self> {
        let strikes_per_mute = env_or("BASTION_STRIKES_PER_MUTE", DEFAULT_STRIKES_PER_MUTE)?;

        let mute_ladder_hours = match std::env::var("BASTION_MUTE_LADDER_HOURS") {
            Ok(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| parse_field("BASTION_MUTE_LADDER_HOURS", s))
                .collect::<BastionResult<Vec<u64>>>()?,
            Err(_) => DEFAULT_MUTE_LADDER_HOURS.to_vec(),
        };

        let expiry_days = env_or("BASTION_STRIKE_EXPIRY_DAYS", DEFAULT_STRIKE_EXPIRY_DAYS)?;
        let strike_expiry = expiry_from_days("BASTION_STRIKE_EXPIRY_DAYS", expiry_days)?;

        let production = std::env::var("BASTION_ENV")
            .map(|s| s.eq_ignore_ascii_case("production"))
            .unwrap_or(false);

        let policy = Self {
            strikes_per_mute,
            mute_ladder_hours,
            strike_expiry,
            production,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Validate the policy.
    pub fn validate(&self) -> BastionResult<()> {
        if self.strikes_per_mute == 0 {
            return Err(invalid("strikes_per_mute", "0", "must be positive"));
        }
        if self.mute_ladder_hours.is_empty() {
            return Err(invalid("mute_ladder_hours", "[]", "must have at least one rung"));
        }
        if self.strike_expiry.is_zero() {
            return Err(invalid("strike_expiry", "0", "must be positive"));
        }
        Ok(())
    }

    /// Total above which a member is banned instead of muted.
    pub fn ban_threshold(&self) -> u64 {
        self.mute_ladder_hours.len() as u64 * u64::from(self.strikes_per_mute) + 1
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> BastionResult<T> {
    match std::env::var(key) {
        Ok(raw) => parse_field(key, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_field<T: std::str::FromStr>(field: &str, raw: &str) -> BastionResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| invalid(field, raw, "not a valid number"))
}

fn expiry_from_days(field: &str, days: u64) -> BastionResult<Duration> {
    days.checked_mul(SECS_PER_DAY)
        .map(Duration::from_secs)
        .ok_or_else(|| invalid(field, &days.to_string(), "too many days"))
}

fn invalid(field: &str, value: &str, reason: &str) -> BastionError {
    BastionError::Config(ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    })
}
