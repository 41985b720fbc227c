//! Escalation ledger: warnings, strikes and the mute/ban ladder.
//!
//! Nothing but the strike rows is persisted. A user's standing is recomputed
//! from the full strike table on every call, so removing or expiring a strike
//! immediately changes what the next warning does.

use std::sync::Arc;

use bastion_core::{
    snowflake_timestamp, BastionResult, EscalationPolicy, ModerationError, Timestamp, UserId,
};
use bastion_storage::{Database, Table};
use chrono::{TimeDelta, Utc};
use tracing::{debug, info, warn};

use crate::gateway::{Attribution, AuditEntry, ModerationGateway};
use crate::ladder::{
    added_mute_hours, crosses_last_rung, exceeds_ban_threshold, normalize_weight,
};
use crate::strike::Strike;
use crate::strike_id;

/// Name of the table holding strike rows.
pub const STRIKE_TABLE: &str = "strikes";

const FINAL_WARNING: &str =
    "This is your final warning. Any further strike may result in a permanent ban.";

// ============================================================================
// OUTCOMES
// ============================================================================

/// Side effect applied after a strike was recorded.
#[derive(Debug, Clone, PartialEq)]
pub enum Escalation {
    /// The total stayed within the current mute rung.
    None,
    /// A timeout of `added_hours` was applied on top of any running one.
    Muted { added_hours: u64, until: Timestamp },
    /// A mute was owed but could not be applied; reported to the mod log.
    MuteSkipped { added_hours: u64 },
    Banned,
    /// A ban was owed but was not applied; reported to the mod log.
    BanSkipped,
}

/// Result of a [`EscalationLedger::warn`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct WarnOutcome {
    pub strike: Strike,
    pub old_total: f64,
    pub new_total: f64,
    pub escalation: Escalation,
    pub final_warning_sent: bool,
    pub dm_delivered: bool,
}

/// A strike with its expiry state at the time of the query.
#[derive(Debug, Clone, PartialEq)]
pub struct StrikeEntry {
    pub strike: Strike,
    pub expired: bool,
}

// ============================================================================
// LEDGER
// ============================================================================

/// Records strikes and escalates users along the mute ladder.
pub struct EscalationLedger {
    strikes: Table<Strike>,
    gateway: Arc<dyn ModerationGateway>,
    policy: EscalationPolicy,
    expiry: TimeDelta,
}

impl EscalationLedger {
    pub fn new(
        strikes: Table<Strike>,
        gateway: Arc<dyn ModerationGateway>,
        policy: EscalationPolicy,
    ) -> Self {
        let expiry = TimeDelta::from_std(policy.strike_expiry).unwrap_or(TimeDelta::MAX);
        Self {
            strikes,
            gateway,
            policy,
            expiry,
        }
    }

    /// Validate the policy and open the strike table.
    pub async fn open(
        db: &Database,
        gateway: Arc<dyn ModerationGateway>,
        policy: EscalationPolicy,
    ) -> BastionResult<Self> {
        policy.validate()?;
        let strikes = db.open_table::<Strike>(STRIKE_TABLE).await?;
        Ok(Self::new(strikes, gateway, policy))
    }

    pub fn strikes(&self) -> &Table<Strike> {
        &self.strikes
    }

    pub fn policy(&self) -> &EscalationPolicy {
        &self.policy
    }

    /// Sum of the user's active strike weights.
    pub fn active_total(&self, user: UserId) -> f64 {
        self.total_at(user, Utc::now())
    }

    fn total_at(&self, user: UserId, now: Timestamp) -> f64 {
        self.strikes
            .data()
            .iter()
            .filter(|s| s.user == user && s.is_active(now, self.expiry))
            .map(|s| s.count)
            .sum()
    }

    /// Every strike ever recorded against the user, oldest first, including
    /// removed and expired ones.
    pub fn history(&self, user: UserId) -> Vec<StrikeEntry> {
        let now = Utc::now();
        self.strikes
            .data()
            .iter()
            .filter(|s| s.user == user)
            .map(|s| StrikeEntry {
                strike: s.clone(),
                expired: s.is_expired(now, self.expiry),
            })
            .collect()
    }

    /// Find a strike by its short id, or by the raw audit-log message id.
    pub fn filter_to_strike(&self, query: &str) -> Option<Strike> {
        let query = query.trim().to_ascii_lowercase();
        if query.is_empty() {
            return None;
        }
        let rows = self.strikes.data();
        if let Some(strike) = rows.iter().find(|s| s.id == query) {
            return Some(strike.clone());
        }
        if query.bytes().all(|b| b.is_ascii_digit()) {
            let short = strike_id::encode(query.parse::<u64>().ok()?);
            return rows.iter().find(|s| s.id == short).cloned();
        }
        None
    }

    /// Mark a strike removed. The row stays for auditing.
    pub fn remove_strike(&self, query: &str) -> Result<Strike, ModerationError> {
        let target = self
            .filter_to_strike(query)
            .ok_or_else(|| ModerationError::StrikeNotFound {
                query: query.to_string(),
            })?;

        self.strikes.update(|rows| {
            rows.iter()
                .cloned()
                .map(|mut strike| {
                    if strike.id == target.id {
                        strike.removed = true;
                    }
                    strike
                })
                .collect()
        });
        info!(user = target.user, strike_id = %target.id, "Removed strike");

        Ok(Strike {
            removed: true,
            ..target
        })
    }

    /// Record a warning and apply whatever mute or ban it earns.
    ///
    /// Missing permissions never fail the call: the strike is still recorded
    /// and the skipped action is reported to the moderation log.
    pub async fn warn(
        &self,
        user: UserId,
        reason: &str,
        weight: f64,
        attribution: Attribution,
    ) -> Result<WarnOutcome, ModerationError> {
        let now = Utc::now();
        let old_total = self.total_at(user, now);
        let weight = normalize_weight(weight);
        let new_total = old_total + weight;

        let audit_id = self
            .gateway
            .post_audit_log(&AuditEntry {
                user,
                reason: reason.to_string(),
                weight,
                total: new_total,
                attribution: attribution.clone(),
            })
            .await?;

        let dm_delivered = self
            .notify(user, &warning_text(reason, weight, new_total))
            .await;

        let strike = Strike::new(user, audit_id, snowflake_timestamp(audit_id), weight);
        self.strikes.push(strike.clone());
        info!(
            user,
            strike_id = %strike.id,
            weight,
            old_total,
            new_total,
            attribution = %attribution,
            "Recorded strike"
        );

        let escalation = if exceeds_ban_threshold(&self.policy, new_total) {
            self.ban(user, reason, new_total).await?
        } else {
            self.mute(user, reason, old_total, new_total, now).await?
        };

        let banned = matches!(escalation, Escalation::Banned | Escalation::BanSkipped);
        let final_warning_sent = if !banned && crosses_last_rung(&self.policy, old_total, new_total)
        {
            self.notify(user, FINAL_WARNING).await
        } else {
            false
        };

        Ok(WarnOutcome {
            strike,
            old_total,
            new_total,
            escalation,
            final_warning_sent,
            dm_delivered,
        })
    }

    async fn ban(
        &self,
        user: UserId,
        reason: &str,
        total: f64,
    ) -> Result<Escalation, ModerationError> {
        let capabilities = self.gateway.capabilities(user).await?;
        if !capabilities.bannable {
            self.report(&format!(
                "Cannot ban <@{}> at {} strikes: missing permission",
                user, total
            ))
            .await;
            return Ok(Escalation::BanSkipped);
        }
        if !self.policy.production && capabilities.outranks_baseline_role {
            self.report(&format!(
                "Not banning <@{}> at {} strikes outside production: member outranks the baseline role",
                user, total
            ))
            .await;
            return Ok(Escalation::BanSkipped);
        }

        let ban_reason = format!("Exceeded {} strikes: {}", self.policy.ban_threshold(), reason);
        match self.gateway.apply_ban(user, &ban_reason).await {
            Ok(()) => {
                info!(user, total, "Banned user");
                Ok(Escalation::Banned)
            }
            Err(ModerationError::PermissionDenied { .. }) => {
                self.report(&format!("Ban of <@{}> was refused by the platform", user))
                    .await;
                Ok(Escalation::BanSkipped)
            }
            Err(err) => Err(err),
        }
    }

    async fn mute(
        &self,
        user: UserId,
        reason: &str,
        old_total: f64,
        new_total: f64,
        now: Timestamp,
    ) -> Result<Escalation, ModerationError> {
        let added_hours = added_mute_hours(&self.policy, old_total, new_total);
        if added_hours == 0 {
            return Ok(Escalation::None);
        }

        let capabilities = self.gateway.capabilities(user).await?;
        if !capabilities.moderatable {
            self.report(&format!(
                "Cannot mute <@{}> for {}h: missing permission",
                user, added_hours
            ))
            .await;
            return Ok(Escalation::MuteSkipped { added_hours });
        }

        let running = self.gateway.current_timeout(user).await?;
        let start = running.filter(|end| *end > now).unwrap_or(now);
        let until = i64::try_from(added_hours)
            .ok()
            .and_then(TimeDelta::try_hours)
            .and_then(|delta| start.checked_add_signed(delta))
            .ok_or_else(|| ModerationError::Gateway {
                reason: format!("mute of {}h is out of range", added_hours),
            })?;

        match self.gateway.apply_timeout(user, until, reason).await {
            Ok(()) => {
                info!(user, added_hours, until = %until, "Muted user");
                Ok(Escalation::Muted { added_hours, until })
            }
            Err(ModerationError::PermissionDenied { .. }) => {
                self.report(&format!(
                    "Timeout of <@{}> for {}h was refused by the platform",
                    user, added_hours
                ))
                .await;
                Ok(Escalation::MuteSkipped { added_hours })
            }
            Err(err) => Err(err),
        }
    }

    /// Best-effort direct message.
    async fn notify(&self, user: UserId, text: &str) -> bool {
        match self.gateway.send_dm(user, text).await {
            Ok(()) => true,
            Err(err) => {
                debug!(user, error = %err, "Direct message not delivered");
                false
            }
        }
    }

    async fn report(&self, text: &str) {
        warn!("{}", text);
        if let Err(err) = self.gateway.post_mod_log(text).await {
            warn!(error = %err, "Failed to post to moderation log");
        }
    }
}

impl std::fmt::Debug for EscalationLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscalationLedger")
            .field("strikes", &self.strikes)
            .field("policy", &self.policy)
            .finish()
    }
}

fn warning_text(reason: &str, weight: f64, total: f64) -> String {
    if weight < 1.0 {
        format!("You received a verbal warning: {}", reason)
    } else {
        format!(
            "You received a strike ({}): {}\nActive strikes: {}",
            weight, reason, total
        )
    }
}
