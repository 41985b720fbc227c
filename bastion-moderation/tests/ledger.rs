//! Escalation ledger tests against the mock transport and gateway.

use bastion_core::{EscalationPolicy, ModerationError};
use bastion_moderation::{
    normalize_weight, Attribution, Escalation, EscalationLedger, Strike, TargetCapabilities,
    WarnOutcome, STRIKE_TABLE,
};
use bastion_test_utils::assertions::persisted_rows;
use bastion_test_utils::fixtures::{test_ledger, test_ledger_with_policy, LedgerHarness};
use bastion_test_utils::{generators, init_tracing};
use chrono::{Duration, Utc};
use proptest::prelude::*;

const USER: u64 = 4242;
const MODERATOR: u64 = 7;

async fn harness() -> LedgerHarness {
    init_tracing();
    test_ledger().await.unwrap()
}

async fn warn(ledger: &EscalationLedger, weight: f64) -> WarnOutcome {
    ledger
        .warn(USER, "spam", weight, Attribution::Moderator(MODERATOR))
        .await
        .unwrap()
}

async fn warn_times(ledger: &EscalationLedger, times: usize) -> Vec<WarnOutcome> {
    let mut outcomes = Vec::with_capacity(times);
    for _ in 0..times {
        outcomes.push(warn(ledger, 1.0).await);
    }
    outcomes
}

fn added_hours(outcome: &WarnOutcome) -> Option<u64> {
    match outcome.escalation {
        Escalation::Muted { added_hours, .. } => Some(added_hours),
        _ => None,
    }
}

#[tokio::test]
async fn test_third_strike_mutes_for_first_rung_only() {
    let h = harness().await;
    let outcomes = warn_times(&h.ledger, 3).await;

    assert_eq!(outcomes[0].escalation, Escalation::None);
    assert_eq!(outcomes[1].escalation, Escalation::None);
    assert_eq!(added_hours(&outcomes[2]), Some(6));
    assert_eq!(outcomes[2].old_total, 2.0);
    assert_eq!(outcomes[2].new_total, 3.0);
    assert_eq!(h.gateway.timeouts().len(), 1);
}

#[tokio::test]
async fn test_sixth_strike_extends_running_mute_by_second_rung() {
    let h = harness().await;
    let outcomes = warn_times(&h.ledger, 6).await;

    let first_until = match outcomes[2].escalation {
        Escalation::Muted { until, .. } => until,
        ref other => panic!("expected mute, got {:?}", other),
    };
    match outcomes[5].escalation {
        Escalation::Muted { added_hours, until } => {
            assert_eq!(added_hours, 12);
            assert_eq!(until, first_until + Duration::hours(12));
        }
        ref other => panic!("expected mute, got {:?}", other),
    }
    assert_eq!(h.gateway.timeouts().len(), 2);
}

#[tokio::test]
async fn test_exceeding_ban_threshold_bans_instead_of_muting() {
    let h = harness().await;
    let outcomes = warn_times(&h.ledger, 11).await;

    let added: Vec<Option<u64>> = outcomes.iter().map(added_hours).collect();
    assert_eq!(added[8], Some(24));
    assert_eq!(outcomes[9].escalation, Escalation::None);
    assert_eq!(outcomes[10].escalation, Escalation::Banned);
    assert_eq!(h.gateway.bans(), vec![USER]);
    assert_eq!(h.gateway.timeouts().len(), 3);
}

#[tokio::test]
async fn test_final_warning_sent_when_last_rung_reached() {
    let h = harness().await;
    let outcomes = warn_times(&h.ledger, 10).await;

    let flagged: Vec<usize> = outcomes
        .iter()
        .enumerate()
        .filter(|(_, o)| o.final_warning_sent)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(flagged, vec![8]);
    assert!(h
        .gateway
        .dms(USER)
        .iter()
        .any(|text| text.starts_with("This is your final warning")));
}

#[tokio::test]
async fn test_zero_weight_records_verbal_quarter_strike() {
    let h = harness().await;
    let outcome = warn(&h.ledger, 0.0).await;

    assert_eq!(outcome.strike.count, 0.25);
    assert!(outcome.strike.is_verbal());
    assert_eq!(outcome.new_total, 0.25);
    assert_eq!(
        h.gateway.dms(USER),
        vec!["You received a verbal warning: spam".to_string()]
    );
}

#[tokio::test]
async fn test_fractional_weights_accumulate_to_a_mute() {
    let h = harness().await;
    warn(&h.ledger, 1.5).await;
    let outcome = warn(&h.ledger, 1.4).await;
    assert_eq!(outcome.strike.count, 1.5);
    assert_eq!(outcome.new_total, 3.0);
    assert_eq!(added_hours(&outcome), Some(6));
}

#[tokio::test]
async fn test_strike_id_comes_from_audit_message() {
    let h = harness().await;
    let outcome = warn(&h.ledger, 1.0).await;
    let audit_id = outcome.strike.audit_message_id().unwrap();

    assert_eq!(
        h.ledger.filter_to_strike(&audit_id.to_string()),
        Some(outcome.strike.clone())
    );
    assert_eq!(
        h.ledger.filter_to_strike(&outcome.strike.id.to_uppercase()),
        Some(outcome.strike.clone())
    );
    assert_eq!(h.ledger.filter_to_strike("nothing"), None);
    assert_eq!(h.ledger.filter_to_strike(""), None);
    assert!((Utc::now() - outcome.strike.time).num_seconds().abs() < 60);
}

#[tokio::test]
async fn test_missing_mute_permission_is_reported_not_thrown() {
    let h = harness().await;
    h.gateway.deny_timeouts();
    let outcomes = warn_times(&h.ledger, 3).await;

    assert_eq!(
        outcomes[2].escalation,
        Escalation::MuteSkipped { added_hours: 6 }
    );
    assert_eq!(h.gateway.mod_log().len(), 1);
    assert_eq!(h.ledger.strikes().data().len(), 3);
}

#[tokio::test]
async fn test_unmoderatable_member_is_not_muted() {
    let h = harness().await;
    h.gateway.set_capabilities(
        USER,
        TargetCapabilities {
            bannable: true,
            moderatable: false,
            outranks_baseline_role: false,
        },
    );
    let outcomes = warn_times(&h.ledger, 3).await;
    assert_eq!(
        outcomes[2].escalation,
        Escalation::MuteSkipped { added_hours: 6 }
    );
    assert!(h.gateway.timeouts().is_empty());
    assert!(h.gateway.mod_log()[0].contains("missing permission"));
}

#[tokio::test]
async fn test_unbannable_member_is_reported() {
    let h = harness().await;
    h.gateway.set_capabilities(
        USER,
        TargetCapabilities {
            bannable: false,
            moderatable: true,
            outranks_baseline_role: false,
        },
    );
    warn(&h.ledger, 10.0).await;
    let outcome = warn(&h.ledger, 1.0).await;

    assert_eq!(outcome.escalation, Escalation::BanSkipped);
    assert!(h.gateway.bans().is_empty());
    assert_eq!(h.gateway.mod_log().len(), 1);
}

#[tokio::test]
async fn test_platform_refusing_ban_is_reported() {
    let h = harness().await;
    h.gateway.deny_bans();
    let outcome = warn(&h.ledger, 11.0).await;
    assert_eq!(outcome.escalation, Escalation::BanSkipped);
    assert_eq!(h.gateway.mod_log().len(), 1);
}

#[tokio::test]
async fn test_senior_member_only_banned_in_production() {
    let senior = TargetCapabilities {
        bannable: true,
        moderatable: true,
        outranks_baseline_role: true,
    };

    let h = harness().await;
    h.gateway.set_capabilities(USER, senior);
    let outcome = warn(&h.ledger, 11.0).await;
    assert_eq!(outcome.escalation, Escalation::BanSkipped);
    assert!(h.gateway.mod_log()[0].contains("outside production"));

    let production = EscalationPolicy {
        production: true,
        ..EscalationPolicy::default()
    };
    let h = test_ledger_with_policy(production).await.unwrap();
    h.gateway.set_capabilities(USER, senior);
    let outcome = warn(&h.ledger, 11.0).await;
    assert_eq!(outcome.escalation, Escalation::Banned);
}

#[tokio::test]
async fn test_blocked_dm_does_not_fail_warn() {
    let h = harness().await;
    h.gateway.block_dms(USER);
    let outcome = warn(&h.ledger, 1.0).await;
    assert!(!outcome.dm_delivered);
    assert_eq!(h.ledger.active_total(USER), 1.0);
}

#[tokio::test]
async fn test_expired_and_removed_strikes_do_not_count() {
    let h = harness().await;
    let old = Strike::new(USER, 12_345, Utc::now() - Duration::days(100), 2.0);
    let other_user = Strike::new(USER + 1, 12_346, Utc::now(), 2.0);
    h.ledger.strikes().set_data(vec![old.clone(), other_user]);
    assert_eq!(h.ledger.active_total(USER), 0.0);

    let first = warn(&h.ledger, 2.0).await;
    assert_eq!(first.old_total, 0.0);
    let removed = h.ledger.remove_strike(&first.strike.id).unwrap();
    assert!(removed.removed);
    assert_eq!(h.ledger.active_total(USER), 0.0);

    let history = h.ledger.history(USER);
    assert_eq!(history.len(), 2);
    assert!(history[0].expired);
    assert_eq!(history[0].strike, old);
    assert!(!history[1].expired);
    assert!(history[1].strike.removed);
}

#[tokio::test]
async fn test_remove_unknown_strike_fails() {
    let h = harness().await;
    assert_eq!(
        h.ledger.remove_strike("zzz"),
        Err(ModerationError::StrikeNotFound {
            query: "zzz".to_string()
        })
    );
}

#[tokio::test]
async fn test_strikes_are_persisted_through_the_table() {
    let h = harness().await;
    let outcome = warn(&h.ledger, 1.0).await;
    h.db.flush(STRIKE_TABLE).await.unwrap();

    let stored: Vec<Strike> = persisted_rows(&h.transport, h.ledger.strikes());
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, outcome.strike.id);
    assert_eq!(stored[0].count, 1.0);
    assert_eq!(
        stored[0].time.timestamp_millis(),
        outcome.strike.time.timestamp_millis()
    );
}

#[tokio::test]
async fn test_context_attribution_in_audit_log() {
    let h = harness().await;
    h.ledger
        .warn(USER, "link spam", 1.0, Attribution::Context("automod".to_string()))
        .await
        .unwrap();
    let audited = h.gateway.calls().into_iter().any(|call| {
        matches!(
            call,
            bastion_test_utils::GatewayCall::AuditLog(entry)
                if entry.attribution == Attribution::Context("automod".to_string())
                    && entry.reason == "link spam"
        )
    });
    assert!(audited);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Any requested weight lands on a quarter step no smaller than a quarter.
    #[test]
    fn prop_requested_weights_normalize(weight in generators::arb_strike_weight()) {
        let normalized = normalize_weight(weight);
        prop_assert!(normalized >= 0.25);
        prop_assert_eq!((normalized * 4.0).fract(), 0.0);
    }
}
