//! Mute ladder arithmetic.
//!
//! Totals are sums of quarter-step strike weights, so every value here is
//! exactly representable as `f64`.

use bastion_core::EscalationPolicy;

/// Smallest weight a strike can carry.
pub const MIN_STRIKE_WEIGHT: f64 = 0.25;

/// Round a requested weight to the nearest quarter, never below
/// [`MIN_STRIKE_WEIGHT`]. Non-finite weights count as the minimum.
pub fn normalize_weight(weight: f64) -> f64 {
    if !weight.is_finite() {
        return MIN_STRIKE_WEIGHT;
    }
    ((weight * 4.0).round() / 4.0).max(MIN_STRIKE_WEIGHT)
}

/// Index into the ladder for a strike total.
pub fn mute_rung(policy: &EscalationPolicy, total: f64) -> u64 {
    if total <= 0.0 {
        return 0;
    }
    (total / f64::from(policy.strikes_per_mute)).floor() as u64
}

/// Cumulative mute hours earned by a strike total.
pub fn mute_hours(policy: &EscalationPolicy, total: f64) -> u64 {
    let rung = usize::try_from(mute_rung(policy, total)).unwrap_or(usize::MAX);
    let served = rung.min(policy.mute_ladder_hours.len());
    policy.mute_ladder_hours[..served].iter().sum()
}

/// Additional mute hours owed when a total moves from `old` to `new`.
pub fn added_mute_hours(policy: &EscalationPolicy, old: f64, new: f64) -> u64 {
    mute_hours(policy, new).saturating_sub(mute_hours(policy, old))
}

/// Whether a total is past the ban threshold.
pub fn exceeds_ban_threshold(policy: &EscalationPolicy, total: f64) -> bool {
    total.trunc() > policy.ban_threshold() as f64
}

/// Whether moving from `old` to `new` steps onto or past the last rung.
pub fn crosses_last_rung(policy: &EscalationPolicy, old: f64, new: f64) -> bool {
    let last = policy.mute_ladder_hours.len() as u64;
    mute_rung(policy, old) < last && mute_rung(policy, new) >= last
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Normalized weights are quarter steps of at least 0.25.
        #[test]
        fn prop_normalized_weight_is_quarter_step(weight in -10.0f64..50.0) {
            let normalized = normalize_weight(weight);
            prop_assert!(normalized >= MIN_STRIKE_WEIGHT);
            prop_assert_eq!((normalized * 4.0).fract(), 0.0);
            if weight >= MIN_STRIKE_WEIGHT {
                prop_assert!((normalized - weight).abs() <= 0.125);
            }
        }

        /// Mute hours never decrease as the total grows.
        #[test]
        fn prop_mute_hours_monotonic(quarters in 0u32..200, extra in 1u32..20) {
            let policy = EscalationPolicy::default();
            let old = f64::from(quarters) / 4.0;
            let new = old + f64::from(extra) / 4.0;
            prop_assert!(mute_hours(&policy, new) >= mute_hours(&policy, old));
        }
    }
}
