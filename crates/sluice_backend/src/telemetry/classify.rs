//! Pure mappings from raw telemetry samples to discrete buckets.

/// Below this, power draw relative to budget reads as low-power.
pub const DEFAULT_UTILIZATION_THRESHOLD_PERCENT: u32 = 30;

/// 0 below 75 °C, 1 from 75, 2 from 85, 3 from 95. Lower edges are inclusive.
pub const fn thermal_bucket_from_celsius(temperature_c: u32) -> u8 {
    if temperature_c >= 95 {
        return 3;
    }
    if temperature_c >= 85 {
        return 2;
    }
    if temperature_c >= 75 {
        return 1;
    }
    0
}

/// Higher performance-state numbers are more power constrained.
pub const fn is_low_power_from_pstate(pstate: u32) -> bool {
    pstate >= 8
}

/// Strictly below `threshold_percent` of the budget is low-power.
/// A zero budget has no meaningful ratio and never reads as low-power.
pub const fn is_low_power_from_power_budget(
    current_mw: u32,
    budget_mw: u32,
    threshold_percent: u32,
) -> bool {
    if budget_mw == 0 {
        return false;
    }
    let utilization = (current_mw as u64 * 100) / budget_mw as u64;
    utilization < threshold_percent as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thermal_bucket_boundaries() {
        let cases = [(0, 0), (60, 0), (74, 0), (75, 1), (76, 1), (84, 1), (85, 2), (88, 2), (94, 2), (95, 3), (100, 3)];
        for (temp, bucket) in cases {
            assert_eq!(thermal_bucket_from_celsius(temp), bucket, "{temp} C");
        }
    }

    #[test]
    fn thermal_bucket_is_monotonic() {
        let mut previous = 0;
        for temp in 0..=150 {
            let bucket = thermal_bucket_from_celsius(temp);
            assert!(bucket >= previous);
            previous = bucket;
        }
        assert_eq!(thermal_bucket_from_celsius(u32::MAX), 3);
    }

    #[test]
    fn pstate_threshold() {
        for p in 0..=7 {
            assert!(!is_low_power_from_pstate(p));
        }
        assert!(is_low_power_from_pstate(8));
        assert!(is_low_power_from_pstate(15));
    }

    #[test]
    fn power_budget_ratio() {
        let t = DEFAULT_UTILIZATION_THRESHOLD_PERCENT;
        assert!(!is_low_power_from_power_budget(10_000, 0, t));
        assert!(!is_low_power_from_power_budget(0, 0, t));
        assert!(is_low_power_from_power_budget(10_000, 60_000, t));
        assert!(!is_low_power_from_power_budget(40_000, 60_000, t));
    }

    #[test]
    fn power_budget_exact_threshold_is_not_low_power() {
        // 18000 / 60000 is exactly 30%.
        assert!(!is_low_power_from_power_budget(18_000, 60_000, 30));
        assert!(is_low_power_from_power_budget(17_999, 60_000, 30));
    }

    #[test]
    fn power_budget_does_not_overflow() {
        assert!(!is_low_power_from_power_budget(u32::MAX, u32::MAX, 30));
        assert!(!is_low_power_from_power_budget(u32::MAX, 1, 30));
        assert!(is_low_power_from_power_budget(1, u32::MAX, 30));
    }
}
