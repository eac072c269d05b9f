//! Step table for the dynamic sleep algorithm.
//!
//! Sleep multipliers are not tuned continuously. The controller moves along a
//! fixed ladder of multiplier levels, each stored scaled by 100 so that all
//! comparisons are integer comparisons.

/// Index into [`STEPS`].
pub type Step = usize;

/// Multiplier levels, scaled by 100 (entry 130 is multiplier 1.30).
pub const STEPS: [u32; 11] = [0, 5, 10, 20, 30, 50, 70, 100, 130, 160, 200];

/// Highest valid step index.
pub const MAX_STEP: Step = STEPS.len() - 1;

/// Convert a multiplier to the first step whose table value is at least the
/// multiplier scaled by 100. Multipliers above the last entry (and NaN) map
/// to [`MAX_STEP`].
///
/// Entries are compared as multipliers (`entry / 100`), the same division
/// [`step_to_multiplier`] performs, so every table multiplier maps back to
/// its own step without any tolerance.
pub fn multiplier_to_step(multiplier: f64) -> Step {
    STEPS
        .iter()
        .position(|&entry| f64::from(entry) / 100.0 >= multiplier)
        .unwrap_or(MAX_STEP)
}

/// Multiplier value of a step. Out of range steps are clamped to [`MAX_STEP`].
pub fn step_to_multiplier(step: Step) -> f64 {
    f64::from(STEPS[step.min(MAX_STEP)]) / 100.0
}

/// Clamp an arbitrary step value into `[0, MAX_STEP]`.
pub fn clamp_step(step: Step) -> Step {
    step.min(MAX_STEP)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_table_is_strictly_increasing() {
        for pair in STEPS.windows(2) {
            assert!(pair[0] < pair[1], "{:?} is not increasing", pair);
        }
        assert_eq!(MAX_STEP, 10);
    }

    #[test]
    fn test_default_multiplier_is_step_seven() {
        assert_eq!(multiplier_to_step(1.0), 7);
        assert_eq!(step_to_multiplier(7), 1.0);
    }

    #[test]
    fn test_every_step_round_trips() {
        for step in 0..=MAX_STEP {
            let multiplier = f64::from(STEPS[step]) / 100.0;
            assert_eq!(multiplier_to_step(multiplier), step, "step {}", step);
        }
    }

    #[test]
    fn test_between_entries_rounds_up() {
        assert_eq!(multiplier_to_step(1.01), 8);
        assert_eq!(multiplier_to_step(1.304), 9);
        assert_eq!(multiplier_to_step(0.01), 1);
    }

    #[test]
    fn test_tiny_multipliers_above_entry_round_up() {
        assert_eq!(multiplier_to_step(1e-9), 1);
        assert_eq!(multiplier_to_step(f64::MIN_POSITIVE), 1);
        assert_eq!(multiplier_to_step(1.0 + 1e-12), 8);
        assert_eq!(multiplier_to_step(1.3 + 1e-12), 9);
        assert_eq!(multiplier_to_step(0.0), 0);
        assert_eq!(multiplier_to_step(-1e-9), 0);
    }

    #[test]
    fn test_out_of_range_multipliers() {
        assert_eq!(multiplier_to_step(2.5), MAX_STEP);
        assert_eq!(multiplier_to_step(100.0), MAX_STEP);
        assert_eq!(multiplier_to_step(f64::NAN), MAX_STEP);
        assert_eq!(multiplier_to_step(-1.0), 0);
    }

    #[test]
    fn test_step_to_multiplier_clamps() {
        assert_eq!(step_to_multiplier(MAX_STEP + 5), 2.0);
        assert_eq!(clamp_step(42), MAX_STEP);
        assert_eq!(clamp_step(3), 3);
    }

    proptest! {
        #[test]
        fn prop_multiplier_to_step_is_monotonic(a in 0.0f64..3.0, b in 0.0f64..3.0) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(multiplier_to_step(lo) <= multiplier_to_step(hi));
        }

        #[test]
        fn prop_multiplier_to_step_is_ceiling(
            ndx in 1usize..=MAX_STEP,
            fraction in 0.01f64..0.99,
        ) {
            let lower = f64::from(STEPS[ndx - 1]);
            let upper = f64::from(STEPS[ndx]);
            let multiplier = (lower + (upper - lower) * fraction) / 100.0;
            let step = multiplier_to_step(multiplier);
            prop_assert_eq!(step, ndx);
            prop_assert!(step <= MAX_STEP);
        }
    }
}
