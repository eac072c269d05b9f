//! Per-bus counters and the statistics report.
//!
//! Counters live alongside each bus's tuning state but are never persisted;
//! they describe what the controller did during this process's lifetime.

use crate::core_logic::{BusId, BusRetryState};
use crate::steps::{step_to_multiplier, Step, MAX_STEP};
use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// Activity counters for one bus.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusCounters {
    /// Number of baseline changes that raised the step
    pub adjustments_up: u32,
    /// Sum of all upward step deltas
    pub total_steps_up: u32,
    /// Number of baseline changes that lowered the step
    pub adjustments_down: u32,
    /// Sum of all downward step deltas
    pub total_steps_down: u32,
    /// Operations that eventually succeeded
    pub successes: u64,
    /// Operations that exhausted their tries or hit a fatal error
    pub failures: u64,
    /// Individual failed attempts inside retry loops
    pub retryable_failures: u64,
    /// Average tries (scaled by 10) of the last window examined
    pub latest_avg_tries_10: Option<u32>,
}

impl BusCounters {
    /// Account for a baseline change from `old` to `new`.
    pub fn record_step_change(&mut self, old: Step, new: Step) {
        if new > old {
            self.adjustments_up += 1;
            self.total_steps_up += (new - old) as u32;
        } else if new < old {
            self.adjustments_down += 1;
            self.total_steps_down += (old - new) as u32;
        }
    }
}

/// Report for a single bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusReport {
    pub bus: BusId,
    pub from_cache: bool,
    pub initial_step: Step,
    pub initial_multiplier: f64,
    pub current_step: Step,
    pub current_multiplier: f64,
    pub retry_loop_step: Step,
    pub lookback: usize,
    pub remaining_interval: u32,
    pub min_known_good_step: Step,
    pub failure_step_seen: bool,
    pub history_len: usize,
    pub adjustments_up: u32,
    pub total_steps_up: u32,
    pub adjustments_down: u32,
    pub total_steps_down: u32,
    pub successes: u64,
    pub failures: u64,
    pub retryable_failures: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_avg_tries: Option<f64>,
}

impl From<&BusRetryState> for BusReport {
    fn from(state: &BusRetryState) -> Self {
        let c = &state.counters;
        Self {
            bus: state.bus_id,
            from_cache: state.from_cache,
            initial_step: state.initial_step,
            initial_multiplier: step_to_multiplier(state.initial_step),
            current_step: state.current_step,
            current_multiplier: step_to_multiplier(state.current_step),
            retry_loop_step: state.retry_loop_step,
            lookback: state.lookback,
            remaining_interval: state.remaining_interval,
            min_known_good_step: state.min_known_good_step,
            failure_step_seen: state.failure_step_seen,
            history_len: state.history.len(),
            adjustments_up: c.adjustments_up,
            total_steps_up: c.total_steps_up,
            adjustments_down: c.adjustments_down,
            total_steps_down: c.total_steps_down,
            successes: c.successes,
            failures: c.failures,
            retryable_failures: c.retryable_failures,
            latest_avg_tries: c.latest_avg_tries_10.map(|v| f64::from(v) / 10.0),
        }
    }
}

/// Report for every known bus, exposed by the command line tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatsReport {
    pub enabled: bool,
    pub initial_step: Step,
    pub max_step: Step,
    pub adjustment_interval: u32,
    /// Sorted by bus number
    pub buses: Vec<BusReport>,
}

impl StatsReport {
    pub fn new(
        enabled: bool,
        initial_step: Step,
        adjustment_interval: u32,
        mut buses: Vec<BusReport>,
    ) -> Self {
        buses.sort_by_key(|b| b.bus);
        Self {
            enabled,
            initial_step,
            max_step: MAX_STEP,
            adjustment_interval,
            buses,
        }
    }

    /// Human readable rendering.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Dynamic sleep adjustment: {}",
            if self.enabled { "enabled" } else { "disabled" }
        );
        let _ = writeln!(
            out,
            "   Initial step: {:3}, multiplier = {:4.2}",
            self.initial_step,
            step_to_multiplier(self.initial_step)
        );
        let _ = writeln!(out, "   Max step:     {:3}", self.max_step);
        let _ = writeln!(out, "   Adjustment interval: {}", self.adjustment_interval);
        if self.buses.is_empty() {
            let _ = writeln!(out, "   No bus statistics recorded");
        }
        for bus in &self.buses {
            let cached = if bus.from_cache { " (from cache)" } else { "" };
            let _ = writeln!(out, "Bus /dev/i2c-{}{}:", bus.bus, cached);
            let _ = writeln!(
                out,
                "   Initial step:       {:3},  multiplier = {:4.2}",
                bus.initial_step, bus.initial_multiplier
            );
            let _ = writeln!(
                out,
                "   Current step:       {:3},  multiplier = {:4.2}",
                bus.current_step, bus.current_multiplier
            );
            let _ = writeln!(
                out,
                "   Min known good step:{:3},  failure step seen = {}",
                bus.min_known_good_step, bus.failure_step_seen
            );
            let _ = writeln!(out, "   Lookback:           {:3}", bus.lookback);
            let _ = writeln!(out, "   Remaining interval: {:3}", bus.remaining_interval);
            let _ = writeln!(out, "   History records:    {:3}", bus.history_len);
            let _ = writeln!(
                out,
                "   Adjustments up:     {:3}  (total steps {})",
                bus.adjustments_up, bus.total_steps_up
            );
            let _ = writeln!(
                out,
                "   Adjustments down:   {:3}  (total steps {})",
                bus.adjustments_down, bus.total_steps_down
            );
            let _ = writeln!(out, "   Successes:          {:3}", bus.successes);
            let _ = writeln!(out, "   Failures:           {:3}", bus.failures);
            let _ = writeln!(out, "   Retryable failures: {:3}", bus.retryable_failures);
            if let Some(avg) = bus.latest_avg_tries {
                let _ = writeln!(out, "   Latest avg tries:  {:4.1}", avg);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TuningConfig;
    use crate::core_logic::TuningParams;

    #[test]
    fn test_record_step_change() {
        let mut counters = BusCounters::default();
        counters.record_step_change(5, 7);
        counters.record_step_change(7, 6);
        counters.record_step_change(6, 6);
        counters.record_step_change(6, 3);
        assert_eq!(counters.adjustments_up, 1);
        assert_eq!(counters.total_steps_up, 2);
        assert_eq!(counters.adjustments_down, 2);
        assert_eq!(counters.total_steps_down, 4);
    }

    #[test]
    fn test_report_from_state() {
        let params = TuningParams::from(&TuningConfig::default());
        let mut state = BusRetryState::new(6, &params);
        state.counters.successes = 4;
        state.counters.latest_avg_tries_10 = Some(12);

        let report = BusReport::from(&state);
        assert_eq!(report.bus, 6);
        assert_eq!(report.current_step, 7);
        assert_eq!(report.current_multiplier, 1.0);
        assert_eq!(report.successes, 4);
        assert_eq!(report.latest_avg_tries, Some(1.2));
    }

    #[test]
    fn test_stats_report_sorted_and_rendered() {
        let params = TuningParams::from(&TuningConfig::default());
        let buses = vec![
            BusReport::from(&BusRetryState::new(9, &params)),
            BusReport::from(&BusRetryState::new(2, &params)),
        ];
        let report = StatsReport::new(true, 7, 3, buses);
        assert_eq!(report.buses[0].bus, 2);
        assert_eq!(report.buses[1].bus, 9);

        let text = report.render_text();
        assert!(text.contains("Dynamic sleep adjustment: enabled"));
        assert!(text.contains("Bus /dev/i2c-2:"));
        assert!(text.contains("Bus /dev/i2c-9:"));

        let json = serde_json::to_string(&report).unwrap();
        let parsed: StatsReport = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, report);
    }

    #[test]
    fn test_empty_report() {
        let report = StatsReport::new(false, 7, 3, Vec::new());
        let text = report.render_text();
        assert!(text.contains("disabled"));
        assert!(text.contains("No bus statistics recorded"));
    }
}
