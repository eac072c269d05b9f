//! Core Logic module implementing the dynamic sleep algorithm.
//!
//! Each I2C bus carries a tuned baseline step (`current_step`) and a scratch
//! step for the operation in flight (`retry_loop_step`). Failed attempts
//! escalate the scratch step; completed operations are logged to the bus's
//! history and periodically fold back into the baseline with asymmetric
//! hysteresis: trouble raises the baseline at once, clean runs lower it one
//! step at a time and never below a level that has already caused trouble.

use crate::config::{FailureReset, Thresholds, TuningConfig};
use crate::history::{HistoryRing, InvocationRecord};
use crate::metrics::BusCounters;
use crate::retry_loop::MAX_MAX_TRIES;
use crate::steps::{clamp_step, Step, MAX_STEP};
use tracing::debug;

/// I2C bus number (`/dev/i2c-N`).
pub type BusId = u32;

/// Escalated steps below this fraction of a whole step are left alone.
const ESCALATION_ROUND_UP_FLOOR: f64 = 0.75;

/// Tries stored in a history record are clamped to `1..=MAX_RECORDED_TRIES`.
pub const MAX_RECORDED_TRIES: u32 = MAX_MAX_TRIES;

/// Settings that shape every bus's state, derived from [`TuningConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct TuningParams {
    pub initial_step: Step,
    pub adjustment_interval: u32,
    pub lookback: usize,
    pub history_capacity: usize,
    pub thresholds: Thresholds,
    pub failure_reset: FailureReset,
}

impl From<&TuningConfig> for TuningParams {
    fn from(config: &TuningConfig) -> Self {
        Self {
            initial_step: config.initial_step(),
            adjustment_interval: config.adjustment_interval.max(1),
            lookback: config.lookback.max(1),
            history_capacity: config.history_capacity.max(1),
            thresholds: config.thresholds.clone(),
            failure_reset: config.failure_reset,
        }
    }
}

impl Default for TuningParams {
    fn default() -> Self {
        Self::from(&TuningConfig::default())
    }
}

/// Result of a baseline re-tuning pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    Raised { from: Step, to: Step },
    Lowered { from: Step, to: Step },
    Unchanged { step: Step },
}

/// Tuning state for one bus.
#[derive(Debug, Clone, PartialEq)]
pub struct BusRetryState {
    pub bus_id: BusId,
    /// Tuned baseline used to seed each new operation.
    pub current_step: Step,
    /// Step of the operation currently in flight.
    pub retry_loop_step: Step,
    /// Records examined by each re-tuning pass.
    pub lookback: usize,
    /// Gated operations left before the next re-tuning pass.
    pub remaining_interval: u32,
    /// Lowest step trusted not to cause trouble.
    pub min_known_good_step: Step,
    /// Whether trouble has ever raised the baseline.
    pub failure_step_seen: bool,
    pub history: HistoryRing,
    /// Step this state started from (fresh, cached, or reset).
    pub initial_step: Step,
    /// Byte 127 of the monitor's EDID, used to detect a swapped monitor.
    pub edid_checksum: u8,
    /// Restored from the statistics file.
    pub from_cache: bool,
    /// The cached EDID checksum has been confirmed against the live monitor.
    pub edid_verified: bool,
    pub counters: BusCounters,
}

impl BusRetryState {
    /// Fresh state for a bus seen for the first time.
    pub fn new(bus_id: BusId, params: &TuningParams) -> Self {
        Self {
            bus_id,
            current_step: params.initial_step,
            retry_loop_step: params.initial_step,
            lookback: params.lookback,
            remaining_interval: params.adjustment_interval,
            min_known_good_step: 0,
            failure_step_seen: false,
            history: HistoryRing::with_capacity(params.history_capacity),
            initial_step: params.initial_step,
            edid_checksum: 0,
            from_cache: false,
            edid_verified: false,
            counters: BusCounters::default(),
        }
    }

    /// Sleep multiplier for the next attempt on this bus.
    pub fn multiplier(&self) -> f64 {
        crate::steps::step_to_multiplier(self.retry_loop_step)
    }

    /// Reset the baseline to `step`, clearing the hysteresis floor and the
    /// activity counters.
    pub fn reset_to(&mut self, step: Step) {
        let step = clamp_step(step);
        self.initial_step = step;
        self.current_step = step;
        self.retry_loop_step = step;
        self.min_known_good_step = 0;
        self.failure_step_seen = false;
        self.counters = BusCounters::default();
    }

    /// Apply escalation after a failed attempt with `remaining_tries` left.
    pub fn note_retryable_failure(&mut self, remaining_tries: u32) {
        self.counters.retryable_failures += 1;
        let prev = self.retry_loop_step;
        self.retry_loop_step = next_retry_step(prev, remaining_tries);
        debug!(
            bus = self.bus_id,
            prev_step = prev,
            next_step = self.retry_loop_step,
            remaining_tries,
            "Escalated retry loop step"
        );
    }

    /// Record a successful operation that took `tries_used` attempts.
    pub fn record_success(
        &mut self,
        tries_used: u32,
        timestamp: i64,
        params: &TuningParams,
    ) -> Adjustment {
        let thresholds = &params.thresholds;
        let tries_used = tries_used.clamp(1, MAX_RECORDED_TRIES);
        self.counters.successes += 1;
        self.history
            .add(InvocationRecord::new(timestamp, tries_used, self.retry_loop_step));

        let old = self.current_step;
        let outcome = if tries_used > thresholds.promote_above_tries {
            // Bad operation: adopt the escalated step without waiting for the interval.
            if self.current_step < MAX_STEP {
                self.current_step = self.retry_loop_step;
                self.min_known_good_step = self.current_step;
                self.failure_step_seen = true;
                self.counters.record_step_change(old, self.current_step);
            }
            step_change(old, self.current_step)
        } else if tries_used > thresholds.gate_above_tries {
            if self.remaining_interval <= 1 {
                self.remaining_interval = params.adjustment_interval;
                adjust(self, thresholds)
            } else {
                self.remaining_interval -= 1;
                Adjustment::Unchanged { step: old }
            }
        } else {
            self.remaining_interval = params.adjustment_interval;
            adjust(self, thresholds)
        };

        self.retry_loop_step = self.current_step;
        debug!(
            bus = self.bus_id,
            tries_used,
            current_step = self.current_step,
            remaining_interval = self.remaining_interval,
            "Recorded successful operation"
        );
        outcome
    }

    /// Record an operation that exhausted its tries or failed fatally.
    pub fn record_failure(&mut self, params: &TuningParams) {
        self.counters.failures += 1;
        self.remaining_interval = params.adjustment_interval;
        self.retry_loop_step = match params.failure_reset {
            FailureReset::CurrentStep => self.current_step,
            FailureReset::InitialStep => params.initial_step,
        };
        debug!(
            bus = self.bus_id,
            retry_loop_step = self.retry_loop_step,
            "Recorded failed operation"
        );
    }
}

fn step_change(from: Step, to: Step) -> Adjustment {
    if to > from {
        Adjustment::Raised { from, to }
    } else if to < from {
        Adjustment::Lowered { from, to }
    } else {
        Adjustment::Unchanged { step: from }
    }
}

/// Step to use for the next attempt after a failed one.
///
/// The fewer tries remain, the larger the jump, so the final attempts run
/// with the longest delays. An increment between 0.75 and 1.0 is rounded up
/// to a full step instead of truncating to zero. With no tries remaining the
/// step is returned unchanged.
pub fn next_retry_step(prev_step: Step, remaining_tries: u32) -> Step {
    let prev_step = clamp_step(prev_step);
    if remaining_tries == 0 {
        return prev_step;
    }
    let remaining_steps = (MAX_STEP - prev_step) as f64;
    let mut adj = remaining_steps / f64::from(remaining_tries);
    if adj > ESCALATION_ROUND_UP_FLOOR && adj < 1.0 {
        adj = 1.0;
    }
    (prev_step + adj.floor() as Step).min(MAX_STEP)
}

/// Re-tune the baseline step of `state` from its recent history.
///
/// A window is troubled when its worst operation exceeded
/// `greatest_tries_upper_bound` tries or its average (compared ×10 in integer
/// arithmetic) exceeded `average_tries_upper_bound`. Trouble raises the
/// baseline by one step and pins the known-good floor there. Otherwise the
/// baseline drops by one step when the window needed at most one retry in
/// total, or when it is still above the floor (or no trouble was ever seen).
pub fn adjust(state: &mut BusRetryState, thresholds: &Thresholds) -> Adjustment {
    let records = state.history.latest(state.lookback);
    if records.is_empty() {
        return Adjustment::Unchanged {
            step: state.current_step,
        };
    }

    let n = records.len() as u64;
    let max_tries = records.iter().map(|r| r.tries_used).max().unwrap_or(0);
    let total_tries: u64 = records.iter().map(|r| u64::from(r.tries_used)).sum();
    let avg_tries_10 = total_tries.saturating_mul(10) / n;
    state.counters.latest_avg_tries_10 = Some(u32::try_from(avg_tries_10).unwrap_or(u32::MAX));

    let too_many_errors = max_tries > thresholds.greatest_tries_upper_bound
        || avg_tries_10 > u64::from(thresholds.average_upper_bound_10());

    let old = state.current_step;
    if too_many_errors {
        state.current_step = (old + 1).min(MAX_STEP);
        state.failure_step_seen = true;
        state.min_known_good_step = state.current_step;
    } else if old > 0 {
        if total_tries <= n + 1 {
            // A clean window earns the lower level as the new floor.
            state.current_step = old - 1;
            state.min_known_good_step = state.current_step;
        } else if !state.failure_step_seen || old > state.min_known_good_step {
            state.current_step = old - 1;
        }
    }

    state.counters.record_step_change(old, state.current_step);
    debug!(
        bus = state.bus_id,
        window = n,
        max_tries,
        total_tries,
        too_many_errors,
        old_step = old,
        new_step = state.current_step,
        "Adjusted baseline step"
    );
    step_change(old, state.current_step)
}
