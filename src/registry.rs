//! Registry of per-bus tuning state.
//!
//! Buses are keyed by their I2C bus number. Entries are created lazily the
//! first time a bus is referenced, or restored wholesale from the statistics
//! file at startup.

use crate::core_logic::{BusId, BusRetryState, TuningParams};
use crate::steps::{multiplier_to_step, Step};
use std::collections::HashMap;
use tracing::{info, warn};

/// What [`StateRegistry::note_bus_detected`] did with a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusDetection {
    /// No state existed; a fresh one was created.
    Created,
    /// Cached state matched the monitor's EDID and was kept.
    Verified,
    /// Cached state belonged to a different monitor and was replaced.
    Discarded,
    /// State already existed and needed no verification.
    Known,
}

/// Mapping from bus number to tuning state.
#[derive(Debug, Clone, Default)]
pub struct StateRegistry {
    buses: HashMap<BusId, BusRetryState>,
    params: TuningParams,
}

impl StateRegistry {
    pub fn new(params: TuningParams) -> Self {
        Self {
            buses: HashMap::new(),
            params,
        }
    }

    /// Settings applied to newly created states.
    pub fn params(&self) -> &TuningParams {
        &self.params
    }

    pub fn get(&self, bus: BusId) -> Option<&BusRetryState> {
        self.buses.get(&bus)
    }

    pub fn get_mut(&mut self, bus: BusId) -> Option<&mut BusRetryState> {
        self.buses.get_mut(&bus)
    }

    /// State for `bus`, created with fresh defaults on first reference.
    pub fn get_or_create(&mut self, bus: BusId) -> &mut BusRetryState {
        let params = &self.params;
        self.buses
            .entry(bus)
            .or_insert_with(|| BusRetryState::new(bus, params))
    }

    /// Split borrow of the settings and the state for `bus`.
    pub fn params_and_state(&mut self, bus: BusId) -> (&TuningParams, &mut BusRetryState) {
        let params = &self.params;
        let state = self
            .buses
            .entry(bus)
            .or_insert_with(|| BusRetryState::new(bus, params));
        (params, state)
    }

    pub fn contains(&self, bus: BusId) -> bool {
        self.buses.contains_key(&bus)
    }

    pub fn len(&self) -> usize {
        self.buses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buses.is_empty()
    }

    /// Known bus numbers in ascending order.
    pub fn bus_ids(&self) -> Vec<BusId> {
        let mut ids: Vec<BusId> = self.buses.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// States in ascending bus order.
    pub fn iter_sorted(&self) -> impl Iterator<Item = &BusRetryState> + '_ {
        self.bus_ids().into_iter().filter_map(move |bus| self.buses.get(&bus))
    }

    pub fn remove(&mut self, bus: BusId) -> Option<BusRetryState> {
        self.buses.remove(&bus)
    }

    pub fn clear(&mut self) {
        self.buses.clear();
    }

    /// Replace every state at once, e.g. with a fully validated restore.
    pub fn replace_all(&mut self, buses: HashMap<BusId, BusRetryState>) {
        self.buses = buses;
    }

    /// Set a new baseline multiplier for new buses and every known bus,
    /// clearing each bus's hysteresis floor. Returns the new initial step.
    pub fn reset_multiplier(&mut self, multiplier: f64) -> Step {
        let step = multiplier_to_step(multiplier);
        self.params.initial_step = step;
        for state in self.buses.values_mut() {
            state.reset_to(step);
        }
        info!(multiplier, step, buses = self.buses.len(), "Reset sleep multiplier");
        step
    }

    /// Discard everything known about `bus` and start it over at
    /// `multiplier`, or at the default multiplier 1.0 when `None`.
    pub fn reset_bus(&mut self, bus: BusId, multiplier: Option<f64>) -> &mut BusRetryState {
        let step = multiplier_to_step(multiplier.unwrap_or(1.0));
        let mut state = BusRetryState::new(bus, &self.params);
        state.reset_to(step);
        if let Some(old) = self.buses.get(&bus) {
            state.edid_checksum = old.edid_checksum;
        }
        self.buses.insert(bus, state);
        self.get_or_create(bus)
    }

    /// Report that a monitor with EDID checksum byte `edid_checksum` is
    /// attached to `bus`. Cached state recorded for a different monitor is
    /// dropped.
    pub fn note_bus_detected(&mut self, bus: BusId, edid_checksum: u8) -> BusDetection {
        let detection = match self.buses.get_mut(&bus) {
            None => BusDetection::Created,
            Some(state) if state.from_cache && !state.edid_verified => {
                if state.edid_checksum == edid_checksum {
                    state.edid_verified = true;
                    BusDetection::Verified
                } else {
                    warn!(
                        bus,
                        cached = %format!("{:02x}", state.edid_checksum),
                        detected = %format!("{:02x}", edid_checksum),
                        "Discarding cached sleep adjustment data, EDID has changed"
                    );
                    self.buses.remove(&bus);
                    BusDetection::Discarded
                }
            }
            Some(state) => {
                state.edid_checksum = edid_checksum;
                BusDetection::Known
            }
        };

        if matches!(detection, BusDetection::Created | BusDetection::Discarded) {
            self.get_or_create(bus).edid_checksum = edid_checksum;
        }
        detection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TuningConfig;

    fn registry() -> StateRegistry {
        StateRegistry::new(TuningParams::from(&TuningConfig::default()))
    }

    #[test]
    fn test_get_or_create_uses_defaults() {
        let mut reg = registry();
        assert!(reg.get(3).is_none());

        let state = reg.get_or_create(3);
        assert_eq!(state.bus_id, 3);
        assert_eq!(state.current_step, 7);
        assert_eq!(state.retry_loop_step, 7);
        assert_eq!(state.lookback, 5);
        assert_eq!(state.min_known_good_step, 0);
        assert!(!state.failure_step_seen);
        assert!(state.history.is_empty());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_get_or_create_returns_existing() {
        let mut reg = registry();
        reg.get_or_create(3).current_step = 2;
        assert_eq!(reg.get_or_create(3).current_step, 2);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_large_bus_numbers_are_accepted() {
        let mut reg = registry();
        reg.get_or_create(4096);
        reg.get_or_create(1);
        assert_eq!(reg.bus_ids(), vec![1, 4096]);
        let order: Vec<BusId> = reg.iter_sorted().map(|s| s.bus_id).collect();
        assert_eq!(order, vec![1, 4096]);
    }

    #[test]
    fn test_reset_multiplier_applies_to_all() {
        let mut reg = registry();
        for bus in [1, 2] {
            let state = reg.get_or_create(bus);
            state.current_step = 9;
            state.min_known_good_step = 9;
            state.failure_step_seen = true;
        }

        let step = reg.reset_multiplier(0.5);
        assert_eq!(step, 5);
        for bus in [1, 2] {
            let state = reg.get(bus).unwrap();
            assert_eq!(state.current_step, 5);
            assert_eq!(state.retry_loop_step, 5);
            assert_eq!(state.min_known_good_step, 0);
            assert!(!state.failure_step_seen);
        }
        assert_eq!(reg.get_or_create(7).current_step, 5);
    }

    #[test]
    fn test_reset_bus() {
        let mut reg = registry();
        let state = reg.get_or_create(2);
        state.current_step = 10;
        state.edid_checksum = 0xab;
        state.counters.successes = 3;

        let state = reg.reset_bus(2, Some(1.3));
        assert_eq!(state.current_step, 8);
        assert_eq!(state.edid_checksum, 0xab);
        assert_eq!(state.counters.successes, 0);

        assert_eq!(reg.reset_bus(5, None).current_step, 7);
    }

    #[test]
    fn test_note_bus_detected_creates() {
        let mut reg = registry();
        assert_eq!(reg.note_bus_detected(6, 0x3c), BusDetection::Created);
        assert_eq!(reg.get(6).unwrap().edid_checksum, 0x3c);
        assert_eq!(reg.note_bus_detected(6, 0x3d), BusDetection::Known);
        assert_eq!(reg.get(6).unwrap().edid_checksum, 0x3d);
    }

    #[test]
    fn test_note_bus_detected_verifies_cache() {
        let mut reg = registry();
        let state = reg.get_or_create(6);
        state.from_cache = true;
        state.edid_checksum = 0x3c;
        state.current_step = 2;

        assert_eq!(reg.note_bus_detected(6, 0x3c), BusDetection::Verified);
        assert!(reg.get(6).unwrap().edid_verified);
        assert_eq!(reg.get(6).unwrap().current_step, 2);
        assert_eq!(reg.note_bus_detected(6, 0x3c), BusDetection::Known);
    }

    #[test]
    fn test_note_bus_detected_discards_stale_cache() {
        let mut reg = registry();
        let state = reg.get_or_create(6);
        state.from_cache = true;
        state.edid_checksum = 0x3c;
        state.current_step = 2;

        assert_eq!(reg.note_bus_detected(6, 0x99), BusDetection::Discarded);
        let state = reg.get(6).unwrap();
        assert_eq!(state.current_step, 7);
        assert_eq!(state.edid_checksum, 0x99);
        assert!(!state.from_cache);
    }
}
