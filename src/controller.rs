//! Process-scoped dynamic sleep context.
//!
//! [`DynamicSleep`] owns the state registry behind a single lock, the enable
//! flag and the statistics file. Every call that reads or mutates bus state,
//! including save and restore, runs with the lock held for its whole duration.

use crate::config::TuningConfig;
use crate::core_logic::{Adjustment, BusId, BusRetryState, TuningParams};
use crate::error::StatsError;
use crate::history::epoch_seconds;
use crate::metrics::{BusReport, StatsReport};
use crate::persistence::StatsFile;
use crate::registry::{BusDetection, StateRegistry};
use crate::steps::Step;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

/// How an operation reaches its device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoPath {
    /// `/dev/i2c-N`
    I2c { bus: BusId },
    /// USB HID device, not subject to sleep tuning
    Usb { hiddev: u32 },
}

impl IoPath {
    /// Bus number for bus-addressed paths.
    pub fn bus(&self) -> Option<BusId> {
        match self {
            IoPath::I2c { bus } => Some(*bus),
            IoPath::Usb { .. } => None,
        }
    }
}

/// Shared dynamic sleep state for one process.
#[derive(Debug)]
pub struct DynamicSleep {
    registry: Mutex<StateRegistry>,
    enabled: AtomicBool,
    stats_file: StatsFile,
}

impl DynamicSleep {
    pub fn new(config: &TuningConfig, stats_file: StatsFile) -> Self {
        Self {
            registry: Mutex::new(StateRegistry::new(TuningParams::from(config))),
            enabled: AtomicBool::new(config.enabled),
            stats_file,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StateRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        let was = self.enabled.swap(enabled, Ordering::Relaxed);
        if was != enabled {
            info!(enabled, "Dynamic sleep adjustment toggled");
        }
    }

    pub fn stats_path(&self) -> &Path {
        self.stats_file.path()
    }

    /// Multiplier to apply to the base sleep before the next attempt on `path`.
    pub fn sleep_multiplier(&self, path: &IoPath) -> f64 {
        if !self.is_enabled() {
            return 1.0;
        }
        match path.bus() {
            Some(bus) => self.lock().get_or_create(bus).multiplier(),
            None => 1.0,
        }
    }

    /// An attempt on `bus` failed and `remaining_tries` attempts are left.
    pub fn note_retryable_failure(&self, bus: BusId, remaining_tries: u32) {
        if !self.is_enabled() {
            return;
        }
        self.lock().get_or_create(bus).note_retryable_failure(remaining_tries);
    }

    /// Report the outcome of a complete operation on `bus`.
    ///
    /// Returns the baseline change it caused, or `None` when disabled.
    pub fn record_final(&self, bus: BusId, success: bool, tries_used: u32) -> Option<Adjustment> {
        self.record_final_at(bus, success, tries_used, epoch_seconds())
    }

    /// [`record_final`](Self::record_final) with an explicit timestamp.
    pub fn record_final_at(
        &self,
        bus: BusId,
        success: bool,
        tries_used: u32,
        timestamp: i64,
    ) -> Option<Adjustment> {
        if !self.is_enabled() {
            return None;
        }
        let mut registry = self.lock();
        let (params, state) = registry.params_and_state(bus);
        if !success {
            state.record_failure(params);
            return Some(Adjustment::Unchanged {
                step: state.current_step,
            });
        }

        let adjustment = state.record_success(tries_used, timestamp, params);
        match adjustment {
            Adjustment::Raised { from, to } | Adjustment::Lowered { from, to } => {
                info!(bus, from, to, tries_used, "Sleep step changed");
            }
            Adjustment::Unchanged { .. } => {}
        }
        Some(adjustment)
    }

    /// Apply a new baseline multiplier to every known bus and to buses seen
    /// later. Returns the resulting step.
    pub fn reset_multiplier(&self, multiplier: f64) -> Step {
        self.lock().reset_multiplier(multiplier)
    }

    /// Start `bus` over at `multiplier` (default 1.0). Returns the new step.
    pub fn reset_bus(&self, bus: BusId, multiplier: Option<f64>) -> Step {
        self.lock().reset_bus(bus, multiplier).current_step
    }

    /// The host identified the monitor on `bus` by its EDID checksum byte.
    pub fn note_bus_detected(&self, bus: BusId, edid_checksum: u8) -> BusDetection {
        let detection = self.lock().note_bus_detected(bus, edid_checksum);
        debug!(bus, ?detection, "Bus detected");
        detection
    }

    /// Copy of the state of `bus`, if known.
    pub fn bus_state(&self, bus: BusId) -> Option<BusRetryState> {
        self.lock().get(bus).cloned()
    }

    /// Known bus numbers in ascending order.
    pub fn bus_ids(&self) -> Vec<BusId> {
        self.lock().bus_ids()
    }

    /// Write statistics for every known bus. Returns the number of buses.
    pub fn save_stats(&self) -> Result<usize, StatsError> {
        let registry = self.lock();
        self.stats_file.save(&registry).map_err(|e| {
            error!(errno = e.errno(), "Failed to save dynamic sleep statistics: {}", e);
            e
        })
    }

    /// Replace the registry with the contents of the statistics file.
    ///
    /// A missing file is a cold start and leaves the registry untouched. Any
    /// error leaves the registry empty, so every bus starts from defaults.
    pub fn restore_stats(&self) -> Result<usize, StatsError> {
        let mut registry = self.lock();
        match self.stats_file.load(registry.params()) {
            Ok(Some(table)) => {
                let count = table.len();
                registry.replace_all(table);
                info!(
                    path = %self.stats_file.path().display(),
                    buses = count,
                    "Restored dynamic sleep statistics"
                );
                Ok(count)
            }
            Ok(None) => Ok(0),
            Err(e) => {
                registry.clear();
                for line_error in e.line_errors() {
                    warn!("{}", line_error);
                }
                error!(errno = e.errno(), "Discarding dynamic sleep statistics: {}", e);
                Err(e)
            }
        }
    }

    /// Delete the statistics file.
    pub fn erase_stats(&self) -> Result<(), StatsError> {
        let _registry = self.lock();
        self.stats_file.erase()
    }

    /// Snapshot of settings, state and counters for every bus.
    pub fn report(&self) -> StatsReport {
        let registry = self.lock();
        let params = registry.params();
        StatsReport::new(
            self.is_enabled(),
            params.initial_step,
            params.adjustment_interval,
            registry.iter_sorted().map(BusReport::from).collect(),
        )
    }
}
