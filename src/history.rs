//! Bounded per-bus history of completed operations.
//!
//! Each bus keeps the outcome of its most recent successful operations in a
//! fixed-capacity circular buffer, so memory stays bounded regardless of how
//! long the process runs.

use crate::steps::Step;
use std::time::{SystemTime, UNIX_EPOCH};

/// Default number of records retained per bus.
pub const DEFAULT_HISTORY_CAPACITY: usize = 20;

/// Outcome of one completed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvocationRecord {
    /// Wall-clock seconds since the Unix epoch.
    pub timestamp: i64,
    /// Number of attempts the operation needed.
    pub tries_used: u32,
    /// Step in effect when the operation succeeded.
    pub step: Step,
}

impl InvocationRecord {
    pub fn new(timestamp: i64, tries_used: u32, step: Step) -> Self {
        Self {
            timestamp,
            tries_used,
            step,
        }
    }

    /// Create a record stamped with the current wall-clock time.
    pub fn now(tries_used: u32, step: Step) -> Self {
        Self::new(epoch_seconds(), tries_used, step)
    }
}

/// Current wall-clock time in whole seconds since the Unix epoch.
pub fn epoch_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Fixed-capacity circular buffer of [`InvocationRecord`]s.
///
/// Writes go to `next_pos` and overwrite the oldest record once the buffer is
/// full. Logical index 0 is always the oldest record still held.
#[derive(Debug, Clone)]
pub struct HistoryRing {
    slots: Vec<InvocationRecord>,
    capacity: usize,
    count: usize,
    next_pos: usize,
}

impl HistoryRing {
    /// Create a ring with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    /// Create a ring holding at most `capacity` records (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            count: 0,
            next_pos: 0,
        }
    }

    /// Append a record, overwriting the oldest one when full.
    pub fn add(&mut self, record: InvocationRecord) {
        if self.slots.len() < self.capacity {
            self.slots.push(record);
        } else {
            self.slots[self.next_pos] = record;
        }
        self.next_pos = (self.next_pos + 1) % self.capacity;
        if self.count < self.capacity {
            self.count += 1;
        }
    }

    /// Physical slot of a logical index, or `None` past the last record.
    fn physical_index(&self, logical: usize) -> Option<usize> {
        if logical >= self.count {
            return None;
        }
        if self.count < self.capacity {
            Some(logical)
        } else {
            Some((self.next_pos + logical) % self.capacity)
        }
    }

    /// Record at a logical index (0 = oldest).
    pub fn get(&self, logical: usize) -> Option<&InvocationRecord> {
        self.physical_index(logical).map(|ndx| &self.slots[ndx])
    }

    /// The most recent `k` records, oldest first.
    pub fn latest(&self, k: usize) -> Vec<InvocationRecord> {
        let skip = self.count.saturating_sub(k);
        (skip..self.count)
            .filter_map(|logical| self.get(logical).copied())
            .collect()
    }

    /// All records, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &InvocationRecord> + '_ {
        (0..self.count).filter_map(move |logical| self.get(logical))
    }

    /// Number of records currently held.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every record.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.count = 0;
        self.next_pos = 0;
    }
}

/// Rings are equal when they hold the same records in the same logical order
/// and have the same capacity, regardless of where the write cursor sits.
impl PartialEq for HistoryRing {
    fn eq(&self, other: &Self) -> bool {
        self.capacity == other.capacity && self.count == other.count && self.iter().eq(other.iter())
    }
}

impl Eq for HistoryRing {}

impl Default for HistoryRing {
    fn default() -> Self {
        Self::new()
    }
}
