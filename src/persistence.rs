//! Persisted per-bus statistics.
//!
//! The statistics file is plain text:
//!
//! ```text
//! FORMAT 1
//! * comment lines start with '*' or '#'
//! i2c-3 3c 6 5 3 0 0 {1700000000,1,7} {1700000042,2,7}
//! ```
//!
//! Each data line holds the bus name, the monitor's EDID checksum byte (hex),
//! current step, lookback, remaining interval, min known good step, the
//! failure-step-seen flag (`0`/`1`), then the bus history oldest first as
//! `{epoch,tries,step}` tuples.
//!
//! Parsing is a pure function from text to a complete table. A restore only
//! replaces the live registry once every line has been validated.

use crate::config::APP_DIR;
use crate::core_logic::{BusId, BusRetryState, TuningParams, MAX_RECORDED_TRIES};
use crate::error::{LineError, LineErrors, StatsError};
use crate::history::InvocationRecord;
use crate::registry::StateRegistry;
use crate::steps::{Step, MAX_STEP};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// The only format version this module reads or writes.
pub const FORMAT_VERSION: u32 = 1;

/// Fixed fields before the history tuples.
pub const MIN_FIELDS: usize = 7;

/// File name below the cache directory.
pub const STATS_FILE_NAME: &str = "stats";

const HEADER_COMMENTS: &[&str] = &[
    "* DEV  /dev/i2c device",
    "* EC   EDID check sum byte",
    "* C    current step",
    "* L    lookback",
    "* I    interval remaining",
    "* M    minimum known good step",
    "* F    failure step seen",
    "* Values {epoch seconds, tries, step}",
    "* DEV EC C L I M F Values",
];

/// Parsed contents of a statistics file, keyed by bus.
pub type StatsTable = HashMap<BusId, BusRetryState>;

/// Render one bus as a data line (without trailing newline).
pub fn format_bus_line(state: &BusRetryState) -> String {
    let mut line = format!(
        "i2c-{} {:02x} {} {} {} {} {}",
        state.bus_id,
        state.edid_checksum,
        state.current_step,
        state.lookback,
        state.remaining_interval,
        state.min_known_good_step,
        u8::from(state.failure_step_seen),
    );
    for record in state.history.iter() {
        let _ = write!(
            line,
            " {{{},{},{}}}",
            record.timestamp, record.tries_used, record.step
        );
    }
    line
}

/// Render the whole registry, buses in ascending order.
pub fn format_stats(registry: &StateRegistry) -> String {
    let mut out = format!("FORMAT {}\n", FORMAT_VERSION);
    for comment in HEADER_COMMENTS {
        out.push_str(comment);
        out.push('\n');
    }
    for state in registry.iter_sorted() {
        out.push_str(&format_bus_line(state));
        out.push('\n');
    }
    out
}

/// Parse a complete statistics file.
///
/// Returns every line error found; a single bad line invalidates the file.
pub fn parse_stats(text: &str, params: &TuningParams) -> Result<StatsTable, LineErrors> {
    let mut lines = text.lines().enumerate().map(|(ndx, line)| (ndx + 1, line));
    let mut table = StatsTable::new();

    let Some((_, header)) = lines.next() else {
        return Ok(table);
    };
    parse_header(header).map_err(|e| LineErrors(vec![e]))?;

    let mut errors = Vec::new();
    for (line_no, line) in lines {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('*') {
            continue;
        }
        match parse_bus_line(line_no, trimmed, params) {
            Ok(state) => {
                if table.contains_key(&state.bus_id) {
                    errors.push(LineError::new(line_no, line, "duplicate bus"));
                } else {
                    table.insert(state.bus_id, state);
                }
            }
            Err(e) => errors.push(e),
        }
    }

    if errors.is_empty() {
        Ok(table)
    } else {
        Err(LineErrors(errors))
    }
}

fn parse_header(line: &str) -> Result<(), LineError> {
    let version = line
        .trim()
        .strip_prefix("FORMAT ")
        .ok_or_else(|| LineError::new(1, line, "invalid format line"))?;
    match version.trim().parse::<u32>() {
        Ok(FORMAT_VERSION) => Ok(()),
        Ok(_) => Err(LineError::new(1, line, "unsupported format version")),
        Err(_) => Err(LineError::new(1, line, "invalid format version")),
    }
}

/// Parse `i2c-N` or `/dev/i2c-N`.
pub fn parse_bus_name(name: &str) -> Option<BusId> {
    let name = name.strip_prefix("/dev/").unwrap_or(name);
    let digits = name.strip_prefix("i2c-")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Parse a `{epoch,tries,step}` tuple. Tries must lie in
/// `1..=MAX_RECORDED_TRIES` and the step must be a valid table index.
pub fn parse_record(segment: &str) -> Option<InvocationRecord> {
    let inner = segment.strip_prefix('{')?.strip_suffix('}')?;
    let mut parts = inner.split(',');
    let timestamp = parts.next()?.parse::<i64>().ok()?;
    let tries_used = parts.next()?.parse::<u32>().ok()?;
    let step = parts.next()?.parse::<Step>().ok()?;
    if parts.next().is_some()
        || step > MAX_STEP
        || !(1..=MAX_RECORDED_TRIES).contains(&tries_used)
    {
        return None;
    }
    Some(InvocationRecord::new(timestamp, tries_used, step))
}

fn parse_bus_line(
    line_no: usize,
    line: &str,
    params: &TuningParams,
) -> Result<BusRetryState, LineError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let err = |reason: String| LineError::new(line_no, line, reason);

    if fields.len() < MIN_FIELDS {
        return Err(err(format!(
            "expected at least {} fields, found {}",
            MIN_FIELDS,
            fields.len()
        )));
    }

    let bus = parse_bus_name(fields[0])
        .ok_or_else(|| err(format!("invalid bus name '{}'", fields[0])))?;
    let edid_checksum = parse_checksum(fields[1])
        .ok_or_else(|| err(format!("invalid EDID checksum byte '{}'", fields[1])))?;
    let current_step = parse_step(fields[2], "current step", bus).map_err(&err)?;
    let lookback = fields[3]
        .parse::<usize>()
        .ok()
        .filter(|&l| l > 0)
        .ok_or_else(|| err(format!("invalid lookback '{}'", fields[3])))?;
    let remaining_interval = fields[4]
        .parse::<u32>()
        .map_err(|_| err(format!("invalid remaining interval '{}'", fields[4])))?;
    let min_known_good_step = parse_step(fields[5], "min known good step", bus).map_err(&err)?;
    let failure_step_seen = match fields[6] {
        "0" => false,
        "1" => true,
        other => return Err(err(format!("invalid failure step flag '{}'", other))),
    };
    if failure_step_seen && min_known_good_step > current_step {
        return Err(err(format!(
            "min known good step {} is above current step {}",
            min_known_good_step, current_step
        )));
    }

    let mut state = BusRetryState::new(bus, params);
    state.edid_checksum = edid_checksum;
    state.current_step = current_step;
    state.retry_loop_step = current_step;
    state.initial_step = current_step;
    state.lookback = lookback;
    state.remaining_interval = remaining_interval;
    state.min_known_good_step = min_known_good_step;
    state.failure_step_seen = failure_step_seen;
    state.from_cache = true;

    for segment in &fields[MIN_FIELDS..] {
        let record = parse_record(segment)
            .ok_or_else(|| err(format!("invalid history value '{}'", segment)))?;
        state.history.add(record);
    }

    Ok(state)
}

fn parse_checksum(field: &str) -> Option<u8> {
    if field.is_empty() || field.len() > 2 {
        return None;
    }
    u8::from_str_radix(field, 16).ok()
}

/// Parse a step field, clamping values above [`MAX_STEP`].
fn parse_step(field: &str, what: &str, bus: BusId) -> Result<Step, String> {
    let step = field
        .parse::<Step>()
        .map_err(|_| format!("invalid {} '{}'", what, field))?;
    if step > MAX_STEP {
        warn!(bus, step, max_step = MAX_STEP, "Resetting invalid cached {} to max step", what);
        return Ok(MAX_STEP);
    }
    Ok(step)
}

/// Write `bytes` to `temp_path`, then rename it over `path`. The temp file is
/// removed again when any step fails.
pub(crate) fn write_atomic(path: &Path, temp_path: &Path, bytes: &[u8]) -> io::Result<()> {
    fn write_and_rename(path: &Path, temp_path: &Path, bytes: &[u8]) -> io::Result<()> {
        let mut file = fs::File::create(temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(temp_path, path)
    }

    let result = write_and_rename(path, temp_path, bytes);
    if result.is_err() {
        let _ = fs::remove_file(temp_path);
    }
    result
}

/// The statistics file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsFile {
    path: PathBuf,
}

impl StatsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Default location (`$XDG_CACHE_HOME/ddc-dsa/stats`).
    pub fn default_path() -> Result<PathBuf, StatsError> {
        dirs::cache_dir()
            .map(|dir| dir.join(APP_DIR).join(STATS_FILE_NAME))
            .ok_or(StatsError::PathUnavailable)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: io::Error) -> StatsError {
        StatsError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Write every bus in `registry`, atomically replacing the old file.
    /// Returns the number of buses written.
    pub fn save(&self, registry: &StateRegistry) -> Result<usize, StatsError> {
        let contents = format_stats(registry);

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }

        let temp_path = self.path.with_extension("tmp");
        write_atomic(&self.path, &temp_path, contents.as_bytes()).map_err(|e| self.io_error(e))?;

        info!(
            path = %self.path.display(),
            buses = registry.len(),
            "Saved dynamic sleep statistics"
        );
        Ok(registry.len())
    }

    /// Read and fully validate the file. `Ok(None)` means there is no file.
    pub fn load(&self, params: &TuningParams) -> Result<Option<StatsTable>, StatsError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No statistics file, cold start");
                return Ok(None);
            }
            Err(e) => return Err(self.io_error(e)),
        };

        parse_stats(&text, params)
            .map(Some)
            .map_err(|errors| StatsError::BadData {
                path: self.path.clone(),
                errors,
            })
    }

    /// Delete the file. A missing file is not an error.
    pub fn erase(&self) -> Result<(), StatsError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "Erased dynamic sleep statistics");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_error(e)),
        }
    }
}
