//! Command line definitions for `ddc-dsa`.
//!
//! - `report`: show per-bus tuning state and counters
//! - `erase`: delete the statistics file
//! - `reset`: apply a new baseline multiplier
//! - `simulate`: drive the retry loop against a scripted bus
//! - `config`: show or initialize the tuning configuration

use clap::{Args, Parser, Subcommand};
use ddc_dynamic_sleep::logging::LogFormat;
use ddc_dynamic_sleep::retry_loop::{DEFAULT_MAX_TRIES, MAX_MAX_TRIES};
use ddc_dynamic_sleep::steps::{step_to_multiplier, MAX_STEP};
use std::path::PathBuf;

/// Inspect and tune DDC/CI dynamic sleep adjustment.
#[derive(Parser, Debug)]
#[command(name = "ddc-dsa", version, about, long_about = None, propagate_version = true)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "DDC_DSA_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Statistics file path
    #[arg(long, env = "DDC_DSA_STATS_FILE", global = true)]
    pub stats_file: Option<PathBuf>,

    /// Log filter (trace, debug, info, warn, error, or RUST_LOG directives)
    #[arg(short, long, env = "DDC_DSA_LOG_LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Log format (text, json)
    #[arg(long, default_value = "text", env = "DDC_DSA_LOG_FORMAT", global = true)]
    pub log_format: LogFormat,

    /// Also write JSON logs to the rotating log file
    #[arg(long, global = true)]
    pub log_file: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Show the cached per-bus statistics
    Report(ReportArgs),

    /// Delete the statistics file
    Erase,

    /// Apply a new baseline sleep multiplier
    ///
    /// Resets every cached bus (or just `--bus`) to the step for the
    /// multiplier, clears their known-good floor, and saves the statistics.
    Reset(ResetArgs),

    /// Run scripted operations through the retry loop
    ///
    /// Each value of `--tries` is the attempt on which one operation
    /// succeeds. Values above `--max-tries` make the operation fail.
    Simulate(SimulateArgs),

    /// Show the effective tuning configuration
    Config(ConfigArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct ReportArgs {
    /// Print JSON instead of text
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ResetArgs {
    /// New multiplier (0.0 ..= 2.0)
    #[arg(value_parser = parse_multiplier)]
    pub multiplier: f64,

    /// Only reset this bus
    #[arg(short, long)]
    pub bus: Option<u32>,

    /// Also store the multiplier as `initial_multiplier` in the config file
    #[arg(long, conflicts_with = "bus")]
    pub persist: bool,
}

#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    /// I2C bus number
    #[arg(short, long)]
    pub bus: u32,

    /// Comma separated attempt counts, one per operation
    #[arg(short, long, value_delimiter = ',', required = true)]
    pub tries: Vec<u32>,

    /// Attempt budget per operation
    #[arg(long, default_value_t = DEFAULT_MAX_TRIES,
          value_parser = clap::value_parser!(u32).range(1..=MAX_MAX_TRIES as i64))]
    pub max_tries: u32,

    /// Base delay before each attempt, in milliseconds
    #[arg(long, default_value_t = 0)]
    pub delay_ms: u64,

    /// EDID checksum byte (hex) of the simulated monitor
    #[arg(long, value_parser = parse_hex_byte)]
    pub edid: Option<u8>,

    /// Do not write the statistics file afterwards
    #[arg(long)]
    pub no_save: bool,
}

#[derive(Args, Debug, Clone, Default)]
pub struct ConfigArgs {
    /// Write the default configuration if no config file exists
    #[arg(long)]
    pub init: bool,
}

fn parse_multiplier(s: &str) -> Result<f64, String> {
    let value: f64 = s.parse().map_err(|_| format!("'{}' is not a number", s))?;
    let max = step_to_multiplier(MAX_STEP);
    if !value.is_finite() || !(0.0..=max).contains(&value) {
        return Err(format!("multiplier must be between 0.0 and {:.1}", max));
    }
    Ok(value)
}

fn parse_hex_byte(s: &str) -> Result<u8, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u8::from_str_radix(digits, 16).map_err(|_| format!("'{}' is not a hex byte", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_command() {
        let cli = Cli::try_parse_from(["ddc-dsa", "report", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::Report(ReportArgs { json: true })));
        assert_eq!(cli.log_format, LogFormat::Text);
    }

    #[test]
    fn test_global_options() {
        let cli = Cli::try_parse_from([
            "ddc-dsa",
            "erase",
            "--stats-file",
            "/tmp/stats",
            "--log-level",
            "debug",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Erase));
        assert_eq!(cli.stats_file, Some(PathBuf::from("/tmp/stats")));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert_eq!(cli.log_format, LogFormat::Json);
    }

    #[test]
    fn test_reset_command() {
        let cli = Cli::try_parse_from(["ddc-dsa", "reset", "0.5", "--bus", "4"]).unwrap();
        match cli.command {
            Commands::Reset(args) => {
                assert_eq!(args.multiplier, 0.5);
                assert_eq!(args.bus, Some(4));
            }
            other => panic!("unexpected command {:?}", other),
        }

        assert!(Cli::try_parse_from(["ddc-dsa", "reset", "2.5"]).is_err());
        assert!(Cli::try_parse_from(["ddc-dsa", "reset", "abc"]).is_err());
        assert!(
            Cli::try_parse_from(["ddc-dsa", "reset", "1.0", "--bus", "1", "--persist"]).is_err()
        );
    }

    #[test]
    fn test_simulate_command() {
        let cli = Cli::try_parse_from([
            "ddc-dsa", "simulate", "--bus", "3", "--tries", "1,1,5", "--edid", "0x3c",
        ])
        .unwrap();
        match cli.command {
            Commands::Simulate(args) => {
                assert_eq!(args.bus, 3);
                assert_eq!(args.tries, vec![1, 1, 5]);
                assert_eq!(args.max_tries, DEFAULT_MAX_TRIES);
                assert_eq!(args.edid, Some(0x3c));
                assert!(!args.no_save);
            }
            other => panic!("unexpected command {:?}", other),
        }

        assert!(Cli::try_parse_from(["ddc-dsa", "simulate", "--bus", "3"]).is_err());
        assert!(Cli::try_parse_from([
            "ddc-dsa", "simulate", "--bus", "3", "--tries", "1", "--max-tries", "16"
        ])
        .is_err());
    }

    #[test]
    fn test_parse_hex_byte() {
        assert_eq!(parse_hex_byte("ff"), Ok(0xff));
        assert_eq!(parse_hex_byte("0x0a"), Ok(0x0a));
        assert!(parse_hex_byte("100").is_err());
    }
}
