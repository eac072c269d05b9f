//! `ddc-dsa` - inspect and tune DDC/CI dynamic sleep adjustment.
//!
//! Loads the tuning configuration and the cached per-bus statistics, runs one
//! administrative command, and writes the statistics back when the command
//! changed them.

mod cli;

use clap::Parser;
use cli::{Cli, Commands, ConfigArgs, ReportArgs, ResetArgs, SimulateArgs};
use ddc_dynamic_sleep::config::ConfigManager;
use ddc_dynamic_sleep::controller::{DynamicSleep, IoPath};
use ddc_dynamic_sleep::error::DsaError;
use ddc_dynamic_sleep::logging::{self, LogOptions};
use ddc_dynamic_sleep::persistence::StatsFile;
use ddc_dynamic_sleep::retry_loop::{with_retry, RetryClass, RetryPolicy};
use ddc_dynamic_sleep::steps::step_to_multiplier;
use std::process::ExitCode;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

/// Failure produced by the scripted bus.
#[derive(Debug, Error)]
enum SimulatedError {
    #[error("no response from simulated monitor")]
    NoResponse,
}

impl RetryClass for SimulatedError {
    fn is_retryable(&self) -> bool {
        true
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_options = LogOptions {
        level: cli.log_level.clone(),
        format: cli.log_format,
        file: cli.log_file,
    };
    let _log_guard = match logging::init_logging(&log_options) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), DsaError> {
    let config_path = match cli.config {
        Some(path) => path,
        None => ConfigManager::default_path()?,
    };
    let config_manager = ConfigManager::load_or_default(&config_path)?;
    let config = config_manager.get();
    info!(path = %config_path.display(), "Configuration loaded");

    let stats_path = match cli.stats_file {
        Some(path) => path,
        None => StatsFile::default_path()?,
    };
    let ctx = DynamicSleep::new(&config, StatsFile::new(stats_path));

    match cli.command {
        Commands::Report(args) => report(&ctx, &args),
        Commands::Erase => {
            ctx.erase_stats()?;
            println!("Erased {}", ctx.stats_path().display());
            Ok(())
        }
        Commands::Reset(args) => reset(&ctx, &config_manager, &args),
        Commands::Simulate(args) => simulate(&ctx, &args).await,
        Commands::Config(args) => show_config(&config_manager, &args),
    }
}

/// Load cached statistics, continuing from defaults when they are unusable.
fn restore(ctx: &DynamicSleep) {
    if let Err(e) = ctx.restore_stats() {
        warn!("Starting without cached statistics: {}", e);
    }
}

fn report(ctx: &DynamicSleep, args: &ReportArgs) -> Result<(), DsaError> {
    restore(ctx);
    let report = ctx.report();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.render_text());
    }
    Ok(())
}

fn reset(
    ctx: &DynamicSleep,
    config_manager: &ConfigManager,
    args: &ResetArgs,
) -> Result<(), DsaError> {
    restore(ctx);
    let step = match args.bus {
        Some(bus) => ctx.reset_bus(bus, Some(args.multiplier)),
        None => ctx.reset_multiplier(args.multiplier),
    };

    if args.persist {
        let mut config = config_manager.get();
        config.initial_multiplier = args.multiplier;
        config_manager.update(config)?;
        info!(path = %config_manager.path().display(), "Stored initial multiplier");
    }

    let buses = ctx.save_stats()?;
    println!(
        "Reset to step {} (multiplier {:.2}), saved {} bus(es)",
        step,
        step_to_multiplier(step),
        buses
    );
    Ok(())
}

async fn simulate(ctx: &DynamicSleep, args: &SimulateArgs) -> Result<(), DsaError> {
    if args.tries.iter().any(|&t| t == 0) {
        return Err(DsaError::InvalidArgument("tries values must be at least 1".to_string()));
    }

    restore(ctx);
    if let Some(edid) = args.edid {
        ctx.note_bus_detected(args.bus, edid);
    }

    let path = IoPath::I2c { bus: args.bus };
    let policy = RetryPolicy::new(args.max_tries, Duration::from_millis(args.delay_ms));

    for (ndx, &succeed_on) in args.tries.iter().enumerate() {
        let before = ctx.bus_state(args.bus).map(|s| s.current_step);
        let outcome = with_retry(ctx, path, &policy, |attempt| async move {
            if attempt >= succeed_on {
                Ok(())
            } else {
                Err(SimulatedError::NoResponse)
            }
        })
        .await;

        let after = ctx.bus_state(args.bus).map(|s| s.current_step);
        let result = match outcome {
            Ok(((), tries)) => format!("ok after {} tries", tries),
            Err(e) => format!("failed: {}", e),
        };
        match (before, after) {
            (Some(b), Some(a)) if b != a => println!(
                "op {:3}: {:<40} step {} -> {} (multiplier {:.2})",
                ndx + 1,
                result,
                b,
                a,
                step_to_multiplier(a)
            ),
            (_, Some(a)) => println!(
                "op {:3}: {:<40} step {} (multiplier {:.2})",
                ndx + 1,
                result,
                a,
                step_to_multiplier(a)
            ),
            (_, None) => println!("op {:3}: {}", ndx + 1, result),
        }
    }

    if !args.no_save {
        let buses = ctx.save_stats()?;
        println!("Saved {} bus(es) to {}", buses, ctx.stats_path().display());
    }
    Ok(())
}

fn show_config(config_manager: &ConfigManager, args: &ConfigArgs) -> Result<(), DsaError> {
    if args.init && !config_manager.path().exists() {
        config_manager.save()?;
        println!("Wrote default configuration to {}", config_manager.path().display());
    }
    println!("{}", serde_json::to_string_pretty(&config_manager.get())?);
    Ok(())
}
