//! Dynamic sleep adjustment for DDC/CI over I2C.
//!
//! Monitors differ wildly in how long they need between a DDC request and its
//! reply. This crate keeps a per-bus sleep multiplier that rises when
//! operations need retries and decays while they succeed cleanly, and persists
//! what it learned between runs.
//!
//! The entry point is [`controller::DynamicSleep`]. [`retry_loop::with_retry`]
//! shows how an I/O layer consumes it.

pub mod config;
pub mod controller;
pub mod core_logic;
pub mod error;
pub mod history;
pub mod logging;
pub mod metrics;
pub mod persistence;
pub mod registry;
pub mod retry_loop;
pub mod steps;

pub use controller::{DynamicSleep, IoPath};
pub use error::{DsaError, StatsError};
