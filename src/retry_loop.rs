//! Async retry loop driven by the dynamic sleep multiplier.
//!
//! This is the consumer side of [`DynamicSleep`]: before every attempt it
//! sleeps the base DDC delay scaled by the bus's current multiplier, feeds
//! each retryable failure back as an escalation, and reports the final
//! outcome once the operation completes.

use crate::controller::{DynamicSleep, IoPath};
use crate::error::RetryError;
use std::future::Future;
use std::io;
use std::time::Duration;
use tracing::{debug, warn};

/// Normal DDC/CI response delay.
pub const DDC_BASE_DELAY: Duration = Duration::from_millis(50);

/// Default attempt budget for a write-read exchange.
pub const DEFAULT_MAX_TRIES: u32 = 10;

/// Upper bound accepted for any attempt budget.
pub const MAX_MAX_TRIES: u32 = 15;

/// Classifies operation errors as worth another attempt or not.
pub trait RetryClass {
    fn is_retryable(&self) -> bool;
}

impl RetryClass for io::Error {
    fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            io::ErrorKind::TimedOut
                | io::ErrorKind::WouldBlock
                | io::ErrorKind::Interrupted
                | io::ErrorKind::InvalidData
        )
    }
}

/// Attempt budget and base delay for one kind of operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_tries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// `max_tries` is clamped to `1..=MAX_MAX_TRIES`.
    pub fn new(max_tries: u32, base_delay: Duration) -> Self {
        Self {
            max_tries: max_tries.clamp(1, MAX_MAX_TRIES),
            base_delay,
        }
    }

    /// Sleep before an attempt at the given multiplier.
    pub fn delay_for(&self, multiplier: f64) -> Duration {
        if !multiplier.is_finite() || multiplier <= 0.0 {
            return Duration::ZERO;
        }
        self.base_delay.mul_f64(multiplier)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TRIES, DDC_BASE_DELAY)
    }
}

/// Run `op` until it succeeds, fails fatally, or exhausts `policy.max_tries`.
///
/// `op` receives the 1-based attempt number. On success returns the value and
/// the number of tries used.
pub async fn with_retry<T, E, F, Fut>(
    ctx: &DynamicSleep,
    path: IoPath,
    policy: &RetryPolicy,
    mut op: F,
) -> Result<(T, u32), RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryClass + std::error::Error + 'static,
{
    let bus = path.bus();
    let max_tries = policy.max_tries.max(1);
    let mut tries = 0;

    loop {
        tries += 1;
        let delay = policy.delay_for(ctx.sleep_multiplier(&path));
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match op(tries).await {
            Ok(value) => {
                if let Some(bus) = bus {
                    ctx.record_final(bus, true, tries);
                }
                return Ok((value, tries));
            }
            Err(e) if e.is_retryable() && tries < max_tries => {
                debug!(?path, tries, error = %e, "Retryable failure");
                if let Some(bus) = bus {
                    ctx.note_retryable_failure(bus, max_tries - tries);
                }
            }
            Err(e) => {
                if let Some(bus) = bus {
                    ctx.record_final(bus, false, tries);
                }
                return if e.is_retryable() {
                    warn!(?path, tries, error = %e, "Retries exhausted");
                    Err(RetryError::Exhausted { tries, source: e })
                } else {
                    warn!(?path, tries, error = %e, "Fatal error, not retrying");
                    Err(RetryError::Fatal { tries, source: e })
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TuningConfig;
    use crate::persistence::StatsFile;
    use std::collections::VecDeque;
    use tempfile::{tempdir, TempDir};
    use thiserror::Error;

    #[derive(Debug, Error, PartialEq)]
    enum BusError {
        #[error("no response")]
        NoResponse,
        #[error("unsupported feature")]
        Unsupported,
    }

    impl RetryClass for BusError {
        fn is_retryable(&self) -> bool {
            matches!(self, BusError::NoResponse)
        }
    }

    fn context() -> (DynamicSleep, TempDir) {
        let dir = tempdir().unwrap();
        let ctx = DynamicSleep::new(
            &TuningConfig::default(),
            StatsFile::new(dir.path().join("stats")),
        );
        (ctx, dir)
    }

    fn policy(max_tries: u32) -> RetryPolicy {
        RetryPolicy::new(max_tries, Duration::ZERO)
    }

    fn scripted(
        outcomes: Vec<Result<u8, BusError>>,
    ) -> impl FnMut(u32) -> std::future::Ready<Result<u8, BusError>> {
        let mut script: VecDeque<_> = outcomes.into();
        move |_| std::future::ready(script.pop_front().unwrap_or(Err(BusError::NoResponse)))
    }

    #[tokio::test]
    async fn test_succeeds_first_try() {
        let (ctx, _dir) = context();
        let path = IoPath::I2c { bus: 3 };
        let result = with_retry(&ctx, path, &policy(4), scripted(vec![Ok(7)])).await;
        assert_eq!(result.unwrap(), (7, 1));

        let state = ctx.bus_state(3).unwrap();
        assert_eq!(state.counters.successes, 1);
        assert_eq!(state.current_step, 6);
    }

    #[tokio::test]
    async fn test_retries_escalate_then_record() {
        let (ctx, _dir) = context();
        let outcomes = vec![
            Err(BusError::NoResponse),
            Err(BusError::NoResponse),
            Err(BusError::NoResponse),
            Err(BusError::NoResponse),
            Ok(1),
        ];
        let result = with_retry(&ctx, IoPath::I2c { bus: 3 }, &policy(5), scripted(outcomes)).await;
        assert_eq!(result.unwrap(), (1, 5));

        let state = ctx.bus_state(3).unwrap();
        assert_eq!(state.counters.retryable_failures, 4);
        assert_eq!(state.current_step, 10);
        assert!(state.failure_step_seen);
        assert_eq!(state.history.latest(1)[0].tries_used, 5);
    }

    #[tokio::test]
    async fn test_exhausted() {
        let (ctx, _dir) = context();
        let err = with_retry(&ctx, IoPath::I2c { bus: 1 }, &policy(3), scripted(Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, RetryError::Exhausted { tries: 3, .. }));

        let state = ctx.bus_state(1).unwrap();
        assert_eq!(state.counters.failures, 1);
        assert_eq!(state.counters.retryable_failures, 2);
        assert_eq!(state.retry_loop_step, state.current_step);
        assert!(state.history.is_empty());
    }

    #[tokio::test]
    async fn test_fatal_stops_immediately() {
        let (ctx, _dir) = context();
        let outcomes = vec![Err(BusError::NoResponse), Err(BusError::Unsupported), Ok(1)];
        let err = with_retry(&ctx, IoPath::I2c { bus: 1 }, &policy(5), scripted(outcomes))
            .await
            .unwrap_err();
        assert_eq!(err.tries(), 2);
        assert_eq!(err.into_source(), BusError::Unsupported);
    }

    #[tokio::test]
    async fn test_usb_path_skips_registry() {
        let (ctx, _dir) = context();
        let outcomes = vec![Err(BusError::NoResponse), Ok(2)];
        let path = IoPath::Usb { hiddev: 0 };
        let result = with_retry(&ctx, path, &policy(3), scripted(outcomes)).await;
        assert_eq!(result.unwrap(), (2, 2));
        assert!(ctx.bus_ids().is_empty());
    }

    #[test]
    fn test_policy_delay() {
        let policy = RetryPolicy::new(4, Duration::from_millis(50));
        assert_eq!(policy.delay_for(1.0), Duration::from_millis(50));
        assert_eq!(policy.delay_for(2.0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(0.0), Duration::ZERO);
        assert_eq!(policy.delay_for(f64::NAN), Duration::ZERO);
    }

    #[test]
    fn test_policy_clamps_tries() {
        assert_eq!(RetryPolicy::new(0, DDC_BASE_DELAY).max_tries, 1);
        assert_eq!(RetryPolicy::new(99, DDC_BASE_DELAY).max_tries, MAX_MAX_TRIES);
        assert_eq!(RetryPolicy::default().max_tries, DEFAULT_MAX_TRIES);
    }

    #[test]
    fn test_io_error_classification() {
        assert!(io::Error::from(io::ErrorKind::TimedOut).is_retryable());
        assert!(!io::Error::from(io::ErrorKind::PermissionDenied).is_retryable());
    }
}
