//! Small helpers shared across the crate: backoff math, clock, logging setup
//! and the log-and-ignore wrapper for side effects.

use std::fmt::Display;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{CourierError, CourierResult};

/// Exponential backoff: `min(base * 2^(attempt-1), max)`.
///
/// `attempt` is 1-based; 0 is treated as the first attempt.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> u64 {
    let exponent = attempt.saturating_sub(1);
    let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
    base_ms.saturating_mul(factor).min(max_ms)
}

/// Current time as epoch milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Run a telemetry/audit side effect result through the log, never failing
/// the caller.
pub(crate) fn log_and_ignore<T, E: Display>(what: &str, result: Result<T, E>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(side_effect = what, error = %e, "Side effect failed, ignoring");
            None
        }
    }
}

/// Install a global `tracing` subscriber according to the configuration.
///
/// `RUST_LOG` takes precedence over the configured level when set.
pub fn init_logging(config: &LoggingConfig) -> CourierResult<()> {
    let level: tracing::Level = config.level.into();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.include_targets);

    let installed = if config.json_format {
        builder.json().try_init()
    } else {
        builder.with_ansi(config.colored).try_init()
    };

    installed.map_err(|e| CourierError::config(format!("failed to install log subscriber: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_capped() {
        let delays: Vec<u64> = (1..=7)
            .map(|attempt| calculate_backoff(attempt, 15_000, 300_000))
            .collect();
        assert_eq!(
            delays,
            vec![15_000, 30_000, 60_000, 120_000, 240_000, 300_000, 300_000]
        );
    }

    #[test]
    fn test_backoff_never_overflows() {
        assert_eq!(calculate_backoff(0, 100, 1_000), 100);
        assert_eq!(calculate_backoff(200, 15_000, 300_000), 300_000);
        assert_eq!(calculate_backoff(64, u64::MAX / 2, u64::MAX), u64::MAX);
    }

    #[test]
    fn test_log_and_ignore() {
        assert_eq!(log_and_ignore::<_, String>("ok", Ok(3)), Some(3));
        assert_eq!(log_and_ignore::<u8, _>("err", Err("nope")), None);
    }

    #[test]
    fn test_now_millis_moves_forward() {
        let a = now_millis();
        let b = now_millis();
        assert!(b >= a);
        assert!(a > 1_600_000_000_000);
    }
}
