//! Restart back-off and polling jitter.
//!
//! The delay curve is a pure function of the consecutive-error counter so it
//! can be tested without timers; jitter is applied separately.

use std::time::Duration;

/// After this many consecutive subcomponent failures the worker escalates a
/// fatal error instead of restarting again.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 150;

const MIN_RESTART_SECS: f64 = 10.0;
const MAX_RESTART_SECS: f64 = 600.0;
const RESTART_JITTER_FRACTION: f64 = 0.05;

/// Restart delay before jitter: `clamp(9 + errors^2.5, 10s, 600s)`.
pub fn base_restart_delay(consecutive_errors: u32) -> Duration {
    let secs = (9.0 + (consecutive_errors as f64).powf(2.5)).clamp(MIN_RESTART_SECS, MAX_RESTART_SECS);
    Duration::from_secs_f64(secs)
}

/// Restart delay with ±5% jitter applied.
pub fn restart_delay(consecutive_errors: u32) -> Duration {
    jittered(base_restart_delay(consecutive_errors), RESTART_JITTER_FRACTION)
}

/// Perturb a polling interval by a symmetric jitter of
/// `± jitter_fraction × interval / 2`. A fraction of zero returns the
/// interval unchanged.
pub fn jittered_polling_interval(interval: Duration, jitter_fraction: f64) -> Duration {
    if jitter_fraction <= 0.0 {
        return interval;
    }
    jittered(interval, jitter_fraction / 2.0)
}

fn jittered(duration: Duration, fraction: f64) -> Duration {
    let secs = duration.as_secs_f64();
    let spread = secs * fraction;
    Duration::from_secs_f64(secs - spread + rand::random::<f64>() * 2.0 * spread)
}
