//! Retry delay calculation with exponential backoff

use std::time::Duration;

use rand::Rng;

/// Calculate how long to wait before retrying a failed attempt
///
/// # Formula
/// `delay = min(base * 2^attempt, max_delay) * (1 ± jitter)`, capped at `max_delay`
///
/// # Arguments
/// * `attempt` - The attempt that just failed (0 for the first dispatch)
/// * `base_delay_secs` - Base delay in seconds
/// * `max_delay_secs` - Maximum delay in seconds
/// * `jitter_factor` - Jitter factor (e.g., 0.2 for ±20%); 0 disables jitter
pub fn calculate_backoff(
    attempt: u32,
    base_delay_secs: u64,
    max_delay_secs: u64,
    jitter_factor: f64,
) -> Duration {
    let delay = if attempt >= 63 {
        max_delay_secs
    } else {
        base_delay_secs
            .saturating_mul(1u64 << attempt)
            .min(max_delay_secs)
    };

    if jitter_factor <= 0.0 || delay == 0 {
        return Duration::from_secs(delay);
    }

    #[allow(clippy::cast_precision_loss)]
    let jittered = {
        let delay = delay as f64;
        let jitter_range = delay * jitter_factor;
        let jitter: f64 = rand::rng().random_range(-jitter_range..=jitter_range);
        (delay + jitter).clamp(0.0, max_delay_secs as f64)
    };

    Duration::from_secs_f64(jittered)
}
