use rand::Rng;
use std::time::Duration;

/// Fraction of the delay randomised in either direction
const JITTER: f64 = 0.2;

/// Delay before retry number `attempt` (1-based)
///
/// Doubles from `base` per attempt, capped at `max`, then scaled by
/// `jitter_factor` which callers draw from `[1 - JITTER, 1 + JITTER]`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration, jitter_factor: f64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let raw = base.saturating_mul(1u32 << exponent).min(max);
    let factor = jitter_factor.clamp(1.0 - JITTER, 1.0 + JITTER);
    Duration::from_millis((raw.as_millis() as f64 * factor).round() as u64)
}

/// [`backoff_delay`] with a random jitter factor
pub fn retry_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range((1.0 - JITTER)..=(1.0 + JITTER));
    backoff_delay(attempt, base, max, factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_secs(1);
    const MAX: Duration = Duration::from_secs(30);

    #[test]
    fn test_doubles_until_cap() {
        assert_eq!(backoff_delay(1, BASE, MAX, 1.0), Duration::from_secs(1));
        assert_eq!(backoff_delay(2, BASE, MAX, 1.0), Duration::from_secs(2));
        assert_eq!(backoff_delay(3, BASE, MAX, 1.0), Duration::from_secs(4));
        assert_eq!(backoff_delay(6, BASE, MAX, 1.0), MAX);
        assert_eq!(backoff_delay(40, BASE, MAX, 1.0), MAX);
    }

    #[test]
    fn test_jitter_is_bounded() {
        assert_eq!(backoff_delay(1, BASE, MAX, 5.0), Duration::from_millis(1200));
        assert_eq!(backoff_delay(1, BASE, MAX, 0.0), Duration::from_millis(800));

        for _ in 0..100 {
            let delay = retry_delay(2, BASE, MAX);
            assert!(delay >= Duration::from_millis(1600));
            assert!(delay <= Duration::from_millis(2400));
        }
    }
}
