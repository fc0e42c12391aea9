// Exponential backoff with optional jitter
use rand::Rng;
use std::time::Duration;

use crate::config::RecoveryConfiguration;

/// Fraction of the delay that jitter may add or remove
pub const JITTER_RATIO: f64 = 0.1;

/// `min(base_delay * multiplier^attempt, max_delay)`, without jitter.
///
/// `attempt` is 0-based: the sleep before retry try `n` uses `attempt = n - 1`.
pub fn base_delay(attempt: u32, config: &RecoveryConfiguration) -> Duration {
    let max = config.max_delay.as_nanos() as f64;
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let raw = config.base_delay.as_nanos() as f64 * config.backoff_multiplier.powi(exponent);

    if !raw.is_finite() || raw >= max {
        return config.max_delay;
    }
    Duration::from_nanos(raw.max(0.0) as u64)
}

/// Backoff delay using the caller's random source
pub fn delay_with_rng<R: Rng + ?Sized>(
    attempt: u32,
    config: &RecoveryConfiguration,
    rng: &mut R,
) -> Duration {
    let delay = base_delay(attempt, config);
    if !config.jitter || delay.is_zero() {
        return delay;
    }

    let nanos = delay.as_nanos() as f64;
    let spread = nanos * JITTER_RATIO;
    let jittered = nanos + rng.gen_range(-spread..=spread);
    Duration::from_nanos(jittered.max(0.0) as u64)
}

/// Backoff delay using the thread-local random source
pub fn delay(attempt: u32, config: &RecoveryConfiguration) -> Duration {
    delay_with_rng(attempt, config, &mut rand::thread_rng())
}

/// First `count` un-jittered delays
pub fn schedule(config: &RecoveryConfiguration, count: u32) -> Vec<Duration> {
    (0..count).map(|attempt| base_delay(attempt, config)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn config() -> RecoveryConfiguration {
        RecoveryConfiguration::default()
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(1))
            .with_backoff_multiplier(2.0)
            .with_jitter(false)
    }

    #[test]
    fn test_backoff_is_monotonic_and_capped() {
        let config = config();
        let delays = schedule(&config, 8);
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert_eq!(delays[2], Duration::from_millis(400));
        assert_eq!(delays[3], Duration::from_millis(800));
        for window in delays.windows(2) {
            assert!(window[0] <= window[1]);
        }
        assert!(delays.iter().all(|d| *d <= config.max_delay));
        assert_eq!(delays[7], Duration::from_secs(1));
    }

    #[test]
    fn test_huge_attempt_saturates() {
        let config = config();
        assert_eq!(base_delay(u32::MAX, &config), config.max_delay);
        assert_eq!(base_delay(5000, &config), config.max_delay);
    }

    #[test]
    fn test_no_jitter_is_deterministic() {
        let config = config();
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(
            delay_with_rng(2, &config, &mut rng),
            Duration::from_millis(400)
        );
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let config = config().with_jitter(true);
        let mut rng = StdRng::seed_from_u64(42);
        for attempt in 0..6 {
            let expected = base_delay(attempt, &config).as_secs_f64();
            for _ in 0..200 {
                let actual = delay_with_rng(attempt, &config, &mut rng).as_secs_f64();
                assert!(actual >= expected * 0.9 - 1e-9, "{actual} below {expected}");
                assert!(actual <= expected * 1.1 + 1e-9, "{actual} above {expected}");
            }
        }
    }
}
