//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// Delay before retrying after failed attempt number `attempt` (1-based),
/// without jitter: `min(max_delay, base_delay * multiplier^(attempt - 1))`.
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let max_ms = config.max_delay_ms as f64;
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let delay_ms = config.base_delay_ms as f64 * config.backoff_multiplier.powi(exponent);
    let capped = if delay_ms.is_finite() { delay_ms.min(max_ms) } else { max_ms };

    Duration::from_nanos((capped.max(0.0) * 1_000_000.0).round() as u64)
}

/// Scale `delay` by a uniform random factor in `[0.5, 1.0]`.
pub fn apply_jitter<R: Rng + ?Sized>(delay: Duration, rng: &mut R) -> Duration {
    delay.mul_f64(rng.gen_range(0.5..=1.0))
}

/// Delay for `attempt` with jitter applied when the config asks for it.
pub fn next_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let delay = calculate_backoff(attempt, config);
    if config.jitter {
        apply_jitter(delay, &mut rand::thread_rng())
    } else {
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn config(jitter: bool) -> RetryConfig {
        RetryConfig {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 1000,
            backoff_multiplier: 2.0,
            jitter,
        }
    }

    #[test]
    fn test_backoff_calculation() {
        let config = config(false);
        assert_eq!(calculate_backoff(0, &config), Duration::ZERO);
        assert_eq!(calculate_backoff(1, &config), Duration::from_millis(100));
        assert_eq!(calculate_backoff(2, &config), Duration::from_millis(200));
        assert_eq!(calculate_backoff(3, &config), Duration::from_millis(400));
        assert_eq!(calculate_backoff(5, &config), Duration::from_millis(1000));
        assert_eq!(calculate_backoff(u32::MAX, &config), Duration::from_millis(1000));
    }

    #[test]
    fn test_fractional_multiplier() {
        let config = RetryConfig {
            backoff_multiplier: 1.5,
            ..config(false)
        };
        assert_eq!(calculate_backoff(3, &config), Duration::from_millis(225));
    }

    #[test]
    fn test_jitter_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let delay = Duration::from_millis(400);
        for _ in 0..1000 {
            let jittered = apply_jitter(delay, &mut rng);
            assert!(jittered >= Duration::from_millis(200));
            assert!(jittered <= delay);
        }
    }

    #[test]
    fn test_next_delay_respects_jitter_flag() {
        assert_eq!(next_delay(2, &config(false)), Duration::from_millis(200));
        let jittered = next_delay(2, &config(true));
        assert!(jittered >= Duration::from_millis(100) && jittered <= Duration::from_millis(200));
    }
}
