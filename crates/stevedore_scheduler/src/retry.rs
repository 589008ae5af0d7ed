//! Backoff computation for retryable engine failures.

use std::time::Duration;

use rand::Rng;

use stevedore_protocol::config::RetryPolicy;

/// Delay before retry number `attempt` (0-based): exponential growth
/// capped at the policy maximum, scaled by a jitter factor drawn from
/// `[1 - ratio, 1 + ratio]`.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32, rng: &mut impl Rng) -> Duration {
    let exp = policy
        .base_delay
        .saturating_mul(2u32.saturating_pow(attempt.min(20)));
    let capped = exp.min(policy.max_delay);
    let ratio = policy.jitter_ratio.clamp(0.0, 1.0);
    if ratio == 0.0 {
        return capped;
    }
    let factor = rng.gen_range(1.0 - ratio..=1.0 + ratio);
    capped.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: f64) -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter_ratio: jitter,
        }
    }

    #[test]
    fn doubles_until_the_cap() {
        let mut rng = rand::thread_rng();
        let p = policy(0.0);
        assert_eq!(backoff_delay(&p, 0, &mut rng), Duration::from_millis(100));
        assert_eq!(backoff_delay(&p, 1, &mut rng), Duration::from_millis(200));
        assert_eq!(backoff_delay(&p, 2, &mut rng), Duration::from_millis(400));
        assert_eq!(backoff_delay(&p, 3, &mut rng), Duration::from_millis(800));
        assert_eq!(backoff_delay(&p, 4, &mut rng), Duration::from_secs(1));
        assert_eq!(backoff_delay(&p, 30, &mut rng), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_inside_the_ratio_band() {
        let mut rng = rand::thread_rng();
        let p = policy(0.25);
        for _ in 0..200 {
            let d = backoff_delay(&p, 1, &mut rng);
            assert!(d >= Duration::from_millis(150), "{d:?}");
            assert!(d <= Duration::from_millis(250), "{d:?}");
        }
    }
}
