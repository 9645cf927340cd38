//! Reconnect delays: exponential with a cap and symmetric jitter

use rand::Rng;
use std::time::Duration;

/// Relative jitter applied around the exponential delay
const JITTER_RATIO: f64 = 0.2;

/// Delay before reconnect attempt `attempt` (1-based)
pub fn backoff_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let bounded = base_ms.saturating_mul(1u64 << exp).min(max_ms).max(1);

    let unit: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
    let jittered = (bounded as f64) * (1.0 + unit * JITTER_RATIO);
    Duration::from_millis(jittered.round().clamp(1.0, max_ms.max(1) as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_and_caps() {
        for _ in 0..50 {
            let first = backoff_delay(1, 1_000, 60_000).as_millis() as u64;
            assert!((800..=1_200).contains(&first));

            let fourth = backoff_delay(4, 1_000, 60_000).as_millis() as u64;
            assert!((6_400..=9_600).contains(&fourth));

            let late = backoff_delay(30, 1_000, 60_000).as_millis() as u64;
            assert!((48_000..=60_000).contains(&late));
        }
    }

    #[test]
    fn test_zero_attempt_is_base() {
        let d = backoff_delay(0, 500, 10_000).as_millis() as u64;
        assert!((400..=600).contains(&d));
    }
}
