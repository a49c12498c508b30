//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

/// Delay for failure step `attempt` (1-based), jittered upward by at most 10%.
///
/// Step 1 waits `base_ms`, each later step doubles it, and the doubled value
/// is capped at `max_ms` before jitter is added. Step 0 means "not backing off".
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let delay_ms = capped_delay_ms(attempt, base_ms, max_ms);
    let jitter = jitter_ms(delay_ms, &mut rand::thread_rng());
    Duration::from_millis(delay_ms.saturating_add(jitter))
}

fn capped_delay_ms(attempt: u32, base_ms: u64, max_ms: u64) -> u64 {
    let Some(doublings) = attempt.checked_sub(1) else {
        return 0;
    };
    let factor = 1u64.checked_shl(doublings).unwrap_or(u64::MAX);
    base_ms.saturating_mul(factor).min(max_ms)
}

fn jitter_ms<R: Rng>(delay_ms: u64, rng: &mut R) -> u64 {
    match delay_ms / 10 {
        0 => 0,
        spread => rng.gen_range(0..spread),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubling_and_cap() {
        assert_eq!(capped_delay_ms(0, 100, 2_000), 0);
        assert_eq!(capped_delay_ms(1, 100, 2_000), 100);
        assert_eq!(capped_delay_ms(2, 100, 2_000), 200);
        assert_eq!(capped_delay_ms(5, 100, 2_000), 1_600);
        assert_eq!(capped_delay_ms(6, 100, 2_000), 2_000);
        assert_eq!(capped_delay_ms(64, 100, 2_000), 2_000);
        assert_eq!(capped_delay_ms(u32::MAX, 1_000, 60_000), 60_000);
    }

    #[test]
    fn test_jitter_bounds() {
        assert_eq!(calculate_backoff(0, 100, 2_000), Duration::ZERO);

        for _ in 0..50 {
            let d = calculate_backoff(3, 1_000, 60_000).as_millis();
            assert!((4_000..4_400).contains(&d), "{}", d);
        }

        assert!(calculate_backoff(64, u64::MAX, u64::MAX) >= Duration::from_millis(u64::MAX - 1));

        // Too small to jitter.
        assert_eq!(calculate_backoff(1, 5, 100), Duration::from_millis(5));
    }
}
