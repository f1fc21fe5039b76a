use std::time::Duration;

use rand::Rng;

/// Exponential backoff with ±50% jitter, capped.
///
/// attempt 0 → ~1s, attempt 1 → ~2s, attempt 2 → ~4s, …
pub fn retry_backoff(attempt: i32, cap: Duration) -> Duration {
    let base_ms = 1000u64.saturating_mul(1u64 << attempt.clamp(0, 20) as u32);
    let capped = base_ms.min(cap.as_millis() as u64).max(1);
    let jittered = rand::thread_rng().gen_range(capped / 2..=capped + capped / 2);
    Duration::from_millis(jittered.min(cap.as_millis() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let cap = Duration::from_secs(30);
        for attempt in 0..10 {
            let d = retry_backoff(attempt, cap);
            assert!(d <= cap, "attempt {attempt} exceeded cap: {d:?}");
            assert!(d >= Duration::from_millis(1));
        }
        // Late attempts sit at the cap (within jitter's lower half).
        let late = retry_backoff(15, cap);
        assert!(late >= cap / 2);
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        let d = retry_backoff(i32::MAX, Duration::from_secs(60));
        assert!(d <= Duration::from_secs(60));
    }
}
