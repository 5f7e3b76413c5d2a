use std::time::Duration;

/// Exponential backoff w/ "full jitter":
/// a random duration in [0, min(cap, base * 2^attempt)].
///
/// This tends to behave well under contention and avoids lockstep retries.
pub fn backoff_full_jitter(base: Duration, cap: Duration, attempt: usize) -> Duration {
    // Exponential term: base * 2^attempt, capped.
    // Use millis math to avoid Duration overflow footguns.
    let base_ms = base.as_millis() as u64;
    let cap_ms = cap.as_millis() as u64;

    // 2^attempt, saturating if attempt is huge.
    let pow = if attempt >= 63 {
        u64::MAX
    } else {
        1u64 << attempt
    };

    let exp_ms = base_ms.saturating_mul(pow);
    let upper = exp_ms.min(cap_ms).max(1); // avoid 0ms upper bound

    // Full jitter: uniform random in [0, upper]
    let jitter_ms = rand::random_range(0..=upper);
    Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_under_cap() {
        let base = Duration::from_millis(250);
        let cap = Duration::from_secs(2);
        for attempt in 0..20 {
            let d = backoff_full_jitter(base, cap, attempt);
            assert!(d <= cap, "attempt {attempt} produced {d:?}");
        }
    }

    #[test]
    fn huge_attempts_saturate_at_the_cap_bound() {
        let base = Duration::from_millis(250);
        let cap = Duration::from_secs(2);
        let d = backoff_full_jitter(base, cap, 1000);
        assert!(d <= cap);
    }
}
