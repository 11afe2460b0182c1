use std::time::Duration;

/// Reconnect delay for outbound transports: quadratic in the attempt
/// number, capped at 15 s (1 s, 4 s, 9 s, then the cap).
pub fn reconnect_delay(attempt: u32) -> Duration {
    let step = attempt.clamp(1, 5) as u64;
    Duration::from_millis((1000 * step * step).min(15_000))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn curve_matches_documented_delays() {
        let expected = [1000, 4000, 9000, 15_000, 15_000, 15_000, 15_000];
        for (idx, millis) in expected.iter().enumerate() {
            assert_eq!(
                reconnect_delay(idx as u32 + 1),
                Duration::from_millis(*millis),
                "attempt {}",
                idx + 1
            );
        }
    }

    #[test]
    fn zero_attempt_behaves_like_first() {
        assert_eq!(reconnect_delay(0), Duration::from_millis(1000));
    }
}
