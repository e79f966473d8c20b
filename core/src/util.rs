use std::time::Duration;

use rand::Rng;

/// Exponential backoff with jitter for rate-limit retries (§4.6, §9):
/// `base_delay_ms * 2^(attempt-1) * jitter(0.8..1.2)`.
pub fn backoff(base_delay_ms: u64, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let base = base_delay_ms.saturating_mul(1u64 << exp);
    let jitter = rand::rng().random_range(0.8..1.2);
    let delay_ms = (base as f64 * jitter) as u64;
    Duration::from_millis(delay_ms)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn backoff_grows_with_attempt() {
        // With jitter in [0.8, 1.2), attempt N+1's minimum (0.8x) must still
        // exceed attempt N's maximum (1.2x) once the base has doubled enough
        // times; check a widely-separated pair instead of adjacent ones to
        // avoid flakiness from jitter overlap.
        let small = backoff(200, 1).as_millis();
        let large = backoff(200, 6).as_millis();
        assert!(large > small * 4);
    }
}
