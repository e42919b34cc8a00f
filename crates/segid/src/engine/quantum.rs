use std::time::{Duration, Instant};

/// Multiplier on the target duration separating "demand matches target"
/// from "demand below target".
const SEGMENT_FACTOR: u32 = 2;

/// Sizes the next lease from how fast the current segment is draining.
///
/// `activated_at` is the instant the current bucket was promoted, `None` if
/// no bucket was ever activated. Cold start applies no scaling, so the
/// engine's first lease uses the configured initial quantum. Afterwards the
/// quantum doubles while a segment drains faster than `segment_duration`,
/// holds while it drains within [1x, 2x) of it, and halves beyond that.
///
/// The result is clamped to `min_quantum` first, `max_quantum` second: on
/// conflict the max wins, bounding how many reserved IDs a mid-segment
/// crash can forfeit.
pub(crate) fn next_quantum(
    last_quantum: u64,
    activated_at: Option<Instant>,
    segment_duration: Duration,
    min_quantum: u64,
    max_quantum: u64,
) -> u64 {
    let mut quantum = last_quantum;
    if let Some(activated_at) = activated_at {
        let elapsed = activated_at.elapsed();
        if elapsed < segment_duration {
            quantum = quantum.saturating_mul(2);
        } else if elapsed < segment_duration * SEGMENT_FACTOR {
            // draining on target, keep the size
        } else {
            quantum /= 2;
        }
    }
    quantum.max(min_quantum).min(max_quantum)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEGMENT_DURATION: Duration = Duration::from_millis(100);

    #[test]
    fn scales_with_observed_segment_lifetime() {
        let (initial, min, max) = (20, 10, 40);

        // First-ever lease: the initial quantum passes through unscaled.
        let quantum = next_quantum(initial, None, SEGMENT_DURATION, min, max);
        assert_eq!(quantum, initial);

        // Renewal triggered almost immediately after activation: demand
        // outpaces the target, so the quantum doubles.
        let activated_at = Instant::now();
        let quantum = next_quantum(quantum, Some(activated_at), SEGMENT_DURATION, min, max);
        assert_eq!(quantum, max);

        // The segment outlived twice the target: demand dropped, halve.
        std::thread::sleep(SEGMENT_DURATION * 2);
        let quantum = next_quantum(quantum, Some(activated_at), SEGMENT_DURATION, min, max);
        assert_eq!(quantum, max / 2);
    }

    #[test]
    fn growth_is_clamped_by_max() {
        let activated_at = Some(Instant::now());
        assert_eq!(next_quantum(3_000, activated_at, SEGMENT_DURATION, 30, 3_000), 3_000);
    }

    #[test]
    fn shrink_is_clamped_by_min() {
        let activated_at = Some(Instant::now() - SEGMENT_DURATION * 10);
        assert_eq!(next_quantum(40, activated_at, SEGMENT_DURATION, 30, 3_000), 30);
    }

    #[test]
    fn max_wins_over_min_on_conflict() {
        // Deliberately inverted bounds: the max clamp is applied last.
        assert_eq!(next_quantum(500, None, SEGMENT_DURATION, 100, 50), 50);
    }
}
