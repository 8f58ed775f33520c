//! General utilities shared across the engine.

use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current Unix timestamp in milliseconds.
///
/// Returns 0 if the system clock is before the Unix epoch (shouldn't happen
/// in practice).
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Compares two 16-bit sequence numbers with wrap-around semantics, treating
/// the gap between them as a signed half-space: `a` is considered "less
/// than" `b` if advancing from `a` to `b` is a shorter walk forward than
/// backward.
///
/// Used by [`ReorderQueue`](crate::reorder::ReorderQueue) so that a sequence
/// number near `u16::MAX` compares correctly against one that has wrapped
/// around to a small value.
#[must_use]
pub fn seq_lt(a: u16, b: u16) -> bool {
    (a.wrapping_sub(b) as i16) < 0
}

/// `a >= b` under the same wrap-around rule as [`seq_lt`].
#[must_use]
pub fn seq_ge(a: u16, b: u16) -> bool {
    !seq_lt(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_millis_is_nonzero() {
        assert!(now_millis() > 0);
    }

    #[test]
    fn seq_lt_handles_simple_order() {
        assert!(seq_lt(1, 2));
        assert!(!seq_lt(2, 1));
        assert!(!seq_lt(5, 5));
    }

    #[test]
    fn seq_lt_handles_wraparound() {
        // 65535 is "less than" 1 once the counter wraps.
        assert!(seq_lt(u16::MAX, 1));
        assert!(!seq_lt(1, u16::MAX));
    }

    #[test]
    fn seq_ge_is_the_complement_of_seq_lt() {
        for (a, b) in [(1u16, 2u16), (2, 1), (5, 5), (u16::MAX, 1), (1, u16::MAX)] {
            assert_eq!(seq_ge(a, b), !seq_lt(a, b));
        }
    }
}
