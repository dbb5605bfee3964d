//! Point-in-time snapshots of system-wide and per-process metrics.

pub mod process;
pub mod system;

pub use process::ProcessSnapshotter;
pub use system::SystemSnapshotter;

use crate::sample::Reading;

/// Delta of a cumulative counter against its previous value, updating it.
/// A counter that went backwards reports zero.
pub(crate) fn delta(prev: &mut u64, cur: u64) -> Reading {
    let d = cur.saturating_sub(*prev);
    *prev = cur;
    Reading::Value(d as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_updates_previous() {
        let mut prev = 10;
        assert_eq!(delta(&mut prev, 15), Reading::Value(5.0));
        assert_eq!(prev, 15);
        assert_eq!(delta(&mut prev, 3), Reading::Value(0.0));
        assert_eq!(prev, 3);
    }
}
