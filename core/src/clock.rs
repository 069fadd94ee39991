//! Monotonic time and exponential decay math.
//!
//! All interval arithmetic in the pool runs on monotonic seconds anchored
//! at process start; wall-clock time appears only in logs and snapshots.
//! Inputs may be adversarial or clock-backward, so the bounded forms exist
//! as safety rails.

use once_cell::sync::Lazy;
use std::time::Instant;

static ANCHOR: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic now, in seconds since process start.
pub fn monotonic_now() -> f64 {
    ANCHOR.elapsed().as_secs_f64()
}

/// Plain interval `a - b` in seconds.
pub fn tdiff(a: f64, b: f64) -> f64 {
    a - b
}

/// Interval clamped away from zero so it can safely divide.
pub fn sane_tdiff(a: f64, b: f64) -> f64 {
    tdiff(a, b).max(1e-3)
}

/// Interval capped at 60 seconds, for timestamps that may lie.
pub fn us_tvdiff(a: f64, b: f64) -> f64 {
    tdiff(a, b).clamp(0.0, 60.0)
}

/// Interval capped at one hour.
pub fn ms_tvdiff(a: f64, b: f64) -> f64 {
    tdiff(a, b).clamp(0.0, 3600.0)
}

/// Time-weighted exponential moving average shared by every rolling-rate
/// field. `secs <= 0` is a no-op; the exponent is clamped at 36 so `exp`
/// cannot overflow; results below 2e-16 snap to zero.
pub fn decay_time(acc: &mut f64, add: f64, secs: f64, interval: f64) {
    if secs <= 0.0 {
        return;
    }
    let ratio = (secs / interval).min(36.0);
    let fprop = 1.0 - 1.0 / ratio.exp();
    *acc = (*acc + add / secs * fprop) / (1.0 + fprop);
    if *acc < 2e-16 {
        *acc = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_now_advances() {
        let a = monotonic_now();
        let b = monotonic_now();
        assert!(b >= a);
    }

    #[test]
    fn sane_tdiff_floors_at_millisecond() {
        assert_eq!(sane_tdiff(5.0, 5.0), 1e-3);
        assert_eq!(sane_tdiff(3.0, 10.0), 1e-3);
        assert!((sane_tdiff(10.0, 3.0) - 7.0).abs() < 1e-12);
    }

    #[test]
    fn bounded_diffs_cap() {
        assert_eq!(us_tvdiff(100.0, 0.0), 60.0);
        assert_eq!(ms_tvdiff(1e6, 0.0), 3600.0);
        assert_eq!(us_tvdiff(0.0, 100.0), 0.0);
    }

    #[test]
    fn decay_noop_on_non_positive_interval() {
        let mut acc = 1.5;
        decay_time(&mut acc, 100.0, 0.0, 300.0);
        assert_eq!(acc, 1.5);
        decay_time(&mut acc, 100.0, -5.0, 300.0);
        assert_eq!(acc, 1.5);
    }

    #[test]
    fn decay_converges_toward_rate() {
        // A steady 10 diff every 5 seconds should converge near 2 diff/s.
        let mut acc = 0.0;
        for _ in 0..2000 {
            decay_time(&mut acc, 10.0, 5.0, 300.0);
        }
        assert!((acc - 2.0).abs() < 0.05, "acc {acc}");
    }

    #[test]
    fn decay_clamps_exponent() {
        let mut acc = 5.0;
        // secs/interval far beyond 36 must not produce NaN or panic.
        decay_time(&mut acc, 1.0, 1e9, 1.0);
        assert!(acc.is_finite());
    }

    #[test]
    fn decay_snaps_tiny_values_to_zero() {
        let mut acc = 1e-15;
        decay_time(&mut acc, 0.0, 1e6, 1.0);
        assert_eq!(acc, 0.0);
    }
}
