//! Variable-difficulty controller.
//!
//! Keeps each session's share arrival near one share every ~3.33 seconds
//! without thrashing: a three-tier retarget cadence reacts faster the
//! harder a session bursts, a dead band around the ideal diff-rate ratio
//! suppresses noise, and each adjustment only closes part of the gap.

use lode_core::target::normalize_pool_diff;

/// Seconds per share the controller steers toward.
pub const TARGET_SHARE_SECS: f64 = 3.33;
/// Faster target used when a worker pinned its own difficulty floor.
pub const TARGET_SHARE_SECS_MINDIFF: f64 = 2.4;

/// Changes smaller than this are not worth a set_difficulty round trip.
pub const DIFF_EPSILON: f64 = 1e-6;

const DRR_LOW: f64 = 0.15;
const DRR_HIGH: f64 = 0.4;

pub const PERIOD_NORMAL: f64 = 300.0;
pub const PERIOD_FAST: f64 = 60.0;
pub const PERIOD_ULTRA: f64 = 15.0;

/// Difficulty bounds gathered from pool config, worker preference and the
/// current network.
#[derive(Debug, Clone, Copy)]
pub struct DiffBounds {
    pub pool_mindiff: f64,
    /// 0 disables the cap.
    pub pool_maxdiff: f64,
    /// Worker-selected floor; 0 when unset.
    pub worker_mindiff: f64,
    /// 0 disables the cap.
    pub worker_maxdiff: f64,
    pub network_diff: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Retarget {
    /// Leave the difficulty alone.
    NoChange,
    /// First share after an idle gap wanted a lower diff; restart the
    /// cadence clock instead of punishing one slow share.
    ResetTimer,
    /// Commit a new difficulty.
    Adjust(f64),
}

/// Retarget period from the (ssdc, seconds-since-change) bands. Boundaries
/// are strict: 143 shares is not a burst, and 15.0 s is already out of the
/// ultra window.
pub fn cadence_period(ssdc: u64, since_change: f64) -> f64 {
    if ssdc >= 144 && since_change < PERIOD_ULTRA {
        PERIOD_ULTRA
    } else if ssdc >= 72 {
        PERIOD_FAST
    } else {
        PERIOD_NORMAL
    }
}

/// One retarget evaluation for a session.
///
/// `dsps` is the session's 5-minute diff-shares-per-second estimate,
/// `since_change` the (possibly clock-skewed) seconds since the last diff
/// change, `mindiff_active` whether a worker floor is pinned.
pub fn retarget(
    current_diff: f64,
    dsps: f64,
    ssdc: u64,
    since_change: f64,
    mindiff_active: bool,
    bounds: &DiffBounds,
) -> Retarget {
    // VM suspends and NTP steps can turn the clock backwards.
    let tdiff = since_change.max(0.0);
    let period = cadence_period(ssdc, tdiff);

    let share_secs = if mindiff_active {
        TARGET_SHARE_SECS_MINDIFF
    } else {
        TARGET_SHARE_SECS
    };
    let mut optimal = normalize_pool_diff(dsps * share_secs);

    optimal = optimal.max(bounds.pool_mindiff);
    optimal = optimal.max(bounds.worker_mindiff);
    if bounds.pool_maxdiff > 0.0 {
        optimal = optimal.min(bounds.pool_maxdiff);
    }
    if bounds.worker_maxdiff > 0.0 {
        optimal = optimal.min(bounds.worker_maxdiff);
    }
    optimal = optimal.min(bounds.network_diff);
    if optimal <= 0.0 {
        return Retarget::NoChange;
    }

    if current_diff > 0.0 {
        let drr = dsps / current_diff;
        if drr > DRR_LOW && drr < DRR_HIGH {
            return Retarget::NoChange;
        }
    }

    let time_bias = 1.0 - (-(tdiff / period).min(36.0)).exp();
    let mut next = current_diff + (optimal - current_diff) * time_bias;
    next = normalize_pool_diff(next);

    if (current_diff - next).abs() < DIFF_EPSILON {
        return Retarget::NoChange;
    }
    if ssdc == 1 && next < current_diff {
        return Retarget::ResetTimer;
    }
    Retarget::Adjust(next)
}
