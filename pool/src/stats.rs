//! Stratifier metrics and periodic stats output.
//!
//! Two surfaces: cumulative counters plus latency histograms consumed by
//! the JSON snapshot (with previous-interval copies for deltas), and
//! per-user persistence records handed to a write callback.

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::uaregistry::UaSnapshot;
use crate::users::RollingRates;

const ROLLING_WINDOW: usize = 100;

/// Latency histogram: running min/max/sum plus a rolling window for
/// percentile estimates.
#[derive(Debug, Default)]
pub struct LatencyHistogram {
    min: f64,
    max: f64,
    sum: f64,
    samples: u64,
    window: VecDeque<f64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LatencySnapshot {
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub samples: u64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

impl LatencyHistogram {
    pub fn record(&mut self, value: f64) {
        if self.samples == 0 || value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
        self.sum += value;
        self.samples += 1;
        if self.window.len() == ROLLING_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(value);
    }

    fn percentile(sorted: &[f64], p: f64) -> f64 {
        if sorted.is_empty() {
            return 0.0;
        }
        let rank = (p * (sorted.len() - 1) as f64).round() as usize;
        sorted[rank.min(sorted.len() - 1)]
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        let mut sorted: Vec<f64> = self.window.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        LatencySnapshot {
            min: self.min,
            max: self.max,
            sum: self.sum,
            samples: self.samples,
            p50: Self::percentile(&sorted, 0.50),
            p95: Self::percentile(&sorted, 0.95),
            p99: Self::percentile(&sorted, 0.99),
        }
    }
}

/// Cumulative stratifier counters plus the two latency histograms.
#[derive(Debug, Default)]
pub struct StratifierMetrics {
    pub shares_accepted: AtomicU64,
    pub shares_rejected: AtomicU64,
    pub shares_invalid: AtomicU64,
    pub auth_fails: AtomicU64,
    pub client_disconnects: AtomicU64,
    pub rpc_errors: AtomicU64,
    pub submit_latency: Mutex<LatencyHistogram>,
    pub block_fetch_latency: Mutex<LatencyHistogram>,
    prev: Mutex<Option<MetricsSnapshot>>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MetricsSnapshot {
    pub shares_accepted: u64,
    pub shares_rejected: u64,
    pub shares_invalid: u64,
    pub auth_fails: u64,
    pub client_disconnects: u64,
    pub rpc_errors: u64,
    pub submit_latency: LatencySnapshot,
    pub block_fetch_latency: LatencySnapshot,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MetricsDelta {
    pub shares_accepted: u64,
    pub shares_rejected: u64,
    pub shares_invalid: u64,
    pub auth_fails: u64,
    pub client_disconnects: u64,
    pub rpc_errors: u64,
}

impl StratifierMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            shares_accepted: self.shares_accepted.load(Ordering::Relaxed),
            shares_rejected: self.shares_rejected.load(Ordering::Relaxed),
            shares_invalid: self.shares_invalid.load(Ordering::Relaxed),
            auth_fails: self.auth_fails.load(Ordering::Relaxed),
            client_disconnects: self.client_disconnects.load(Ordering::Relaxed),
            rpc_errors: self.rpc_errors.load(Ordering::Relaxed),
            submit_latency: self.submit_latency.lock().snapshot(),
            block_fetch_latency: self.block_fetch_latency.lock().snapshot(),
        }
    }

    /// Snapshot plus the delta against the previous call; the snapshot
    /// becomes the new baseline.
    pub fn snapshot_with_delta(&self) -> (MetricsSnapshot, MetricsDelta) {
        let current = self.snapshot();
        let mut prev_slot = self.prev.lock();
        let prev = prev_slot.unwrap_or_default();
        let delta = MetricsDelta {
            shares_accepted: current.shares_accepted - prev.shares_accepted,
            shares_rejected: current.shares_rejected - prev.shares_rejected,
            shares_invalid: current.shares_invalid - prev.shares_invalid,
            auth_fails: current.auth_fails - prev.auth_fails,
            client_disconnects: current.client_disconnects - prev.client_disconnects,
            rpc_errors: current.rpc_errors - prev.rpc_errors,
        };
        *prev_slot = Some(current);
        (current, delta)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub workername: String,
    pub instances: i64,
    pub rates: RollingRates,
    pub best_diff: f64,
    pub best_ever: f64,
    pub idle: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserSnapshot {
    pub username: String,
    pub worker_count: usize,
    pub session_count: usize,
    pub rates: RollingRates,
    pub best_diff: f64,
    pub best_ever: f64,
    pub shares: f64,
    pub workers: Vec<WorkerSnapshot>,
}

/// The periodic JSON snapshot of the whole pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub timestamp: i64,
    pub sessions: usize,
    pub users: usize,
    pub workbase_height: Option<u64>,
    pub metrics: MetricsSnapshot,
    pub metrics_delta: MetricsDelta,
    pub user_stats: Vec<UserSnapshot>,
    pub useragents: Vec<UaSnapshot>,
}

impl PoolSnapshot {
    pub fn now_timestamp() -> i64 {
        Utc::now().timestamp()
    }
}

/// One per-user persistence record; the write destination is a
/// collaborator concern.
#[derive(Debug, Clone, Serialize)]
pub struct UserRecord {
    pub username: String,
    pub worker_count: usize,
    pub rates: RollingRates,
    pub best_diff: f64,
    pub best_ever: f64,
    pub useragent: String,
    pub norm_useragent: String,
}

/// Callback invoked with each user record on the stats cadence.
pub type PersistSink = Arc<dyn Fn(UserRecord) + Send + Sync>;

/// Callback invoked with the full pool snapshot.
pub type SnapshotSink = Arc<dyn Fn(PoolSnapshot) + Send + Sync>;
