//! Per-user and per-worker aggregation.
//!
//! A User is one unique username (typically a payout address); a Worker is
//! one (user, workername) pair. Both live for the rest of the run once
//! created, so stats survive disconnects. Sessions hold back-references to
//! both; the registry owns the maps.

use lode_core::address::PayoutAddress;
use lode_core::clock::decay_time;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::uaregistry::{normalize_ua, UA_OTHER};

pub const MIN1: f64 = 60.0;
pub const MIN5: f64 = 300.0;
pub const HOUR: f64 = 3600.0;
pub const DAY: f64 = 86400.0;
pub const WEEK: f64 = 604800.0;

/// The rolling dsps windows shared by Session, Worker and User.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RollingRates {
    pub dsps15s: f64,
    pub dsps1: f64,
    pub dsps5: f64,
    pub dsps60: f64,
    pub dsps1440: f64,
    pub dsps10080: f64,
}

impl RollingRates {
    /// Fold `diff` of work done over the last `secs` into every window.
    pub fn record(&mut self, diff: f64, secs: f64) {
        decay_time(&mut self.dsps15s, diff, secs, 15.0);
        decay_time(&mut self.dsps1, diff, secs, MIN1);
        decay_time(&mut self.dsps5, diff, secs, MIN5);
        decay_time(&mut self.dsps60, diff, secs, HOUR);
        decay_time(&mut self.dsps1440, diff, secs, DAY);
        decay_time(&mut self.dsps10080, diff, secs, WEEK);
    }

    /// Decay toward zero across an idle gap.
    pub fn decay_idle(&mut self, secs: f64) {
        self.record(0.0, secs);
    }
}

#[derive(Debug)]
pub struct WorkerState {
    pub useragent: String,
    pub norm_useragent: String,
    pub start_time: f64,
    pub last_connect: f64,
    pub last_share: f64,
    pub last_decay: f64,
    pub rates: RollingRates,
    pub best_diff: f64,
    pub best_ever: f64,
    /// User-selected difficulty floor (password `diff=`); 0 when unset.
    pub mindiff: f64,
    pub idle: bool,
}

#[derive(Debug)]
pub struct Worker {
    pub workername: String,
    /// Sessions currently attached with `authorised == true`.
    pub instance_count: AtomicI64,
    pub state: Mutex<WorkerState>,
}

impl Worker {
    fn new(workername: &str, now: f64) -> Self {
        Self {
            workername: workername.to_string(),
            instance_count: AtomicI64::new(0),
            state: Mutex::new(WorkerState {
                useragent: String::new(),
                norm_useragent: String::new(),
                start_time: now,
                last_connect: now,
                last_share: 0.0,
                last_decay: now,
                rates: RollingRates::default(),
                best_diff: 0.0,
                best_ever: 0.0,
                mindiff: 0.0,
                idle: false,
            }),
        }
    }

    pub fn instances(&self) -> i64 {
        self.instance_count.load(Ordering::Relaxed)
    }

    /// Recompute the worker's useragent after a session attach/detach.
    /// One attached session owns the field; several collapse to "Other";
    /// zero preserves whatever was last written.
    pub fn refresh_useragent(&self, attached_ua: Option<&str>) {
        let count = self.instances();
        let mut state = self.state.lock();
        if count == 1 {
            if let Some(ua) = attached_ua {
                state.useragent = ua.to_string();
                state.norm_useragent = normalize_ua(ua);
            }
        } else if count > 1 {
            state.useragent = UA_OTHER.to_string();
            state.norm_useragent = UA_OTHER.to_string();
        }
    }

    pub fn record_share(&self, diff: f64, share_diff: f64, now: f64) {
        let mut state = self.state.lock();
        let secs = if state.last_decay > 0.0 {
            (now - state.last_decay).max(1e-3)
        } else {
            1e-3
        };
        state.rates.record(diff, secs);
        state.last_decay = now;
        state.last_share = now;
        state.idle = false;
        if share_diff > state.best_diff {
            state.best_diff = share_diff;
        }
        if share_diff > state.best_ever {
            state.best_ever = share_diff;
        }
    }
}

#[derive(Debug, Default)]
pub struct AuthState {
    pub authorised: bool,
    pub auth_time: f64,
    pub failed_authtime: f64,
    pub auth_backoff: f64,
    pub throttled: bool,
}

#[derive(Debug)]
pub struct UserState {
    pub last_share: f64,
    pub last_decay: f64,
    pub rates: RollingRates,
    pub best_diff: f64,
    pub best_ever: f64,
    /// Cumulative accepted difficulty.
    pub shares: f64,
}

#[derive(Debug)]
pub struct User {
    pub id: u64,
    pub username: String,
    /// Parsed payout script, when the username is a valid address.
    pub address: Option<PayoutAddress>,
    pub workers: Mutex<Vec<Arc<Worker>>>,
    /// Session ids currently attached.
    pub sessions: Mutex<Vec<u64>>,
    pub state: Mutex<UserState>,
    pub auth: Mutex<AuthState>,
}

impl User {
    fn new(id: u64, username: &str, now: f64) -> Self {
        Self {
            id,
            username: username.to_string(),
            address: PayoutAddress::parse(username).ok(),
            workers: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
            state: Mutex::new(UserState {
                last_share: 0.0,
                last_decay: now,
                rates: RollingRates::default(),
                best_diff: 0.0,
                best_ever: 0.0,
                shares: 0.0,
            }),
            auth: Mutex::new(AuthState::default()),
        }
    }

    pub fn record_share(&self, diff: f64, share_diff: f64, now: f64) {
        let mut state = self.state.lock();
        let secs = if state.last_decay > 0.0 {
            (now - state.last_decay).max(1e-3)
        } else {
            1e-3
        };
        state.rates.record(diff, secs);
        state.last_decay = now;
        state.last_share = now;
        state.shares += diff;
        if share_diff > state.best_diff {
            state.best_diff = share_diff;
        }
        if share_diff > state.best_ever {
            state.best_ever = share_diff;
        }
    }

    pub fn attach_session(&self, session_id: u64) {
        let mut sessions = self.sessions.lock();
        if !sessions.contains(&session_id) {
            sessions.push(session_id);
        }
    }

    pub fn detach_session(&self, session_id: u64) {
        self.sessions.lock().retain(|&id| id != session_id);
    }

    pub fn get_or_create_worker(&self, workername: &str, now: f64) -> Arc<Worker> {
        let mut workers = self.workers.lock();
        if let Some(worker) = workers.iter().find(|w| w.workername == workername) {
            let existing = worker.clone();
            existing.state.lock().last_connect = now;
            return existing;
        }
        let worker = Arc::new(Worker::new(workername, now));
        workers.push(worker.clone());
        worker
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }
}

/// Owner of the user map; lives under the pool instance lock.
#[derive(Debug, Default)]
pub struct UserRegistry {
    users: HashMap<String, Arc<User>>,
    next_id: u64,
}

impl UserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, username: &str) -> Option<Arc<User>> {
        self.users.get(username).cloned()
    }

    pub fn get_or_create(&mut self, username: &str, now: f64) -> Arc<User> {
        if let Some(user) = self.users.get(username) {
            return user.clone();
        }
        let id = self.next_id;
        self.next_id += 1;
        let user = Arc::new(User::new(id, username, now));
        self.users.insert(username.to_string(), user.clone());
        user
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<User>> {
        self.users.values()
    }
}

/// Split a stratum username into (user, workername). An absent or empty
/// workername becomes ".".
pub fn split_username(full: &str) -> (&str, &str) {
    match full.split_once('.') {
        Some((user, worker)) if !worker.is_empty() => (user, worker),
        Some((user, _)) => (user, "."),
        None => (full, "."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_split() {
        assert_eq!(split_username("addr.rig1"), ("addr", "rig1"));
        assert_eq!(split_username("addr"), ("addr", "."));
        assert_eq!(split_username("addr."), ("addr", "."));
    }

    #[test]
    fn workers_are_created_once() {
        let mut reg = UserRegistry::new();
        let user = reg.get_or_create("alice", 1.0);
        let w1 = user.get_or_create_worker("rig1", 1.0);
        let w2 = user.get_or_create_worker("rig1", 2.0);
        assert!(Arc::ptr_eq(&w1, &w2));
        assert_eq!(user.worker_count(), 1);
        user.get_or_create_worker("rig2", 3.0);
        assert_eq!(user.worker_count(), 2);
    }

    #[test]
    fn users_are_created_once_with_monotonic_ids() {
        let mut reg = UserRegistry::new();
        let a = reg.get_or_create("alice", 0.0);
        let b = reg.get_or_create("bob", 0.0);
        let a2 = reg.get_or_create("alice", 5.0);
        assert!(Arc::ptr_eq(&a, &a2));
        assert!(b.id > a.id);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn share_accounting_updates_rates_and_bests() {
        let mut reg = UserRegistry::new();
        let user = reg.get_or_create("alice", 0.0);
        user.record_share(8.0, 120.0, 10.0);
        user.record_share(8.0, 40.0, 13.0);
        let state = user.state.lock();
        assert!(state.rates.dsps5 > 0.0);
        assert_eq!(state.best_diff, 120.0);
        assert_eq!(state.best_ever, 120.0);
        assert_eq!(state.shares, 16.0);
    }

    #[test]
    fn worker_ua_follows_instance_count() {
        let worker = Worker::new("rig1", 0.0);
        worker.instance_count.store(1, Ordering::Relaxed);
        worker.refresh_useragent(Some("cgminer/4.9"));
        assert_eq!(worker.state.lock().norm_useragent, "cgminer");

        worker.instance_count.store(2, Ordering::Relaxed);
        worker.refresh_useragent(Some("bfgminer/5.0"));
        assert_eq!(worker.state.lock().norm_useragent, UA_OTHER);

        // Zero instances preserves the last written value.
        worker.instance_count.store(0, Ordering::Relaxed);
        worker.refresh_useragent(None);
        assert_eq!(worker.state.lock().norm_useragent, UA_OTHER);
    }

    #[test]
    fn session_attachment_is_a_set() {
        let user = User::new(0, "alice", 0.0);
        user.attach_session(7);
        user.attach_session(7);
        user.attach_session(9);
        assert_eq!(user.sessions.lock().len(), 2);
        user.detach_session(7);
        assert_eq!(user.sessions.lock().as_slice(), &[9]);
    }
}
