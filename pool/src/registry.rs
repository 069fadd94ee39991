//! The tables behind the pool instance lock.
//!
//! One `parking_lot::Mutex<PoolRegistry>` guards session, user and
//! useragent membership. Critical sections stay brief: handlers clone the
//! `Arc`s they need and release before doing any hashing or I/O.

use std::collections::HashMap;
use std::sync::Arc;

use crate::session::Session;
use crate::uaregistry::UaRegistry;
use crate::users::UserRegistry;

#[derive(Default)]
pub struct PoolRegistry {
    pub sessions: HashMap<u64, Arc<Session>>,
    pub users: UserRegistry,
    pub ua: UaRegistry,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self, id: u64) -> Option<Arc<Session>> {
        self.sessions.get(&id).cloned()
    }

    pub fn session_or_create(&mut self, id: u64, now: f64) -> Arc<Session> {
        self.sessions
            .entry(id)
            .or_insert_with(|| Arc::new(Session::new(id, now)))
            .clone()
    }

    pub fn remove_session(&mut self, id: u64) -> Option<Arc<Session>> {
        self.sessions.remove(&id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
