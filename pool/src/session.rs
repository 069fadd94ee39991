//! Per-client session state.
//!
//! One Session per subscribed TCP client, owned by the stratifier's
//! session table and borrowed by handlers through its `Arc`. The watchdog
//! reaper inspects the `Arc` strong count as the reader refcount: a
//! dropped session may only leave the table when nothing else holds it.

use parking_lot::RwLock;
use std::net::IpAddr;
use std::sync::Arc;

use crate::users::{RollingRates, User, Worker};

/// Lazy-drop marker: 0 clean, 1 reject run in progress, 2 drop pending.
pub const REJECT_RUN_CLEAN: u8 = 0;
pub const REJECT_RUN_ACTIVE: u8 = 1;
pub const REJECT_RUN_DROP: u8 = 2;

#[derive(Debug)]
pub struct SessionState {
    pub subscribed: bool,
    pub authorising: bool,
    pub authorised: bool,
    pub dropped: bool,

    pub useragent: String,
    pub enonce1: String,
    pub source: Option<(IpAddr, u16)>,
    /// Full submitted workername, `username[.worker]`.
    pub workername: String,
    pub user: Option<Arc<User>>,
    pub worker: Option<Arc<Worker>>,
    /// Normalized UA key registered with the UA registry, for paired
    /// removal on drop.
    pub ua_key: Option<String>,

    pub diff: f64,
    pub old_diff: f64,
    /// First job id the current `diff` applies to; shares against older
    /// jobs are credited at `old_diff`.
    pub diff_change_job_id: u64,
    pub suggest_diff: f64,
    pub password_diff_set: bool,

    /// Shares since the last difficulty change.
    pub ssdc: u64,
    pub last_diff_change: f64,
    pub first_share: f64,
    pub last_share: f64,
    pub last_decay: f64,
    pub rates: RollingRates,
    /// Cumulative accepted difficulty.
    pub uadiff: f64,
    pub best_diff: f64,

    pub first_invalid: f64,
    pub consecutive_rejects: u32,
    pub reject_run: u8,

    /// Version-rolling mask agreed via mining.configure.
    pub version_mask: Option<u32>,
    /// Last workbase id this session was notified of.
    pub current_workbase: Option<u64>,
}

#[derive(Debug)]
pub struct Session {
    pub id: u64,
    pub state: RwLock<SessionState>,
}

impl Session {
    pub fn new(id: u64, now: f64) -> Self {
        Self {
            id,
            state: RwLock::new(SessionState {
                subscribed: false,
                authorising: false,
                authorised: false,
                dropped: false,
                useragent: String::new(),
                enonce1: String::new(),
                source: None,
                workername: String::new(),
                user: None,
                worker: None,
                ua_key: None,
                diff: 0.0,
                old_diff: 0.0,
                diff_change_job_id: 0,
                suggest_diff: 0.0,
                password_diff_set: false,
                ssdc: 0,
                last_diff_change: now,
                first_share: 0.0,
                last_share: 0.0,
                last_decay: now,
                rates: RollingRates::default(),
                uadiff: 0.0,
                best_diff: 0.0,
                first_invalid: 0.0,
                consecutive_rejects: 0,
                reject_run: REJECT_RUN_CLEAN,
                version_mask: None,
                current_workbase: None,
            }),
        }
    }
}

/// Search a password string for `diff=X` and return the clamped value, or
/// 0.0 when absent or invalid.
///
/// Rules: a space or tab directly after `=` is ambiguous and rejected;
/// the float must parse, be finite and positive, and terminate at end of
/// string, `,`, space or tab; the result is floored at `mindiff` and,
/// when `maxdiff > 0`, capped at `maxdiff`.
pub fn parse_password_diff(password: &str, mindiff: f64, maxdiff: f64) -> f64 {
    let Some(pos) = password.find("diff=") else {
        return 0.0;
    };
    let rest = &password[pos + 5..];
    if rest.starts_with(' ') || rest.starts_with('\t') {
        return 0.0;
    }
    let end = rest
        .find(|c| c == ',' || c == ' ' || c == '\t')
        .unwrap_or(rest.len());
    let token = &rest[..end];
    let Ok(value) = token.parse::<f64>() else {
        return 0.0;
    };
    // `parse` accepts "inf"/"nan" spellings; a difficulty must be a real
    // positive number.
    if !value.is_finite() || value <= 0.0 {
        return 0.0;
    }
    let mut diff = value.max(mindiff);
    if maxdiff > 0.0 {
        diff = diff.min(maxdiff);
    }
    diff
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_session_is_unsubscribed() {
        let s = Session::new(1, 0.0);
        let state = s.state.read();
        assert!(!state.subscribed && !state.authorised && !state.dropped);
        assert_eq!(state.reject_run, REJECT_RUN_CLEAN);
    }

    #[test]
    fn password_diff_basic() {
        assert_eq!(parse_password_diff("x,diff=64,f=9", 1.0, 0.0), 64.0);
        assert_eq!(parse_password_diff("diff=0.5", 0.2, 0.0), 0.5);
        assert_eq!(parse_password_diff("x", 1.0, 0.0), 0.0);
        assert_eq!(parse_password_diff("", 1.0, 0.0), 0.0);
    }

    #[test]
    fn password_diff_with_spaces_after_comma() {
        assert_eq!(parse_password_diff("x, diff=0.5, f=9", 0.2, 0.0), 0.5);
    }

    #[test]
    fn password_diff_rejects_space_after_equals() {
        assert_eq!(parse_password_diff("diff= 5", 1.0, 0.0), 0.0);
        assert_eq!(parse_password_diff("diff=\t5", 1.0, 0.0), 0.0);
    }

    #[test]
    fn password_diff_rejects_bad_terminators() {
        assert_eq!(parse_password_diff("diff=5x", 1.0, 0.0), 0.0);
        assert_eq!(parse_password_diff("diff=5;x", 1.0, 0.0), 0.0);
    }

    #[test]
    fn password_diff_rejects_non_finite_and_non_positive() {
        assert_eq!(parse_password_diff("diff=inf", 1.0, 0.0), 0.0);
        assert_eq!(parse_password_diff("diff=nan", 1.0, 0.0), 0.0);
        assert_eq!(parse_password_diff("diff=-3", 1.0, 0.0), 0.0);
        assert_eq!(parse_password_diff("diff=0", 1.0, 0.0), 0.0);
    }

    #[test]
    fn password_diff_accepts_scientific_notation() {
        assert_eq!(parse_password_diff("diff=1e3", 1.0, 0.0), 1000.0);
        assert_eq!(parse_password_diff("diff=2.5e-3", 0.0, 0.0), 0.0025);
    }

    #[test]
    fn password_diff_clamps() {
        assert_eq!(parse_password_diff("diff=0.5", 2.0, 0.0), 2.0);
        assert_eq!(parse_password_diff("diff=1e9", 1.0, 1024.0), 1024.0);
        // maxdiff 0 means uncapped
        assert_eq!(parse_password_diff("diff=1e9", 1.0, 0.0), 1e9);
    }
}
