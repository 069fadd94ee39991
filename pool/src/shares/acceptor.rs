//! The share-acceptance pipeline.
//!
//! A submit travels: admission, parameter shape, workbase resolution,
//! duplicate detection, ntime sanity, header assembly and hashing,
//! old-vs-new difficulty selection by job id, target compare, block test,
//! accounting, vardiff. Every rejection carries one of the wire error
//! kinds; nothing in here performs I/O.

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use lode_core::clock::sane_tdiff;
use lode_core::hash::{coinbase_merkle_root, fulltest, ShareHeader};
use lode_core::target::{diff_from_target, target_from_diff};

use crate::config::PoolConfig;
use crate::generator::BlockMeta;
use crate::registry::PoolRegistry;
use crate::session::{Session, REJECT_RUN_ACTIVE, REJECT_RUN_CLEAN, REJECT_RUN_DROP};
use crate::stratum::protocol::{validhex, StratumError};
use crate::vardiff::{self, DiffBounds, Retarget};
use crate::workbase::WorkbaseStore;

/// Maximum seconds a submitted ntime may run ahead of the workbase.
pub const MAX_NTIME_OFFSET: u32 = 7200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ShareError {
    #[error("Stale")]
    Stale,
    #[error("Duplicate")]
    Duplicate,
    #[error("Invalid ntime")]
    InvalidNtime,
    #[error("Above target")]
    AboveTarget,
    #[error("Low difficulty")]
    LowDifficulty,
    #[error("Invalid version mask")]
    InvalidVersionMask,
    #[error("Invalid nonce2")]
    InvalidNonce2,
    #[error("Worker mismatch")]
    WorkerMismatch,
}

impl ShareError {
    pub fn to_stratum(self) -> StratumError {
        match self {
            ShareError::Stale => StratumError::Stale,
            ShareError::Duplicate => StratumError::Duplicate,
            ShareError::InvalidNtime => StratumError::InvalidNtime,
            ShareError::AboveTarget => StratumError::AboveTarget,
            ShareError::LowDifficulty => StratumError::LowDifficulty,
            ShareError::InvalidVersionMask => StratumError::InvalidVersionMask,
            ShareError::InvalidNonce2 => StratumError::InvalidNonce2,
            ShareError::WorkerMismatch => StratumError::WorkerMismatch,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcceptedShare {
    /// Measured difficulty of the hash itself.
    pub share_diff: f64,
    /// Difficulty the share was credited at.
    pub credited_diff: f64,
}

#[derive(Debug)]
pub enum SubmitVerdict {
    Accepted(AcceptedShare),
    Rejected(ShareError),
    /// Parameter shape violation; replied as invalid params.
    Malformed(&'static str),
}

#[derive(Debug)]
pub struct SubmitOutcome {
    pub verdict: SubmitVerdict,
    /// Vardiff decided on a new difficulty; the caller broadcasts it.
    pub new_diff: Option<f64>,
    /// The share also met the network target.
    pub candidate: Option<(String, BlockMeta)>,
}

impl SubmitOutcome {
    fn rejected(err: ShareError) -> Self {
        Self {
            verdict: SubmitVerdict::Rejected(err),
            new_diff: None,
            candidate: None,
        }
    }

    fn malformed(what: &'static str) -> Self {
        Self {
            verdict: SubmitVerdict::Malformed(what),
            new_diff: None,
            candidate: None,
        }
    }
}

struct SubmitFields<'a> {
    workername: &'a str,
    job_id: &'a str,
    nonce2: &'a str,
    ntime: &'a str,
    nonce: &'a str,
    version_bits: Option<&'a str>,
}

fn parse_fields(params: &[Value]) -> Result<SubmitFields<'_>, SubmitOutcome> {
    if params.len() < 5 {
        return Err(SubmitOutcome::malformed("too few params"));
    }
    let mut strings = Vec::with_capacity(6);
    for v in params.iter().take(6) {
        match v.as_str() {
            Some(s) => strings.push(s),
            None => return Err(SubmitOutcome::malformed("non-string param")),
        }
    }
    Ok(SubmitFields {
        workername: strings[0],
        job_id: strings[1],
        nonce2: strings[2],
        ntime: strings[3],
        nonce: strings[4],
        version_bits: strings.get(5).copied(),
    })
}

/// Run one mining.submit through the pipeline. The caller has already
/// enforced admission (unsubscribed drop, unauthorized Stale).
pub fn process_submit(
    session: &Arc<Session>,
    params: &[Value],
    store: &WorkbaseStore,
    registry: &Mutex<PoolRegistry>,
    config: &PoolConfig,
    now: f64,
) -> SubmitOutcome {
    let fields = match parse_fields(params) {
        Ok(f) => f,
        Err(outcome) => return outcome,
    };

    // Snapshot everything share validation needs, then release the lock
    // for the hashing work.
    let (
        authorised,
        session_workername,
        enonce1_hex,
        diff,
        old_diff,
        diff_change_job_id,
        version_mask,
        worker,
        user,
        ua_key,
    ) = {
        let state = session.state.read();
        (
            state.authorised,
            state.workername.clone(),
            state.enonce1.clone(),
            state.diff,
            state.old_diff,
            state.diff_change_job_id,
            state.version_mask,
            state.worker.clone(),
            state.user.clone(),
            state.ua_key.clone(),
        )
    };
    if !authorised {
        return SubmitOutcome::rejected(ShareError::Stale);
    }

    if fields.workername.is_empty() || fields.workername.contains('/') {
        return reject(session, config, now, ShareError::WorkerMismatch);
    }
    if fields.workername != session_workername {
        return reject(session, config, now, ShareError::WorkerMismatch);
    }
    if fields.job_id.is_empty() {
        return SubmitOutcome::malformed("empty job_id");
    }
    if fields.nonce.len() < 8 || !validhex(fields.nonce) {
        return SubmitOutcome::malformed("bad nonce");
    }
    if !validhex(fields.ntime) {
        return reject(session, config, now, ShareError::InvalidNtime);
    }
    if !validhex(fields.nonce2) || fields.nonce2.len() != config.enonce2_size * 2 {
        return reject(session, config, now, ShareError::InvalidNonce2);
    }

    // Workbase rwlock is taken (read side) before any session or registry
    // lock below; never the reverse.
    let Ok(job_id) = u64::from_str_radix(fields.job_id, 16) else {
        return reject(session, config, now, ShareError::Stale);
    };
    let Some(wb) = store.get(job_id) else {
        return reject(session, config, now, ShareError::Stale);
    };
    if wb.retired_at().is_some() {
        return reject(session, config, now, ShareError::Stale);
    }

    if !wb
        .dupes
        .lock()
        .insert(session.id, fields.nonce2, fields.ntime, fields.nonce)
    {
        return reject(session, config, now, ShareError::Duplicate);
    }

    let Ok(ntime) = u32::from_str_radix(fields.ntime, 16) else {
        return reject(session, config, now, ShareError::InvalidNtime);
    };
    if ntime < wb.ntime || ntime > wb.ntime.saturating_add(MAX_NTIME_OFFSET) {
        return reject(session, config, now, ShareError::InvalidNtime);
    }

    let version = match fields.version_bits {
        Some(bits_hex) => {
            let Ok(bits) = u32::from_str_radix(bits_hex, 16) else {
                return reject(session, config, now, ShareError::InvalidVersionMask);
            };
            let Some(mask) = version_mask else {
                return reject(session, config, now, ShareError::InvalidVersionMask);
            };
            if bits & !mask != 0 {
                return reject(session, config, now, ShareError::InvalidVersionMask);
            }
            (wb.version & !mask) | (bits & mask)
        }
        None => wb.version,
    };

    let enonce1 = hex::decode(&enonce1_hex).unwrap_or_default();
    let nonce2 = match hex::decode(fields.nonce2) {
        Ok(b) => b,
        Err(_) => return reject(session, config, now, ShareError::InvalidNonce2),
    };
    let Ok(nonce) = u32::from_str_radix(&fields.nonce[fields.nonce.len() - 8..], 16) else {
        return SubmitOutcome::malformed("bad nonce");
    };

    let merkle_root =
        coinbase_merkle_root(&wb.coinbase1, &enonce1, &nonce2, &wb.coinbase2, &wb.merkle_branches);
    let header = ShareHeader {
        version,
        prevhash: wb.prevhash,
        merkle_root,
        ntime,
        nbits: wb.nbits,
        nonce,
    };
    let hash = header.hash();
    let share_diff = diff_from_target(&hash);

    // Old-vs-new difficulty selection: a diff change binds to the first
    // job id it applies to.
    let mut credited = if job_id < diff_change_job_id {
        old_diff
    } else {
        diff
    };
    if credited <= 0.0 {
        credited = diff;
    }

    let mut capped = false;
    let mut effective = credited;
    if effective > wb.network_diff {
        effective = wb.network_diff;
        capped = true;
    }
    if !fulltest(&hash, &target_from_diff(effective)) {
        let err = if capped {
            ShareError::AboveTarget
        } else {
            ShareError::LowDifficulty
        };
        return reject(session, config, now, err);
    }

    let candidate = if fulltest(&hash, &wb.target) {
        let mut coinbase =
            Vec::with_capacity(wb.coinbase1.len() + enonce1.len() + nonce2.len() + wb.coinbase2.len());
        coinbase.extend_from_slice(&wb.coinbase1);
        coinbase.extend_from_slice(&enonce1);
        coinbase.extend_from_slice(&nonce2);
        coinbase.extend_from_slice(&wb.coinbase2);
        let block_hex = format!("{}{}", hex::encode(&coinbase), hex::encode(header.serialize()));
        let mut hash_be = hash;
        hash_be.reverse();
        let meta = BlockMeta {
            height: wb.height,
            workbase_id: wb.id,
            workername: session_workername.clone(),
            share_diff,
            hash_hex: hex::encode(hash_be),
        };
        Some((block_hex, meta))
    } else {
        None
    };

    // Accounting, then the inline vardiff pass.
    let (dsps5, ssdc, since_change, current_diff) = {
        let mut state = session.state.write();
        let secs = if state.last_share > 0.0 {
            sane_tdiff(now, state.last_share)
        } else {
            sane_tdiff(now, state.last_decay)
        };
        state.rates.record(credited, secs);
        state.last_decay = now;
        if state.first_share == 0.0 {
            state.first_share = now;
        }
        state.last_share = now;
        state.uadiff += credited;
        state.ssdc += 1;
        if share_diff > state.best_diff {
            state.best_diff = share_diff;
        }
        state.consecutive_rejects = 0;
        state.first_invalid = 0.0;
        state.reject_run = REJECT_RUN_CLEAN;
        (
            state.rates.dsps5,
            state.ssdc,
            now - state.last_diff_change,
            state.diff,
        )
    };

    let mut worker_mindiff = 0.0;
    if let Some(worker) = &worker {
        worker.record_share(credited, share_diff, now);
        worker_mindiff = worker.state.lock().mindiff;
    }
    if let Some(user) = &user {
        user.record_share(credited, share_diff, now);
    }
    if let Some(key) = &ua_key {
        registry.lock().ua.record_share(key, credited, share_diff, now);
    }

    let bounds = DiffBounds {
        pool_mindiff: config.mindiff,
        pool_maxdiff: config.maxdiff,
        worker_mindiff,
        worker_maxdiff: 0.0,
        network_diff: wb.network_diff,
    };
    let new_diff = match vardiff::retarget(
        current_diff,
        dsps5,
        ssdc,
        since_change,
        worker_mindiff > 0.0,
        &bounds,
    ) {
        Retarget::Adjust(next) => {
            let mut state = session.state.write();
            state.old_diff = state.diff;
            state.diff = next;
            state.ssdc = 0;
            state.last_diff_change = now;
            state.diff_change_job_id = store.next_id();
            Some(next)
        }
        Retarget::ResetTimer => {
            session.state.write().last_diff_change = now;
            None
        }
        Retarget::NoChange => None,
    };

    SubmitOutcome {
        verdict: SubmitVerdict::Accepted(AcceptedShare {
            share_diff,
            credited_diff: credited,
        }),
        new_diff,
        candidate,
    }
}

/// Shared reject bookkeeping: start or extend the invalid run and arm the
/// lazy drop once the threshold is crossed.
fn reject(
    session: &Arc<Session>,
    config: &PoolConfig,
    now: f64,
    err: ShareError,
) -> SubmitOutcome {
    let mut state = session.state.write();
    if state.first_invalid == 0.0 {
        state.first_invalid = now;
    }
    state.consecutive_rejects += 1;
    state.reject_run = if state.consecutive_rejects >= config.reject_threshold {
        REJECT_RUN_DROP
    } else {
        REJECT_RUN_ACTIVE
    };
    drop(state);
    SubmitOutcome::rejected(err)
}
