//! Work template snapshots and their append-only store.
//!
//! A Workbase is an immutable snapshot of the upstream block template,
//! pre-decoded so share validation never touches hex on the hot path.
//! The store assigns monotonically increasing ids, tracks the current
//! workbase, and keeps retired entries resolvable for a grace window so
//! late shares classify as stale instead of unknown.

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::shares::dupes::DupeSet;
use lode_core::target::{diff_from_nbits, target_from_diff};

#[derive(Debug, Error)]
pub enum WorkbaseError {
    #[error("bad hex in {field}: {source}")]
    BadHex {
        field: &'static str,
        source: hex::FromHexError,
    },
    #[error("{field} has length {got}, expected {want}")]
    BadLength {
        field: &'static str,
        got: usize,
        want: usize,
    },
    #[error("nbits decodes to a non-positive difficulty")]
    BadNbits,
}

/// A genwork record as pushed by the Generator.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkbaseTemplate {
    pub version: u32,
    /// Big-endian display hex, 64 chars.
    pub prevhash: String,
    pub coinbase1: String,
    pub coinbase2: String,
    #[serde(default)]
    pub merkles: Vec<String>,
    /// Compact difficulty, 8 hex chars, exponent first.
    pub nbits: String,
    pub ntime: u32,
    pub height: u64,
}

#[derive(Debug)]
pub struct Workbase {
    pub id: u64,
    pub height: u64,
    pub version: u32,
    /// Internal (little-endian) byte order, ready for the share header.
    pub prevhash: [u8; 32],
    pub nbits: u32,
    pub ntime: u32,
    pub network_diff: f64,
    /// Little-endian network target.
    pub target: [u8; 32],
    pub coinbase1: Vec<u8>,
    pub coinbase2: Vec<u8>,
    pub merkle_branches: Vec<[u8; 32]>,
    pub gentime: f64,
    retired: Mutex<Option<f64>>,
    readcount: AtomicU64,
    pub dupes: Mutex<DupeSet>,
}

fn decode_hash32(field: &'static str, hex_str: &str) -> Result<[u8; 32], WorkbaseError> {
    let bytes = hex::decode(hex_str).map_err(|source| WorkbaseError::BadHex { field, source })?;
    if bytes.len() != 32 {
        return Err(WorkbaseError::BadLength {
            field,
            got: bytes.len(),
            want: 32,
        });
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

impl Workbase {
    pub fn from_template(id: u64, tpl: &WorkbaseTemplate, now: f64) -> Result<Self, WorkbaseError> {
        let mut prevhash = decode_hash32("prevhash", &tpl.prevhash)?;
        prevhash.reverse();

        let nbits_bytes =
            hex::decode(&tpl.nbits).map_err(|source| WorkbaseError::BadHex {
                field: "nbits",
                source,
            })?;
        if nbits_bytes.len() != 4 {
            return Err(WorkbaseError::BadLength {
                field: "nbits",
                got: nbits_bytes.len(),
                want: 4,
            });
        }
        let nbits_arr = [nbits_bytes[0], nbits_bytes[1], nbits_bytes[2], nbits_bytes[3]];
        let network_diff = diff_from_nbits(nbits_arr);
        if !network_diff.is_finite() || network_diff <= 0.0 {
            return Err(WorkbaseError::BadNbits);
        }

        let coinbase1 = hex::decode(&tpl.coinbase1).map_err(|source| WorkbaseError::BadHex {
            field: "coinbase1",
            source,
        })?;
        let coinbase2 = hex::decode(&tpl.coinbase2).map_err(|source| WorkbaseError::BadHex {
            field: "coinbase2",
            source,
        })?;

        let mut merkle_branches = Vec::with_capacity(tpl.merkles.len());
        for m in &tpl.merkles {
            merkle_branches.push(decode_hash32("merkle", m)?);
        }

        Ok(Self {
            id,
            height: tpl.height,
            version: tpl.version,
            prevhash,
            nbits: u32::from_be_bytes(nbits_arr),
            ntime: tpl.ntime,
            network_diff,
            target: target_from_diff(network_diff),
            coinbase1,
            coinbase2,
            merkle_branches,
            gentime: now,
            retired: Mutex::new(None),
            readcount: AtomicU64::new(0),
            dupes: Mutex::new(DupeSet::new()),
        })
    }

    pub fn job_id_hex(&self) -> String {
        format!("{:016x}", self.id)
    }

    /// Prevhash as stratum notify wants it: each 4-byte word of the
    /// internal order reversed.
    pub fn prevhash_stratum_hex(&self) -> String {
        let mut swapped = [0u8; 32];
        for word in 0..8 {
            for i in 0..4 {
                swapped[word * 4 + i] = self.prevhash[word * 4 + 3 - i];
            }
        }
        hex::encode(swapped)
    }

    pub fn retired_at(&self) -> Option<f64> {
        *self.retired.lock()
    }

    pub fn retire(&self, now: f64) {
        let mut retired = self.retired.lock();
        if retired.is_none() {
            *retired = Some(now);
        }
    }

    pub fn readcount(&self) -> u64 {
        self.readcount.load(Ordering::Acquire)
    }
}

/// Shared-lock read handle; releases the readcount on drop.
pub struct WorkbaseRef {
    wb: Arc<Workbase>,
}

impl Deref for WorkbaseRef {
    type Target = Workbase;

    fn deref(&self) -> &Workbase {
        &self.wb
    }
}

impl Drop for WorkbaseRef {
    fn drop(&mut self) {
        self.wb.readcount.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Default)]
struct StoreInner {
    map: HashMap<u64, Arc<Workbase>>,
    current: Option<u64>,
    next_id: u64,
}

pub struct WorkbaseStore {
    inner: RwLock<StoreInner>,
    grace: f64,
}

impl WorkbaseStore {
    pub fn new(grace: f64) -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                map: HashMap::new(),
                current: None,
                next_id: 1,
            }),
            grace,
        }
    }

    /// Insert a new workbase, retire the previous current, and make the
    /// new one current. Returns the stored entry.
    pub fn put(&self, tpl: &WorkbaseTemplate, now: f64) -> Result<Arc<Workbase>, WorkbaseError> {
        let mut inner = self.inner.write();
        let id = inner.next_id;
        let wb = Arc::new(Workbase::from_template(id, tpl, now)?);
        inner.next_id += 1;
        if let Some(prev) = inner.current {
            if let Some(old) = inner.map.get(&prev) {
                old.retire(now);
            }
        }
        inner.map.insert(id, wb.clone());
        inner.current = Some(id);
        Ok(wb)
    }

    /// Resolve a workbase by id, taking a read reference. The caller's
    /// `WorkbaseRef` keeps the entry alive past retirement.
    pub fn get(&self, id: u64) -> Option<WorkbaseRef> {
        let inner = self.inner.read();
        let wb = inner.map.get(&id)?.clone();
        wb.readcount.fetch_add(1, Ordering::AcqRel);
        Some(WorkbaseRef { wb })
    }

    pub fn current(&self) -> Option<WorkbaseRef> {
        let id = self.inner.read().current?;
        self.get(id)
    }

    pub fn current_id(&self) -> Option<u64> {
        self.inner.read().current
    }

    /// Id the next inserted workbase will get; diff changes scheduled for
    /// "the next job" bind to this.
    pub fn next_id(&self) -> u64 {
        self.inner.read().next_id
    }

    /// Free retired entries whose grace window elapsed and that nobody
    /// still reads.
    pub fn purge(&self, now: f64) -> usize {
        let mut inner = self.inner.write();
        let current = inner.current;
        let grace = self.grace;
        let before = inner.map.len();
        inner.map.retain(|id, wb| {
            if Some(*id) == current {
                return true;
            }
            match wb.retired_at() {
                Some(t) => now - t < grace || wb.readcount() > 0,
                None => true,
            }
        });
        before - inner.map.len()
    }

    pub fn len(&self) -> usize {
        self.inner.read().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(prevhash_byte: u8) -> WorkbaseTemplate {
        WorkbaseTemplate {
            version: 0x20000000,
            prevhash: hex::encode([prevhash_byte; 32]),
            coinbase1: "01000000010000000000000000".to_string(),
            coinbase2: "ffffffff0100f2052a01000000".to_string(),
            merkles: vec![hex::encode([0x44u8; 32])],
            nbits: "1d00ffff".to_string(),
            ntime: 1700000000,
            height: 850000,
        }
    }

    #[test]
    fn template_decodes() {
        let wb = Workbase::from_template(1, &template(0xab), 0.0).unwrap();
        assert_eq!(wb.nbits, 0x1d00ffff);
        assert!((wb.network_diff - 1.0).abs() < 1e-9);
        assert_eq!(wb.prevhash[31], 0xab);
        assert_eq!(wb.merkle_branches.len(), 1);
        assert_eq!(wb.job_id_hex(), "0000000000000001");
    }

    #[test]
    fn bad_hex_is_an_error() {
        let mut tpl = template(0);
        tpl.prevhash = "zz".repeat(32);
        assert!(Workbase::from_template(1, &tpl, 0.0).is_err());
        let mut tpl = template(0);
        tpl.nbits = "1d00".to_string();
        assert!(Workbase::from_template(1, &tpl, 0.0).is_err());
    }

    #[test]
    fn ids_are_monotonic_and_current_advances() {
        let store = WorkbaseStore::new(60.0);
        let a = store.put(&template(1), 0.0).unwrap();
        let b = store.put(&template(2), 1.0).unwrap();
        assert!(b.id > a.id);
        assert_eq!(store.current_id(), Some(b.id));
        assert_eq!(store.next_id(), b.id + 1);
        // The replaced workbase is retired but still resolvable.
        assert!(a.retired_at().is_some());
        assert!(store.get(a.id).is_some());
    }

    #[test]
    fn purge_honors_grace_and_readers() {
        let store = WorkbaseStore::new(60.0);
        let a = store.put(&template(1), 0.0).unwrap();
        store.put(&template(2), 10.0).unwrap();

        // Inside grace: kept.
        assert_eq!(store.purge(30.0), 0);

        // Past grace but with a live reader: kept.
        let held = store.get(a.id).unwrap();
        assert_eq!(store.purge(200.0), 0);
        drop(held);

        assert_eq!(store.purge(200.0), 1);
        assert!(store.get(a.id).is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn readers_survive_retirement() {
        let store = WorkbaseStore::new(0.0);
        let a = store.put(&template(1), 0.0).unwrap();
        let held = store.get(a.id).unwrap();
        store.put(&template(2), 1.0).unwrap();
        store.purge(100.0);
        // The held reference still works even though the entry is gone
        // from the map.
        assert_eq!(held.id, a.id);
    }

    #[test]
    fn prevhash_word_swap() {
        let mut tpl = template(0);
        tpl.prevhash =
            "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f".to_string();
        let wb = Workbase::from_template(1, &tpl, 0.0).unwrap();
        let hex_out = wb.prevhash_stratum_hex();
        // Internal order is the display hex reversed; each 4-byte word is
        // then flipped for the wire.
        assert_eq!(&hex_out[0..8], "1c1d1e1f");
        assert_eq!(&hex_out[56..64], "00010203");
    }
}
