//! Pool-wide useragent registry.
//!
//! Keyed by a normalized token so "cgminer/4.9.2" and "CGMiner/4.10" land
//! in the same bucket. Entries are refcounted by subscriber count and
//! vanish when the last session detaches.

use lode_core::clock::decay_time;
use serde::Serialize;
use std::collections::HashMap;

pub const UA_TRUNCATE_LEN: usize = 64;
pub const UA_OTHER: &str = "Other";

/// Lowercased leading identifier of a useragent: skip leading whitespace,
/// copy until `/`, `(` or whitespace, cap at 64 bytes. Empty results
/// collapse to the literal "Other".
pub fn normalize_ua(ua: &str) -> String {
    let mut out = String::new();
    for ch in ua.trim_start().chars() {
        if ch == '/' || ch == '(' || ch.is_whitespace() {
            break;
        }
        if out.len() + ch.len_utf8() > UA_TRUNCATE_LEN {
            break;
        }
        out.push(ch.to_ascii_lowercase());
    }
    let out = out.trim_end().to_string();
    // Empty collapses to the literal "Other"; so does a literal "other",
    // which keeps normalization idempotent over its own output.
    if out.is_empty() || out == "other" {
        UA_OTHER.to_string()
    } else {
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct UaItem {
    pub count: i64,
    pub dsps5: f64,
    pub last_decay: f64,
    pub best_diff: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UaSnapshot {
    pub ua: String,
    pub count: i64,
    pub dsps5: f64,
    pub best_diff: f64,
}

#[derive(Debug, Default)]
pub struct UaRegistry {
    map: HashMap<String, UaItem>,
}

impl UaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one subscriber for `ua`. Returns the normalized key the
    /// caller must later pass to `remove`. Empty input is a no-op.
    pub fn add(&mut self, ua: &str) -> Option<String> {
        if ua.is_empty() {
            return None;
        }
        let key = normalize_ua(ua);
        self.map.entry(key.clone()).or_default().count += 1;
        Some(key)
    }

    /// Drop one subscriber. `add` and `remove` share the normalization
    /// path so pairing is guaranteed; count 0 deletes the entry.
    pub fn remove(&mut self, ua: &str) {
        if ua.is_empty() {
            return;
        }
        let key = normalize_ua(ua);
        if let Some(item) = self.map.get_mut(&key) {
            item.count -= 1;
            if item.count <= 0 {
                self.map.remove(&key);
            }
        }
    }

    /// Credit an accepted share's difficulty to the (already normalized)
    /// useragent bucket.
    pub fn record_share(&mut self, norm: &str, diff: f64, share_diff: f64, now: f64) {
        if let Some(item) = self.map.get_mut(norm) {
            let secs = if item.last_decay > 0.0 {
                (now - item.last_decay).max(1e-3)
            } else {
                1e-3
            };
            decay_time(&mut item.dsps5, diff, secs, 300.0);
            item.last_decay = now;
            if share_diff > item.best_diff {
                item.best_diff = share_diff;
            }
        }
    }

    pub fn total_count(&self) -> i64 {
        self.map.values().map(|i| i.count).sum()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&self, norm: &str) -> Option<&UaItem> {
        self.map.get(norm)
    }

    pub fn snapshot(&self) -> Vec<UaSnapshot> {
        let mut out: Vec<UaSnapshot> = self
            .map
            .iter()
            .map(|(ua, item)| UaSnapshot {
                ua: ua.clone(),
                count: item.count,
                dsps5: item.dsps5,
                best_diff: item.best_diff,
            })
            .collect();
        out.sort_by(|a, b| b.count.cmp(&a.count));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_examples() {
        assert_eq!(normalize_ua("cgminer/4.9.2"), "cgminer");
        assert_eq!(normalize_ua("  BFGMiner/5.0 (linux)"), "bfgminer");
        assert_eq!(normalize_ua("NiceHash (proxy)"), "nicehash");
        assert_eq!(normalize_ua("whatsminer v1"), "whatsminer");
        assert_eq!(normalize_ua(""), "Other");
        assert_eq!(normalize_ua("   "), "Other");
        assert_eq!(normalize_ua("/leading"), "Other");
        assert_eq!(normalize_ua("Other"), "Other");
    }

    #[test]
    fn normalization_is_idempotent() {
        for ua in ["cgminer/4.9", "Mixed Case Agent", "", "Other", "ümlaut/1"] {
            let once = normalize_ua(ua);
            assert_eq!(normalize_ua(&once), once, "input {ua:?}");
        }
    }

    #[test]
    fn normalization_caps_at_64_bytes() {
        let long = "a".repeat(200);
        assert_eq!(normalize_ua(&long).len(), 64);
    }

    #[test]
    fn add_remove_pair_up() {
        let mut reg = UaRegistry::new();
        reg.add("cgminer/4.9");
        reg.add("CGMiner/4.10");
        assert_eq!(reg.get("cgminer").unwrap().count, 2);
        reg.remove("cgminer/4.9");
        assert_eq!(reg.get("cgminer").unwrap().count, 1);
        reg.remove("CGMiner/4.10");
        assert!(reg.get("cgminer").is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn empty_ua_is_noop() {
        let mut reg = UaRegistry::new();
        assert!(reg.add("").is_none());
        reg.remove("");
        assert!(reg.is_empty());
    }

    #[test]
    fn counts_sum_to_subscribers() {
        let mut reg = UaRegistry::new();
        for ua in ["cgminer/1", "cgminer/2", "bfgminer/1", "x"] {
            reg.add(ua);
        }
        assert_eq!(reg.total_count(), 4);
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn share_credit_updates_best_and_rate() {
        let mut reg = UaRegistry::new();
        let key = reg.add("cgminer/4.9").unwrap();
        reg.record_share(&key, 16.0, 900.0, 10.0);
        reg.record_share(&key, 16.0, 100.0, 13.0);
        let item = reg.get(&key).unwrap();
        assert!(item.dsps5 > 0.0);
        assert_eq!(item.best_diff, 900.0);
    }
}
