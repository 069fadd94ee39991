//! Per-workbase duplicate-share detection.
//!
//! Every accepted-or-rejected submit tuple is hashed into a per-workbase
//! set; a repeat is a duplicate. Memory is bounded by the workbase
//! lifetime: the whole set goes away when its workbase is freed.

use siphasher::sip::SipHasher13;
use std::collections::HashSet;
use std::hash::Hasher;

#[derive(Debug)]
pub struct DupeSet {
    k0: u64,
    k1: u64,
    seen: HashSet<u64>,
}

impl DupeSet {
    pub fn new() -> Self {
        Self {
            k0: rand::random(),
            k1: rand::random(),
            seen: HashSet::new(),
        }
    }

    /// Record a submit tuple. Returns true when it is fresh, false when
    /// it was already seen on this workbase.
    pub fn insert(&mut self, session_id: u64, nonce2: &str, ntime: &str, nonce: &str) -> bool {
        let mut hasher = SipHasher13::new_with_keys(self.k0, self.k1);
        hasher.write_u64(session_id);
        hasher.write(nonce2.as_bytes());
        hasher.write_u8(0);
        hasher.write(ntime.as_bytes());
        hasher.write_u8(0);
        hasher.write(nonce.as_bytes());
        self.seen.insert(hasher.finish())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for DupeSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeats_are_duplicates() {
        let mut set = DupeSet::new();
        assert!(set.insert(1, "aabb", "5f5e1000", "deadbeef"));
        assert!(!set.insert(1, "aabb", "5f5e1000", "deadbeef"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn different_sessions_do_not_collide() {
        let mut set = DupeSet::new();
        assert!(set.insert(1, "aabb", "5f5e1000", "deadbeef"));
        assert!(set.insert(2, "aabb", "5f5e1000", "deadbeef"));
    }

    #[test]
    fn field_boundaries_are_separated() {
        let mut set = DupeSet::new();
        // "ab" + "cd" must not equal "abc" + "d".
        assert!(set.insert(1, "ab", "cd", "ee"));
        assert!(set.insert(1, "abc", "d", "ee"));
    }
}
