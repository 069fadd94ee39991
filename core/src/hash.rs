//! SHA-256 primitives and share-header assembly.

use sha2::{Digest, Sha256};

/// Single-shot SHA-256.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(data));
    out
}

/// Bitcoin double-SHA-256.
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    sha256(&sha256(data))
}

/// An 80-byte share header ready for hashing. All integer fields serialize
/// little-endian; `prevhash` and `merkle_root` are stored in internal
/// (little-endian) byte order.
#[derive(Debug, Clone, Copy)]
pub struct ShareHeader {
    pub version: u32,
    pub prevhash: [u8; 32],
    pub merkle_root: [u8; 32],
    pub ntime: u32,
    pub nbits: u32,
    pub nonce: u32,
}

impl ShareHeader {
    pub fn serialize(&self) -> [u8; 80] {
        let mut buf = [0u8; 80];
        buf[0..4].copy_from_slice(&self.version.to_le_bytes());
        buf[4..36].copy_from_slice(&self.prevhash);
        buf[36..68].copy_from_slice(&self.merkle_root);
        buf[68..72].copy_from_slice(&self.ntime.to_le_bytes());
        buf[72..76].copy_from_slice(&self.nbits.to_le_bytes());
        buf[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        buf
    }

    /// Double-SHA-256 of the serialized header. The result is the share
    /// hash in little-endian integer order, directly comparable against a
    /// little-endian target with [`fulltest`].
    pub fn hash(&self) -> [u8; 32] {
        double_sha256(&self.serialize())
    }
}

/// Fold the coinbase transaction and merkle branches into a merkle root.
///
/// The coinbase is `coinb1 || enonce1 || enonce2 || coinb2`; each branch is
/// appended and double-hashed in order. The result stays in internal byte
/// order, ready for [`ShareHeader`].
pub fn coinbase_merkle_root(
    coinb1: &[u8],
    enonce1: &[u8],
    enonce2: &[u8],
    coinb2: &[u8],
    branches: &[[u8; 32]],
) -> [u8; 32] {
    let mut coinbase = Vec::with_capacity(coinb1.len() + enonce1.len() + enonce2.len() + coinb2.len());
    coinbase.extend_from_slice(coinb1);
    coinbase.extend_from_slice(enonce1);
    coinbase.extend_from_slice(enonce2);
    coinbase.extend_from_slice(coinb2);

    let mut root = double_sha256(&coinbase);
    let mut pair = [0u8; 64];
    for branch in branches {
        pair[0..32].copy_from_slice(&root);
        pair[32..64].copy_from_slice(branch);
        root = double_sha256(&pair);
    }
    root
}

/// Full 256-bit target test: true iff `hash`, read as a little-endian
/// 256-bit unsigned integer, is less than or equal to `target`.
pub fn fulltest(hash: &[u8; 32], target: &[u8; 32]) -> bool {
    for i in (0..32).rev() {
        if hash[i] < target[i] {
            return true;
        }
        if hash[i] > target[i] {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};

    #[test]
    fn empty_input_matches_nist_vector() {
        let h = sha256(b"");
        assert_eq!(
            hex::encode(h),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn streaming_agrees_with_single_shot() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let mut hasher = Sha256::new();
        hasher.update(&data[..9]);
        hasher.update(&data[9..]);
        let streamed: [u8; 32] = hasher.finalize().into();
        assert_eq!(streamed, sha256(data));
    }

    #[test]
    fn double_sha_of_empty() {
        assert_eq!(double_sha256(b""), sha256(&sha256(b"")));
    }

    #[test]
    fn header_serializes_to_80_bytes_le() {
        let header = ShareHeader {
            version: 0x20000000,
            prevhash: [0xaa; 32],
            merkle_root: [0xbb; 32],
            ntime: 0x5f5e100f,
            nbits: 0x1d00ffff,
            nonce: 0xdeadbeef,
        };
        let buf = header.serialize();
        assert_eq!(&buf[0..4], &[0x00, 0x00, 0x00, 0x20]);
        assert_eq!(&buf[68..72], &[0x0f, 0x10, 0x5e, 0x5f]);
        assert_eq!(&buf[72..76], &[0xff, 0xff, 0x00, 0x1d]);
        assert_eq!(&buf[76..80], &[0xef, 0xbe, 0xad, 0xde]);
    }

    #[test]
    fn merkle_root_without_branches_is_coinbase_hash() {
        let root = coinbase_merkle_root(b"c1", b"e1", b"e2", b"c2", &[]);
        assert_eq!(root, double_sha256(b"c1e1e2c2"));
    }

    #[test]
    fn merkle_root_folds_branches_in_order() {
        let branch = [0x11u8; 32];
        let root = coinbase_merkle_root(b"a", b"b", b"c", b"d", &[branch]);
        let mut pair = [0u8; 64];
        pair[0..32].copy_from_slice(&double_sha256(b"abcd"));
        pair[32..64].copy_from_slice(&branch);
        assert_eq!(root, double_sha256(&pair));
    }

    #[test]
    fn fulltest_boundaries() {
        let target = [0x7fu8; 32];
        assert!(fulltest(&target, &target));
        let mut above = target;
        above[31] = 0x80;
        assert!(!fulltest(&above, &target));
        let mut below = target;
        below[0] = 0x7e;
        assert!(fulltest(&below, &target));
    }

    #[test]
    fn fulltest_is_monotone_in_hash() {
        // Flipping any 0 bit to 1 makes the hash strictly larger, so a hash
        // sitting exactly on the target must fail after any such flip.
        let target = [0x55u8; 32];
        let hash = target;
        assert!(fulltest(&hash, &target));
        for byte in 0..32 {
            for bit in 0..8 {
                if hash[byte] & (1 << bit) != 0 {
                    continue;
                }
                let mut bumped = hash;
                bumped[byte] |= 1 << bit;
                assert!(!fulltest(&bumped, &target), "byte {byte} bit {bit}");
            }
        }
    }
}
