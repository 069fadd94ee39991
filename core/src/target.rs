//! Difficulty <-> 256-bit target conversions.
//!
//! The pool's authoritative difficulty representation is an `f64`. Targets
//! are little-endian 256-bit integers handled as four 64-bit limbs so the
//! hot path never allocates. Sub-1 difficulties stay fractional (sub-1 H/s
//! devices depend on it); values >= 1 are normalized to whole numbers so
//! share-counting arithmetic stays stable.

/// The difficulty-1 target, 0x00000000FFFF0000...0000, as a double.
pub const TRUEDIFF_ONE: f64 =
    26959535291011309493156476344723991336010898738574164086137773096960.0;

const BITS64: f64 = 18446744073709551616.0;
const BITS128: f64 = BITS64 * BITS64;
const BITS192: f64 = BITS128 * BITS64;

/// Convert a pool difficulty to a little-endian 256-bit target.
///
/// `diff == 0` (and any non-finite or negative input) yields the all-0xFF
/// target rather than crashing. Difficulties small enough that the true
/// target would exceed 2^256 - 1 saturate to all-0xFF as well.
pub fn target_from_diff(diff: f64) -> [u8; 32] {
    if !diff.is_finite() || diff <= 0.0 {
        return [0xff; 32];
    }

    let mut d64 = TRUEDIFF_ONE / diff;
    if d64 >= BITS192 * BITS64 {
        return [0xff; 32];
    }

    let mut target = [0u8; 32];
    for (limb, bits) in [(3usize, BITS192), (2, BITS128), (1, BITS64)] {
        let h = (d64 / bits) as u64;
        target[limb * 8..limb * 8 + 8].copy_from_slice(&h.to_le_bytes());
        d64 -= h as f64 * bits;
    }
    let low = d64 as u64;
    target[0..8].copy_from_slice(&low.to_le_bytes());
    target
}

fn le256_to_f64(target: &[u8; 32]) -> f64 {
    let mut acc = 0.0;
    for limb in (0..4).rev() {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&target[limb * 8..limb * 8 + 8]);
        acc = acc * BITS64 + u64::from_le_bytes(raw) as f64;
    }
    acc
}

/// Difficulty of a little-endian 256-bit target (or share hash).
pub fn diff_from_target(target: &[u8; 32]) -> f64 {
    let mut d = le256_to_f64(target);
    if d == 0.0 {
        d = 1.0;
    }
    TRUEDIFF_ONE / d
}

/// Difficulty of a big-endian 256-bit target. Equal to `diff_from_target`
/// under byte reversal.
pub fn diff_from_betarget(target: &[u8; 32]) -> f64 {
    let mut le = *target;
    le.reverse();
    diff_from_target(&le)
}

/// Decode Bitcoin compact difficulty (nbits, exponent byte first).
///
/// Valid inputs produce a positive finite value. Invalid nbits produce an
/// unspecified value but never crash; a zero mantissa returns 0.
pub fn diff_from_nbits(nbits: [u8; 4]) -> f64 {
    let exponent = nbits[0] as i32;
    let mantissa = (u32::from_be_bytes(nbits) & 0x00ff_ffff) as f64;
    if mantissa == 0.0 {
        return 0.0;
    }
    let powdiff = 8 * (0x1d - 3) - 8 * (exponent - 3);
    65535.0 * powi2(powdiff) / mantissa
}

fn powi2(exp: i32) -> f64 {
    2f64.powi(exp)
}

/// Canonical pool difficulty: identity below 1.0, nearest whole number
/// (half away from zero) at or above 1.0. Idempotent; NaN and infinities
/// propagate untouched.
pub fn normalize_pool_diff(diff: f64) -> f64 {
    if diff < 1.0 {
        diff
    } else {
        diff.round()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_bigint::BigUint;
    use num_traits::Num;

    fn roundtrip_err(d: f64) -> f64 {
        let rt = diff_from_target(&target_from_diff(d));
        (rt - d).abs()
    }

    #[test]
    fn diff_zero_gives_max_target() {
        assert_eq!(target_from_diff(0.0), [0xff; 32]);
        assert_eq!(target_from_diff(f64::NAN), [0xff; 32]);
        assert_eq!(target_from_diff(-1.0), [0xff; 32]);
    }

    #[test]
    fn diff_one_target_matches_reference() {
        let t = target_from_diff(1.0);
        // 0x00000000FFFF0000...0000 big-endian; little-endian puts the
        // 0xffff word at bytes 26..28.
        let mut be = t;
        be.reverse();
        let expect = BigUint::from_str_radix(
            "00000000ffff0000000000000000000000000000000000000000000000000000",
            16,
        )
        .unwrap();
        assert_eq!(BigUint::from_bytes_be(&be), expect);
    }

    #[test]
    fn roundtrip_within_tolerance() {
        for &d in &[
            1e-6, 1e-4, 0.001, 0.01, 0.5, 0.99, 1.0, 2.0, 16.0, 1000.0, 65536.0, 1e7, 1e10,
        ] {
            let err = roundtrip_err(d);
            let tol = (0.001 * d).max(1e-6);
            assert!(err <= tol, "diff {d}: err {err} > tol {tol}");
        }
    }

    #[test]
    fn fractional_diffs_stay_fractional() {
        let d = 0.00001;
        let rt = diff_from_target(&target_from_diff(d));
        assert!((rt - d).abs() / d < 0.001);
    }

    #[test]
    fn be_and_le_agree() {
        let le = target_from_diff(512.0);
        let mut be = le;
        be.reverse();
        assert_eq!(diff_from_target(&le), diff_from_betarget(&be));
    }

    #[test]
    fn nbits_mainnet_genesis() {
        // 0x1d00ffff is difficulty 1.
        let d = diff_from_nbits([0x1d, 0x00, 0xff, 0xff]);
        assert!((d - 1.0).abs() < 1e-9);
    }

    #[test]
    fn nbits_higher_difficulty() {
        // 0x1b0404cb is the classic example block: difficulty ~16307.42.
        let d = diff_from_nbits([0x1b, 0x04, 0x04, 0xcb]);
        assert!((d - 16307.420938523983).abs() / d < 1e-9);
    }

    #[test]
    fn nbits_zero_mantissa_does_not_crash() {
        assert_eq!(diff_from_nbits([0x1d, 0, 0, 0]), 0.0);
    }

    #[test]
    fn normalize_is_idempotent() {
        for &d in &[0.0, 1e-9, 0.5, 0.999, 1.0, 1.4, 1.5, 2.6, 1e12] {
            let n = normalize_pool_diff(d);
            assert_eq!(normalize_pool_diff(n), n, "input {d}");
        }
    }

    #[test]
    fn normalize_rounds_half_away_from_zero() {
        assert_eq!(normalize_pool_diff(1.5), 2.0);
        assert_eq!(normalize_pool_diff(2.5), 3.0);
        assert_eq!(normalize_pool_diff(2.4), 2.0);
        assert_eq!(normalize_pool_diff(0.5), 0.5);
    }

    #[test]
    fn normalize_tolerates_non_finite() {
        assert!(normalize_pool_diff(f64::NAN).is_nan());
        assert_eq!(normalize_pool_diff(f64::INFINITY), f64::INFINITY);
    }
}
