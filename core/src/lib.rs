pub mod address;
pub mod clock;
pub mod hash;
pub mod target;

pub use address::{AddressError, AddressKind, PayoutAddress};
pub use clock::{decay_time, monotonic_now, ms_tvdiff, sane_tdiff, tdiff, us_tvdiff};
pub use hash::{coinbase_merkle_root, double_sha256, fulltest, sha256, ShareHeader};
pub use target::{
    diff_from_betarget, diff_from_nbits, diff_from_target, normalize_pool_diff, target_from_diff,
};
