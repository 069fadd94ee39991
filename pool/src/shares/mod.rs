//! Share acceptance: validation pipeline and duplicate detection.

pub mod acceptor;
pub mod dupes;

pub use acceptor::{process_submit, AcceptedShare, ShareError, SubmitOutcome, SubmitVerdict};
pub use dupes::DupeSet;
