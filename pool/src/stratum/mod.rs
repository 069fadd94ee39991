//! Stratum wire protocol: message types and the proxy-protocol pre-peel.

pub mod protocol;
pub mod proxy;

pub use protocol::{StratumError, StratumRequest, StratumResponse};
pub use proxy::{peek, ProxyPeek};
