pub mod config;
pub mod connector;
pub mod generator;
pub mod logging;
pub mod metrics;
pub mod registry;
pub mod session;
pub mod shares;
pub mod stats;
pub mod stratifier;
pub mod stratum;
pub mod uaregistry;
pub mod users;
pub mod vardiff;
pub mod workbase;

pub use config::PoolConfig;
pub use connector::{ChannelConnector, ClientMessage, Connector};
pub use generator::{BlockMeta, Generator, NullGenerator};
pub use stratifier::{PoolState, Stratifier};
pub use workbase::{Workbase, WorkbaseStore, WorkbaseTemplate};
