//! flash-data crate: pool state, chain ingestion and persistence.

pub mod debounce;
pub mod feeds;
pub mod mempool;
pub mod pipeline;
pub mod pools;
pub mod registry;
pub mod rpc;
pub mod store;
pub mod types;

pub use pools::PoolStore;
pub use registry::{CycleDefinition, Registry, Settings};
pub use types::{CycleId, Fee, PoolKind, PoolSnapshot, ReserveUpdate, Token};
