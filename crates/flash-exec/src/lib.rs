//! flash-exec: turns optimizer results into signed, simulated relay bundles
//! and wires the engine's long-running tasks together.

pub mod bundler;
pub mod chain;
pub mod engine;
pub mod gas;
pub mod payload;
pub mod relay;
pub mod signer;
pub mod tracker;

pub use bundler::{Bundler, BundlerConfig, Submission, SubmissionState, Trigger};
pub use engine::{run, scan, EngineConfig};
pub use gas::{format_eth, ProfitGate, ProfitThreshold};
pub use relay::{BundleRelay, FlashbotsRelay, RelayError, SimulationReport};
pub use signer::{LocalSigner, TransactionSigner};
