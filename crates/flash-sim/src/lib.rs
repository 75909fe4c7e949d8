//! flash-sim: exact swap math, cycle optimization and pending-swap projection.
//!
//! Everything here is synchronous and side-effect free apart from writes
//! into the [`cycle::CycleBook`]; the async engine drives it from blocking
//! worker tasks.

pub mod cycle;
pub mod decoder;
pub mod math;
pub mod optimizer;
pub mod projector;
pub mod quote;
pub mod view;

pub use cycle::{CycleBook, HopAmounts, OpportunityResult};
pub use optimizer::CycleOptimizer;
pub use projector::{MempoolProjector, Projection};
