//! Instance pooling, wasm stages, and middleware chain composition.
//!
//! A [`WasmStage`] wraps one module behind a bounded [`InstancePool`] so a
//! non-reentrant compiled module stays safe under concurrent traffic;
//! [`build_chain`] threads an ordered list of stages together with a
//! continuation handed to each one.

pub mod chain;
pub mod pool;
pub mod stage;

pub use chain::build_chain;
pub use pool::{InstancePool, PoolGuard};
pub use stage::WasmStage;
