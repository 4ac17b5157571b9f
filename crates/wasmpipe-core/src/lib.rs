//! Wasmtime engine, module compilation, and capability binding for wasmpipe.
//!
//! This crate owns everything that touches Wasmtime directly:
//! - [`WasmEngine`]: the shared, process-wide engine with a compiled-module cache
//! - [`CompiledModule`]: bytecode loading, validation, and compilation
//! - [`CapabilityProfile`]: import-derived host capability binding
//! - [`InvocationContext`]: the per-invocation store state and WASI linker

pub mod capability;
pub mod context;
pub mod engine;
pub mod module;

pub use capability::CapabilityProfile;
pub use context::{new_linker, new_store, InvocationContext};
pub use engine::WasmEngine;
pub use module::CompiledModule;
