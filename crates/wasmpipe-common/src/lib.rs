//! Common types, errors, and configuration for wasmpipe.
//!
//! This crate provides the shared vocabulary used across the wasmpipe workspace:
//! - Error types using `thiserror` for the provisioning and per-request taxonomies
//! - Pool and stage configuration with strict external key validation
//! - TOML configuration file structures
//! - The HTTP exchange types threaded through the middleware chain
//! - The deferred-commit response buffer

pub mod config;
pub mod config_file;
pub mod error;
pub mod exchange;
pub mod writer;

pub use config::{BuilderKind, EngineConfig, ExecutionConfig, PoolConfig, StageSpec};
pub use config_file::ConfigFile;
pub use error::{ConfigError, PipelineError, ProvisionError};
pub use exchange::{Continuation, Handler, StageRequest};
pub use writer::{CaptureHandle, CaptureSink, CapturedResponse, ResponseBuffer, ResponseSink};
