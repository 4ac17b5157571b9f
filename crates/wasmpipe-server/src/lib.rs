//! HTTP serving edge for the wasmpipe middleware chain.
//!
//! Provisioning turns a configuration file into a composed chain of wasm
//! stages; the axum server buffers each request once, runs it through the
//! chain against a deferred response buffer, and commits the result in a
//! single flush.

pub mod handler;
pub mod provision;
pub mod router;
pub mod server;
pub mod state;

pub use provision::provision;
pub use router::build_router;
pub use server::{PipelineServer, ServerConfig, TestHandle};
pub use state::AppState;
