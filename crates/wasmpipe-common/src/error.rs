//! Error types for wasmpipe.
//!
//! Two distinct taxonomies, reflecting where a failure can surface:
//! - [`ProvisionError`]: startup-time failures (compile, bind, adapter
//!   construction, configuration). Fatal; the pipeline does not start.
//! - [`PipelineError`]: per-request failures. Caught at the stage boundary,
//!   logged, and converted into an HTTP response rather than crashing.

use std::io;

use thiserror::Error;

/// Fatal errors raised while provisioning the pipeline.
///
/// Any of these aborts startup; none are retried.
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// Reading module bytecode from disk failed.
    #[error("failed to read module '{path}': {source}")]
    Read {
        /// Path that could not be read.
        path: String,
        #[source]
        source: io::Error,
    },

    /// WebAssembly compilation failed.
    #[error("compilation failed: {reason}")]
    Compile {
        /// Description of the compilation failure.
        reason: String,
    },

    /// Capability binding failed (e.g. a malformed sockets-extension import).
    #[error("capability binding failed: {reason}")]
    CapabilityBind {
        /// Description of the binding failure.
        reason: String,
    },

    /// ABI adapter construction failed.
    #[error("adapter construction failed: {reason}")]
    Adapter {
        /// Description of the adapter failure.
        reason: String,
    },

    /// Engine construction or configuration failed.
    #[error("invalid engine configuration: {reason}")]
    Engine {
        /// Description of the engine failure.
        reason: String,
    },

    /// Invalid pipeline configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ProvisionError {
    /// Create a new `Compile` error.
    pub fn compile(reason: impl Into<String>) -> Self {
        Self::Compile {
            reason: reason.into(),
        }
    }

    /// Create a new `CapabilityBind` error.
    pub fn capability_bind(reason: impl Into<String>) -> Self {
        Self::CapabilityBind {
            reason: reason.into(),
        }
    }

    /// Create a new `Adapter` error.
    pub fn adapter(reason: impl Into<String>) -> Self {
        Self::Adapter {
            reason: reason.into(),
        }
    }

    /// Create a new `Engine` error.
    pub fn engine(reason: impl Into<String>) -> Self {
        Self::Engine {
            reason: reason.into(),
        }
    }
}

/// Per-request errors surfaced by stages and the pool.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The instance pool had no entry available within the borrow deadline.
    #[error("instance pool exhausted: {reason}")]
    PoolExhausted {
        /// Why the borrow failed (at capacity, timed out, pool closed).
        reason: String,
    },

    /// A pooled value did not match the expected handler contract.
    ///
    /// This is a programming or configuration mismatch, never retried and
    /// never silently swallowed.
    #[error("pooled value does not implement the stage handler contract")]
    AdapterContract,

    /// Guest execution failed: the guest reported an error, or
    /// instantiation/decoding of its output failed.
    #[error("guest execution failed: {reason}")]
    GuestExecution {
        /// The guest-reported error text or host-side failure description.
        reason: String,
    },

    /// The request was cancelled before or during guest execution.
    #[error("request cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Create a new `PoolExhausted` error.
    pub fn pool_exhausted(reason: impl Into<String>) -> Self {
        Self::PoolExhausted {
            reason: reason.into(),
        }
    }

    /// Create a new `GuestExecution` error.
    pub fn guest(reason: impl Into<String>) -> Self {
        Self::GuestExecution {
            reason: reason.into(),
        }
    }

    /// Returns `true` if this error came from pool contention.
    pub fn is_pool_exhausted(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. })
    }

    /// Returns `true` if the guest itself failed.
    pub fn is_guest_failure(&self) -> bool {
        matches!(self, Self::GuestExecution { .. })
    }
}

/// Configuration errors.
///
/// Unknown keys are rejected at provisioning time rather than ignored.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A pool configuration key is not in the recognized set.
    #[error("unsupported pool directive: {key}")]
    UnknownPoolKey {
        /// The offending key, as supplied.
        key: String,
    },

    /// A configuration value could not be interpreted.
    #[error("invalid value for '{key}': {reason}")]
    InvalidValue {
        /// The key whose value was rejected.
        key: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// An unknown stage builder kind.
    #[error("unsupported stage builder: {kind}")]
    UnknownBuilder {
        /// The offending builder discriminator.
        kind: String,
    },

    /// Failed to read a configuration file.
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Failed to parse a configuration file.
    #[error("failed to parse config file: {message}")]
    Parse { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provision_error_display() {
        let err = ProvisionError::compile("bad magic number");
        assert_eq!(err.to_string(), "compilation failed: bad magic number");

        let err = ProvisionError::from(ConfigError::UnknownPoolKey {
            key: "Frobnicate".into(),
        });
        assert_eq!(err.to_string(), "unsupported pool directive: Frobnicate");
    }

    #[test]
    fn test_pipeline_error_predicates() {
        let err = PipelineError::pool_exhausted("borrow timed out");
        assert!(err.is_pool_exhausted());
        assert!(!err.is_guest_failure());

        let err = PipelineError::guest("boom");
        assert!(err.is_guest_failure());

        assert!(!PipelineError::AdapterContract.is_pool_exhausted());
        assert!(!PipelineError::Cancelled.is_guest_failure());
    }

    #[test]
    fn test_config_error_names_key() {
        let err = ConfigError::UnknownPoolKey {
            key: "Frobnicate".into(),
        };
        assert!(err.to_string().contains("Frobnicate"));
    }
}
