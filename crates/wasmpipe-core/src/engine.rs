//! Wasmtime engine configuration and creation.
//!
//! The [`WasmEngine`] is the foundation of the host. It is:
//! - Thread-safe and shared across all stages and requests
//! - Optionally configured with the pooling allocator for fast instantiation
//! - Set up with fuel metering and epoch interruption for resource limiting
//!
//! It also carries the process-wide compiled-module cache, keyed by content
//! hash, so two stages pointing at the same bytecode share one compilation.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};
use wasmtime::{Config, Engine, InstanceAllocationStrategy, PoolingAllocationConfig};

use wasmpipe_common::{EngineConfig, ProvisionError};

use crate::module::CompiledModule;

/// Thread-safe WebAssembly engine wrapper.
///
/// Wraps a Wasmtime [`Engine`] configured for middleware execution. The
/// engine is shared across all requests and contains no per-request state.
///
/// # Example
///
/// ```ignore
/// use wasmpipe_common::EngineConfig;
/// use wasmpipe_core::WasmEngine;
///
/// let engine = WasmEngine::new(&EngineConfig::default())?;
/// ```
#[derive(Clone)]
pub struct WasmEngine {
    engine: Arc<Engine>,
    modules: Arc<DashMap<String, Arc<CompiledModule>>>,
    config: EngineConfig,
}

impl WasmEngine {
    /// Create a new WebAssembly engine with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the Wasmtime configuration is invalid or the
    /// pooling allocator cannot be initialized.
    pub fn new(config: &EngineConfig) -> Result<Self, ProvisionError> {
        let mut wasmtime_config = Config::new();

        // Async support for non-blocking host calls
        wasmtime_config.async_support(true);

        // Fuel accounting is always compiled in; stores for stages that do
        // not meter fuel are given an effectively unlimited budget instead.
        wasmtime_config.consume_fuel(true);

        if config.epoch_interruption {
            wasmtime_config.epoch_interruption(true);
        }

        wasmtime_config.cranelift_opt_level(wasmtime::OptLevel::Speed);

        if config.pooling_allocator {
            let pooling_config = Self::create_pooling_config(config);

            wasmtime_config
                .allocation_strategy(InstanceAllocationStrategy::Pooling(pooling_config));

            info!(
                max_instances = config.max_instances,
                instance_memory_mb = config.instance_memory_mb,
                "Pooling allocator enabled"
            );
        }

        let engine = Engine::new(&wasmtime_config).map_err(|e| {
            ProvisionError::engine(format!("failed to create Wasmtime engine: {e}"))
        })?;

        debug!("Wasmtime engine initialized");

        Ok(Self {
            engine: Arc::new(engine),
            modules: Arc::new(DashMap::new()),
            config: config.clone(),
        })
    }

    /// Create pooling allocation configuration.
    fn create_pooling_config(config: &EngineConfig) -> PoolingAllocationConfig {
        let mut pooling = PoolingAllocationConfig::default();

        pooling.total_core_instances(config.max_instances);
        pooling.total_memories(config.max_instances);
        pooling.total_tables(config.max_instances);

        let max_memory_bytes = (config.instance_memory_mb as usize) * 1024 * 1024;
        pooling.max_memory_size(max_memory_bytes);

        pooling
    }

    /// Get a reference to the inner Wasmtime engine.
    pub fn inner(&self) -> &Engine {
        &self.engine
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Increment the epoch counter.
    ///
    /// Called periodically (e.g., every 1ms) to drive epoch-based
    /// interruption of long-running guest executions.
    pub fn increment_epoch(&self) {
        self.engine.increment_epoch();
    }

    /// Check if the pooling allocator is enabled.
    pub fn is_pooling_enabled(&self) -> bool {
        self.config.pooling_allocator
    }

    /// Look up a cached compiled module by content hash.
    pub(crate) fn cached_module(&self, content_hash: &str) -> Option<Arc<CompiledModule>> {
        self.modules.get(content_hash).map(|m| Arc::clone(&m))
    }

    /// Insert a compiled module into the cache.
    pub(crate) fn cache_module(&self, module: Arc<CompiledModule>) {
        self.modules
            .insert(module.content_hash().to_string(), module);
    }

    /// Number of distinct compiled modules currently cached.
    pub fn cached_module_count(&self) -> usize {
        self.modules.len()
    }
}

impl std::fmt::Debug for WasmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmEngine")
            .field("pooling_allocator", &self.config.pooling_allocator)
            .field("max_instances", &self.config.max_instances)
            .field("cached_modules", &self.modules.len())
            .finish_non_exhaustive()
    }
}
