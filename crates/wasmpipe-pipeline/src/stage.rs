//! One wasm middleware stage backed by an instance pool.

use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use wasmpipe_abi::{pooled, InstanceFactory, PooledInstance};
use wasmpipe_common::{Continuation, PipelineError, PoolConfig, ResponseBuffer, StageRequest};

use crate::pool::InstancePool;

/// Upper bound on waiting for a pool entry before the request fails.
const BORROW_DEADLINE: Duration = Duration::from_secs(10);

/// A middleware stage executing one wasm module.
///
/// The stage owns a pool of type-erased instance factories. Serving a
/// request borrows exactly one entry, binds it to the continuation, runs
/// the resulting handler, and returns the entry before any error
/// propagates.
pub struct WasmStage {
    name: String,
    pool: InstancePool<PooledInstance>,
}

impl WasmStage {
    /// Create a stage over an instance factory with the given pool policy.
    pub fn new(name: impl Into<String>, factory: InstanceFactory, config: PoolConfig) -> Self {
        let pool = InstancePool::new(config, Box::new(move || pooled(&factory)));
        Self {
            name: name.into(),
            pool,
        }
    }

    /// Stage name, for logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start this stage's pool evictor, if one is configured.
    pub fn spawn_evictor(&self) -> Option<tokio::task::JoinHandle<()>> {
        self.pool.spawn_evictor()
    }

    /// Access the underlying pool, for introspection.
    pub fn pool(&self) -> &InstancePool<PooledInstance> {
        &self.pool
    }

    /// Serve one request through this stage.
    ///
    /// If the guest handler reports that it did not terminate the response
    /// (the pass-through case), the stage forwards to `next` afterwards,
    /// which is what lets a stage act as pure middleware.
    ///
    /// # Errors
    ///
    /// Returns pool exhaustion, adapter contract violations, guest
    /// failures, or cancellation. The pooled entry is returned in every
    /// case.
    pub async fn serve(
        &self,
        req: &StageRequest,
        rw: &mut ResponseBuffer,
        next: Continuation,
    ) -> Result<(), PipelineError> {
        let entry = self.pool.borrow(BORROW_DEADLINE).await?;

        // A pooled value of any other shape is a programming error, not a
        // retryable condition.
        let factory = entry
            .downcast_ref::<InstanceFactory>()
            .ok_or(PipelineError::AdapterContract)?;
        let handler = factory(Arc::clone(&next));

        trace!(stage = %self.name, "Dispatching to guest");
        let result = handler.serve(req, rw).await;

        // Return the entry before propagating anything.
        drop(entry);

        let served = result?;
        if !served.body_written {
            trace!(stage = %self.name, "Guest passed through; forwarding");
            next.serve(req, rw).await?;
        }

        Ok(())
    }
}

impl std::fmt::Debug for WasmStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmStage")
            .field("name", &self.name)
            .field("idle", &self.pool.idle_count())
            .field("active", &self.pool.active_count())
            .finish_non_exhaustive()
    }
}
