//! Shared application state.

use std::sync::Arc;
use std::time::Duration;

use wasmpipe_common::Continuation;
use wasmpipe_core::WasmEngine;
use wasmpipe_pipeline::WasmStage;

/// How often the epoch ticker advances the engine's epoch counter. Store
/// deadlines are expressed in these ticks.
const EPOCH_TICK: Duration = Duration::from_millis(1);

/// Shared state across all request handlers.
///
/// Cloned per request; everything inside is `Arc`-shared.
#[derive(Clone)]
pub struct AppState {
    engine: Arc<WasmEngine>,
    stages: Arc<Vec<Arc<WasmStage>>>,
    chain: Continuation,
    request_timeout: Duration,
}

impl AppState {
    pub(crate) fn new(
        engine: Arc<WasmEngine>,
        stages: Vec<Arc<WasmStage>>,
        chain: Continuation,
        request_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            stages: Arc::new(stages),
            chain,
            request_timeout,
        }
    }

    /// The Wasmtime engine.
    pub fn engine(&self) -> &WasmEngine {
        &self.engine
    }

    /// The provisioned stages, in chain order.
    pub fn stages(&self) -> &[Arc<WasmStage>] {
        &self.stages
    }

    /// The composed middleware chain.
    pub fn chain(&self) -> &Continuation {
        &self.chain
    }

    /// Per-request deadline.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Start the epoch ticker driving guest interruption deadlines.
    ///
    /// Returns `None` when epoch interruption is disabled. Abort the
    /// returned handle to stop the ticker.
    pub fn spawn_epoch_ticker(&self) -> Option<tokio::task::JoinHandle<()>> {
        if !self.engine.config().epoch_interruption {
            return None;
        }

        let engine = Arc::clone(&self.engine);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(EPOCH_TICK);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                engine.increment_epoch();
            }
        }))
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("stages", &self.stages.len())
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}
