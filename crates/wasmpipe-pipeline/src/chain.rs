//! Middleware chain composition.
//!
//! `build_chain([s0, s1, ..], terminal)` folds the stage list into a
//! single handler: each link serves its stage with the composed remainder
//! as the continuation, and the empty list is the terminal handler
//! itself. Whether a continuation runs at all, before, or after a stage's
//! own work is the stage's (and its guest's) decision.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::error;

use wasmpipe_common::{Continuation, Handler, PipelineError, ResponseBuffer, StageRequest};

use crate::stage::WasmStage;

/// Compose an ordered stage list and a terminal handler into one handler.
pub fn build_chain(stages: &[Arc<WasmStage>], terminal: Continuation) -> Continuation {
    match stages.split_first() {
        None => terminal,
        Some((head, rest)) => Arc::new(ChainLink {
            stage: Arc::clone(head),
            next: build_chain(rest, terminal),
        }),
    }
}

/// One composed link: a stage plus the rest of the chain.
struct ChainLink {
    stage: Arc<WasmStage>,
    next: Continuation,
}

#[async_trait]
impl Handler for ChainLink {
    async fn serve(&self, req: &StageRequest, rw: &mut ResponseBuffer) -> Result<(), PipelineError> {
        self.stage
            .serve(req, rw, Arc::clone(&self.next))
            .await
            .inspect_err(|e| {
                error!(stage = %self.stage.name(), error = %e, "Stage failed");
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Method, StatusCode};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wasmpipe_common::CaptureSink;

    struct CountingTerminal {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Handler for CountingTerminal {
        async fn serve(
            &self,
            _req: &StageRequest,
            rw: &mut ResponseBuffer,
        ) -> Result<(), PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            rw.write_header(StatusCode::NOT_FOUND);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_empty_chain_is_terminal() {
        let terminal = Arc::new(CountingTerminal {
            calls: AtomicUsize::new(0),
        });
        let chain = build_chain(&[], terminal.clone());

        let req = StageRequest::new(Method::GET, "/".parse().unwrap());
        let (sink, handle) = CaptureSink::new();
        let mut rw = ResponseBuffer::new(Box::new(sink));

        chain.serve(&req, &mut rw).await.unwrap();
        rw.flush();

        assert_eq!(terminal.calls.load(Ordering::SeqCst), 1);
        assert_eq!(handle.take().unwrap().status, StatusCode::NOT_FOUND);
    }
}
