//! Stdio JSON adapter for batch-style guests.
//!
//! The guest is a one-shot program: it reads the exchange envelope from
//! standard input, runs to completion, and writes the answering envelope
//! to standard output. Nothing survives between requests; every request
//! instantiates the module fresh. AssemblyScript and JavaScript toolchains
//! targeting WASI commands fit this shape.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use wasmtime::Linker;
use wasmtime_wasi::p2::pipe::{MemoryInputPipe, MemoryOutputPipe};
use wasmtime_wasi::WasiCtxBuilder;

use wasmpipe_common::{
    Continuation, ExecutionConfig, PipelineError, ProvisionError, ResponseBuffer, StageRequest,
};
use wasmpipe_core::{new_linker, CapabilityProfile, CompiledModule, InvocationContext, WasmEngine};

use crate::adapter::{
    encode_guest_config, log_guest_stderr, require_start_export, run_command, GuestHandler,
    InstanceFactory, Served, STDIO_PIPE_CAPACITY,
};
use crate::envelope::Envelope;

/// Environment variable carrying the stage's configuration blob.
pub(crate) const GUEST_CONFIG_ENV: &str = "GUEST_CONFIG";

/// Builder for stdio-protocol instance factories.
pub struct StdioAdapter;

impl StdioAdapter {
    /// Build the instance factory for a stdio-protocol stage.
    ///
    /// # Errors
    ///
    /// Returns an error if the module exports no `_start` function or the
    /// guest configuration cannot be serialized.
    pub fn make(
        engine: &WasmEngine,
        module: Arc<CompiledModule>,
        profile: CapabilityProfile,
        guest_config: Option<&toml::Value>,
        exec: &ExecutionConfig,
    ) -> Result<InstanceFactory, ProvisionError> {
        require_start_export(&module)?;

        let shared = Arc::new(StdioShared {
            engine: engine.clone(),
            linker: new_linker(engine, &module, profile)?,
            module,
            profile,
            config_json: encode_guest_config(guest_config)?,
            exec: exec.clone(),
        });

        Ok(Arc::new(move |_next: Continuation| {
            // Batch guests never invoke the continuation; the envelope they
            // return always terminates the response.
            Arc::new(StdioGuest {
                shared: Arc::clone(&shared),
            }) as Arc<dyn GuestHandler>
        }))
    }
}

struct StdioShared {
    engine: WasmEngine,
    linker: Linker<InvocationContext>,
    module: Arc<CompiledModule>,
    profile: CapabilityProfile,
    config_json: Option<String>,
    exec: ExecutionConfig,
}

struct StdioGuest {
    shared: Arc<StdioShared>,
}

#[async_trait]
impl GuestHandler for StdioGuest {
    async fn serve(
        &self,
        req: &StageRequest,
        rw: &mut ResponseBuffer,
    ) -> Result<Served, PipelineError> {
        let shared = &self.shared;
        let input = Envelope::from_stage_request(req).to_json()?;

        let stdout = MemoryOutputPipe::new(STDIO_PIPE_CAPACITY);
        let stderr = MemoryOutputPipe::new(STDIO_PIPE_CAPACITY);

        let mut builder = WasiCtxBuilder::new();
        builder.stdin(MemoryInputPipe::new(input));
        builder.stdout(stdout.clone());
        builder.stderr(stderr.clone());
        if let Some(config) = &shared.config_json {
            builder.env(GUEST_CONFIG_ENV, config);
        }
        shared.profile.apply(&mut builder);

        let result = run_command(
            &shared.engine,
            &shared.exec,
            &shared.linker,
            &shared.module,
            builder.build_p1(),
            req,
        )
        .await;

        log_guest_stderr(shared.module.source_path(), &stderr.contents());
        result?;

        let output = stdout.contents();
        debug!(
            module = %shared.module.source_path(),
            output_len = output.len(),
            "Stdio guest completed"
        );

        Envelope::decode(&output)?.apply(rw, false)
    }
}
