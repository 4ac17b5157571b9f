//! Adapter selection and the instance-factory contract.
//!
//! An ABI adapter turns a compiled module into an [`InstanceFactory`]: a
//! function that, given the continuation for the rest of the chain, yields
//! a ready-to-serve handler bound to that continuation. Factories are what
//! instance pools hold; the adapter variant is chosen once at provisioning
//! by the stage's builder discriminator and never switched on again during
//! serving.
//!
//! Every adapter shares one per-request state machine: instantiate, execute,
//! decode, then commit or error. No guest memory survives across requests;
//! pooling bounds concurrency rather than amortizing instantiation.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;
use wasmtime::{Linker, Store};
use wasmtime_wasi::p1::WasiP1Ctx;

use wasmpipe_common::{
    BuilderKind, ExecutionConfig, PipelineError, ProvisionError, ResponseBuffer, StageRequest,
};
use wasmpipe_core::{new_store, CapabilityProfile, CompiledModule, InvocationContext, WasmEngine};

use crate::cgi::CgiAdapter;
use crate::native::NativeAdapter;
use crate::stdio::StdioAdapter;

/// Capacity of the in-memory stdout/stderr capture pipes.
pub(crate) const STDIO_PIPE_CAPACITY: usize = 4 * 1024 * 1024;

/// What a guest handler did with the response.
#[derive(Debug, Clone, Copy)]
pub struct Served {
    /// Whether the response was terminated by the guest (or by a
    /// continuation the guest invoked). When false the stage forwards to
    /// the continuation itself, so the guest acted as pure middleware.
    pub body_written: bool,
}

/// A handler produced by an instance factory, bound to its continuation.
#[async_trait]
pub trait GuestHandler: Send + Sync {
    /// Execute the guest against one request.
    async fn serve(
        &self,
        req: &StageRequest,
        rw: &mut ResponseBuffer,
    ) -> Result<Served, PipelineError>;
}

/// Factory yielding a handler bound to a continuation.
///
/// This is the concrete type stages downcast pooled values to; storing
/// anything else in a stage's pool is an adapter contract violation.
pub type InstanceFactory =
    Arc<dyn Fn(wasmpipe_common::Continuation) -> Arc<dyn GuestHandler> + Send + Sync>;

/// Type-erased pool entry.
pub type PooledInstance = Box<dyn Any + Send + Sync>;

/// Wrap an instance factory for pool storage.
pub fn pooled(factory: &InstanceFactory) -> PooledInstance {
    Box::new(Arc::clone(factory))
}

/// Build the instance factory for a stage.
///
/// The module's exports are validated here, so a module that cannot
/// satisfy its adapter's contract fails provisioning instead of its first
/// request.
///
/// # Errors
///
/// Returns an error if the guest configuration cannot be serialized or
/// the module does not export what the chosen adapter requires.
pub fn make_factory(
    kind: BuilderKind,
    engine: &WasmEngine,
    module: Arc<CompiledModule>,
    profile: CapabilityProfile,
    guest_config: Option<&toml::Value>,
    exec: &ExecutionConfig,
) -> Result<InstanceFactory, ProvisionError> {
    match kind {
        BuilderKind::Native => NativeAdapter::make(engine, module, profile, guest_config, exec),
        BuilderKind::StdioJson => StdioAdapter::make(engine, module, profile, guest_config, exec),
        BuilderKind::CgiEnv => CgiAdapter::make(engine, module, profile, guest_config, exec),
    }
}

/// Serialize the stage's guest configuration once, at provisioning time.
///
/// The blob is handed to every instantiation unchanged.
pub(crate) fn encode_guest_config(
    guest_config: Option<&toml::Value>,
) -> Result<Option<String>, ProvisionError> {
    guest_config
        .map(|value| {
            serde_json::to_string(value).map_err(|e| {
                ProvisionError::adapter(format!("guest configuration is not serializable: {e}"))
            })
        })
        .transpose()
}

/// Require that the module exports a start function, the contract for
/// batch-style (stdio and CGI) guests.
pub(crate) fn require_start_export(module: &CompiledModule) -> Result<(), ProvisionError> {
    let has_start = module
        .inner()
        .get_export("_start")
        .is_some_and(|ty| matches!(ty, wasmtime::ExternType::Func(_)));
    if has_start {
        Ok(())
    } else {
        Err(ProvisionError::adapter(format!(
            "module {} does not export a _start function",
            module.source_path()
        )))
    }
}

/// Instantiate the module and drive its start function to completion.
///
/// A clean `proc_exit(0)` counts as success; any other exit code or trap
/// is a guest execution failure. Cancellation aborts the run, including
/// mid-instantiation.
pub(crate) async fn run_command(
    engine: &WasmEngine,
    exec: &ExecutionConfig,
    linker: &Linker<InvocationContext>,
    module: &CompiledModule,
    wasi: WasiP1Ctx,
    req: &StageRequest,
) -> Result<(), PipelineError> {
    if req.cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }

    let mut store = new_store(engine, exec, InvocationContext::new(wasi))?;

    tokio::select! {
        () = req.cancel.cancelled() => Err(PipelineError::Cancelled),
        result = drive_start(linker, module, &mut store) => result,
    }
}

async fn drive_start(
    linker: &Linker<InvocationContext>,
    module: &CompiledModule,
    store: &mut Store<InvocationContext>,
) -> Result<(), PipelineError> {
    let instance = linker
        .instantiate_async(&mut *store, module.inner())
        .await
        .map_err(|e| PipelineError::guest(format!("instantiation failed: {e}")))?;

    let start = instance
        .get_typed_func::<(), ()>(&mut *store, "_start")
        .map_err(|e| PipelineError::guest(format!("missing _start function: {e}")))?;

    match start.call_async(&mut *store, ()).await {
        Ok(()) => Ok(()),
        Err(e) => match e.downcast_ref::<wasmtime_wasi::I32Exit>() {
            Some(exit) if exit.0 == 0 => Ok(()),
            Some(exit) => Err(PipelineError::guest(format!(
                "module closed with exit_code {}",
                exit.0
            ))),
            None => Err(PipelineError::guest(format!("guest trapped: {e}"))),
        },
    }
}

/// Log captured stderr, which is guest diagnostics rather than response
/// content.
pub(crate) fn log_guest_stderr(stage_module: &str, stderr: &[u8]) {
    if !stderr.is_empty() {
        warn!(
            module = %stage_module,
            stderr = %String::from_utf8_lossy(stderr),
            "Guest wrote to stderr"
        );
    }
}
