//! Native-export adapter for guests exporting request/response hooks.
//!
//! The guest exports `handle_request`, reads the exchange envelope from
//! standard input, and writes any replacement envelope to standard output.
//! In the rich form `handle_request` returns an `i64` whose low bit asks
//! the host to invoke the continuation and whose high 32 bits carry an
//! opaque guest context token; after the continuation runs, the host calls
//! `handle_response(ctx, is_error)` so the guest can observe or rewrite
//! the outcome. A `handle_request` returning nothing is the observe-only
//! form: the guest runs, and the stage forwards to the continuation unless
//! the guest wrote a response.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use wasmtime::{ExternType, Linker, Store, ValType};
use wasmtime_wasi::p2::pipe::{MemoryInputPipe, MemoryOutputPipe};
use wasmtime_wasi::WasiCtxBuilder;

use wasmpipe_common::{
    Continuation, ExecutionConfig, PipelineError, ProvisionError, ResponseBuffer, StageRequest,
};
use wasmpipe_core::{
    new_linker, new_store, CapabilityProfile, CompiledModule, InvocationContext, WasmEngine,
};

use crate::adapter::{
    encode_guest_config, log_guest_stderr, GuestHandler, InstanceFactory, Served,
    STDIO_PIPE_CAPACITY,
};
use crate::envelope::Envelope;
use crate::stdio::GUEST_CONFIG_ENV;

const HANDLE_REQUEST: &str = "handle_request";
const HANDLE_RESPONSE: &str = "handle_response";

/// How the module's `handle_request` export participates in the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HookMode {
    /// `handle_request() -> i64`: the guest decides whether the
    /// continuation runs and receives `handle_response` afterwards.
    Rich { has_response_hook: bool },
    /// `handle_request()`: the guest only observes; the stage forwards
    /// unless the guest wrote a response.
    Observe,
}

/// Builder for native-export instance factories.
pub struct NativeAdapter;

impl NativeAdapter {
    /// Build the instance factory for a native-export stage.
    ///
    /// # Errors
    ///
    /// Returns an error if the module's hook exports do not match either
    /// accepted `handle_request` signature, or the guest configuration
    /// cannot be serialized.
    pub fn make(
        engine: &WasmEngine,
        module: Arc<CompiledModule>,
        profile: CapabilityProfile,
        guest_config: Option<&toml::Value>,
        exec: &ExecutionConfig,
    ) -> Result<InstanceFactory, ProvisionError> {
        let mode = detect_hook_mode(&module)?;

        let shared = Arc::new(NativeShared {
            engine: engine.clone(),
            linker: new_linker(engine, &module, profile)?,
            module,
            profile,
            config_json: encode_guest_config(guest_config)?,
            exec: exec.clone(),
            mode,
        });

        Ok(Arc::new(move |next: Continuation| {
            Arc::new(NativeGuest {
                shared: Arc::clone(&shared),
                next,
            }) as Arc<dyn GuestHandler>
        }))
    }
}

/// Validate the hook exports and classify the module.
fn detect_hook_mode(module: &CompiledModule) -> Result<HookMode, ProvisionError> {
    let Some(ExternType::Func(request_ty)) = module.inner().get_export(HANDLE_REQUEST) else {
        return Err(ProvisionError::adapter(format!(
            "module {} does not export a {HANDLE_REQUEST} function",
            module.source_path()
        )));
    };

    if request_ty.params().len() != 0 {
        return Err(ProvisionError::adapter(format!(
            "{HANDLE_REQUEST} in {} must take no parameters",
            module.source_path()
        )));
    }

    let results: Vec<ValType> = request_ty.results().collect();
    match results.as_slice() {
        [] => Ok(HookMode::Observe),
        [ValType::I64] => {
            let has_response_hook = match module.inner().get_export(HANDLE_RESPONSE) {
                None => false,
                Some(ExternType::Func(response_ty)) => {
                    let params: Vec<ValType> = response_ty.params().collect();
                    let ok = matches!(params.as_slice(), [ValType::I32, ValType::I32])
                        && response_ty.results().len() == 0;
                    if !ok {
                        return Err(ProvisionError::adapter(format!(
                            "{HANDLE_RESPONSE} in {} must have signature (i32, i32) -> ()",
                            module.source_path()
                        )));
                    }
                    true
                }
                Some(_) => {
                    return Err(ProvisionError::adapter(format!(
                        "{HANDLE_RESPONSE} in {} is not a function",
                        module.source_path()
                    )));
                }
            };
            Ok(HookMode::Rich { has_response_hook })
        }
        _ => Err(ProvisionError::adapter(format!(
            "{HANDLE_REQUEST} in {} must return nothing or a single i64",
            module.source_path()
        ))),
    }
}

struct NativeShared {
    engine: WasmEngine,
    linker: Linker<InvocationContext>,
    module: Arc<CompiledModule>,
    profile: CapabilityProfile,
    config_json: Option<String>,
    exec: ExecutionConfig,
    mode: HookMode,
}

struct NativeGuest {
    shared: Arc<NativeShared>,
    next: Continuation,
}

#[async_trait]
impl GuestHandler for NativeGuest {
    async fn serve(
        &self,
        req: &StageRequest,
        rw: &mut ResponseBuffer,
    ) -> Result<Served, PipelineError> {
        if req.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

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

        let mut store = new_store(
            &shared.engine,
            &shared.exec,
            InvocationContext::new(builder.build_p1()),
        )?;

        let result = tokio::select! {
            () = req.cancel.cancelled() => Err(PipelineError::Cancelled),
            result = self.drive(req, rw, &mut store) => result,
        };

        log_guest_stderr(shared.module.source_path(), &stderr.contents());
        let invoked_continuation = result?;

        let output = stdout.contents();
        if output.is_empty() {
            // No replacement envelope; the response is whatever the
            // continuation (if any) produced.
            return Ok(Served {
                body_written: invoked_continuation,
            });
        }

        debug!(
            module = %shared.module.source_path(),
            output_len = output.len(),
            "Native guest wrote a response envelope"
        );
        Envelope::decode(&output)?.apply(rw, invoked_continuation)
    }
}

impl NativeGuest {
    /// Instantiate the guest and run its hooks. Returns whether the
    /// continuation was invoked.
    async fn drive(
        &self,
        req: &StageRequest,
        rw: &mut ResponseBuffer,
        store: &mut Store<InvocationContext>,
    ) -> Result<bool, PipelineError> {
        let shared = &self.shared;

        let instance = shared
            .linker
            .instantiate_async(&mut *store, shared.module.inner())
            .await
            .map_err(|e| PipelineError::guest(format!("instantiation failed: {e}")))?;

        match shared.mode {
            HookMode::Observe => {
                let hook = instance
                    .get_typed_func::<(), ()>(&mut *store, HANDLE_REQUEST)
                    .map_err(|e| PipelineError::guest(format!("missing {HANDLE_REQUEST}: {e}")))?;
                map_hook_error(hook.call_async(&mut *store, ()).await)?;
                Ok(false)
            }
            HookMode::Rich { has_response_hook } => {
                let hook = instance
                    .get_typed_func::<(), i64>(&mut *store, HANDLE_REQUEST)
                    .map_err(|e| PipelineError::guest(format!("missing {HANDLE_REQUEST}: {e}")))?;

                // ctx_next packs the guest context token into the high 32
                // bits; the low bit asks for the continuation.
                let ctx_next = match hook.call_async(&mut *store, ()).await {
                    Ok(value) => value,
                    Err(e) => {
                        map_hook_error::<i64>(Err(e))?;
                        // Clean exit before returning a value: nothing to
                        // continue with.
                        return Ok(false);
                    }
                };

                if ctx_next & 1 == 0 {
                    return Ok(false);
                }

                #[allow(clippy::cast_possible_truncation)]
                let guest_ctx = (ctx_next >> 32) as i32;
                let next_result = self.next.serve(req, rw).await;

                if has_response_hook {
                    let response_hook = instance
                        .get_typed_func::<(i32, i32), ()>(&mut *store, HANDLE_RESPONSE)
                        .map_err(|e| {
                            PipelineError::guest(format!("missing {HANDLE_RESPONSE}: {e}"))
                        })?;
                    let is_error = i32::from(next_result.is_err());
                    map_hook_error(
                        response_hook
                            .call_async(&mut *store, (guest_ctx, is_error))
                            .await,
                    )?;
                }

                next_result?;
                Ok(true)
            }
        }
    }
}

/// Treat a clean `proc_exit(0)` as success; everything else is a guest
/// failure.
fn map_hook_error<T>(result: Result<T, wasmtime::Error>) -> Result<(), PipelineError> {
    match result {
        Ok(_) => Ok(()),
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
