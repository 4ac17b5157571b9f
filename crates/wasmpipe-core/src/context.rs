//! Per-invocation store state and WASI linking.
//!
//! Each guest invocation gets a fresh [`wasmtime::Store`] carrying an
//! [`InvocationContext`]. The store is where the execution limits bite:
//! fuel is charged against the configured budget and the epoch deadline is
//! armed from the invocation timeout.

use wasmtime::{Linker, Store};
use wasmtime_wasi::p1::{self, WasiP1Ctx};

use wasmpipe_common::{ExecutionConfig, PipelineError, ProvisionError};

use crate::capability::CapabilityProfile;
use crate::engine::WasmEngine;
use crate::module::CompiledModule;

/// State carried by every invocation store.
pub struct InvocationContext {
    /// WASI preview1 context backing the guest's system interface.
    pub wasi: WasiP1Ctx,
}

impl InvocationContext {
    pub fn new(wasi: WasiP1Ctx) -> Self {
        Self { wasi }
    }
}

/// Create a linker with the WASI preview1 host functions registered.
///
/// The linker is built once per stage at provisioning time and reused for
/// every instantiation. For a sockets-profile module the socket extension
/// imports are also satisfied: their signatures vary by guest toolchain,
/// so they are stubbed with traps of whatever shape the module declares.
/// A guest that imports them without touching them on a request path runs
/// normally; an actual call fails that request alone.
///
/// # Errors
///
/// Returns an error if the WASI host functions cannot be registered or the
/// module's extension imports cannot be stubbed.
pub fn new_linker(
    engine: &WasmEngine,
    module: &CompiledModule,
    profile: CapabilityProfile,
) -> Result<Linker<InvocationContext>, ProvisionError> {
    let mut linker = Linker::new(engine.inner());
    p1::add_to_linker_async(&mut linker, |cx: &mut InvocationContext| &mut cx.wasi)
        .map_err(|e| ProvisionError::engine(format!("failed to register WASI imports: {e}")))?;

    if profile.grants_network() {
        linker
            .define_unknown_imports_as_traps(module.inner())
            .map_err(|e| {
                ProvisionError::capability_bind(format!(
                    "failed to bind socket extension imports for {}: {e}",
                    module.source_path()
                ))
            })?;
    }

    Ok(linker)
}

/// Create a store for one invocation, with fuel and epoch limits armed.
///
/// When fuel metering is disabled the store still needs a fuel balance
/// (the engine always accounts fuel), so it gets an effectively unlimited
/// one.
///
/// # Errors
///
/// Returns an error if the fuel balance cannot be set.
pub fn new_store(
    engine: &WasmEngine,
    exec: &ExecutionConfig,
    ctx: InvocationContext,
) -> Result<Store<InvocationContext>, PipelineError> {
    let mut store = Store::new(engine.inner(), ctx);

    let fuel = if exec.fuel_metering {
        exec.max_fuel
    } else {
        u64::MAX
    };
    store
        .set_fuel(fuel)
        .map_err(|e| PipelineError::guest(format!("failed to set fuel budget: {e}")))?;

    if engine.config().epoch_interruption {
        // The epoch ticker advances once per millisecond, so the timeout in
        // milliseconds is the deadline in ticks.
        store.set_epoch_deadline(exec.timeout_ms);
    }

    Ok(store)
}
