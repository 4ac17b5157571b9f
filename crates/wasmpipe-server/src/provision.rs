//! Pipeline provisioning: configuration to a ready-to-serve chain.
//!
//! Provisioning is all-or-nothing: any compile, capability, or adapter
//! failure aborts startup rather than serving a partial pipeline.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::StatusCode;
use tracing::info;

use wasmpipe_common::{
    ConfigFile, Handler, PipelineError, ProvisionError, ResponseBuffer, StageRequest,
};
use wasmpipe_core::{CapabilityProfile, CompiledModule, WasmEngine};
use wasmpipe_pipeline::{build_chain, WasmStage};

use crate::state::AppState;

/// Build the full application state from a configuration file.
///
/// Each stage's module is compiled (or fetched from the content cache),
/// its capability profile detected, and its adapter validated before any
/// traffic is accepted.
///
/// # Errors
///
/// Returns the first provisioning failure encountered.
pub fn provision(config: &ConfigFile) -> Result<AppState, ProvisionError> {
    let engine = Arc::new(WasmEngine::new(&config.engine)?);
    let specs = config.stage_specs()?;

    let mut stages = Vec::with_capacity(specs.len());
    for (index, spec) in specs.iter().enumerate() {
        let module = CompiledModule::load(&engine, &spec.path)?;
        let profile = CapabilityProfile::detect(&module)?;
        let factory = wasmpipe_abi::make_factory(
            spec.builder,
            &engine,
            Arc::clone(&module),
            profile,
            spec.guest_config.as_ref(),
            &config.execution,
        )?;

        let name = stage_name(index, &spec.path);
        info!(
            stage = %name,
            builder = ?spec.builder,
            capability = ?profile,
            content_hash = %module.content_hash(),
            "Stage provisioned"
        );

        let stage = Arc::new(WasmStage::new(name, factory, spec.pool.clone()));
        stage.spawn_evictor();
        stages.push(stage);
    }

    let chain = build_chain(&stages, Arc::new(NotFoundTerminal));
    let timeout = Duration::from_secs(config.server.request_timeout_secs);

    Ok(AppState::new(engine, stages, chain, timeout))
}

/// Derive a readable stage name from its position and module path.
fn stage_name(index: usize, path: &str) -> String {
    let stem = Path::new(path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(path);
    format!("{index}:{stem}")
}

/// Terminal handler when no stage terminates the response.
pub struct NotFoundTerminal;

#[async_trait]
impl Handler for NotFoundTerminal {
    async fn serve(
        &self,
        _req: &StageRequest,
        rw: &mut ResponseBuffer,
    ) -> Result<(), PipelineError> {
        rw.write_header(StatusCode::NOT_FOUND);
        Ok(())
    }
}
