//! WebAssembly module loading and compilation.
//!
//! [`CompiledModule`] wraps a Wasmtime [`Module`] together with the metadata
//! provisioning needs: where it came from, a content hash, and when it was
//! compiled. Loading goes through the engine's content-hash cache, so a
//! bytecode file referenced by several stages compiles once.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, instrument};
use wasmtime::Module;

use wasmpipe_common::ProvisionError;

use crate::engine::WasmEngine;

/// Magic bytes at the start of every WebAssembly binary.
const WASM_MAGIC: &[u8; 4] = b"\0asm";

/// A compiled WebAssembly module with provisioning metadata.
///
/// Thread-safe; the underlying Wasmtime module is shared freely across
/// instantiations.
#[derive(Clone)]
pub struct CompiledModule {
    module: Module,
    content_hash: String,
    source_path: String,
    compiled_at: Instant,
}

impl CompiledModule {
    /// Load and compile the module at `path`, consulting the engine's cache.
    ///
    /// The file is read exactly once. A cache hit returns the previously
    /// compiled module without touching Wasmtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not a WebAssembly
    /// binary, or fails compilation.
    #[instrument(skip(engine), fields(path = %path.as_ref().display()))]
    pub fn load(engine: &WasmEngine, path: impl AsRef<Path>) -> Result<Arc<Self>, ProvisionError> {
        let path = path.as_ref();

        let bytes = std::fs::read(path).map_err(|e| ProvisionError::Read {
            path: path.display().to_string(),
            source: e,
        })?;

        Self::validate_wasm_header(path, &bytes)?;

        let content_hash = compute_hash(&bytes);
        if let Some(cached) = engine.cached_module(&content_hash) {
            debug!(content_hash = %content_hash, "Module cache hit");
            return Ok(cached);
        }

        let start = Instant::now();
        let module = Module::new(engine.inner(), &bytes).map_err(|e| {
            ProvisionError::compile(format!("compilation of {} failed: {e}", path.display()))
        })?;

        info!(
            content_hash = %content_hash,
            duration_ms = start.elapsed().as_millis(),
            "Module compiled"
        );

        let compiled = Arc::new(Self {
            module,
            content_hash,
            source_path: path.display().to_string(),
            compiled_at: Instant::now(),
        });
        engine.cache_module(Arc::clone(&compiled));

        Ok(compiled)
    }

    /// Compile a module from WebAssembly text format. Bypasses the cache;
    /// intended for tests and tooling.
    ///
    /// # Errors
    ///
    /// Returns an error if the text cannot be parsed or compiled.
    pub fn from_wat(engine: &WasmEngine, wat: &str) -> Result<Arc<Self>, ProvisionError> {
        let module = Module::new(engine.inner(), wat)
            .map_err(|e| ProvisionError::compile(format!("WAT compilation failed: {e}")))?;

        Ok(Arc::new(Self {
            module,
            content_hash: compute_hash(wat.as_bytes()),
            source_path: "<wat>".to_string(),
            compiled_at: Instant::now(),
        }))
    }

    /// Reject files that are not WebAssembly binaries before handing them
    /// to the compiler, so the error names the actual problem.
    fn validate_wasm_header(path: &Path, bytes: &[u8]) -> Result<(), ProvisionError> {
        if bytes.len() < 8 || &bytes[0..4] != WASM_MAGIC {
            return Err(ProvisionError::compile(format!(
                "{} is not a WebAssembly binary (bad magic number)",
                path.display()
            )));
        }
        Ok(())
    }

    /// Get the inner Wasmtime module.
    pub fn inner(&self) -> &Module {
        &self.module
    }

    /// Content hash of the original bytecode.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Path the bytecode was loaded from.
    pub fn source_path(&self) -> &str {
        &self.source_path
    }

    /// How long ago this module was compiled.
    pub fn age(&self) -> std::time::Duration {
        self.compiled_at.elapsed()
    }
}

impl std::fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledModule")
            .field("content_hash", &self.content_hash)
            .field("source_path", &self.source_path)
            .finish_non_exhaustive()
    }
}

/// Compute a 16-hex-digit content hash of the given bytes.
fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasmpipe_common::EngineConfig;

    fn test_engine() -> WasmEngine {
        let config = EngineConfig {
            pooling_allocator: false,
            ..Default::default()
        };
        WasmEngine::new(&config).unwrap()
    }

    const EMPTY_MODULE: &str = "(module)";

    #[test]
    fn test_from_wat() {
        let engine = test_engine();
        let module = CompiledModule::from_wat(&engine, EMPTY_MODULE).unwrap();

        assert_eq!(module.source_path(), "<wat>");
        assert_eq!(module.content_hash().len(), 16);
    }

    #[test]
    fn test_load_rejects_non_wasm() {
        let engine = test_engine();
        let dir = std::env::temp_dir();
        let path = dir.join("wasmpipe-test-not-wasm.bin");
        std::fs::write(&path, b"definitely not wasm").unwrap();

        let err = CompiledModule::load(&engine, &path).unwrap_err();
        assert!(err.to_string().contains("magic"));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_load_missing_file() {
        let engine = test_engine();
        let err = CompiledModule::load(&engine, "/nonexistent/module.wasm").unwrap_err();

        assert!(matches!(err, ProvisionError::Read { .. }));
    }

    #[test]
    fn test_load_caches_by_content() {
        let engine = test_engine();
        // A bare magic-and-version header is the minimal valid module.
        let wasm = b"\0asm\x01\0\0\0";

        let dir = std::env::temp_dir();
        let a = dir.join("wasmpipe-test-cache-a.wasm");
        let b = dir.join("wasmpipe-test-cache-b.wasm");
        std::fs::write(&a, &wasm).unwrap();
        std::fs::write(&b, &wasm).unwrap();

        let first = CompiledModule::load(&engine, &a).unwrap();
        let second = CompiledModule::load(&engine, &b).unwrap();

        // Identical bytecode shares one compilation.
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(engine.cached_module_count(), 1);

        std::fs::remove_file(&a).ok();
        std::fs::remove_file(&b).ok();
    }
}
