//! Host capability binding derived from module imports.
//!
//! Before an adapter is built, the module's import list is inspected to
//! decide which host surface it needs: plain WASI, or WASI plus the socket
//! extension functions some toolchains emit. Detection happens once at
//! provisioning; a module importing a socket name as a non-function is
//! rejected outright instead of failing at first instantiation.

use wasmtime::ExternType;

use wasmpipe_common::ProvisionError;

use crate::module::CompiledModule;

/// Socket extension imports under `wasi_snapshot_preview1`.
const SOCKET_EXTENSION_IMPORTS: &[&str] = &[
    "sock_open",
    "sock_bind",
    "sock_connect",
    "sock_listen",
    "sock_getsockopt",
    "sock_setsockopt",
    "sock_getlocaladdr",
    "sock_getpeeraddr",
    "sock_getaddrinfo",
];

const WASI_MODULE: &str = "wasi_snapshot_preview1";

/// The host capability surface a module gets bound against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityProfile {
    /// Standard WASI preview1 imports only.
    Wasi,
    /// WASI preview1 plus the socket extension: the guest is granted
    /// host network access and name lookup.
    WasiSockets,
}

impl CapabilityProfile {
    /// Inspect a compiled module's imports and choose its profile.
    ///
    /// # Errors
    ///
    /// Returns an error if a socket extension name is imported as anything
    /// other than a function.
    pub fn detect(module: &CompiledModule) -> Result<Self, ProvisionError> {
        let mut sockets = false;

        for import in module.inner().imports() {
            if import.module() != WASI_MODULE {
                continue;
            }
            if !SOCKET_EXTENSION_IMPORTS.contains(&import.name()) {
                continue;
            }
            if !matches!(import.ty(), ExternType::Func(_)) {
                return Err(ProvisionError::capability_bind(format!(
                    "module {} imports {} as a non-function",
                    module.source_path(),
                    import.name(),
                )));
            }
            sockets = true;
        }

        Ok(if sockets {
            Self::WasiSockets
        } else {
            Self::Wasi
        })
    }

    /// Whether this profile grants host network access.
    pub fn grants_network(self) -> bool {
        matches!(self, Self::WasiSockets)
    }

    /// Apply the profile's grants to a WASI context under construction.
    pub fn apply(self, builder: &mut wasmtime_wasi::WasiCtxBuilder) {
        if self.grants_network() {
            builder.inherit_network();
            builder.allow_ip_name_lookup(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::WasmEngine;
    use wasmpipe_common::EngineConfig;

    fn test_engine() -> WasmEngine {
        let config = EngineConfig {
            pooling_allocator: false,
            ..Default::default()
        };
        WasmEngine::new(&config).unwrap()
    }

    #[test]
    fn test_plain_module_gets_wasi_profile() {
        let engine = test_engine();
        let module = CompiledModule::from_wat(&engine, "(module)").unwrap();

        let profile = CapabilityProfile::detect(&module).unwrap();
        assert_eq!(profile, CapabilityProfile::Wasi);
        assert!(!profile.grants_network());
    }

    #[test]
    fn test_socket_import_gets_sockets_profile() {
        let engine = test_engine();
        let wat = r#"
            (module
                (import "wasi_snapshot_preview1" "sock_open"
                    (func (param i32 i32 i32) (result i32))))
        "#;
        let module = CompiledModule::from_wat(&engine, wat).unwrap();

        let profile = CapabilityProfile::detect(&module).unwrap();
        assert_eq!(profile, CapabilityProfile::WasiSockets);
        assert!(profile.grants_network());
    }

    #[test]
    fn test_socket_name_as_global_is_rejected() {
        let engine = test_engine();
        let wat = r#"
            (module
                (import "wasi_snapshot_preview1" "sock_bind" (global i32)))
        "#;
        let module = CompiledModule::from_wat(&engine, wat).unwrap();

        let err = CapabilityProfile::detect(&module).unwrap_err();
        assert!(err.to_string().contains("sock_bind"));
    }

    #[test]
    fn test_socket_name_in_other_namespace_is_ignored() {
        let engine = test_engine();
        let wat = r#"
            (module
                (import "env" "sock_open" (func (param i32) (result i32))))
        "#;
        let module = CompiledModule::from_wat(&engine, wat).unwrap();

        let profile = CapabilityProfile::detect(&module).unwrap();
        assert_eq!(profile, CapabilityProfile::Wasi);
    }
}
