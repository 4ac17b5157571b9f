//! CGI-style adapter for scripting-runtime guests.
//!
//! The module is an interpreter (a PHP runtime compiled to wasm, say) that
//! serves one request per execution in the classic CGI shape: the request
//! is described through environment variables, the body arrives on
//! standard input, and standard output carries CGI headers, a blank line,
//! then the response envelope. The configured document root is preopened
//! read-only at the guest's filesystem root.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use wasmtime::Linker;
use wasmtime_wasi::p2::pipe::{MemoryInputPipe, MemoryOutputPipe};
use wasmtime_wasi::{DirPerms, FilePerms, WasiCtxBuilder};

use wasmpipe_common::{
    Continuation, ExecutionConfig, PipelineError, ProvisionError, ResponseBuffer, StageRequest,
};
use wasmpipe_core::{new_linker, CapabilityProfile, CompiledModule, InvocationContext, WasmEngine};

use crate::adapter::{
    log_guest_stderr, require_start_export, run_command, GuestHandler, InstanceFactory, Served,
    STDIO_PIPE_CAPACITY,
};
use crate::envelope::Envelope;

/// Script served when the request path is the root.
const DEFAULT_SCRIPT: &str = "index.php";

/// Boundary between CGI headers and the response body.
const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Builder for CGI-protocol instance factories.
pub struct CgiAdapter;

impl CgiAdapter {
    /// Build the instance factory for a CGI-protocol stage.
    ///
    /// The stage's guest configuration may carry a `document_root` key;
    /// it defaults to the current directory and must exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the module exports no `_start` function or the
    /// document root is not a directory.
    pub fn make(
        engine: &WasmEngine,
        module: Arc<CompiledModule>,
        profile: CapabilityProfile,
        guest_config: Option<&toml::Value>,
        exec: &ExecutionConfig,
    ) -> Result<InstanceFactory, ProvisionError> {
        require_start_export(&module)?;

        let document_root = guest_config
            .and_then(|config| config.get("document_root"))
            .and_then(toml::Value::as_str)
            .unwrap_or(".")
            .to_string();

        if !std::path::Path::new(&document_root).is_dir() {
            return Err(ProvisionError::adapter(format!(
                "document root {document_root} is not a directory"
            )));
        }

        let shared = Arc::new(CgiShared {
            engine: engine.clone(),
            linker: new_linker(engine, &module, profile)?,
            module,
            profile,
            document_root,
            exec: exec.clone(),
        });

        Ok(Arc::new(move |_next: Continuation| {
            // CGI guests terminate the response themselves; the
            // continuation is never invoked.
            Arc::new(CgiGuest {
                shared: Arc::clone(&shared),
            }) as Arc<dyn GuestHandler>
        }))
    }
}

struct CgiShared {
    engine: WasmEngine,
    linker: Linker<InvocationContext>,
    module: Arc<CompiledModule>,
    profile: CapabilityProfile,
    document_root: String,
    exec: ExecutionConfig,
}

struct CgiGuest {
    shared: Arc<CgiShared>,
}

#[async_trait]
impl GuestHandler for CgiGuest {
    async fn serve(
        &self,
        req: &StageRequest,
        rw: &mut ResponseBuffer,
    ) -> Result<Served, PipelineError> {
        let shared = &self.shared;

        let script = script_name(req.path());
        let script_filename = format!("/{script}");

        let stdout = MemoryOutputPipe::new(STDIO_PIPE_CAPACITY);
        let stderr = MemoryOutputPipe::new(STDIO_PIPE_CAPACITY);

        let mut builder = WasiCtxBuilder::new();
        builder.stdin(MemoryInputPipe::new(req.body.clone()));
        builder.stdout(stdout.clone());
        builder.stderr(stderr.clone());
        builder.args(&["php-cgi".to_string(), script_filename.clone()]);
        builder
            .preopened_dir(&shared.document_root, "/", DirPerms::READ, FilePerms::READ)
            .map_err(|e| {
                PipelineError::guest(format!(
                    "failed to preopen document root {}: {e}",
                    shared.document_root
                ))
            })?;

        for (key, value) in cgi_environment(req, &script_filename) {
            builder.env(&key, &value);
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
        let Some(boundary) = output
            .windows(HEADER_TERMINATOR.len())
            .position(|window| window == HEADER_TERMINATOR)
        else {
            return Err(PipelineError::guest(
                "CGI output has no header terminator".to_string(),
            ));
        };

        debug!(
            module = %shared.module.source_path(),
            script = %script,
            header_len = boundary,
            "CGI guest completed"
        );

        let body = &output[boundary + HEADER_TERMINATOR.len()..];
        Envelope::decode(body)?.apply(rw, false)
    }
}

/// Resolve the script to execute from the request path.
fn script_name(path: &str) -> &str {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        DEFAULT_SCRIPT
    } else {
        trimmed
    }
}

/// Build the CGI environment variable set for a request.
fn cgi_environment(req: &StageRequest, script_filename: &str) -> Vec<(String, String)> {
    let (server_name, server_port) = server_name_port(req);

    let mut env = vec![
        ("REQUEST_METHOD".to_string(), req.method.to_string()),
        ("REQUEST_URI".to_string(), req.uri.to_string()),
        ("SCRIPT_FILENAME".to_string(), script_filename.to_string()),
        ("SCRIPT_NAME".to_string(), script_filename.to_string()),
        ("DOCUMENT_ROOT".to_string(), "/".to_string()),
        (
            "QUERY_STRING".to_string(),
            req.query().unwrap_or("").to_string(),
        ),
        ("GATEWAY_INTERFACE".to_string(), "CGI/1.1".to_string()),
        ("SERVER_PROTOCOL".to_string(), "HTTP/1.1".to_string()),
        ("SERVER_SOFTWARE".to_string(), "wasmpipe".to_string()),
        ("SERVER_NAME".to_string(), server_name),
        ("SERVER_PORT".to_string(), server_port),
    ];

    if let Some(content_type) = req.headers.get(http::header::CONTENT_TYPE) {
        env.push((
            "CONTENT_TYPE".to_string(),
            String::from_utf8_lossy(content_type.as_bytes()).into_owned(),
        ));
    }
    if !req.body.is_empty() {
        env.push(("CONTENT_LENGTH".to_string(), req.body.len().to_string()));
    }

    for name in req.headers.keys() {
        let values: Vec<String> = req
            .headers
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect();
        let cgi_name = format!(
            "HTTP_{}",
            name.as_str().to_ascii_uppercase().replace('-', "_")
        );
        env.push((cgi_name, values.join(", ")));
    }

    env
}

/// Derive SERVER_NAME and SERVER_PORT from the Host header.
fn server_name_port(req: &StageRequest) -> (String, String) {
    let host = req
        .headers
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");

    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
            (name.to_string(), port.to_string())
        }
        _ => (host.to_string(), "80".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::HeaderValue;
    use http::Method;

    #[test]
    fn test_script_name_defaults_to_index() {
        assert_eq!(script_name("/"), "index.php");
        assert_eq!(script_name(""), "index.php");
        assert_eq!(script_name("/admin/list.php"), "admin/list.php");
    }

    #[test]
    fn test_cgi_environment_basics() {
        let mut req = StageRequest::new(Method::POST, "/submit?draft=1".parse().unwrap());
        req.body = bytes::Bytes::from_static(b"a=b");
        req.headers
            .insert("content-type", HeaderValue::from_static("text/plain"));
        req.headers
            .insert("x-request-id", HeaderValue::from_static("abc"));
        req.headers
            .insert("host", HeaderValue::from_static("example.com:8443"));

        let env = cgi_environment(&req, "/submit");
        let get = |key: &str| {
            env.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
                .unwrap_or_default()
        };

        assert_eq!(get("REQUEST_METHOD"), "POST");
        assert_eq!(get("QUERY_STRING"), "draft=1");
        assert_eq!(get("SCRIPT_FILENAME"), "/submit");
        assert_eq!(get("CONTENT_TYPE"), "text/plain");
        assert_eq!(get("CONTENT_LENGTH"), "3");
        assert_eq!(get("HTTP_X_REQUEST_ID"), "abc");
        assert_eq!(get("SERVER_NAME"), "example.com");
        assert_eq!(get("SERVER_PORT"), "8443");
        assert_eq!(get("GATEWAY_INTERFACE"), "CGI/1.1");
    }

    #[test]
    fn test_server_defaults_without_host_header() {
        let req = StageRequest::new(Method::GET, "/".parse().unwrap());
        let (name, port) = server_name_port(&req);

        assert_eq!(name, "localhost");
        assert_eq!(port, "80");
    }
}
