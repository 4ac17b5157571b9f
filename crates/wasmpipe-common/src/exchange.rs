//! Request exchange types shared across the pipeline.
//!
//! A [`StageRequest`] is the immutable view of the inbound HTTP request that
//! every stage sees. The body is buffered once at the edge, so any stage (or
//! the terminal handler) can read it without consuming it for the others.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;
use crate::writer::ResponseBuffer;

/// The inbound request as seen by pipeline stages.
#[derive(Clone)]
pub struct StageRequest {
    /// HTTP method.
    pub method: Method,
    /// Full request URI (path and query).
    pub uri: Uri,
    /// Request headers.
    pub headers: HeaderMap,
    /// Fully buffered request body.
    pub body: Bytes,
    /// Cancelled when the request deadline passes or the client goes away.
    pub cancel: CancellationToken,
}

impl StageRequest {
    /// Build a request with no headers or body, mainly for tests.
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// The URI path component.
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// The raw query string, if any.
    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }
}

impl fmt::Debug for StageRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageRequest")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("body_len", &self.body.len())
            .finish_non_exhaustive()
    }
}

/// A handler in the middleware chain.
///
/// Both wasm stages and the terminal handler implement this; a stage invokes
/// the rest of the chain through its [`Continuation`].
#[async_trait]
pub trait Handler: Send + Sync {
    /// Serve the request, writing any response into `rw`.
    async fn serve(&self, req: &StageRequest, rw: &mut ResponseBuffer) -> Result<(), PipelineError>;
}

/// The remainder of the chain, handed to each stage.
pub type Continuation = Arc<dyn Handler>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_request_accessors() {
        let req = StageRequest::new(Method::GET, "/items?page=2".parse().unwrap());

        assert_eq!(req.path(), "/items");
        assert_eq!(req.query(), Some("page=2"));
        assert!(req.body.is_empty());
    }

    #[test]
    fn test_debug_omits_body_contents() {
        let mut req = StageRequest::new(Method::POST, "/upload".parse().unwrap());
        req.body = Bytes::from_static(b"secret payload");

        let rendered = format!("{req:?}");
        assert!(rendered.contains("body_len"));
        assert!(!rendered.contains("secret"));
    }
}
