//! Buffered response writer shared by all stages.
//!
//! Every stage in a chain writes into the same [`ResponseBuffer`]; nothing
//! reaches the client until the edge flushes it. A later write replaces an
//! earlier body wholesale, so the stage closest to the edge in write order
//! wins, and a flush commits the response to the underlying sink exactly
//! once no matter how many times it is called.

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};

/// Notice some guest runtimes print when the module exits cleanly. It is
/// runtime chatter, not response content, and is filtered out of the body.
const GUEST_EXIT_NOTICE: &[u8] = b"module closed with exit_code";

/// Destination a [`ResponseBuffer`] commits to on flush.
pub trait ResponseSink: Send {
    /// Receive the final response exactly once.
    fn write_response(&mut self, status: StatusCode, headers: HeaderMap, body: Bytes);
}

/// Buffered, last-writer-wins response under construction.
pub struct ResponseBuffer {
    status: StatusCode,
    status_explicit: bool,
    headers: HeaderMap,
    body: Vec<u8>,
    flushed: bool,
    sink: Box<dyn ResponseSink>,
}

impl ResponseBuffer {
    /// Create a buffer committing to `sink`. The status starts at 200 and
    /// counts as implicit until [`write_header`](Self::write_header) is
    /// called.
    pub fn new(sink: Box<dyn ResponseSink>) -> Self {
        Self {
            status: StatusCode::OK,
            status_explicit: false,
            headers: HeaderMap::new(),
            body: Vec::new(),
            flushed: false,
            sink,
        }
    }

    /// Replace the buffered body with `buf`.
    ///
    /// Guest-exit notices are dropped rather than buffered, so a clean guest
    /// exit does not overwrite a response written earlier in the chain.
    pub fn write(&mut self, buf: &[u8]) {
        if buf.starts_with(GUEST_EXIT_NOTICE) {
            return;
        }
        self.body.clear();
        self.body.extend_from_slice(buf);
    }

    /// Record the response status. The last caller before the flush wins.
    pub fn write_header(&mut self, status: StatusCode) {
        self.status = status;
        self.status_explicit = true;
    }

    /// Whether any stage set a status explicitly.
    pub fn has_explicit_status(&self) -> bool {
        self.status_explicit
    }

    /// The currently recorded status.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The buffered body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Response headers, for additive merging across stages.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Append a header value, keeping values set by earlier stages.
    pub fn append_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.append(name, value);
    }

    /// Whether the buffer has been committed.
    pub fn flushed(&self) -> bool {
        self.flushed
    }

    /// Commit the buffered response to the sink. Idempotent; only the first
    /// call reaches the sink.
    pub fn flush(&mut self) {
        if self.flushed {
            return;
        }
        self.flushed = true;
        self.sink.write_response(
            self.status,
            std::mem::take(&mut self.headers),
            Bytes::from(std::mem::take(&mut self.body)),
        );
    }
}

impl std::fmt::Debug for ResponseBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseBuffer")
            .field("status", &self.status)
            .field("body_len", &self.body.len())
            .field("flushed", &self.flushed)
            .finish_non_exhaustive()
    }
}

/// Sink that captures the committed response for later retrieval.
///
/// The serving edge flushes into one of these, then converts the captured
/// parts into the outbound HTTP response.
pub struct CaptureSink {
    slot: std::sync::Arc<parking_lot::Mutex<Option<CapturedResponse>>>,
}

/// Response parts captured by a [`CaptureSink`].
#[derive(Debug, Clone)]
pub struct CapturedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl CaptureSink {
    /// Create a sink and the handle its response will appear on.
    pub fn new() -> (Self, CaptureHandle) {
        let slot = std::sync::Arc::new(parking_lot::Mutex::new(None));
        (Self { slot: slot.clone() }, CaptureHandle { slot })
    }
}

impl ResponseSink for CaptureSink {
    fn write_response(&mut self, status: StatusCode, headers: HeaderMap, body: Bytes) {
        *self.slot.lock() = Some(CapturedResponse {
            status,
            headers,
            body,
        });
    }
}

/// Read side of a [`CaptureSink`].
pub struct CaptureHandle {
    slot: std::sync::Arc<parking_lot::Mutex<Option<CapturedResponse>>>,
}

impl CaptureHandle {
    /// Take the captured response, if the buffer has flushed.
    pub fn take(&self) -> Option<CapturedResponse> {
        self.slot.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer() -> (ResponseBuffer, CaptureHandle) {
        let (sink, handle) = CaptureSink::new();
        (ResponseBuffer::new(Box::new(sink)), handle)
    }

    #[test]
    fn test_last_writer_wins() {
        let (mut rw, handle) = buffer();

        rw.write(b"first stage");
        rw.write(b"second stage");
        rw.flush();

        let captured = handle.take().unwrap();
        assert_eq!(&captured.body[..], b"second stage");
        assert_eq!(captured.status, StatusCode::OK);
    }

    #[test]
    fn test_flush_is_idempotent() {
        let (mut rw, handle) = buffer();

        rw.write(b"once");
        rw.flush();
        rw.write(b"twice");
        rw.flush();

        let captured = handle.take().unwrap();
        assert_eq!(&captured.body[..], b"once");
        assert!(handle.take().is_none());
    }

    #[test]
    fn test_guest_exit_notice_is_filtered() {
        let (mut rw, handle) = buffer();

        rw.write(b"real body");
        rw.write(b"module closed with exit_code 0");
        rw.flush();

        let captured = handle.take().unwrap();
        assert_eq!(&captured.body[..], b"real body");
    }

    #[test]
    fn test_status_starts_implicit() {
        let (mut rw, _handle) = buffer();

        assert!(!rw.has_explicit_status());
        rw.write_header(StatusCode::IM_A_TEAPOT);
        assert!(rw.has_explicit_status());
        assert_eq!(rw.status(), StatusCode::IM_A_TEAPOT);
    }

    #[test]
    fn test_headers_merge_additively() {
        let (mut rw, handle) = buffer();

        rw.append_header(
            HeaderName::from_static("x-stage"),
            HeaderValue::from_static("auth"),
        );
        rw.append_header(
            HeaderName::from_static("x-stage"),
            HeaderValue::from_static("rewrite"),
        );
        rw.flush();

        let captured = handle.take().unwrap();
        let values: Vec<_> = captured.headers.get_all("x-stage").iter().collect();
        assert_eq!(values.len(), 2);
    }
}
