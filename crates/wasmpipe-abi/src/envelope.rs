//! The JSON exchange envelope fed to batch-style guests.
//!
//! Stdio and CGI guests see one request per execution, serialized as a
//! single JSON document on standard input, and answer with a document of
//! the same shape. Field aliases accept the capitalized key spellings some
//! guest SDKs emit, since their encoders derive keys from struct field
//! names.

use std::collections::BTreeMap;

use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::warn;

use wasmpipe_common::{PipelineError, ResponseBuffer, StageRequest};

use crate::adapter::Served;

/// Multi-valued header map in guest wire form.
pub type WireHeaders = BTreeMap<String, Vec<String>>;

/// The request half of the envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuestRequest {
    #[serde(default, alias = "Headers")]
    pub headers: WireHeaders,
    #[serde(default, alias = "Url", alias = "URL")]
    pub url: String,
    #[serde(default, alias = "Body")]
    pub body: String,
    #[serde(default, alias = "Method")]
    pub method: String,
}

/// The response half of the envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuestResponse {
    #[serde(default, alias = "Headers")]
    pub headers: WireHeaders,
    #[serde(default, alias = "Body")]
    pub body: String,
    /// Zero means the guest left the status untouched.
    #[serde(default, alias = "Status")]
    pub status: u16,
}

/// The full exchange envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, alias = "Request")]
    pub request: GuestRequest,
    #[serde(default, alias = "Response")]
    pub response: GuestResponse,
    #[serde(default, alias = "Error")]
    pub error: String,
    #[serde(default, alias = "Context")]
    pub context: String,
}

impl Envelope {
    /// Build the inbound envelope for a stage request.
    ///
    /// The response half is prefilled by echoing the request, so a guest
    /// that returns the envelope unmodified acts as an identity filter.
    pub fn from_stage_request(req: &StageRequest) -> Self {
        let headers = headers_to_wire(&req.headers);
        let body = String::from_utf8_lossy(&req.body).into_owned();

        Self {
            request: GuestRequest {
                headers: headers.clone(),
                url: req.uri.to_string(),
                body: body.clone(),
                method: req.method.to_string(),
            },
            response: GuestResponse {
                headers,
                body,
                status: 0,
            },
            error: String::new(),
            context: "request".to_string(),
        }
    }

    /// Serialize the envelope for the guest's standard input.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<Vec<u8>, PipelineError> {
        serde_json::to_vec(self)
            .map_err(|e| PipelineError::guest(format!("failed to encode request envelope: {e}")))
    }

    /// Decode a guest-produced envelope.
    ///
    /// # Errors
    ///
    /// Returns a guest execution error if the bytes are not a valid
    /// envelope document.
    pub fn decode(bytes: &[u8]) -> Result<Self, PipelineError> {
        serde_json::from_slice(bytes)
            .map_err(|e| PipelineError::guest(format!("invalid response envelope: {e}")))
    }

    /// Apply a decoded envelope to the response buffer.
    ///
    /// A non-empty `error` field converts to a 500 with the error text as
    /// body and fails the stage, so the continuation is never reached.
    /// Otherwise the guest's headers merge in, its status (when set)
    /// replaces the current one, and its body is written.
    ///
    /// `downstream_responded` marks that a continuation already produced
    /// the body; an empty guest body then leaves it in place rather than
    /// clearing it, so header-only rewrites compose with downstream
    /// stages.
    ///
    /// # Errors
    ///
    /// Returns a guest execution error when the envelope reports one or
    /// carries an invalid status code.
    pub fn apply(
        self,
        rw: &mut ResponseBuffer,
        downstream_responded: bool,
    ) -> Result<Served, PipelineError> {
        if !self.error.is_empty() {
            rw.write_header(StatusCode::INTERNAL_SERVER_ERROR);
            rw.write(self.error.as_bytes());
            return Err(PipelineError::guest(self.error));
        }

        merge_wire_headers(rw, &self.response.headers);

        if self.response.status != 0 {
            let status = StatusCode::from_u16(self.response.status).map_err(|_| {
                PipelineError::guest(format!(
                    "guest produced invalid status code {}",
                    self.response.status
                ))
            })?;
            rw.write_header(status);
        }

        if !(downstream_responded && self.response.body.is_empty()) {
            rw.write(self.response.body.as_bytes());
        }

        Ok(Served { body_written: true })
    }
}

/// Convert typed headers to the guest wire form.
pub fn headers_to_wire(headers: &HeaderMap) -> WireHeaders {
    let mut wire: WireHeaders = BTreeMap::new();
    for (name, value) in headers {
        wire.entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    wire
}

/// Merge guest wire headers into the response buffer, skipping entries
/// that are not valid HTTP header names or values.
fn merge_wire_headers(rw: &mut ResponseBuffer, wire: &WireHeaders) {
    for (name, values) in wire {
        let Ok(header_name) = HeaderName::try_from(name.as_str()) else {
            warn!(header = %name, "Dropping invalid header name from guest");
            continue;
        };
        for value in values {
            match HeaderValue::try_from(value.as_str()) {
                Ok(header_value) => rw.append_header(header_name.clone(), header_value),
                Err(_) => warn!(header = %name, "Dropping invalid header value from guest"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::Method;
    use wasmpipe_common::CaptureSink;

    fn buffer() -> (ResponseBuffer, wasmpipe_common::CaptureHandle) {
        let (sink, handle) = CaptureSink::new();
        (ResponseBuffer::new(Box::new(sink)), handle)
    }

    #[test]
    fn test_envelope_echoes_request_into_response() {
        let mut req = StageRequest::new(Method::POST, "/submit".parse().unwrap());
        req.body = Bytes::from_static(b"payload");
        req.headers
            .insert("x-tenant", HeaderValue::from_static("acme"));

        let env = Envelope::from_stage_request(&req);

        assert_eq!(env.request.method, "POST");
        assert_eq!(env.request.url, "/submit");
        assert_eq!(env.request.body, "payload");
        assert_eq!(env.response.body, "payload");
        assert_eq!(env.response.status, 0);
        assert_eq!(env.context, "request");
        assert_eq!(env.request.headers["x-tenant"], vec!["acme"]);
    }

    #[test]
    fn test_decode_accepts_capitalized_keys() {
        let env = Envelope::decode(
            br#"{"Error":"boom","Response":{"Status":503,"Body":"oops"}}"#,
        )
        .unwrap();

        assert_eq!(env.error, "boom");
        assert_eq!(env.response.status, 503);
        assert_eq!(env.response.body, "oops");
    }

    #[test]
    fn test_apply_error_writes_500() {
        let (mut rw, handle) = buffer();
        let env = Envelope {
            error: "guest blew up".to_string(),
            ..Default::default()
        };

        let err = env.apply(&mut rw, false).unwrap_err();
        assert!(err.is_guest_failure());

        rw.flush();
        let captured = handle.take().unwrap();
        assert_eq!(captured.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(&captured.body[..], b"guest blew up");
    }

    #[test]
    fn test_apply_success_writes_headers_status_body() {
        let (mut rw, handle) = buffer();
        let mut env = Envelope::default();
        env.response.status = 201;
        env.response.body = "created".to_string();
        env.response
            .headers
            .insert("x-guest".to_string(), vec!["yes".to_string()]);

        let served = env.apply(&mut rw, false).unwrap();
        assert!(served.body_written);

        rw.flush();
        let captured = handle.take().unwrap();
        assert_eq!(captured.status, StatusCode::CREATED);
        assert_eq!(&captured.body[..], b"created");
        assert_eq!(captured.headers.get("x-guest").unwrap(), "yes");
    }

    #[test]
    fn test_apply_zero_status_keeps_default() {
        let (mut rw, _handle) = buffer();
        let env = Envelope::default();

        env.apply(&mut rw, false).unwrap();
        assert!(!rw.has_explicit_status());
        assert_eq!(rw.status(), StatusCode::OK);
    }

    #[test]
    fn test_apply_drops_invalid_header_names() {
        let (mut rw, handle) = buffer();
        let mut env = Envelope::default();
        env.response
            .headers
            .insert("bad header\n".to_string(), vec!["x".to_string()]);
        env.response
            .headers
            .insert("good".to_string(), vec!["y".to_string()]);

        env.apply(&mut rw, false).unwrap();
        rw.flush();

        let captured = handle.take().unwrap();
        assert_eq!(captured.headers.len(), 1);
        assert_eq!(captured.headers.get("good").unwrap(), "y");
    }

    #[test]
    fn test_apply_header_only_preserves_downstream_body() {
        let (mut rw, handle) = buffer();
        rw.write(b"done");

        let mut env = Envelope::default();
        env.response
            .headers
            .insert("x-a".to_string(), vec!["1".to_string()]);

        let served = env.apply(&mut rw, true).unwrap();
        assert!(served.body_written);

        rw.flush();
        let captured = handle.take().unwrap();
        assert_eq!(&captured.body[..], b"done");
        assert_eq!(captured.headers.get("x-a").unwrap(), "1");
    }

    #[test]
    fn test_apply_nonempty_body_still_overrides_downstream() {
        let (mut rw, handle) = buffer();
        rw.write(b"done");

        let mut env = Envelope::default();
        env.response.body = "rewritten".to_string();

        env.apply(&mut rw, true).unwrap();
        rw.flush();

        assert_eq!(&handle.take().unwrap().body[..], b"rewritten");
    }

    #[test]
    fn test_decode_garbage_is_guest_error() {
        let err = Envelope::decode(b"not json at all").unwrap_err();
        assert!(err.is_guest_failure());
    }
}
