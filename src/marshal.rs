//! Boundary marshaling between host network primitives and plain data.
//!
//! Everything that crosses into or out of the guest interpreter passes
//! through this module. The contract is strict: every output field is
//! self-contained plain data. A [`SerializedResponse`] never holds a lazy
//! body reference into host internals, and a [`RequestDescriptor`] carries
//! the guest's body intent as one tagged representation instead of hiding it
//! inside an untyped wrapper field.

use crate::error::Result;
use futures::Stream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::pin::Pin;

/// Chunked response body as produced by the network executor.
pub type BodyChunkStream = Pin<Box<dyn Stream<Item = std::io::Result<Vec<u8>>> + Send>>;

/// A response as handed over by the network executor, body not yet drained.
pub struct RawResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: BodyChunkStream,
}

impl RawResponse {
    /// Build a raw response from an already-materialized body.
    pub fn from_bytes(
        status: u16,
        headers: Vec<(String, String)>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        let chunk: std::io::Result<Vec<u8>> = Ok(body.into());
        Self {
            status,
            status_text: String::new(),
            headers,
            body: Box::pin(futures::stream::iter(vec![chunk])),
        }
    }

    /// Set a non-canonical reason phrase.
    #[must_use]
    pub fn with_status_text(mut self, status_text: impl Into<String>) -> Self {
        self.status_text = status_text.into();
        self
    }
}

impl std::fmt::Debug for RawResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawResponse")
            .field("status", &self.status)
            .field("status_text", &self.status_text)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// One HTTP header, order-preserving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A fully-materialized response, safe to hand across the guest boundary.
///
/// Immutable once built. The body is owned bytes; `text`/`json` are pure
/// derivations over it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<Header>,
    pub body: Vec<u8>,
}

impl SerializedResponse {
    /// Case-insensitive header lookup, first match wins.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Body as text (lossy UTF-8).
    #[must_use]
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Body parsed as JSON.
    pub fn json(&self) -> Result<Value> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Plain-data rendition handed to the guest.
    ///
    /// The guest-side wrapper derives its `text()`/`json()`/`arrayBuffer()`
    /// accessors from these fields alone; no host reference survives.
    #[must_use]
    pub fn to_bridge_value(&self) -> Value {
        let headers: Vec<Value> = self
            .headers
            .iter()
            .map(|h| serde_json::json!({ "name": h.name, "value": h.value }))
            .collect();
        let bytes: Vec<Value> = self.body.iter().map(|b| Value::from(*b)).collect();
        serde_json::json!({
            "status": self.status,
            "statusText": self.status_text,
            "headers": headers,
            "bodyBytes": bytes,
            "bodyText": self.text(),
        })
    }
}

/// Drain a raw response fully into a [`SerializedResponse`].
///
/// Never fails: a body stream error truncates the body at the last good
/// chunk (logged), and an empty reason phrase is filled from the status
/// code.
pub async fn to_serialized_response(raw: RawResponse) -> SerializedResponse {
    let RawResponse {
        status,
        status_text,
        headers,
        mut body,
    } = raw;

    let mut bytes = Vec::new();
    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(chunk) => bytes.extend_from_slice(&chunk),
            Err(err) => {
                tracing::warn!(
                    event = "marshal.body_truncated",
                    error = %err,
                    drained = bytes.len(),
                    "Response body stream failed mid-read"
                );
                break;
            }
        }
    }

    let status_text = if status_text.is_empty() {
        reason_phrase(status).to_string()
    } else {
        status_text
    };

    tracing::trace!(
        event = "marshal.response",
        status = status,
        body_len = bytes.len(),
        header_count = headers.len(),
        "Serialized response"
    );

    SerializedResponse {
        status,
        status_text,
        headers: headers
            .into_iter()
            .map(|(name, value)| Header { name, value })
            .collect(),
        body: bytes,
    }
}

/// Canonical reason phrase for common status codes.
fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}

/// One field of a url-encoded form body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormField {
    pub name: String,
    pub value: String,
}

/// One part of a multipart body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultipartPart {
    pub name: String,
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// Tagged request body representation consumed by the network executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestBody {
    Empty,
    Text { content: String, media_type: String },
    Bytes { content: Vec<u8>, media_type: String },
    Form { fields: Vec<FormField> },
    Multipart { parts: Vec<MultipartPart> },
    /// Unrecognized guest body shapes pass through whole rather than being
    /// silently dropped.
    Opaque { content: Value, media_type: String },
}

/// A normalized outgoing request handed to the network executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    pub url: String,
    pub method: String,
    pub headers: Vec<Header>,
    pub body: RequestBody,
}

impl RequestDescriptor {
    /// Plain-data rendition of the request as seen by the guest.
    pub fn to_bridge_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Normalize guest-supplied fetch options into a [`RequestDescriptor`].
///
/// `options` is the guest's options object already converted to plain JSON.
/// Method defaults to GET, header values are string-coerced, and the body
/// is classified into the tagged [`RequestBody`] shapes.
#[must_use]
pub fn to_network_request(url: &str, options: &Value) -> RequestDescriptor {
    let method = options
        .get("method")
        .and_then(Value::as_str)
        .map(|m| m.trim().to_ascii_uppercase())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| "GET".to_string());

    let headers = normalize_headers(options.get("headers"));
    let body = normalize_body(options.get("body"), &headers);

    tracing::trace!(
        event = "marshal.request",
        url = %url,
        method = %method,
        body_kind = body_kind_name(&body),
        "Normalized network request"
    );

    RequestDescriptor {
        url: url.to_string(),
        method,
        headers,
        body,
    }
}

fn body_kind_name(body: &RequestBody) -> &'static str {
    match body {
        RequestBody::Empty => "empty",
        RequestBody::Text { .. } => "text",
        RequestBody::Bytes { .. } => "bytes",
        RequestBody::Form { .. } => "form",
        RequestBody::Multipart { .. } => "multipart",
        RequestBody::Opaque { .. } => "opaque",
    }
}

/// Accepts `{name: value}` maps, `[[name, value], ...]` pairs and
/// `[{name, value}, ...]` entries; values are string-coerced.
fn normalize_headers(headers: Option<&Value>) -> Vec<Header> {
    let mut out = Vec::new();
    match headers {
        Some(Value::Object(map)) => {
            for (name, value) in map {
                out.push(Header::new(name.clone(), coerce_string(value)));
            }
        }
        Some(Value::Array(entries)) => {
            for entry in entries {
                match entry {
                    Value::Array(pair) if pair.len() == 2 => {
                        out.push(Header::new(coerce_string(&pair[0]), coerce_string(&pair[1])));
                    }
                    Value::Object(map) => {
                        let name = map.get("name").map(coerce_string);
                        let value = map.get("value").map(coerce_string);
                        if let (Some(name), Some(value)) = (name, value) {
                            out.push(Header::new(name, value));
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
    out
}

/// String-coerce a header or form value; never fails.
fn coerce_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn header_media_type(headers: &[Header], fallback: &str) -> String {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("content-type"))
        .map(|h| h.value.clone())
        .unwrap_or_else(|| fallback.to_string())
}

fn normalize_body(body: Option<&Value>, headers: &[Header]) -> RequestBody {
    let Some(body) = body else {
        return RequestBody::Empty;
    };
    match body {
        Value::Null => RequestBody::Empty,
        Value::String(text) => RequestBody::Text {
            content: text.clone(),
            media_type: header_media_type(headers, "text/plain"),
        },
        Value::Array(items) => {
            if let Some(bytes) = as_byte_array(items) {
                RequestBody::Bytes {
                    content: bytes,
                    media_type: header_media_type(headers, "application/octet-stream"),
                }
            } else {
                RequestBody::Opaque {
                    content: body.clone(),
                    media_type: header_media_type(headers, "application/json"),
                }
            }
        }
        Value::Object(map) => {
            if let Some(fields) = map.get("form").and_then(|f| as_form_fields(f)) {
                RequestBody::Form { fields }
            } else if let Some(parts) = map.get("multipart").and_then(|p| as_multipart_parts(p)) {
                RequestBody::Multipart { parts }
            } else {
                RequestBody::Opaque {
                    content: body.clone(),
                    media_type: header_media_type(headers, "application/json"),
                }
            }
        }
        other => RequestBody::Opaque {
            content: other.clone(),
            media_type: header_media_type(headers, "application/json"),
        },
    }
}

fn as_byte_array(items: &[Value]) -> Option<Vec<u8>> {
    if items.is_empty() {
        return None;
    }
    let mut bytes = Vec::with_capacity(items.len());
    for item in items {
        let n = item.as_u64()?;
        bytes.push(u8::try_from(n).ok()?);
    }
    Some(bytes)
}

fn as_form_fields(form: &Value) -> Option<Vec<FormField>> {
    match form {
        Value::Object(map) => Some(
            map.iter()
                .map(|(name, value)| FormField {
                    name: name.clone(),
                    value: coerce_string(value),
                })
                .collect(),
        ),
        Value::Array(entries) => {
            let mut fields = Vec::new();
            for entry in entries {
                let map = entry.as_object()?;
                fields.push(FormField {
                    name: map.get("name").map(coerce_string)?,
                    value: map.get("value").map(coerce_string).unwrap_or_default(),
                });
            }
            Some(fields)
        }
        _ => None,
    }
}

fn as_multipart_parts(multipart: &Value) -> Option<Vec<MultipartPart>> {
    let entries = multipart.as_array()?;
    let mut parts = Vec::new();
    for entry in entries {
        let map = entry.as_object()?;
        parts.push(MultipartPart {
            name: map.get("name").map(coerce_string)?,
            content: map.get("content").cloned().unwrap_or(Value::Null),
            filename: map.get("filename").and_then(Value::as_str).map(String::from),
            content_type: map
                .get("contentType")
                .and_then(Value::as_str)
                .map(String::from),
        });
    }
    Some(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run_async<T>(future: impl std::future::Future<Output = T>) -> T {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("build runtime")
            .block_on(future)
    }

    #[test]
    fn drains_chunked_body_fully() {
        let chunks: Vec<std::io::Result<Vec<u8>>> =
            vec![Ok(b"hello ".to_vec()), Ok(b"world".to_vec())];
        let raw = RawResponse {
            status: 200,
            status_text: String::new(),
            headers: vec![("Content-Type".into(), "text/plain".into())],
            body: Box::pin(futures::stream::iter(chunks)),
        };

        let serialized = run_async(to_serialized_response(raw));
        assert_eq!(serialized.body, b"hello world");
        assert_eq!(serialized.text(), "hello world");
        assert_eq!(serialized.status_text, "OK");
    }

    #[test]
    fn body_stream_error_truncates_instead_of_failing() {
        let chunks: Vec<std::io::Result<Vec<u8>>> = vec![
            Ok(b"partial".to_vec()),
            Err(std::io::Error::other("connection reset")),
            Ok(b"never seen".to_vec()),
        ];
        let raw = RawResponse {
            status: 200,
            status_text: "OK".into(),
            headers: Vec::new(),
            body: Box::pin(futures::stream::iter(chunks)),
        };

        let serialized = run_async(to_serialized_response(raw));
        assert_eq!(serialized.body, b"partial");
    }

    #[test]
    fn empty_body_text_is_empty_and_json_errors() {
        let raw = RawResponse::from_bytes(204, Vec::new(), Vec::new());
        let serialized = run_async(to_serialized_response(raw));
        assert_eq!(serialized.text(), "");
        assert!(serialized.json().is_err());
        assert_eq!(serialized.status_text, "No Content");
    }

    #[test]
    fn json_accessor_reproduces_body_structurally() {
        let payload = json!({"token": "abc", "count": 3, "nested": {"ok": true}});
        let raw = RawResponse::from_bytes(
            200,
            vec![("content-type".into(), "application/json".into())],
            serde_json::to_vec(&payload).expect("serialize"),
        );
        let serialized = run_async(to_serialized_response(raw));
        assert_eq!(serialized.json().expect("parse"), payload);
    }

    #[test]
    fn header_lookup_is_case_insensitive_first_match() {
        let raw = RawResponse::from_bytes(
            200,
            vec![
                ("X-Token".into(), "first".into()),
                ("x-token".into(), "second".into()),
            ],
            Vec::new(),
        );
        let serialized = run_async(to_serialized_response(raw));
        assert_eq!(serialized.header("X-TOKEN"), Some("first"));
        assert_eq!(serialized.header("missing"), None);
    }

    #[test]
    fn request_defaults_to_get_with_empty_body() {
        let descriptor = to_network_request("https://api.test/v1", &json!({}));
        assert_eq!(descriptor.method, "GET");
        assert_eq!(descriptor.body, RequestBody::Empty);
        assert!(descriptor.headers.is_empty());
    }

    #[test]
    fn request_method_is_uppercased() {
        let descriptor = to_network_request("https://api.test", &json!({"method": "post"}));
        assert_eq!(descriptor.method, "POST");
    }

    #[test]
    fn header_values_are_string_coerced() {
        let options = json!({"headers": {"X-Retries": 3, "X-Flag": true}});
        let descriptor = to_network_request("https://api.test", &options);
        let retries = descriptor
            .headers
            .iter()
            .find(|h| h.name == "X-Retries")
            .expect("header");
        assert_eq!(retries.value, "3");
    }

    #[test]
    fn string_body_uses_content_type_header() {
        let options = json!({
            "headers": {"Content-Type": "application/xml"},
            "body": "<a/>",
        });
        let descriptor = to_network_request("https://api.test", &options);
        assert_eq!(
            descriptor.body,
            RequestBody::Text {
                content: "<a/>".into(),
                media_type: "application/xml".into(),
            }
        );
    }

    #[test]
    fn numeric_array_body_becomes_bytes() {
        let options = json!({"body": [0, 128, 255]});
        let descriptor = to_network_request("https://api.test", &options);
        assert_eq!(
            descriptor.body,
            RequestBody::Bytes {
                content: vec![0, 128, 255],
                media_type: "application/octet-stream".into(),
            }
        );
    }

    #[test]
    fn form_body_preserves_field_order() {
        let options = json!({"body": {"form": [
            {"name": "b", "value": "2"},
            {"name": "a", "value": "1"},
        ]}});
        let descriptor = to_network_request("https://api.test", &options);
        let RequestBody::Form { fields } = descriptor.body else {
            panic!("expected form body");
        };
        assert_eq!(fields[0].name, "b");
        assert_eq!(fields[1].name, "a");
    }

    #[test]
    fn multipart_body_keeps_part_metadata() {
        let options = json!({"body": {"multipart": [
            {"name": "file", "content": "data", "filename": "a.txt", "contentType": "text/plain"},
        ]}});
        let descriptor = to_network_request("https://api.test", &options);
        let RequestBody::Multipart { parts } = descriptor.body else {
            panic!("expected multipart body");
        };
        assert_eq!(parts[0].filename.as_deref(), Some("a.txt"));
        assert_eq!(parts[0].content_type.as_deref(), Some("text/plain"));
    }

    #[test]
    fn unrecognized_body_shape_passes_through_opaque() {
        let options = json!({"body": {"graphql": {"query": "{ me }"}}});
        let descriptor = to_network_request("https://api.test", &options);
        let RequestBody::Opaque {
            content,
            media_type,
        } = descriptor.body
        else {
            panic!("expected opaque body");
        };
        assert_eq!(content, json!({"graphql": {"query": "{ me }"}}));
        assert_eq!(media_type, "application/json");
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn utf8_bodies_round_trip_through_text(body in "\\PC{0,64}") {
                let raw = RawResponse::from_bytes(200, Vec::new(), body.as_bytes().to_vec());
                let serialized = run_async(to_serialized_response(raw));
                prop_assert_eq!(serialized.text(), body);
            }

            #[test]
            fn header_lookup_ignores_ascii_case(name in "[a-zA-Z][a-zA-Z0-9-]{0,16}") {
                let raw = RawResponse::from_bytes(
                    200,
                    vec![(name.clone(), "v".into())],
                    Vec::new(),
                );
                let serialized = run_async(to_serialized_response(raw));
                prop_assert_eq!(serialized.header(&name.to_ascii_uppercase()), Some("v"));
                prop_assert_eq!(serialized.header(&name.to_ascii_lowercase()), Some("v"));
            }
        }
    }
}
