//! # HTTP Message Model
//!
//! Parsed request and response representations shared by the codec, the
//! idempotency guard, and the handler boundary.
//!
//! ## Design Principles
//!
//! 1. **Binary-Safe Bodies**: Bodies are `Bytes` so cached responses can be
//!    replayed without copying.
//! 2. **Ordered Headers**: Headers keep insertion order and allow duplicate
//!    names; lookup is case-insensitive and returns the first match.
//! 3. **First-Class Protocol Fields**: `Content-Length` and the idempotency
//!    key are extracted once at parse time, not re-derived on every use.

use bytes::Bytes;

/// HTTP request method. Unrecognized tokens parse to `Unknown` so the
/// pipeline can answer 501 instead of failing the whole parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Patch,
    Unknown,
}

impl Method {
    /// Maps a request-line token to a method. Case-sensitive, per RFC 9110.
    pub fn from_token(token: &str) -> Self {
        match token {
            "GET" => Method::Get,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "HEAD" => Method::Head,
            "OPTIONS" => Method::Options,
            "PATCH" => Method::Patch,
            _ => Method::Unknown,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Patch => "PATCH",
            Method::Unknown => "UNKNOWN",
        }
    }

    /// Safe methods bypass the idempotency guard when no key is supplied.
    pub const fn is_safe(self) -> bool {
        matches!(self, Method::Get | Method::Head | Method::Options)
    }
}

/// Supported protocol versions. Anything else is a parse failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "HTTP/1.1" => Some(Version::Http11),
            "HTTP/1.0" => Some(Version::Http10),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

/// Reason phrase for the status codes the server surfaces.
pub const fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        409 => "Conflict",
        413 => "Payload Too Large",
        422 => "Unprocessable Entity",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        _ => "Unknown",
    }
}

/// A single name/value header pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// Parsed representation of one HTTP request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    pub uri: String,
    pub version: Version,
    /// Headers in wire order; duplicates preserved.
    pub headers: Vec<Header>,
    /// Body bytes; empty unless `Content-Length` > 0.
    pub body: Bytes,
    /// Value of the `Content-Length` header (invalid values read as 0).
    pub content_length: usize,
    /// Value of `X-Idempotency-Key`, when supplied.
    pub idempotency_key: Option<String>,
}

impl Request {
    /// Returns the first header whose name matches case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }
}

/// Response produced by the handler or replayed from the idempotency cache.
///
/// `Server`, `Date`, and `Content-Length` are injected at serialization
/// time; `headers` holds only caller-supplied pairs, in insertion order.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<Header>,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Response {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push(Header {
            name: name.to_string(),
            value: value.to_string(),
        });
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Builds a JSON response from a serializable value and tags it with
    /// `Content-Type: application/json`.
    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        Response::new(status)
            .with_header("Content-Type", "application/json")
            .with_body(value.to_string())
    }

    /// Structured JSON error body sent on every post-read failure path:
    /// `{"error": <detail>, "status": <code>, "message": <reason phrase>}`.
    pub fn error(status: u16, detail: &str) -> Self {
        Response::json(
            status,
            &serde_json::json!({
                "error": detail,
                "status": status,
                "message": reason_phrase(status),
            }),
        )
    }
}
