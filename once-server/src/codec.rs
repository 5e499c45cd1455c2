//! # HTTP/1.1 Message Codec
//!
//! Parse a buffered request head into a [`Request`] and serialize a
//! [`Response`] into wire bytes.
//!
//! ## Design Principles
//!
//! 1. **Strict Tokenization**: The request line must be exactly
//!    method / URI / version; extra tokens are logged, not fatal.
//! 2. **Bounded Everything**: Header count, name length, URI length, and key
//!    length are checked against configured limits before anything is stored.
//! 3. **Tolerant Headers**: Lines without a colon or with an empty name are
//!    skipped with a warning; over-length values are truncated (the one
//!    documented truncation policy).
//! 4. **Fail Fast on Identity**: Over-length idempotency keys are rejected
//!    outright, because truncating one could alias two distinct keys.

use std::fmt::Write;
use std::time::SystemTime;

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use once_common::{Header, Limits, Method, Request, Response, Version, reason_phrase};

/// Value of the injected `Server` header.
pub const SERVER_NAME: &str = concat!("OnceServe/", env!("CARGO_PKG_VERSION"));

/// Protocol-level parse failures, each mapped to a client-facing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("request head is not valid UTF-8")]
    InvalidEncoding,
    #[error("malformed request line")]
    BadRequestLine,
    #[error("URI must start with '/'")]
    InvalidUri,
    #[error("URI exceeds {0} bytes")]
    UriTooLong(usize),
    #[error("unsupported HTTP version")]
    UnsupportedVersion,
    #[error("header name exceeds {0} bytes")]
    HeaderNameTooLong(usize),
    #[error("more than {0} headers")]
    TooManyHeaders(usize),
    #[error("idempotency key exceeds {0} bytes")]
    KeyTooLong(usize),
    #[error("request head exceeds {0} bytes without a blank line")]
    HeadTooLarge(usize),
    #[error("no blank line terminating the header section")]
    MissingTerminator,
    #[error("request body exceeds {0} bytes")]
    BodyTooLarge(usize),
    #[error("request body ended before Content-Length bytes arrived")]
    BodyTooShort,
}

impl ParseError {
    /// Status code surfaced to the client for this failure.
    pub const fn status(self) -> u16 {
        match self {
            ParseError::BodyTooLarge(_) => 413,
            _ => 400,
        }
    }
}

/// Returns the offset of the `\r\n\r\n` head terminator, if present.
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Parses the request line and header section (everything before the blank
/// line). The body is read separately by the pipeline once `Content-Length`
/// is known; `body` starts out empty here.
pub fn parse_head(head: &[u8], limits: &Limits) -> Result<Request, ParseError> {
    let head = std::str::from_utf8(head).map_err(|_| ParseError::InvalidEncoding)?;
    let mut lines = head.split("\r\n");

    let request_line = lines.next().ok_or(ParseError::BadRequestLine)?;
    let (method, uri, version) = parse_request_line(request_line, limits)?;

    let mut headers: Vec<Header> = Vec::new();
    let mut content_length = 0usize;
    let mut idempotency_key = None;

    for line in lines {
        if line.is_empty() {
            break;
        }
        let Some((raw_name, raw_value)) = line.split_once(':') else {
            tracing::warn!(line, "header line without colon; skipping");
            continue;
        };

        let name = raw_name.trim();
        let mut value = raw_value.trim();

        if name.is_empty() {
            tracing::warn!(line, "header line with empty name; skipping");
            continue;
        }
        if name.len() > limits.max_header_name_length {
            return Err(ParseError::HeaderNameTooLong(limits.max_header_name_length));
        }
        if value.len() > limits.max_header_value_length {
            tracing::warn!(
                name,
                length = value.len(),
                max = limits.max_header_value_length,
                "header value too long; truncating"
            );
            value = truncate_str(value, limits.max_header_value_length);
        }
        if headers.len() >= limits.max_headers {
            return Err(ParseError::TooManyHeaders(limits.max_headers));
        }

        // Duplicate occurrences of the extracted fields: last one wins.
        if name.eq_ignore_ascii_case("Content-Length") {
            content_length = match value.parse() {
                Ok(length) => length,
                Err(_) => {
                    tracing::warn!(value, "invalid Content-Length; treating as 0");
                    0
                }
            };
        }
        if name.eq_ignore_ascii_case("X-Idempotency-Key") {
            if value.len() > limits.max_idempotency_key_length {
                return Err(ParseError::KeyTooLong(limits.max_idempotency_key_length));
            }
            idempotency_key = Some(value.to_string());
        }

        headers.push(Header {
            name: name.to_string(),
            value: value.to_string(),
        });
    }

    Ok(Request {
        method,
        uri,
        version,
        headers,
        body: Bytes::new(),
        content_length,
        idempotency_key,
    })
}

fn parse_request_line(
    line: &str,
    limits: &Limits,
) -> Result<(Method, String, Version), ParseError> {
    let mut tokens = line.split_whitespace();

    let method_token = tokens.next().ok_or(ParseError::BadRequestLine)?;
    let method = Method::from_token(method_token);
    if method == Method::Unknown {
        // Unknown methods still parse; the pipeline answers 501.
        tracing::warn!(method = method_token, "unrecognized HTTP method");
    }

    let uri = tokens.next().ok_or(ParseError::BadRequestLine)?;
    if !uri.starts_with('/') {
        return Err(ParseError::InvalidUri);
    }
    if uri.len() > limits.max_uri_length {
        return Err(ParseError::UriTooLong(limits.max_uri_length));
    }

    let version_token = tokens.next().ok_or(ParseError::BadRequestLine)?;
    let version = Version::from_token(version_token).ok_or(ParseError::UnsupportedVersion)?;

    if tokens.next().is_some() {
        tracing::warn!(line, "extra tokens in request line");
    }

    Ok((method, uri.to_string(), version))
}

/// Truncates on a char boundary at or below `max` bytes.
fn truncate_str(value: &str, max: usize) -> &str {
    let mut end = max;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

/// Serializes a response: status line, injected `Server` / `Date` /
/// `Content-Length`, caller headers in insertion order, blank line, body.
pub fn serialize_response(response: &Response) -> Bytes {
    let mut buf = BytesMut::with_capacity(256 + response.body.len());

    // fmt::Write on BytesMut cannot fail; growth aborts on OOM like any
    // other allocation, so a partial or corrupt head is unrepresentable.
    let _ = write!(
        buf,
        "HTTP/1.1 {} {}\r\n",
        response.status,
        reason_phrase(response.status)
    );
    let _ = write!(buf, "Server: {SERVER_NAME}\r\n");
    let _ = write!(buf, "Date: {}\r\n", httpdate::fmt_http_date(SystemTime::now()));
    let _ = write!(buf, "Content-Length: {}\r\n", response.body.len());
    for header in &response.headers {
        let _ = write!(buf, "{}: {}\r\n", header.name, header.value);
    }
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(&response.body);
    buf.freeze()
}
