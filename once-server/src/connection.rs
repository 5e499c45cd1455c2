//! # Per-Connection Pipeline
//!
//! One connection, one request, one response. A worker runs the full
//! sequence here: buffer the head, parse, enforce limits, consult the
//! idempotency guard, invoke the handler, serialize, write, close.
//!
//! ## Design Principles
//!
//! 1. **Every Failure Answers**: Once any bytes have arrived, the client
//!    gets a structured JSON error response; silent closes happen only when
//!    the peer sent nothing at all.
//! 2. **Reject Before Reading**: An oversized declared body is refused with
//!    413 before any body byte is read.
//! 3. **Guard Outcomes Are Exhaustive**: Cached hit replays, in-flight
//!    duplicate conflicts, and fresh reservations each have exactly one path.
//! 4. **Failure Releases the Reservation**: A handler error releases the key
//!    so a client retry re-executes; only successes are cached.

use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use once_common::{Limits, Method, Request, Response};
use once_guard::{IdempotencyStore, Reservation};

use crate::codec::{self, ParseError};
use crate::handler::Handler;
use crate::listener::Connection;

/// Shared state every worker needs to process a request.
pub struct PipelineContext {
    pub guard: Arc<dyn IdempotencyStore>,
    pub handler: Arc<dyn Handler>,
    pub limits: Limits,
}

const READ_CHUNK: usize = 4096;

/// Entry point for an accepted connection.
pub async fn handle(conn: Connection, ctx: &PipelineContext) -> io::Result<()> {
    let peer = conn.peer;
    let mut stream = conn.stream;
    let result = run_pipeline(&mut stream, ctx).await;
    if let Err(ref err) = result {
        tracing::warn!(%peer, %err, "connection failed");
    }
    let _ = stream.shutdown().await;
    result
}

/// Runs the request/response sequence over any byte stream. Generic so the
/// full pipeline is testable against in-memory duplex streams.
pub async fn run_pipeline<S>(stream: &mut S, ctx: &PipelineContext) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    // Buffer until the blank line ending the head, a limit, or EOF.
    let head_end = loop {
        if let Some(end) = codec::find_head_end(&buf) {
            break end;
        }
        if buf.len() > ctx.limits.max_head_bytes {
            let err = ParseError::HeadTooLarge(ctx.limits.max_head_bytes);
            return respond(stream, &Response::error(err.status(), &err.to_string())).await;
        }
        match stream.read_buf(&mut buf).await {
            Ok(0) if buf.is_empty() => {
                // Peer connected and closed without sending anything.
                return Ok(());
            }
            Ok(0) => {
                let err = ParseError::MissingTerminator;
                return respond(stream, &Response::error(err.status(), &err.to_string())).await;
            }
            Ok(_) => {}
            Err(read_err) => {
                tracing::warn!(%read_err, "failed to read request");
                if !buf.is_empty() {
                    let _ = respond(stream, &Response::error(400, "Failed to read request")).await;
                }
                return Err(read_err);
            }
        }
    };

    let head = buf.split_to(head_end);
    bytes::Buf::advance(&mut buf, 4); // skip the \r\n\r\n terminator
    let mut request = match codec::parse_head(&head, &ctx.limits) {
        Ok(request) => request,
        Err(err) => {
            tracing::warn!(%err, "rejected malformed request");
            return respond(stream, &Response::error(err.status(), &err.to_string())).await;
        }
    };

    if request.method == Method::Unknown {
        return respond(stream, &Response::error(501, "Method not implemented")).await;
    }

    if request.content_length > ctx.limits.max_body_size {
        let err = ParseError::BodyTooLarge(ctx.limits.max_body_size);
        return respond(stream, &Response::error(err.status(), &err.to_string())).await;
    }

    while buf.len() < request.content_length {
        match stream.read_buf(&mut buf).await {
            Ok(0) => {
                let err = ParseError::BodyTooShort;
                return respond(stream, &Response::error(err.status(), &err.to_string())).await;
            }
            Ok(_) => {}
            Err(read_err) => {
                let _ = respond(stream, &Response::error(400, "Failed to read request")).await;
                return Err(read_err);
            }
        }
    }
    request.body = buf.split_to(request.content_length).freeze();

    if request.method == Method::Post && request.idempotency_key.is_none() {
        return respond(
            stream,
            &Response::error(422, "POST requests require X-Idempotency-Key header"),
        )
        .await;
    }

    let response = dispatch(&request, ctx);
    respond(stream, &response).await
}

/// Routes the request through the idempotency guard when a key is present,
/// straight to the handler otherwise.
fn dispatch(request: &Request, ctx: &PipelineContext) -> Response {
    let Some(key) = request.idempotency_key.as_deref() else {
        return execute(request, ctx);
    };

    match ctx.guard.check_and_reserve(key) {
        Reservation::Hit(cached) => {
            tracing::info!(key, "replaying cached response");
            cached
        }
        Reservation::InFlight => {
            tracing::info!(key, "duplicate of an in-flight request");
            Response::error(409, "Request with this idempotency key is already in progress")
        }
        Reservation::Reserved => match ctx.handler.handle(request) {
            Ok(response) => {
                if let Err(err) = ctx.guard.complete(key, response.clone()) {
                    tracing::error!(key, %err, "failed to record completed response");
                }
                response
            }
            Err(err) => {
                tracing::error!(key, %err, "handler failed; releasing reservation");
                ctx.guard.release(key);
                Response::error(500, "Request handler failed")
            }
        },
    }
}

fn execute(request: &Request, ctx: &PipelineContext) -> Response {
    match ctx.handler.handle(request) {
        Ok(response) => response,
        Err(err) => {
            tracing::error!(%err, "handler failed");
            Response::error(500, "Request handler failed")
        }
    }
}

async fn respond<S>(stream: &mut S, response: &Response) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let wire = codec::serialize_response(response);
    stream.write_all(&wire).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use once_guard::ShardedStore;
    use serde_json::Value;

    use crate::handler::{HandlerError, PaymentHandler};

    use super::*;

    struct FailingHandler;

    impl Handler for FailingHandler {
        fn handle(&self, _request: &Request) -> Result<Response, HandlerError> {
            Err(HandlerError("downstream unavailable".to_string()))
        }
    }

    struct CountingHandler {
        calls: AtomicUsize,
    }

    impl Handler for CountingHandler {
        fn handle(&self, _request: &Request) -> Result<Response, HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Response::json(200, &serde_json::json!({"ok": true})))
        }
    }

    fn context(handler: Arc<dyn Handler>) -> (PipelineContext, Arc<ShardedStore>) {
        let store = ShardedStore::new(Duration::from_secs(300));
        let ctx = PipelineContext {
            guard: Arc::clone(&store) as Arc<dyn IdempotencyStore>,
            handler,
            limits: Limits::default(),
        };
        (ctx, store)
    }

    async fn roundtrip(ctx: &PipelineContext, raw: &[u8]) -> (u16, Value) {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        client.write_all(raw).await.unwrap();
        client.shutdown().await.unwrap();

        run_pipeline(&mut server, ctx).await.unwrap();
        drop(server);

        let mut wire = Vec::new();
        client.read_to_end(&mut wire).await.unwrap();
        let text = String::from_utf8(wire).unwrap();

        let status: u16 = text
            .strip_prefix("HTTP/1.1 ")
            .and_then(|rest| rest.split(' ').next())
            .and_then(|code| code.parse().ok())
            .unwrap();
        let body_start = text.find("\r\n\r\n").unwrap() + 4;
        let body = serde_json::from_str(&text[body_start..]).unwrap();
        (status, body)
    }

    fn keyed_post(key: &str, body: &str) -> Vec<u8> {
        format!(
            "POST /api/payment HTTP/1.1\r\nX-Idempotency-Key: {key}\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        )
        .into_bytes()
    }

    #[tokio::test]
    async fn keyed_post_executes_and_caches() {
        let (ctx, store) = context(Arc::new(PaymentHandler));
        let (status, body) = roundtrip(&ctx, &keyed_post("k1", r#"{"amount":10}"#)).await;
        assert_eq!(status, 200);
        assert_eq!(body["message"], "Payment processed");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_key_replays_without_reexecuting() {
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
        });
        let (ctx, _store) = context(Arc::clone(&handler) as Arc<dyn Handler>);

        let (first_status, first_body) = roundtrip(&ctx, &keyed_post("k1", "ab")).await;
        let (second_status, second_body) = roundtrip(&ctx, &keyed_post("k1", "ab")).await;

        assert_eq!(first_status, 200);
        assert_eq!(second_status, 200);
        assert_eq!(first_body, second_body);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn post_without_key_is_unprocessable() {
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
        });
        let (ctx, _store) = context(Arc::clone(&handler) as Arc<dyn Handler>);

        let raw = b"POST /api/payment HTTP/1.1\r\nContent-Length: 2\r\n\r\nhi";
        let (status, body) = roundtrip(&ctx, raw).await;

        assert_eq!(status, 422);
        assert_eq!(body["message"], "Unprocessable Entity");
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn get_bypasses_the_guard() {
        let (ctx, store) = context(Arc::new(PaymentHandler));
        let (status, body) = roundtrip(&ctx, b"GET /status HTTP/1.1\r\n\r\n").await;
        assert_eq!(status, 200);
        assert_eq!(body["message"], "Request received");
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn handler_failure_releases_the_reservation() {
        let (ctx, store) = context(Arc::new(FailingHandler));
        let (status, _) = roundtrip(&ctx, &keyed_post("k1", "")).await;
        assert_eq!(status, 500);
        assert!(store.is_empty(), "failed request must not stay reserved");

        // A retry with the same key reaches a working handler.
        let retry_ctx = PipelineContext {
            guard: Arc::clone(&ctx.guard),
            handler: Arc::new(PaymentHandler),
            limits: Limits::default(),
        };
        let (status, body) = roundtrip(&retry_ctx, &keyed_post("k1", "")).await;
        assert_eq!(status, 200);
        assert_eq!(body["message"], "Payment processed");
    }

    #[tokio::test]
    async fn unknown_method_is_not_implemented() {
        let (ctx, _store) = context(Arc::new(PaymentHandler));
        let (status, body) = roundtrip(&ctx, b"BREW /pot HTTP/1.1\r\n\r\n").await;
        assert_eq!(status, 501);
        assert_eq!(body["message"], "Not Implemented");
    }

    #[tokio::test]
    async fn unsupported_version_is_bad_request() {
        let (ctx, _store) = context(Arc::new(PaymentHandler));
        let (status, _) = roundtrip(&ctx, b"GET /x HTTP/9.9\r\n\r\n").await;
        assert_eq!(status, 400);
    }

    #[tokio::test]
    async fn declared_body_over_limit_is_rejected_before_reading() {
        let (mut ctx, _store) = context(Arc::new(PaymentHandler));
        ctx.limits.max_body_size = 4;

        let raw = b"POST / HTTP/1.1\r\nX-Idempotency-Key: k\r\nContent-Length: 5\r\n\r\nhello";
        let (status, body) = roundtrip(&ctx, raw).await;
        assert_eq!(status, 413);
        assert_eq!(body["message"], "Payload Too Large");
    }

    #[tokio::test]
    async fn body_at_the_limit_is_accepted() {
        let (mut ctx, _store) = context(Arc::new(PaymentHandler));
        ctx.limits.max_body_size = 5;

        let raw = b"POST / HTTP/1.1\r\nX-Idempotency-Key: k\r\nContent-Length: 5\r\n\r\nhello";
        let (status, body) = roundtrip(&ctx, raw).await;
        assert_eq!(status, 200);
        assert_eq!(body["body_size"], 5);
    }

    #[tokio::test]
    async fn truncated_body_is_bad_request() {
        let (ctx, _store) = context(Arc::new(PaymentHandler));
        let raw = b"POST / HTTP/1.1\r\nX-Idempotency-Key: k\r\nContent-Length: 10\r\n\r\nhi";
        let (status, _) = roundtrip(&ctx, raw).await;
        assert_eq!(status, 400);
    }

    #[tokio::test]
    async fn missing_head_terminator_is_bad_request() {
        let (ctx, _store) = context(Arc::new(PaymentHandler));
        let (status, _) = roundtrip(&ctx, b"GET / HTTP/1.1\r\nHost: x\r\n").await;
        assert_eq!(status, 400);
    }

    #[tokio::test]
    async fn empty_connection_closes_silently() {
        let (ctx, _store) = context(Arc::new(PaymentHandler));
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.shutdown().await.unwrap();

        run_pipeline(&mut server, &ctx).await.unwrap();
        drop(server);

        let mut wire = Vec::new();
        client.read_to_end(&mut wire).await.unwrap();
        assert!(wire.is_empty());
    }

    #[tokio::test]
    async fn oversized_head_is_rejected() {
        let (mut ctx, _store) = context(Arc::new(PaymentHandler));
        ctx.limits.max_head_bytes = 64;

        let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
        raw.extend_from_slice(&b"X".repeat(128));
        let (status, _) = roundtrip(&ctx, &raw).await;
        assert_eq!(status, 400);
    }
}
