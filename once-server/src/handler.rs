//! # Request Handlers
//!
//! The application boundary. The pipeline hands a fully parsed request to a
//! `Handler` and gets a response back; everything in front (parsing, the
//! idempotency guard, dispatch) is handler-agnostic.

use thiserror::Error;

use once_common::{Method, Request, Response};

/// Handler execution failure. The pipeline maps this to a 500 and releases
/// any idempotency reservation so a retry can re-execute.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

/// Application logic behind the pipeline. Implementations must be shareable
/// across workers.
pub trait Handler: Send + Sync {
    fn handle(&self, request: &Request) -> Result<Response, HandlerError>;
}

/// Built-in payment-style handler: acknowledges keyed POSTs with a receipt
/// and answers everything else with a generic acknowledgement.
pub struct PaymentHandler;

impl Handler for PaymentHandler {
    fn handle(&self, request: &Request) -> Result<Response, HandlerError> {
        let body = match (request.method, request.idempotency_key.as_deref()) {
            (Method::Post, Some(key)) => serde_json::json!({
                "status": "success",
                "message": "Payment processed",
                "idempotency_key": key,
                "body_size": request.body.len(),
            }),
            _ => serde_json::json!({
                "status": "success",
                "message": "Request received",
                "method": request.method.as_str(),
                "uri": request.uri,
            }),
        };
        Ok(Response::json(200, &body))
    }
}
