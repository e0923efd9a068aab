use super::{Body, Request};
use serde_json::Value;
use tracing::debug;

/// Outcome of a finished request
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Value),
    Failure(Value),
}

type Handler = Box<dyn FnOnce(Value)>;

/// One-shot completion handle handed to a [`Transport`].
///
/// Consumed by whichever outcome is delivered, so a request completes at most
/// once. Dropping it without settling is the "neither" case.
pub struct Responder {
    on_success: Handler,
    on_error: Handler,
}

impl Responder {
    pub fn new(on_success: Handler, on_error: Handler) -> Self {
        Self {
            on_success,
            on_error,
        }
    }

    pub fn succeed(self, response: Value) {
        (self.on_success)(response);
    }

    pub fn fail(self, response: Value) {
        (self.on_error)(response);
    }

    pub fn settle(self, outcome: Outcome) {
        match outcome {
            Outcome::Success(response) => self.succeed(response),
            Outcome::Failure(response) => self.fail(response),
        }
    }
}

/// Executes requests built by [`super::sync`].
///
/// Implementations may settle the responder inline or keep it and settle it
/// later; the core never blocks on either.
pub trait Transport {
    fn send(&self, request: Request, responder: Responder);
}

/// Default transport: answers every request inline with its own JSON body
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopbackTransport;

impl Transport for LoopbackTransport {
    fn send(&self, request: Request, responder: Responder) {
        debug!(url = %request.url, method = %request.method, "Loopback request");
        let response = match request.body {
            Some(Body::Json(body)) => body,
            _ => Value::Null,
        };
        responder.succeed(response);
    }
}
