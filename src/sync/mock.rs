use super::{Method, Outcome, Request, Responder, Transport};
use crate::config::MockConfig;
use serde_json::Value;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Canned answer for a mocked request
#[derive(Clone)]
pub enum MockResponse {
    Body(Value),
    /// Computed from the request; `None` fails the request
    Handler(Rc<dyn Fn(&Request) -> Option<Value>>),
}

struct Route {
    method: Method,
    /// Exact URL (query string ignored); `None` matches any URL
    url: Option<String>,
    response: MockResponse,
}

struct Deferred {
    due: Instant,
    outcome: Outcome,
    responder: Responder,
}

/// Stand-in transport answering from canned responses.
///
/// With no delay every request settles inline. With a delay, responses are
/// queued and delivered by [`MockTransport::run_due`], [`MockTransport::flush`]
/// or [`MockTransport::settle`]. A request without a matching response fails.
pub struct MockTransport {
    delay: Duration,
    routes: RefCell<Vec<Route>>,
    queue: RefCell<Vec<Deferred>>,
    log: RefCell<Vec<Request>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            routes: RefCell::new(Vec::new()),
            queue: RefCell::new(Vec::new()),
            log: RefCell::new(Vec::new()),
        }
    }

    pub fn from_config(config: &MockConfig) -> Self {
        Self::with_delay(Duration::from_millis(config.delay_ms))
    }

    /// Answer every `method` request with `body`
    pub fn respond(&self, method: Method, body: Value) -> &Self {
        self.route(method, None, MockResponse::Body(body))
    }

    /// Answer `method` requests to `url` with `body`; wins over [`MockTransport::respond`]
    pub fn respond_at(&self, method: Method, url: &str, body: Value) -> &Self {
        self.route(method, Some(url.to_string()), MockResponse::Body(body))
    }

    pub fn respond_with<F>(&self, method: Method, handler: F) -> &Self
    where
        F: Fn(&Request) -> Option<Value> + 'static,
    {
        self.route(method, None, MockResponse::Handler(Rc::new(handler)))
    }

    /// Every request seen so far, oldest first
    pub fn requests(&self) -> Vec<Request> {
        self.log.borrow().clone()
    }

    pub fn last_request(&self) -> Option<Request> {
        self.log.borrow().last().cloned()
    }

    /// Responses queued but not delivered yet
    pub fn pending(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Deliver every response whose delay has elapsed; returns how many ran
    pub fn run_due(&self) -> usize {
        let now = Instant::now();
        let due: Vec<Deferred> = {
            let mut queue = self.queue.borrow_mut();
            let (due, waiting) = std::mem::take(&mut *queue)
                .into_iter()
                .partition(|deferred| deferred.due <= now);
            *queue = waiting;
            due
        };
        let count = due.len();
        for deferred in due {
            deferred.responder.settle(deferred.outcome);
        }
        count
    }

    /// Deliver every queued response now, delay or not, including responses
    /// to requests issued while delivering
    pub fn flush(&self) -> usize {
        let mut count = 0;
        loop {
            let queued = std::mem::take(&mut *self.queue.borrow_mut());
            if queued.is_empty() {
                return count;
            }
            for deferred in queued {
                count += 1;
                deferred.responder.settle(deferred.outcome);
            }
        }
    }

    /// Sleep until each queued response is due and deliver it, until the
    /// queue is empty
    pub async fn settle(&self) -> usize {
        let mut count = 0;
        loop {
            let next = self.queue.borrow().iter().map(|deferred| deferred.due).min();
            let Some(due) = next else {
                return count;
            };
            tokio::time::sleep_until(tokio::time::Instant::from_std(due)).await;
            count += self.run_due();
        }
    }

    fn route(&self, method: Method, url: Option<String>, response: MockResponse) -> &Self {
        self.routes.borrow_mut().push(Route {
            method,
            url,
            response,
        });
        self
    }

    fn lookup(&self, request: &Request) -> Option<MockResponse> {
        let path = request.url.split('?').next().unwrap_or_default();
        let routes = self.routes.borrow();
        let mut fallback = None;
        // Latest registration wins
        for route in routes.iter().rev().filter(|route| route.method == request.method) {
            match &route.url {
                Some(url) if url == path => return Some(route.response.clone()),
                Some(_) => {}
                None if fallback.is_none() => fallback = Some(route.response.clone()),
                None => {}
            }
        }
        fallback
    }

    fn answer(&self, request: &Request) -> Outcome {
        let body = match self.lookup(request) {
            Some(MockResponse::Body(body)) => Some(body),
            Some(MockResponse::Handler(handler)) => handler(request),
            None => None,
        };
        match body {
            Some(body) if !body.is_null() => Outcome::Success(body),
            _ => {
                warn!(method = %request.method, url = %request.url, "No mock response");
                Outcome::Failure(Value::Null)
            }
        }
    }
}

impl Transport for MockTransport {
    fn send(&self, request: Request, responder: Responder) {
        let outcome = self.answer(&request);
        debug!(
            method = %request.method,
            url = %request.url,
            delay_ms = self.delay.as_millis() as u64,
            "Mock request"
        );
        self.log.borrow_mut().push(request);

        if self.delay.is_zero() {
            responder.settle(outcome);
            return;
        }
        self.queue.borrow_mut().push(Deferred {
            due: Instant::now() + self.delay,
            outcome,
            responder,
        });
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTransport")
            .field("delay", &self.delay)
            .field("routes", &self.routes.borrow().len())
            .field("pending", &self.queue.borrow().len())
            .field("requests", &self.log.borrow().len())
            .finish()
    }
}
