mod mock;
mod query;
mod transport;

pub use mock::{MockResponse, MockTransport};
pub use query::query_string;
pub use transport::{LoopbackTransport, Outcome, Responder, Transport};

use crate::entity::{Entity, ValidationFailure};
use crate::events::{names, Emitter, Observable, Payload};
use crate::group::Group;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::rc::Rc;
use tracing::{info, warn};
use uuid::Uuid;


pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_FORM: &str = "application/x-www-form-urlencoded";

/// Operation names used in scoped notifications (`request:fetch`, `save:error`)
pub mod caller {
    pub const FETCH: &str = "fetch";
    pub const SAVE: &str = "save";
    pub const DESTROY: &str = "destroy";
}

/// Persistence verb
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    Create,
    Read,
    Update,
    Patch,
    Delete,
}

impl Verb {
    pub fn method(self) -> Method {
        match self {
            Verb::Create => Method::Post,
            Verb::Read => Method::Get,
            Verb::Update => Method::Put,
            Verb::Patch => Method::Patch,
            Verb::Delete => Method::Delete,
        }
    }

    /// Verbs whose request carries the target's attributes
    pub fn carries_body(self) -> bool {
        matches!(self, Verb::Create | Verb::Update | Verb::Patch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "content", rename_all = "lowercase")]
pub enum Body {
    Json(Value),
    /// `application/x-www-form-urlencoded` payload
    Form(String),
}

/// Request descriptor handed to a [`Transport`]
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub id: Uuid,
    pub verb: Verb,
    pub method: Method,
    pub url: String,
    pub content_type: &'static str,
    pub body: Option<Body>,
    /// Query string appended to `url` for group reads
    pub query: Option<String>,
    pub caller: Option<String>,
    pub issued_at: DateTime<Utc>,
}

impl Request {
    /// JSON body, if any
    pub fn json(&self) -> Option<&Value> {
        match &self.body {
            Some(Body::Json(value)) => Some(value),
            _ => None,
        }
    }
}

/// Per-call success/error callback
pub type SyncCallback = Rc<dyn Fn(&Target, &Value)>;

/// Options shared by every remote operation
#[derive(Clone)]
pub struct SyncOptions {
    /// Apply the outcome only when the response arrives
    pub wait: bool,
    /// `save`: send only the given attributes with a `PATCH`
    pub patch: bool,
    /// Group `fetch`: reset instead of reconciling
    pub reset: bool,
    /// Run the target's parser over the response
    pub parse: bool,
    pub silent: bool,
    /// Overrides the derived URL
    pub url: Option<String>,
    /// Overrides the body derived from the target
    pub attrs: Option<Value>,
    /// Explicit request body, wins over `attrs`
    pub data: Option<Value>,
    /// Overrides the target's `emulate_json` setting
    pub emulate_json: Option<bool>,
    pub success: Option<SyncCallback>,
    pub error: Option<SyncCallback>,
}

impl SyncOptions {
    pub fn waiting() -> Self {
        Self {
            wait: true,
            ..Self::default()
        }
    }

    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: Fn(&Target, &Value) + 'static,
    {
        self.success = Some(Rc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&Target, &Value) + 'static,
    {
        self.error = Some(Rc::new(f));
        self
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            wait: false,
            patch: false,
            reset: false,
            parse: true,
            silent: false,
            url: None,
            attrs: None,
            data: None,
            emulate_json: None,
            success: None,
            error: None,
        }
    }
}

impl fmt::Debug for SyncOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncOptions")
            .field("wait", &self.wait)
            .field("patch", &self.patch)
            .field("reset", &self.reset)
            .field("parse", &self.parse)
            .field("silent", &self.silent)
            .field("url", &self.url)
            .field("attrs", &self.attrs)
            .field("data", &self.data)
            .field("emulate_json", &self.emulate_json)
            .field("success", &self.success.is_some())
            .field("error", &self.error.is_some())
            .finish()
    }
}

/// Errors raised before a request can be issued
#[derive(Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Neither the target nor its group can produce a URL
    MissingUrl,
    /// The attributes to persist failed validation
    Invalid(ValidationFailure),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::MissingUrl => write!(f, "A \"url\" property or function must be specified"),
            SyncError::Invalid(failure) => write!(f, "Validation failed: {}", failure),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<ValidationFailure> for SyncError {
    fn from(failure: ValidationFailure) -> Self {
        SyncError::Invalid(failure)
    }
}

/// Whatever a request is about
#[derive(Debug, Clone)]
pub enum Target {
    Entity(Entity),
    Group(Group),
}

impl Target {
    pub fn entity(&self) -> Option<&Entity> {
        match self {
            Target::Entity(entity) => Some(entity),
            Target::Group(_) => None,
        }
    }

    pub fn group(&self) -> Option<&Group> {
        match self {
            Target::Group(group) => Some(group),
            Target::Entity(_) => None,
        }
    }

    pub fn cid(&self) -> &str {
        match self {
            Target::Entity(entity) => entity.cid(),
            Target::Group(group) => group.cid(),
        }
    }

    pub fn url(&self) -> Result<String, SyncError> {
        match self {
            Target::Entity(entity) => entity.url(),
            Target::Group(group) => group.url(),
        }
    }

    pub(crate) fn transport(&self) -> Rc<dyn Transport> {
        match self {
            Target::Entity(entity) => entity.transport(),
            Target::Group(group) => group.transport(),
        }
    }

    fn emulate_json(&self) -> bool {
        match self {
            Target::Entity(entity) => entity.schema().emulate_json,
            Target::Group(group) => group.schema().emulate_json,
        }
    }

    // Entities send their attributes, groups their form
    fn default_body(&self) -> Value {
        match self {
            Target::Entity(entity) => entity.to_json(),
            Target::Group(group) => group.form().to_json(),
        }
    }
}

impl Observable for Target {
    fn emitter(&self) -> &Emitter {
        match self {
            Target::Entity(entity) => entity.emitter(),
            Target::Group(group) => group.emitter(),
        }
    }
}

/// Build the request for `verb` on `target` and hand it to the target's
/// transport. Exactly one of `on_success`/`on_error` runs, now or later.
///
/// Emits `request` and `request:<caller>` before the transport sees the request.
pub fn sync(
    target: &Target,
    verb: Verb,
    options: &SyncOptions,
    caller: &str,
    on_success: Box<dyn FnOnce(Value)>,
    on_error: Box<dyn FnOnce(Value)>,
) -> Result<Request, SyncError> {
    let mut url = match &options.url {
        Some(url) => url.clone(),
        None => target.url()?,
    };

    let group_read = verb == Verb::Read && target.group().is_some();
    let mut data = match &options.data {
        Some(data) => Some(data.clone()),
        None if verb.carries_body() || group_read => {
            Some(options.attrs.clone().unwrap_or_else(|| target.default_body()))
        }
        None => None,
    }
    .filter(|data| !data.is_null());

    let mut query = None;
    if group_read {
        if let Some(data) = data.take() {
            url.push(if url.contains('?') { '&' } else { '?' });
            let encoded = query_string(&data);
            url.push_str(&encoded);
            query = Some(encoded);
        }
    }

    let emulate_json = options.emulate_json.unwrap_or_else(|| target.emulate_json());
    let (content_type, body) = if emulate_json {
        let form = match data {
            Some(data) => serde_urlencoded::to_string([("model", data.to_string())]).unwrap_or_default(),
            None => String::new(),
        };
        (CONTENT_TYPE_FORM, Some(Body::Form(form)))
    } else {
        (CONTENT_TYPE_JSON, data.map(Body::Json))
    };

    let request = Request {
        id: Uuid::now_v7(),
        verb,
        method: verb.method(),
        url,
        content_type,
        body,
        query,
        caller: Some(caller.to_string()),
        issued_at: Utc::now(),
    };

    info!(
        cid = %target.cid(),
        verb = ?verb,
        method = %request.method,
        url = %request.url,
        request_id = %request.id,
        "Sync request"
    );

    let payload = Payload::Request {
        target: target.clone(),
        request: request.clone(),
    };
    target.trigger(names::REQUEST, payload.clone());
    target.trigger(&names::scoped(names::REQUEST, caller), payload);

    target
        .transport()
        .send(request.clone(), Responder::new(on_success, on_error));
    Ok(request)
}

/// Error continuation shared by every remote operation: runs the caller's
/// error callback, then emits `error` and `<caller>:error`.
pub(crate) fn wrap_error(
    target: Target,
    callback: Option<SyncCallback>,
    caller: &'static str,
) -> Box<dyn FnOnce(Value)> {
    Box::new(move |response: Value| {
        warn!(cid = %target.cid(), caller, response = %response, "Sync failed");
        if let Some(callback) = &callback {
            callback(&target, &response);
        }
        let payload = Payload::Failed {
            target: target.clone(),
            response,
        };
        target.trigger(names::ERROR, payload.clone());
        target.trigger(&names::scoped(caller, names::ERROR), payload);
    })
}
