use crate::entity::{Entity, ValidationFailure};
use crate::group::Group;
use crate::sync::{Request, Target};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};


/// Event names emitted by entities, groups and the sync layer
pub mod names {
    /// Wildcard subscription receiving every event after its named handlers
    pub const ALL: &str = "all";
    pub const CHANGED: &str = "changed";
    pub const ID_CHANGED: &str = "id-changed";
    pub const INVALID: &str = "invalid";
    pub const ADDED: &str = "added";
    pub const REMOVED: &str = "removed";
    pub const UPDATED: &str = "updated";
    pub const SORTED: &str = "sorted";
    pub const RESET: &str = "reset";
    pub const REQUEST: &str = "request";
    pub const SYNCED: &str = "synced";
    pub const FETCHED: &str = "fetched";
    pub const SAVED: &str = "saved";
    pub const DESTROYED: &str = "destroyed";
    pub const ERROR: &str = "error";

    /// `changed:<path>`
    pub fn changed_path(path: &str) -> String {
        format!("{}:{}", CHANGED, path)
    }

    /// `<base>:<caller>`, e.g. `request:fetch` or `fetch:error`
    pub fn scoped(base: &str, scope: &str) -> String {
        format!("{}:{}", base, scope)
    }
}

/// Subscription callback. Every callback receives the dispatched event,
/// including its concrete name.
pub type Callback = Rc<dyn Fn(&Event)>;

/// Wrap a closure as a [`Callback`]. Keep the returned handle to remove it later.
pub fn callback<F>(f: F) -> Callback
where
    F: Fn(&Event) + 'static,
{
    Rc::new(f)
}

/// A dispatched notification
#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    pub payload: Payload,
}

/// Data carried by a notification
#[derive(Debug, Clone)]
pub enum Payload {
    None,
    /// Free-form arguments for application-defined events
    Args(Vec<Value>),
    /// `changed:<path>`; `value` is the new value at the concrete changed path
    Change {
        entity: Entity,
        value: Option<Value>,
    },
    Changed {
        entity: Entity,
    },
    IdChanged {
        entity: Entity,
        previous: Option<Value>,
    },
    Invalid {
        target: Target,
        error: ValidationFailure,
    },
    /// `index` is set when the caller asked for an explicit position
    Added {
        entity: Entity,
        group: Group,
        index: Option<usize>,
    },
    Removed {
        entity: Entity,
        group: Group,
        index: usize,
    },
    Updated {
        group: Group,
        changes: Changes,
    },
    Sorted {
        group: Group,
    },
    Reset {
        group: Group,
        previous: Vec<Entity>,
    },
    Request {
        target: Target,
        request: Request,
    },
    Synced {
        target: Target,
        response: Value,
    },
    Failed {
        target: Target,
        response: Value,
    },
    Destroyed {
        entity: Entity,
        group: Option<Group>,
    },
}

impl Payload {
    /// The entity this notification is about, if any
    pub fn entity(&self) -> Option<&Entity> {
        match self {
            Payload::Change { entity, .. }
            | Payload::Changed { entity }
            | Payload::IdChanged { entity, .. }
            | Payload::Added { entity, .. }
            | Payload::Removed { entity, .. }
            | Payload::Destroyed { entity, .. } => Some(entity),
            Payload::Invalid { target, .. }
            | Payload::Request { target, .. }
            | Payload::Synced { target, .. }
            | Payload::Failed { target, .. } => target.entity(),
            _ => None,
        }
    }
}

/// Aggregate membership changes carried by `updated`
#[derive(Debug, Clone, Default)]
pub struct Changes {
    pub added: Vec<Entity>,
    pub removed: Vec<Entity>,
    pub merged: Vec<Entity>,
}

impl Changes {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.merged.is_empty()
    }
}

static NEXT_EMITTER_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_HANDLER_SEQ: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
struct Handler {
    seq: u64,
    callback: Callback,
    context: Option<u64>,
    /// Emitter that registered this handler through `listen_to*`
    listener: Option<u64>,
    /// Shared fired flag; every handler holding the same flag fires at most once in total
    once: Option<Rc<Cell<bool>>>,
}

#[derive(Clone)]
enum Once {
    Never,
    PerName,
    Shared(Rc<Cell<bool>>),
}

#[derive(Clone)]
struct Binding {
    context: Option<u64>,
    listener: Option<u64>,
    once: Once,
}

impl Binding {
    fn plain(once: Once) -> Self {
        Self {
            context: None,
            listener: None,
            once,
        }
    }
}

struct Registry {
    id: u64,
    handlers: HashMap<String, Vec<Handler>>,
    /// Emitters holding delegated subscriptions on this one
    listeners: HashMap<u64, Weak<RefCell<Registry>>>,
    /// Emitters this one holds delegated subscriptions on
    listening_to: HashMap<u64, Weak<RefCell<Registry>>>,
}

/// Publish/subscribe core shared by entities, groups and plain application objects.
///
/// Dispatch is synchronous. Every `trigger` works on a snapshot of the
/// subscription list, so subscriptions added or removed by a callback only
/// affect later triggers.
#[derive(Clone)]
pub struct Emitter {
    id: u64,
    registry: Rc<RefCell<Registry>>,
}

impl Emitter {
    pub fn new() -> Self {
        let id = NEXT_EMITTER_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            id,
            registry: Rc::new(RefCell::new(Registry {
                id,
                handlers: HashMap::new(),
                listeners: HashMap::new(),
                listening_to: HashMap::new(),
            })),
        }
    }

    fn from_registry(registry: Rc<RefCell<Registry>>) -> Self {
        let id = registry.borrow().id;
        Self { id, registry }
    }

    /// Process-unique emitter id, also usable as a subscription context
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Subscribe to one or more space-separated event names
    pub fn on(&self, names: &str, callback: Callback) -> &Self {
        self.register(names, &callback, &Binding::plain(Once::Never));
        self
    }

    /// Subscribe with a context id that `off` can later match on
    pub fn on_with_context(&self, names: &str, callback: Callback, context: u64) -> &Self {
        let binding = Binding {
            context: Some(context),
            listener: None,
            once: Once::Never,
        };
        self.register(names, &callback, &binding);
        self
    }

    pub fn on_map(&self, map: &[(&str, Callback)]) -> &Self {
        for (names, callback) in map {
            self.register(names, callback, &Binding::plain(Once::Never));
        }
        self
    }

    /// `on_map` where every entry shares `context`
    pub fn on_map_with_context(&self, map: &[(&str, Callback)], context: u64) -> &Self {
        let binding = Binding {
            context: Some(context),
            listener: None,
            once: Once::Never,
        };
        for (names, callback) in map {
            self.register(names, callback, &binding);
        }
        self
    }

    /// Like `on`, but each event name gets its own one-shot subscription
    pub fn once(&self, names: &str, callback: Callback) -> &Self {
        self.register(names, &callback, &Binding::plain(Once::PerName));
        self
    }

    pub fn once_map(&self, map: &[(&str, Callback)]) -> &Self {
        for (names, callback) in map {
            self.register(names, callback, &Binding::plain(Once::PerName));
        }
        self
    }

    /// Mutually exclusive one-shot subscriptions: the first event to fire
    /// runs its callback and cancels every other pair.
    pub fn once_off(&self, pairs: &[(&str, Callback)]) -> &Self {
        let binding = Binding::plain(Once::Shared(Rc::new(Cell::new(false))));
        for (names, callback) in pairs {
            self.register(names, callback, &binding);
        }
        self
    }

    /// Remove matching subscriptions. `None` arguments match anything.
    pub fn off(
        &self,
        names: Option<&str>,
        callback: Option<&Callback>,
        context: Option<u64>,
    ) -> &Self {
        let affected = {
            let mut registry = self.registry.borrow_mut();
            let keys: Vec<String> = match names {
                Some(names) => names.split_whitespace().map(str::to_string).collect(),
                None => registry.handlers.keys().cloned().collect(),
            };

            let mut affected = Vec::new();
            for key in keys {
                let Some(list) = registry.handlers.get_mut(&key) else {
                    continue;
                };
                list.retain(|handler| {
                    let matched = callback.map_or(true, |cb| Rc::ptr_eq(&handler.callback, cb))
                        && context.map_or(true, |ctx| handler.context == Some(ctx));
                    if matched {
                        if let Some(listener) = handler.listener {
                            affected.push(listener);
                        }
                    }
                    !matched
                });
                if list.is_empty() {
                    registry.handlers.remove(&key);
                }
            }
            affected
        };

        self.prune_listeners(affected);
        self
    }

    /// Dispatch `payload` under each space-separated name, then to `all` subscribers
    pub fn trigger(&self, names: &str, payload: Payload) -> &Self {
        for name in names.split_whitespace() {
            self.emit(&Event {
                name: name.to_string(),
                payload: payload.clone(),
            });
        }
        self
    }

    /// Re-dispatch an existing event under its own name
    pub fn trigger_event(&self, event: &Event) -> &Self {
        self.emit(event);
        self
    }

    /// Subscribe to `source` and remember the relationship here, so that
    /// `stop_listening` can undo it without a handle to `source`.
    pub fn listen_to(&self, source: &Emitter, names: &str, callback: Callback) -> &Self {
        self.listen(source, names, &callback, Once::Never);
        self
    }

    pub fn listen_to_map(&self, source: &Emitter, map: &[(&str, Callback)]) -> &Self {
        for (names, callback) in map {
            self.listen(source, names, callback, Once::Never);
        }
        self
    }

    pub fn listen_to_once(&self, source: &Emitter, names: &str, callback: Callback) -> &Self {
        self.listen(source, names, &callback, Once::PerName);
        self
    }

    pub fn listen_to_once_map(&self, source: &Emitter, map: &[(&str, Callback)]) -> &Self {
        for (names, callback) in map {
            self.listen(source, names, callback, Once::PerName);
        }
        self
    }

    /// Delegated form of [`Emitter::once_off`]
    pub fn listen_to_once_off(&self, source: &Emitter, pairs: &[(&str, Callback)]) -> &Self {
        let flag = Rc::new(Cell::new(false));
        for (names, callback) in pairs {
            self.listen(source, names, callback, Once::Shared(flag.clone()));
        }
        self
    }

    /// Cancel delegated subscriptions. Without `source`, every emitter this
    /// one listens to is visited.
    pub fn stop_listening(
        &self,
        source: Option<&Emitter>,
        names: Option<&str>,
        callback: Option<&Callback>,
    ) -> &Self {
        let sources: Vec<Emitter> = match source {
            Some(source) => {
                if self.registry.borrow().listening_to.contains_key(&source.id) {
                    vec![source.clone()]
                } else {
                    Vec::new()
                }
            }
            None => self
                .registry
                .borrow()
                .listening_to
                .values()
                .filter_map(Weak::upgrade)
                .map(Emitter::from_registry)
                .collect(),
        };

        for source in sources {
            source.off(names, callback, Some(self.id));
        }

        if source.is_none() {
            self.registry
                .borrow_mut()
                .listening_to
                .retain(|_, weak| weak.strong_count() > 0);
        }
        self
    }

    /// True while this emitter holds at least one delegated subscription on `source`
    pub fn is_listening_to(&self, source: &Emitter) -> bool {
        self.registry.borrow().listening_to.contains_key(&source.id)
    }

    /// Number of emitters this one listens to
    pub fn listening_count(&self) -> usize {
        self.registry.borrow().listening_to.len()
    }

    /// Number of emitters listening to this one
    pub fn listener_count(&self) -> usize {
        self.registry.borrow().listeners.len()
    }

    pub fn has_handlers(&self, name: &str) -> bool {
        self.registry.borrow().handlers.contains_key(name)
    }

    fn register(&self, names: &str, callback: &Callback, binding: &Binding) -> bool {
        let names: Vec<&str> = names.split_whitespace().collect();
        if names.is_empty() {
            return false;
        }

        let mut registry = self.registry.borrow_mut();
        for name in names {
            let once = match &binding.once {
                Once::Never => None,
                Once::PerName => Some(Rc::new(Cell::new(false))),
                Once::Shared(flag) => Some(flag.clone()),
            };
            registry
                .handlers
                .entry(name.to_string())
                .or_default()
                .push(Handler {
                    seq: NEXT_HANDLER_SEQ.fetch_add(1, Ordering::Relaxed),
                    callback: callback.clone(),
                    context: binding.context,
                    listener: binding.listener,
                    once,
                });
        }
        true
    }

    fn listen(&self, source: &Emitter, names: &str, callback: &Callback, once: Once) {
        let binding = Binding {
            context: Some(self.id),
            listener: Some(self.id),
            once,
        };
        if !source.register(names, callback, &binding) {
            return;
        }

        self.registry
            .borrow_mut()
            .listening_to
            .insert(source.id, Rc::downgrade(&source.registry));
        source
            .registry
            .borrow_mut()
            .listeners
            .insert(self.id, Rc::downgrade(&self.registry));
    }

    fn snapshot(&self, name: &str) -> Vec<Handler> {
        self.registry
            .borrow()
            .handlers
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    fn emit(&self, event: &Event) {
        let handlers = self.snapshot(&event.name);
        self.dispatch(event, handlers);

        // Re-read after the named handlers ran
        if event.name != names::ALL {
            let all = self.snapshot(names::ALL);
            self.dispatch(event, all);
        }
    }

    fn dispatch(&self, event: &Event, handlers: Vec<Handler>) {
        for handler in handlers {
            if let Some(flag) = &handler.once {
                if flag.get() {
                    continue;
                }
                flag.set(true);
                self.remove_fired(flag, handler.seq);
            }
            (handler.callback)(event);
        }
    }

    // Drop every handler sharing a fired once-flag
    fn remove_fired(&self, flag: &Rc<Cell<bool>>, seq: u64) {
        let affected = {
            let mut registry = self.registry.borrow_mut();
            let mut affected = Vec::new();
            registry.handlers.retain(|_, list| {
                list.retain(|handler| {
                    let fired = handler.seq == seq
                        || handler.once.as_ref().is_some_and(|f| Rc::ptr_eq(f, flag));
                    if fired {
                        if let Some(listener) = handler.listener {
                            affected.push(listener);
                        }
                    }
                    !fired
                });
                !list.is_empty()
            });
            affected
        };
        self.prune_listeners(affected);
    }

    // Forget listener records once a listener has no handlers left here
    fn prune_listeners(&self, mut listener_ids: Vec<u64>) {
        listener_ids.sort_unstable();
        listener_ids.dedup();

        for listener_id in listener_ids {
            let still_listening = self
                .registry
                .borrow()
                .handlers
                .values()
                .flatten()
                .any(|handler| handler.listener == Some(listener_id));
            if still_listening {
                continue;
            }

            let record = self.registry.borrow_mut().listeners.remove(&listener_id);
            if let Some(listener) = record.and_then(|weak| weak.upgrade()) {
                listener.borrow_mut().listening_to.remove(&self.id);
            }
        }
    }
}

impl Default for Emitter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.registry.borrow();
        f.debug_struct("Emitter")
            .field("id", &self.id)
            .field("events", &registry.handlers.len())
            .field("listening_to", &registry.listening_to.len())
            .finish()
    }
}

/// Publish/subscribe capability for any type owning an [`Emitter`].
///
/// Every method forwards to the emitter and returns `self` for chaining.
pub trait Observable {
    fn emitter(&self) -> &Emitter;

    fn on(&self, names: &str, callback: Callback) -> &Self {
        self.emitter().on(names, callback);
        self
    }

    fn on_with_context(&self, names: &str, callback: Callback, context: u64) -> &Self {
        self.emitter().on_with_context(names, callback, context);
        self
    }

    fn on_map(&self, map: &[(&str, Callback)]) -> &Self {
        self.emitter().on_map(map);
        self
    }

    fn on_map_with_context(&self, map: &[(&str, Callback)], context: u64) -> &Self {
        self.emitter().on_map_with_context(map, context);
        self
    }

    fn once(&self, names: &str, callback: Callback) -> &Self {
        self.emitter().once(names, callback);
        self
    }

    fn once_off(&self, pairs: &[(&str, Callback)]) -> &Self {
        self.emitter().once_off(pairs);
        self
    }

    fn off(&self, names: Option<&str>, callback: Option<&Callback>) -> &Self {
        self.emitter().off(names, callback, None);
        self
    }

    /// `off` narrowed to subscriptions registered under `context`
    fn off_with_context(
        &self,
        names: Option<&str>,
        callback: Option<&Callback>,
        context: u64,
    ) -> &Self {
        self.emitter().off(names, callback, Some(context));
        self
    }

    fn trigger(&self, names: &str, payload: Payload) -> &Self {
        self.emitter().trigger(names, payload);
        self
    }

    fn listen_to<S: Observable + ?Sized>(&self, source: &S, names: &str, callback: Callback) -> &Self {
        self.emitter().listen_to(source.emitter(), names, callback);
        self
    }

    fn listen_to_once<S: Observable + ?Sized>(
        &self,
        source: &S,
        names: &str,
        callback: Callback,
    ) -> &Self {
        self.emitter().listen_to_once(source.emitter(), names, callback);
        self
    }

    fn listen_to_once_off<S: Observable + ?Sized>(
        &self,
        source: &S,
        pairs: &[(&str, Callback)],
    ) -> &Self {
        self.emitter().listen_to_once_off(source.emitter(), pairs);
        self
    }

    fn stop_listening(&self) -> &Self {
        self.emitter().stop_listening(None, None, None);
        self
    }

    /// Cancel delegated subscriptions on one source, optionally by name and callback
    fn stop_listening_to<S: Observable + ?Sized>(
        &self,
        source: &S,
        names: Option<&str>,
        callback: Option<&Callback>,
    ) -> &Self {
        self.emitter()
            .stop_listening(Some(source.emitter()), names, callback);
        self
    }
}

impl Observable for Emitter {
    fn emitter(&self) -> &Emitter {
        self
    }
}
