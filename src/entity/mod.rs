mod remote;
mod schema;
mod validation;

pub use schema::{Parser, Schema};
pub use validation::{ValidationFailure, Validator};

use crate::events::{names, Emitter, Event, Observable, Payload};
use crate::group::{Group, GroupInner};
use crate::path::{self, Found, MergeOptions};
use crate::sync::{LoopbackTransport, Target, Transport};
use serde_json::{Map, Value};
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

#[cfg(test)]
mod tests;

static NEXT_CID: AtomicU64 = AtomicU64::new(1);

/// Process-unique client id with the given prefix ("m1", "c2", ...)
pub(crate) fn unique_id(prefix: &str) -> String {
    format!("{}{}", prefix, NEXT_CID.fetch_add(1, Ordering::Relaxed))
}

/// Options for [`Entity::set`]
#[derive(Debug, Clone, Copy)]
pub struct SetOptions {
    /// Skip `changed:*` and `changed` notifications
    pub silent: bool,
    /// Remove the written paths instead of assigning them
    pub unset: bool,
    /// Run the schema validator before mutating
    pub validate: bool,
}

impl SetOptions {
    pub fn silent() -> Self {
        Self {
            silent: true,
            ..Self::default()
        }
    }

    /// No validation; used for data coming back from the transport
    pub fn trusted() -> Self {
        Self {
            validate: false,
            ..Self::default()
        }
    }
}

impl Default for SetOptions {
    fn default() -> Self {
        Self {
            silent: false,
            unset: false,
            validate: true,
        }
    }
}

/// Options for [`Entity::build`]
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Run the schema parser over the raw attributes first
    pub parse: bool,
    pub validate: bool,
    /// Owning group
    pub group: Option<Group>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            parse: false,
            validate: true,
            group: None,
        }
    }
}

struct State {
    attributes: Value,
    id: Option<Value>,
    /// Paths changed since the last outermost `set` began
    changed: Map<String, Value>,
    /// Snapshot taken when the outermost `set` began
    previous: Value,
    changing: bool,
    /// One token per nested `set` that still owes a `changed` notification
    pending: Vec<SetOptions>,
    validation_error: Option<ValidationFailure>,
    group: Option<Weak<GroupInner>>,
}

pub(crate) struct EntityInner {
    cid: String,
    schema: Rc<Schema>,
    events: Emitter,
    state: RefCell<State>,
}

/// A record with a client id, a path-addressable attribute store and
/// change tracking. Cloning yields another handle to the same entity.
#[derive(Clone)]
pub struct Entity(Rc<EntityInner>);

impl Entity {
    /// Entity with the default schema
    pub fn new(attrs: Value) -> Self {
        Self::build(Rc::new(Schema::default()), attrs, BuildOptions::default())
    }

    pub fn with_schema(schema: &Rc<Schema>, attrs: Value) -> Self {
        Self::build(schema.clone(), attrs, BuildOptions::default())
    }

    /// Full construction path: pre hooks, client id, parse, defaults, initial
    /// `set`, post hooks. A validation failure leaves the entity empty with
    /// [`Entity::validation_error`] set.
    pub fn build(schema: Rc<Schema>, attrs: Value, options: BuildOptions) -> Self {
        let mut attrs = match attrs {
            Value::Object(_) => attrs,
            _ => Value::Object(Map::new()),
        };
        schema.hooks.run_pre(&mut attrs);

        let entity = Entity(Rc::new(EntityInner {
            cid: unique_id(&schema.cid_prefix),
            schema: schema.clone(),
            events: Emitter::new(),
            state: RefCell::new(State {
                attributes: Value::Object(Map::new()),
                id: None,
                changed: Map::new(),
                previous: Value::Object(Map::new()),
                changing: false,
                pending: Vec::new(),
                validation_error: None,
                group: options.group.as_ref().map(Group::downgrade),
            }),
        }));

        if options.parse {
            attrs = entity.parse(attrs);
        }
        path::fill_defaults(&mut attrs, &schema.defaults);

        let initial = SetOptions {
            validate: options.validate,
            ..SetOptions::default()
        };
        if entity.set(attrs, &initial).is_ok() {
            entity.0.state.borrow_mut().changed.clear();
        }

        schema.hooks.run_post(&entity);
        entity
    }

    pub fn cid(&self) -> &str {
        &self.0.cid
    }

    pub fn schema(&self) -> &Rc<Schema> {
        &self.0.schema
    }

    pub fn id_field(&self) -> &str {
        &self.0.schema.id_field
    }

    /// Persistent id, read from the id field on every write to it
    pub fn id(&self) -> Option<Value> {
        self.0.state.borrow().id.clone()
    }

    /// Deep copy of the current attributes
    pub fn attributes(&self) -> Value {
        self.0.state.borrow().attributes.clone()
    }

    pub fn to_json(&self) -> Value {
        self.attributes()
    }

    /// Value at `path`; wildcard paths collapse to an array
    pub fn get(&self, path: &str) -> Option<Value> {
        self.lookup(path).map(Found::into_value)
    }

    /// Value at `path` keeping the missing/hole distinction of wildcard paths
    pub fn lookup(&self, path: &str) -> Option<Found> {
        path::search(&self.0.state.borrow().attributes, path)
    }

    /// True when `path` holds a non-null value
    pub fn has(&self, path: &str) -> bool {
        matches!(self.get(path), Some(value) if !value.is_null())
    }

    /// Merge `attrs` (nested, or flat dotted paths) into the attributes.
    ///
    /// Fires `changed:<path>` for every ancestry entry of every changed path,
    /// then a single `changed` once the outermost call unwinds. Nested calls
    /// made from handlers join the running batch; `changed` is re-fired until
    /// no nested change is left.
    pub fn set(&self, attrs: Value, options: &SetOptions) -> Result<(), ValidationFailure> {
        if !attrs.is_object() {
            return Ok(());
        }
        self.validate(&attrs, options)?;

        let id_field = self.id_field().to_string();
        let (was_changing, trails, id_change) = {
            let mut state = self.0.state.borrow_mut();
            let was_changing = state.changing;
            state.changing = true;
            if !was_changing {
                state.previous = state.attributes.clone();
                state.changed.clear();
            }

            let previous_flat = path::flatten(&state.previous);
            let current_flat = path::flatten(&state.attributes);
            let incoming = path::flatten(&attrs);

            let mut changed_paths = Vec::new();
            for (key, value) in &incoming {
                // merge_set drops these too
                if !options.unset && !path::writable(&state.attributes, key) {
                    continue;
                }
                let (differs_now, differs_from_previous) = if options.unset {
                    (holds(&current_flat, key), holds(&previous_flat, key))
                } else {
                    (
                        current_flat.get(key) != Some(value),
                        previous_flat.get(key) != Some(value),
                    )
                };

                if differs_now {
                    changed_paths.push(key.clone());
                }
                if differs_from_previous {
                    let recorded = if options.unset { Value::Null } else { value.clone() };
                    state.changed.insert(key.clone(), recorded);
                } else {
                    state.changed.remove(key);
                }
            }

            let attributes = std::mem::take(&mut state.attributes);
            state.attributes = path::merge_set(
                attributes,
                &attrs,
                MergeOptions {
                    unset: options.unset,
                },
            );

            let id_change = if incoming.contains_key(&id_field) {
                let previous_id = state.id.take();
                state.id = path::resolve(&state.attributes, &id_field)
                    .filter(|id| !id.is_null())
                    .cloned();
                Some(previous_id)
            } else {
                None
            };

            let after = path::flatten(&state.attributes);
            let trails: Vec<(Vec<String>, Option<Value>)> = changed_paths
                .iter()
                .map(|key| {
                    let mut trail = path::ancestry(key, true);
                    trail.reverse();
                    (trail, after.get(key).cloned())
                })
                .collect();

            if !options.silent && !trails.is_empty() {
                state.pending.push(*options);
            }
            (was_changing, trails, id_change)
        };

        debug!(cid = %self.cid(), changes = trails.len(), nested = was_changing, "Entity set");

        if let Some(previous) = id_change {
            self.trigger(
                names::ID_CHANGED,
                Payload::IdChanged {
                    entity: self.clone(),
                    previous,
                },
            );
        }

        if !options.silent {
            for (trail, value) in &trails {
                for path in trail {
                    // Dispatched as-is; attribute keys may contain spaces
                    self.0.events.trigger_event(&Event {
                        name: names::changed_path(path),
                        payload: Payload::Change {
                            entity: self.clone(),
                            value: value.clone(),
                        },
                    });
                }
            }
        }

        if was_changing {
            return Ok(());
        }

        if !options.silent {
            loop {
                let drained = std::mem::take(&mut self.0.state.borrow_mut().pending);
                if drained.is_empty() {
                    break;
                }
                self.trigger(
                    names::CHANGED,
                    Payload::Changed {
                        entity: self.clone(),
                    },
                );
            }
        }

        let mut state = self.0.state.borrow_mut();
        state.pending.clear();
        state.changing = false;
        Ok(())
    }

    /// `set` for a single path
    pub fn set_path(
        &self,
        path: &str,
        value: Value,
        options: &SetOptions,
    ) -> Result<(), ValidationFailure> {
        let mut attrs = Map::new();
        attrs.insert(path.to_string(), value);
        self.set(Value::Object(attrs), options)
    }

    /// Remove `path`; arrays along the path stay dense
    pub fn unset(&self, path: &str, options: &SetOptions) -> Result<(), ValidationFailure> {
        self.set_path(
            path,
            Value::Null,
            &SetOptions {
                unset: true,
                ..*options
            },
        )
    }

    /// Remove every top-level attribute
    pub fn clear(&self, options: &SetOptions) -> Result<(), ValidationFailure> {
        let attrs: Map<String, Value> = match &self.0.state.borrow().attributes {
            Value::Object(map) => map.keys().map(|key| (key.clone(), Value::Null)).collect(),
            _ => Map::new(),
        };
        self.set(
            Value::Object(attrs),
            &SetOptions {
                unset: true,
                ..*options
            },
        )
    }

    /// Whether the last batch changed anything, or changed exactly `path`
    pub fn has_changed(&self, path: Option<&str>) -> bool {
        let state = self.0.state.borrow();
        match path {
            Some(path) => state.changed.contains_key(path),
            None => !state.changed.is_empty(),
        }
    }

    /// Without a candidate, the changed set of the last batch. With one, the
    /// candidate entries that differ from the current attributes (or from the
    /// batch snapshot while a batch is running). `None` when nothing differs.
    pub fn changed_attributes(&self, candidate: Option<&Value>) -> Option<Map<String, Value>> {
        let state = self.0.state.borrow();
        let Some(candidate) = candidate else {
            return (!state.changed.is_empty()).then(|| state.changed.clone());
        };

        let base = if state.changing {
            &state.previous
        } else {
            &state.attributes
        };
        let old = path::flatten(base);
        let diff: Map<String, Value> = path::flatten(candidate)
            .into_iter()
            .filter(|(key, value)| old.get(key) != Some(value))
            .collect();
        (!diff.is_empty()).then_some(diff)
    }

    /// Value at `path` when the last batch began
    pub fn previous(&self, path: &str) -> Option<Value> {
        path::search(&self.0.state.borrow().previous, path).map(Found::into_value)
    }

    pub fn previous_attributes(&self) -> Value {
        self.0.state.borrow().previous.clone()
    }

    /// Never persisted: no id value
    pub fn is_new(&self) -> bool {
        !self.has(self.id_field())
    }

    /// Re-run validation against the current attributes
    pub fn is_valid(&self) -> bool {
        let forced = SetOptions {
            validate: true,
            ..SetOptions::default()
        };
        self.validate(&Value::Object(Map::new()), &forced).is_ok()
    }

    /// Result of the last failed validation, cleared by the next passing one
    pub fn validation_error(&self) -> Option<ValidationFailure> {
        self.0.state.borrow().validation_error.clone()
    }

    /// Every path of `attrs` holds an equal value here
    pub fn matches(&self, attrs: &Value) -> bool {
        let state = self.0.state.borrow();
        path::flatten(attrs)
            .iter()
            .all(|(key, value)| path::resolve(&state.attributes, key) == Some(value))
    }

    /// Run the schema parser, if any
    pub fn parse(&self, response: Value) -> Value {
        match &self.0.schema.parser {
            Some(parser) => parser(response),
            None => response,
        }
    }

    /// New entity of the same schema with a copy of the attributes
    pub fn duplicate(&self) -> Entity {
        Entity::build(
            self.0.schema.clone(),
            self.attributes(),
            BuildOptions {
                validate: false,
                ..BuildOptions::default()
            },
        )
    }

    /// Owning group, if still alive
    pub fn group(&self) -> Option<Group> {
        self.0
            .state
            .borrow()
            .group
            .as_ref()
            .and_then(Group::upgrade)
    }

    pub fn ptr_eq(&self, other: &Entity) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn attach(&self, group: &Group) {
        let mut state = self.0.state.borrow_mut();
        if state.group.as_ref().and_then(Group::upgrade).is_none() {
            state.group = Some(group.downgrade());
        }
    }

    pub(crate) fn detach(&self, group: &Group) {
        let mut state = self.0.state.borrow_mut();
        let owned = state
            .group
            .as_ref()
            .and_then(Group::upgrade)
            .is_some_and(|owner| owner.ptr_eq(group));
        if owned {
            state.group = None;
        }
    }

    /// Swap the attribute store without notifications
    pub(crate) fn replace_attributes(&self, attributes: Value) {
        self.0.state.borrow_mut().attributes = attributes;
    }

    pub(crate) fn transport(&self) -> Rc<dyn Transport> {
        self.0
            .schema
            .transport
            .clone()
            .or_else(|| self.group().and_then(|group| group.schema().transport.clone()))
            .unwrap_or_else(|| Rc::new(LoopbackTransport))
    }

    fn validate(&self, attrs: &Value, options: &SetOptions) -> Result<(), ValidationFailure> {
        if !options.validate {
            return Ok(());
        }
        let Some(validator) = self.0.schema.validator.clone() else {
            return Ok(());
        };

        let prospective = path::merge_set(
            self.attributes(),
            attrs,
            MergeOptions {
                unset: options.unset,
            },
        );
        let result = validator(&prospective);
        self.0.state.borrow_mut().validation_error = result.as_ref().err().cloned();

        if let Err(error) = &result {
            warn!(cid = %self.cid(), error = %error, "Entity validation failed");
            self.trigger(
                names::INVALID,
                Payload::Invalid {
                    target: Target::Entity(self.clone()),
                    error: error.clone(),
                },
            );
        }
        result
    }
}

// Exact path, or anything nested below it
fn holds(flat: &Map<String, Value>, key: &str) -> bool {
    flat.contains_key(key)
        || flat
            .keys()
            .any(|candidate| candidate.len() > key.len() && candidate.starts_with(key) && candidate.as_bytes()[key.len()] == b'.')
}

impl Observable for Entity {
    fn emitter(&self) -> &Emitter {
        &self.0.events
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("cid", &self.0.cid)
            .field("attributes", &self.0.state.borrow().attributes)
            .finish()
    }
}
