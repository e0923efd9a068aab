mod iter;
mod remote;
mod schema;
mod sort;

pub use iter::{Entries, Keys, Values};
pub use schema::{GroupSchema, MemberFactory, SchemaFactory};
pub use sort::{compare_values, Comparator};

use crate::entity::{unique_id, BuildOptions, Entity, SetOptions, ValidationFailure};
use crate::events::{callback, names, Callback, Changes, Emitter, Event, Observable, Payload};
use crate::path;
use crate::sync::{LoopbackTransport, Target, Transport};
use serde_json::{Map, Value};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::{Rc, Weak};
use tracing::{debug, warn};

#[cfg(test)]
mod tests;

/// Errors from explicit group operations
#[derive(Debug, Clone, PartialEq)]
pub enum GroupError {
    MissingComparator,
}

impl fmt::Display for GroupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupError::MissingComparator => write!(f, "Cannot sort a group without a comparator"),
        }
    }
}

impl std::error::Error for GroupError {}

/// Input to reconciliation: an existing entity or raw attributes
#[derive(Debug, Clone)]
pub enum Item {
    Entity(Entity),
    /// Raw attributes, or a bare id / client id when used for lookup
    Attrs(Value),
}

impl Item {
    fn is(&self, entity: &Entity) -> bool {
        matches!(self, Item::Entity(own) if own.ptr_eq(entity))
    }
}

impl From<Entity> for Item {
    fn from(entity: Entity) -> Self {
        Item::Entity(entity)
    }
}

impl From<&Entity> for Item {
    fn from(entity: &Entity) -> Self {
        Item::Entity(entity.clone())
    }
}

impl From<Value> for Item {
    fn from(value: Value) -> Self {
        Item::Attrs(value)
    }
}

impl From<&str> for Item {
    fn from(key: &str) -> Self {
        Item::Attrs(Value::String(key.to_string()))
    }
}

/// Split a response body into reconciliation items
pub fn into_items(value: Value) -> Vec<Item> {
    match value {
        Value::Array(values) => values.into_iter().map(Item::Attrs).collect(),
        Value::Null => Vec::new(),
        other => vec![Item::Attrs(other)],
    }
}

/// Index key for an id value; only scalars are indexable
pub(crate) fn index_key(id: &Value) -> Option<String> {
    match id {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn id_key(entity: &Entity) -> Option<String> {
    entity.id().as_ref().and_then(index_key)
}

/// Options for [`Group::set`] and friends. The default reconciles fully:
/// add, remove and merge are all enabled.
#[derive(Debug, Clone, Copy)]
pub struct UpdateOptions {
    pub add: bool,
    pub remove: bool,
    pub merge: bool,
    /// Insertion position; negative counts from the end
    pub at: Option<isize>,
    /// Keep the comparator order
    pub sort: bool,
    pub silent: bool,
    /// Run group and member parsers over raw input
    pub parse: bool,
    pub validate: bool,
}

impl UpdateOptions {
    /// Add-only semantics: no removal, no merge
    pub fn adding() -> Self {
        Self {
            remove: false,
            merge: false,
            ..Self::default()
        }
    }

    pub fn at(mut self, at: isize) -> Self {
        self.at = Some(at);
        self
    }

    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    pub fn merge(mut self) -> Self {
        self.merge = true;
        self
    }

    pub(crate) fn entity_options(&self) -> SetOptions {
        SetOptions {
            silent: self.silent,
            unset: false,
            validate: self.validate,
        }
    }
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            add: true,
            remove: true,
            merge: true,
            at: None,
            sort: true,
            silent: false,
            parse: false,
            validate: true,
        }
    }
}

struct GroupState {
    members: Vec<Entity>,
    /// Client ids and persistent ids to members
    by_id: HashMap<String, Entity>,
    comparator: Option<Comparator>,
}

pub(crate) struct GroupInner {
    cid: String,
    schema: Rc<GroupSchema>,
    events: Emitter,
    form: Entity,
    state: RefCell<GroupState>,
}

/// Ordered, identity-indexed collection of entities.
///
/// Member events are relayed through the group. Cloning yields another
/// handle to the same group.
#[derive(Clone)]
pub struct Group(Rc<GroupInner>);

impl Group {
    /// Build a group and load `items` silently
    pub fn new(schema: Rc<GroupSchema>, items: Vec<Item>) -> Self {
        let mut items = items;
        schema.hooks.run_pre(&mut items);

        let form = Entity::build(
            schema.form.clone(),
            Value::Object(Map::new()),
            BuildOptions::default(),
        );
        let group = Group(Rc::new(GroupInner {
            cid: unique_id(&schema.cid_prefix),
            schema: schema.clone(),
            events: Emitter::new(),
            form,
            state: RefCell::new(GroupState {
                members: Vec::new(),
                by_id: HashMap::new(),
                comparator: schema.comparator.clone(),
            }),
        }));

        schema.hooks.run_post(&group);
        if !items.is_empty() {
            group.reset(items, &UpdateOptions::default().silent());
        }
        group
    }

    pub fn cid(&self) -> &str {
        &self.0.cid
    }

    pub fn schema(&self) -> &Rc<GroupSchema> {
        &self.0.schema
    }

    pub fn len(&self) -> usize {
        self.0.state.borrow().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the members in order
    pub fn members(&self) -> Vec<Entity> {
        self.0.state.borrow().members.clone()
    }

    pub(crate) fn members_at(&self, index: usize) -> Option<Entity> {
        self.0.state.borrow().members.get(index).cloned()
    }

    /// Member by persistent id, client id, raw attributes or entity
    pub fn get(&self, item: impl Into<Item>) -> Option<Entity> {
        self.resolve(&item.into())
    }

    pub fn has(&self, item: impl Into<Item>) -> bool {
        self.get(item).is_some()
    }

    /// Member at `index`; negative indices count from the end
    pub fn at(&self, index: isize) -> Option<Entity> {
        let state = self.0.state.borrow();
        let index = if index < 0 { index + state.members.len() as isize } else { index };
        usize::try_from(index)
            .ok()
            .and_then(|index| state.members.get(index).cloned())
    }

    pub fn index_of(&self, entity: &Entity) -> Option<usize> {
        self.0
            .state
            .borrow()
            .members
            .iter()
            .position(|member| member.ptr_eq(entity))
    }

    /// Members in `[start, end)`; negative bounds count from the end
    pub fn slice(&self, start: isize, end: Option<isize>) -> Vec<Entity> {
        let state = self.0.state.borrow();
        let len = state.members.len() as isize;
        let bound = |i: isize| {
            let i = if i < 0 { (i + len).max(0) } else { i.min(len) };
            i as usize
        };
        let (start, end) = (bound(start), bound(end.unwrap_or(len)));
        if start >= end {
            return Vec::new();
        }
        state.members[start..end].to_vec()
    }

    /// Members whose attributes match every path of `attrs`
    pub fn find_all(&self, attrs: &Value) -> Vec<Entity> {
        self.members()
            .into_iter()
            .filter(|entity| entity.matches(attrs))
            .collect()
    }

    pub fn find_where(&self, attrs: &Value) -> Option<Entity> {
        self.members().into_iter().find(|entity| entity.matches(attrs))
    }

    /// Value at `path` for every member; `null` where absent
    pub fn pluck(&self, path: &str) -> Vec<Value> {
        self.members()
            .iter()
            .map(|entity| entity.get(path).unwrap_or(Value::Null))
            .collect()
    }

    pub fn to_json(&self) -> Value {
        Value::Array(self.members().iter().map(Entity::to_json).collect())
    }

    /// New group of the same schema and comparator over the same members
    pub fn duplicate(&self) -> Group {
        let items = self.members().into_iter().map(Item::Entity).collect();
        let copy = Group::new(self.0.schema.clone(), Vec::new());
        copy.set_comparator(self.comparator());
        copy.reset(items, &UpdateOptions::default().silent());
        copy
    }

    pub fn comparator(&self) -> Option<Comparator> {
        self.0.state.borrow().comparator.clone()
    }

    pub fn set_comparator(&self, comparator: Option<Comparator>) {
        self.0.state.borrow_mut().comparator = comparator;
    }

    /// Companion entity whose attributes drive read queries
    pub fn form(&self) -> Entity {
        self.0.form.clone()
    }

    pub fn set_form(&self, attrs: Value) -> Result<(), ValidationFailure> {
        self.0.form.set(attrs, &SetOptions::default())
    }

    /// Run the schema parser, if any
    pub fn parse(&self, response: Value) -> Value {
        match &self.0.schema.parser {
            Some(parser) => parser(response),
            None => response,
        }
    }

    pub fn ptr_eq(&self, other: &Group) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn downgrade(&self) -> Weak<GroupInner> {
        Rc::downgrade(&self.0)
    }

    pub(crate) fn upgrade(weak: &Weak<GroupInner>) -> Option<Group> {
        weak.upgrade().map(Group)
    }

    pub(crate) fn transport(&self) -> Rc<dyn Transport> {
        self.0
            .schema
            .transport
            .clone()
            .unwrap_or_else(|| Rc::new(LoopbackTransport))
    }

    /// Add-only reconciliation; `merge` stays whatever `options` says
    pub fn add(&self, items: Vec<Item>, options: &UpdateOptions) -> Vec<Option<Entity>> {
        let options = UpdateOptions {
            add: true,
            remove: false,
            ..*options
        };
        self.set(items, &options)
    }

    pub fn add_one(&self, item: impl Into<Item>, options: &UpdateOptions) -> Option<Entity> {
        self.add(vec![item.into()], options).pop().flatten()
    }

    /// Append at the end
    pub fn push(&self, item: impl Into<Item>, options: &UpdateOptions) -> Option<Entity> {
        let at = self.len() as isize;
        self.add_one(item, &options.at(at))
    }

    /// Remove and return the last member
    pub fn pop(&self, options: &UpdateOptions) -> Option<Entity> {
        let last = self.at(-1)?;
        self.remove_one(&last, options)
    }

    /// Insert at the front
    pub fn unshift(&self, item: impl Into<Item>, options: &UpdateOptions) -> Option<Entity> {
        self.add_one(item, &options.at(0))
    }

    /// Remove and return the first member
    pub fn shift(&self, options: &UpdateOptions) -> Option<Entity> {
        let first = self.at(0)?;
        self.remove_one(&first, options)
    }

    /// Remove the members `items` resolve to. Fires `removed` per member and
    /// one `updated` when anything was removed.
    pub fn remove(&self, items: Vec<Item>, options: &UpdateOptions) -> Vec<Entity> {
        let removed = self.remove_models(&items, options.silent);
        if !options.silent && !removed.is_empty() {
            self.trigger(
                names::UPDATED,
                Payload::Updated {
                    group: self.clone(),
                    changes: Changes {
                        removed: removed.clone(),
                        ..Changes::default()
                    },
                },
            );
        }
        removed
    }

    pub fn remove_one(&self, item: impl Into<Item>, options: &UpdateOptions) -> Option<Entity> {
        self.remove(vec![item.into()], options).pop()
    }

    /// Reconcile the membership against `items`.
    ///
    /// Known items are merged into their member, unknown ones built and
    /// added, and (with `remove`) members not mentioned are evicted. A full
    /// add+remove pass without comparator or position adopts the input order.
    /// Returns the member each item resolved to, `None` for dropped items.
    pub fn set(&self, items: Vec<Item>, options: &UpdateOptions) -> Vec<Option<Entity>> {
        let items = if options.parse && items.iter().all(|item| matches!(item, Item::Attrs(_))) {
            let raw = Value::Array(
                items
                    .into_iter()
                    .filter_map(|item| match item {
                        Item::Attrs(value) => Some(value),
                        Item::Entity(_) => None,
                    })
                    .collect(),
            );
            into_items(self.parse(raw))
        } else {
            items
        };

        let len = self.len() as isize;
        let at = options.at.map(|at| {
            let at = if at > len { len } else { at };
            let at = if at < 0 { at + len + 1 } else { at };
            at.max(0) as usize
        });

        let comparator = self.comparator();
        let sortable = comparator.is_some() && at.is_none() && options.sort;
        let sort_field = comparator
            .as_ref()
            .and_then(|comparator| comparator.field_path().map(str::to_string));

        let mut resolved = Vec::with_capacity(items.len());
        let mut set_list: Vec<Entity> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut changes = Changes::default();
        let mut sort = false;

        for item in items {
            if let Some(existing) = self.resolve(&item) {
                if options.merge && !item.is(&existing) {
                    let attrs = match &item {
                        Item::Entity(entity) => entity.attributes(),
                        Item::Attrs(attrs) => attrs.clone(),
                    };
                    let attrs = if options.parse { existing.parse(attrs) } else { attrs };
                    if let Err(error) = existing.set(attrs, &options.entity_options()) {
                        debug!(cid = %existing.cid(), error = %error, "Merge rejected");
                    }
                    changes.merged.push(existing.clone());
                    if sortable && !sort {
                        sort = existing.has_changed(sort_field.as_deref());
                    }
                }
                if seen.insert(existing.cid().to_string()) {
                    set_list.push(existing.clone());
                }
                resolved.push(Some(existing));
            } else if options.add {
                match self.prepare(item, options) {
                    Ok(entity) => {
                        changes.added.push(entity.clone());
                        self.add_reference(&entity);
                        seen.insert(entity.cid().to_string());
                        set_list.push(entity.clone());
                        resolved.push(Some(entity));
                    }
                    Err(_) => resolved.push(None),
                }
            } else {
                resolved.push(None);
            }
        }

        if options.remove {
            let stale: Vec<Item> = self
                .members()
                .into_iter()
                .filter(|member| !seen.contains(member.cid()))
                .map(Item::Entity)
                .collect();
            if !stale.is_empty() {
                changes.removed = self.remove_models(&stale, options.silent);
            }
        }

        let mut order_changed = false;
        let replace = !sortable && options.add && options.remove;
        if !set_list.is_empty() && replace {
            let mut state = self.0.state.borrow_mut();
            order_changed = state.members.len() != set_list.len()
                || state
                    .members
                    .iter()
                    .zip(&set_list)
                    .any(|(member, next)| !member.ptr_eq(next));
            state.members = set_list;
        } else if !changes.added.is_empty() {
            if sortable {
                sort = true;
            }
            let mut state = self.0.state.borrow_mut();
            let position = at.unwrap_or(state.members.len()).min(state.members.len());
            state
                .members
                .splice(position..position, changes.added.iter().cloned());
        }

        if sort {
            if let Some(comparator) = &comparator {
                self.apply_sort(comparator);
            }
        }

        debug!(
            cid = %self.cid(),
            added = changes.added.len(),
            removed = changes.removed.len(),
            merged = changes.merged.len(),
            sorted = sort,
            "Group set"
        );

        if !options.silent {
            for (i, entity) in changes.added.iter().enumerate() {
                entity.trigger(
                    names::ADDED,
                    Payload::Added {
                        entity: entity.clone(),
                        group: self.clone(),
                        index: at.map(|at| at + i),
                    },
                );
            }
            if sort || order_changed {
                self.trigger(
                    names::SORTED,
                    Payload::Sorted {
                        group: self.clone(),
                    },
                );
            }
            if !changes.is_empty() {
                self.trigger(
                    names::UPDATED,
                    Payload::Updated {
                        group: self.clone(),
                        changes,
                    },
                );
            }
        }

        resolved
    }

    /// Replace the whole membership without granular events, then fire a
    /// single `reset` carrying the previous members.
    pub fn reset(&self, items: Vec<Item>, options: &UpdateOptions) -> Vec<Option<Entity>> {
        let previous = self.members();
        for member in &previous {
            self.remove_reference(member);
        }
        {
            let mut state = self.0.state.borrow_mut();
            state.members.clear();
            state.by_id.clear();
        }

        let added = self.add(
            items,
            &UpdateOptions {
                silent: true,
                ..*options
            },
        );
        if !options.silent {
            self.trigger(
                names::RESET,
                Payload::Reset {
                    group: self.clone(),
                    previous,
                },
            );
        }
        added
    }

    /// Re-apply the comparator to every member
    pub fn sort(&self, silent: bool) -> Result<(), GroupError> {
        let comparator = self.comparator().ok_or(GroupError::MissingComparator)?;
        self.apply_sort(&comparator);
        if !silent {
            self.trigger(
                names::SORTED,
                Payload::Sorted {
                    group: self.clone(),
                },
            );
        }
        Ok(())
    }

    fn apply_sort(&self, comparator: &Comparator) {
        // Comparators may read members; keep the state unborrowed meanwhile
        let mut members = std::mem::take(&mut self.0.state.borrow_mut().members);
        comparator.sort(&mut members);
        self.0.state.borrow_mut().members = members;
    }

    fn resolve(&self, item: &Item) -> Option<Entity> {
        let state = self.0.state.borrow();
        let lookup = |key: Option<String>| key.and_then(|key| state.by_id.get(&key).cloned());
        match item {
            Item::Entity(entity) => lookup(id_key(entity)).or_else(|| lookup(Some(entity.cid().to_string()))),
            Item::Attrs(attrs @ Value::Object(_)) => {
                lookup(path::resolve(attrs, self.0.schema.id_field()).and_then(index_key))
            }
            Item::Attrs(key) => lookup(index_key(key)),
        }
    }

    fn prepare(&self, item: Item, options: &UpdateOptions) -> Result<Entity, ValidationFailure> {
        let attrs = match item {
            Item::Entity(entity) => {
                entity.attach(self);
                return Ok(entity);
            }
            Item::Attrs(attrs) => attrs,
        };
        // A bare id or client id that resolved to nothing is not a new member
        if !attrs.is_object() && !options.parse {
            debug!(cid = %self.cid(), key = %attrs, "Dropping unresolved lookup key");
            return Err(ValidationFailure::new("member attributes must be an object"));
        }

        let entity = self.0.schema.factory.create_member(
            attrs,
            BuildOptions {
                parse: options.parse,
                validate: options.validate,
                group: Some(self.clone()),
            },
        );
        match entity.validation_error() {
            None => Ok(entity),
            Some(error) => {
                warn!(cid = %self.cid(), error = %error, "Dropping invalid member");
                self.trigger(
                    names::INVALID,
                    Payload::Invalid {
                        target: Target::Group(self.clone()),
                        error: error.clone(),
                    },
                );
                Err(error)
            }
        }
    }

    // Splice out and unindex before `removed` fires, so handlers see the
    // post-removal state
    fn remove_models(&self, items: &[Item], silent: bool) -> Vec<Entity> {
        let mut removed = Vec::new();
        for item in items {
            let Some(entity) = self.resolve(item) else {
                continue;
            };
            let index = {
                let mut state = self.0.state.borrow_mut();
                let Some(index) = state.members.iter().position(|m| m.ptr_eq(&entity)) else {
                    continue;
                };
                state.members.remove(index);
                unindex(&mut state.by_id, &entity);
                index
            };

            if !silent {
                entity.trigger(
                    names::REMOVED,
                    Payload::Removed {
                        entity: entity.clone(),
                        group: self.clone(),
                        index,
                    },
                );
            }
            removed.push(entity.clone());
            self.remove_reference(&entity);
        }
        removed
    }

    fn add_reference(&self, entity: &Entity) {
        {
            let mut state = self.0.state.borrow_mut();
            state.by_id.insert(entity.cid().to_string(), entity.clone());
            if let Some(key) = id_key(entity) {
                state.by_id.insert(key, entity.clone());
            }
        }
        entity
            .emitter()
            .on_with_context(names::ALL, self.relay(), self.0.events.id());
    }

    fn remove_reference(&self, entity: &Entity) {
        unindex(&mut self.0.state.borrow_mut().by_id, entity);
        entity.detach(self);
        entity.emitter().off(None, None, Some(self.0.events.id()));
    }

    fn relay(&self) -> Callback {
        let group = self.downgrade();
        callback(move |event| {
            if let Some(group) = Group::upgrade(&group) {
                group.on_member_event(event);
            }
        })
    }

    fn on_member_event(&self, event: &Event) {
        match &event.payload {
            Payload::Added { group, .. } | Payload::Removed { group, .. }
                if (event.name == names::ADDED || event.name == names::REMOVED)
                    && !group.ptr_eq(self) =>
            {
                return;
            }
            Payload::Destroyed { entity, .. } if event.name == names::DESTROYED => {
                self.remove(vec![Item::Entity(entity.clone())], &UpdateOptions::default());
            }
            Payload::IdChanged { entity, previous } if event.name == names::ID_CHANGED => {
                let mut state = self.0.state.borrow_mut();
                if let Some(key) = previous.as_ref().and_then(index_key) {
                    if state.by_id.get(&key).is_some_and(|member| member.ptr_eq(entity)) {
                        state.by_id.remove(&key);
                    }
                }
                if let Some(key) = id_key(entity) {
                    state.by_id.insert(key, entity.clone());
                }
            }
            _ => {}
        }
        self.0.events.trigger_event(event);
    }
}

fn unindex(by_id: &mut HashMap<String, Entity>, entity: &Entity) {
    let keys = std::iter::once(entity.cid().to_string()).chain(id_key(entity));
    for key in keys {
        if by_id.get(&key).is_some_and(|member| member.ptr_eq(entity)) {
            by_id.remove(&key);
        }
    }
}

impl Observable for Group {
    fn emitter(&self) -> &Emitter {
        &self.0.events
    }
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.0.state.borrow();
        f.debug_struct("Group")
            .field("cid", &self.0.cid)
            .field("len", &state.members.len())
            .field("comparator", &state.comparator)
            .finish()
    }
}
