use super::{Entity, SetOptions};
use crate::events::{names, Observable, Payload};
use crate::path::{self, MergeOptions};
use crate::sync::{self, caller, SyncError, SyncOptions, Target, Verb};
use serde_json::Value;
use std::cell::Cell;
use std::rc::Rc;
use tracing::debug;

impl Entity {
    /// Where this entity lives remotely: the schema's `url_root`, else the
    /// owning group's URL, followed by `/<id>` once persisted.
    pub fn url(&self) -> Result<String, SyncError> {
        let base = match &self.schema().url_root {
            Some(root) => root.clone(),
            None => self
                .group()
                .ok_or(SyncError::MissingUrl)
                .and_then(|group| group.url())?,
        };
        if self.is_new() {
            return Ok(base);
        }

        let id = match self.id() {
            Some(Value::String(id)) => id,
            Some(other) => other.to_string(),
            None => return Ok(base),
        };
        let separator = if base.is_empty() || base.ends_with('/') { "" } else { "/" };
        Ok(format!("{}{}{}", base, separator, urlencoding::encode(&id)))
    }

    /// Read this entity and apply the response
    pub fn fetch(&self, options: SyncOptions) -> Result<sync::Request, SyncError> {
        let target = Target::Entity(self.clone());
        let entity = self.clone();
        let parse = options.parse;
        let silent = options.silent;
        let callback = options.success.clone();

        let on_success = Box::new(move |response: Value| {
            let attrs = if parse { entity.parse(response.clone()) } else { response.clone() };
            let trusted = SetOptions {
                silent,
                ..SetOptions::trusted()
            };
            if entity.set(attrs, &trusted).is_err() {
                return;
            }
            let target = Target::Entity(entity.clone());
            if let Some(callback) = &callback {
                callback(&target, &response);
            }
            let payload = Payload::Synced { target, response };
            entity.trigger(names::FETCHED, payload.clone());
            entity.trigger(names::SYNCED, payload);
        });
        let on_error = sync::wrap_error(target.clone(), options.error.clone(), caller::FETCH);

        sync::sync(&target, Verb::Read, &options, caller::FETCH, on_success, on_error)
    }

    /// Persist this entity, optionally setting `attrs` first.
    ///
    /// Without `wait`, `attrs` are applied (and validated) right away. With
    /// `wait`, they are only validated; the request is built as if they were
    /// applied, and they land together with the response.
    pub fn save(
        &self,
        attrs: Option<Value>,
        options: SyncOptions,
    ) -> Result<sync::Request, SyncError> {
        let attrs = attrs.filter(Value::is_object);
        let wait = options.wait;
        let checked = SetOptions {
            silent: options.silent,
            ..SetOptions::default()
        };

        match &attrs {
            Some(attrs) if !wait => self.set(attrs.clone(), &checked)?,
            Some(attrs) => self.validate(attrs, &checked)?,
            None => self.validate(&Value::Object(Default::default()), &checked)?,
        }

        let original = self.attributes();
        let temp_installed = Rc::new(Cell::new(false));

        let entity = self.clone();
        let parse = options.parse;
        let silent = options.silent;
        let callback = options.success.clone();
        let pending_attrs = attrs.clone();
        let restore_from_success = (original.clone(), temp_installed.clone());

        let on_success = Box::new(move |response: Value| {
            let (original, installed) = restore_from_success;
            if installed.replace(false) {
                entity.replace_attributes(original);
            }

            let mut server_attrs = if parse { entity.parse(response.clone()) } else { response.clone() };
            if wait {
                let local = pending_attrs.unwrap_or_else(|| Value::Object(Default::default()));
                server_attrs = match server_attrs {
                    Value::Object(_) => path::merge_set(local, &server_attrs, MergeOptions::default()),
                    _ => local,
                };
            }
            if server_attrs.is_object() {
                let trusted = SetOptions {
                    silent,
                    ..SetOptions::trusted()
                };
                if entity.set(server_attrs, &trusted).is_err() {
                    return;
                }
            }

            let target = Target::Entity(entity.clone());
            if let Some(callback) = &callback {
                callback(&target, &response);
            }
            let payload = Payload::Synced { target, response };
            entity.trigger(names::SAVED, payload.clone());
            entity.trigger(names::SYNCED, payload);
        });

        let target = Target::Entity(self.clone());
        let on_error = sync::wrap_error(target.clone(), options.error.clone(), caller::SAVE);

        // Build the request as if waiting attributes were already applied
        if let (Some(attrs), true) = (&attrs, wait) {
            self.replace_attributes(path::merge_set(original.clone(), attrs, MergeOptions::default()));
            temp_installed.set(true);
        }

        let verb = if self.is_new() {
            Verb::Create
        } else if options.patch {
            Verb::Patch
        } else {
            Verb::Update
        };
        let mut options = options;
        if verb == Verb::Patch && options.attrs.is_none() {
            options.attrs = attrs;
        }
        debug!(cid = %self.cid(), verb = ?verb, wait, "Saving entity");

        let result = sync::sync(&target, verb, &options, caller::SAVE, on_success, on_error);

        if temp_installed.replace(false) {
            self.replace_attributes(original);
        }
        result
    }

    /// Delete this entity remotely. A new entity has nothing to delete and is
    /// only destroyed locally, returning `Ok(None)`.
    pub fn destroy(&self, options: SyncOptions) -> Result<Option<sync::Request>, SyncError> {
        let wait = options.wait;
        let callback = options.success.clone();
        let was_new = self.is_new();

        let detach = {
            let entity = self.clone();
            move || {
                entity.emitter().stop_listening(None, None, None);
                entity.trigger(
                    names::DESTROYED,
                    Payload::Destroyed {
                        entity: entity.clone(),
                        group: entity.group(),
                    },
                );
            }
        };

        let entity = self.clone();
        let on_detach = detach.clone();
        let on_success = move |response: Value| {
            if wait {
                on_detach();
            }
            let target = Target::Entity(entity.clone());
            if let Some(callback) = &callback {
                callback(&target, &response);
            }
            if !was_new {
                entity.trigger(names::SYNCED, Payload::Synced { target, response });
            }
        };

        if was_new {
            if !wait {
                detach();
            }
            on_success(Value::Null);
            return Ok(None);
        }

        let target = Target::Entity(self.clone());
        let on_error = sync::wrap_error(target.clone(), options.error.clone(), caller::DESTROY);
        let request = sync::sync(
            &target,
            Verb::Delete,
            &options,
            caller::DESTROY,
            Box::new(on_success),
            on_error,
        )?;
        if !wait {
            detach();
        }
        Ok(Some(request))
    }
}
