use super::{into_items, Group, Item, UpdateOptions};
use crate::entity::{Entity, SetOptions};
use crate::events::{names, Observable, Payload};
use crate::sync::{self, caller, SyncError, SyncOptions, Target, Verb};
use serde_json::Value;
use std::rc::Rc;
use tracing::debug;

impl Group {
    pub fn url(&self) -> Result<String, SyncError> {
        self.schema().url.clone().ok_or(SyncError::MissingUrl)
    }

    /// Load the membership from the transport.
    ///
    /// An object response carries the members under the schema's
    /// `results_field`; everything else in it is stored in the form (paging,
    /// totals). Members are reconciled, or reset with `options.reset`.
    pub fn fetch(&self, options: SyncOptions) -> Result<sync::Request, SyncError> {
        let target = Target::Group(self.clone());
        let group = self.clone();
        let reset = options.reset;
        let parse = options.parse;
        let silent = options.silent;
        let callback = options.success.clone();

        let on_success = Box::new(move |response: Value| {
            let (data, rest) = match &response {
                Value::Object(map) => {
                    let mut rest = map.clone();
                    let data = rest
                        .remove(&group.schema().results_field)
                        .unwrap_or(Value::Null);
                    (data, Some(Value::Object(rest)))
                }
                other => (other.clone(), None),
            };
            let data = if parse { group.parse(data) } else { data };

            let update = UpdateOptions {
                silent,
                validate: false,
                ..UpdateOptions::default()
            };
            if reset {
                group.reset(into_items(data), &update);
            } else if !data.is_null() {
                group.set(into_items(data), &update);
            }
            if let Some(rest) = rest {
                let trusted = SetOptions {
                    silent,
                    ..SetOptions::trusted()
                };
                if let Err(error) = group.form().set(rest, &trusted) {
                    debug!(cid = %group.cid(), error = %error, "Form update rejected");
                }
            }

            let target = Target::Group(group.clone());
            if let Some(callback) = &callback {
                callback(&target, &response);
            }
            let payload = Payload::Synced { target, response };
            group.trigger(names::FETCHED, payload.clone());
            group.trigger(names::SYNCED, payload);
        });
        let on_error = sync::wrap_error(target.clone(), options.error.clone(), caller::FETCH);

        let verb = if self.schema().send_form_as_post {
            Verb::Create
        } else {
            Verb::Read
        };
        sync::sync(&target, verb, &options, caller::FETCH, on_success, on_error)
    }

    /// Build a member from `attrs`, add it, and save it. With `wait` the
    /// member joins the group only once the save succeeds.
    pub fn create(&self, attrs: Value, options: SyncOptions) -> Result<Entity, SyncError> {
        let entity = self
            .prepare(Item::Attrs(attrs), &UpdateOptions::default())
            .map_err(SyncError::Invalid)?;

        let wait = options.wait;
        if !wait {
            self.add(vec![Item::Entity(entity.clone())], &UpdateOptions::adding());
        }

        let group = self.clone();
        let success = options.success.clone();
        let mut options = options;
        options.success = Some(Rc::new(move |target: &Target, response: &Value| {
            if wait {
                if let Some(entity) = target.entity() {
                    group.add(vec![Item::Entity(entity.clone())], &UpdateOptions::adding());
                }
            }
            if let Some(success) = &success {
                success(target, response);
            }
        }));

        entity.save(None, options)?;
        Ok(entity)
    }
}
