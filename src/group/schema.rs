use super::{Comparator, Group, Item};
use crate::config::TetherConfig;
use crate::entity::{BuildOptions, Entity, Parser, Schema};
use crate::hooks::Hooks;
use crate::sync::Transport;
use serde_json::Value;
use std::fmt;
use std::rc::Rc;

/// Builds members from raw attributes.
///
/// One factory may return entities of different schemas depending on the
/// input; `id_field` tells the group where raw input keeps its identity.
pub trait MemberFactory {
    fn create_member(&self, attrs: Value, options: BuildOptions) -> Entity;

    fn id_field(&self) -> &str {
        "id"
    }
}

/// Factory building every member from one schema
#[derive(Debug, Clone)]
pub struct SchemaFactory(pub Rc<Schema>);

impl MemberFactory for SchemaFactory {
    fn create_member(&self, attrs: Value, options: BuildOptions) -> Entity {
        Entity::build(self.0.clone(), attrs, options)
    }

    fn id_field(&self) -> &str {
        &self.0.id_field
    }
}

/// Shared behaviour of a kind of group
#[derive(Clone)]
pub struct GroupSchema {
    pub name: Option<String>,
    pub url: Option<String>,
    pub cid_prefix: String,
    /// Field of an object fetch response holding the members
    pub results_field: String,
    pub send_form_as_post: bool,
    pub emulate_json: bool,
    pub(crate) factory: Rc<dyn MemberFactory>,
    pub(crate) comparator: Option<Comparator>,
    pub(crate) parser: Option<Parser>,
    /// Schema of the companion form entity
    pub(crate) form: Rc<Schema>,
    pub(crate) hooks: Hooks<Vec<Item>, Group>,
    pub(crate) transport: Option<Rc<dyn Transport>>,
}

impl GroupSchema {
    pub fn new(member: Rc<Schema>) -> Self {
        Self::from_config(&TetherConfig::default(), member)
    }

    pub fn from_config(config: &TetherConfig, member: Rc<Schema>) -> Self {
        Self {
            name: None,
            url: None,
            cid_prefix: config.group.cid_prefix.clone(),
            results_field: config.group.results_field.clone(),
            send_form_as_post: config.group.send_form_as_post,
            emulate_json: config.sync.emulate_json,
            factory: Rc::new(SchemaFactory(member)),
            comparator: None,
            parser: None,
            form: Rc::new(Schema::from_config(config)),
            hooks: Hooks::new(),
            transport: None,
        }
    }

    pub fn with_factory(mut self, factory: Rc<dyn MemberFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_comparator(mut self, comparator: Comparator) -> Self {
        self.comparator = Some(comparator);
        self
    }

    pub fn with_parser<F>(mut self, parser: F) -> Self
    where
        F: Fn(Value) -> Value + 'static,
    {
        self.parser = Some(Rc::new(parser));
        self
    }

    pub fn with_form(mut self, form: Rc<Schema>) -> Self {
        self.form = form;
        self
    }

    pub fn with_hooks(mut self, hooks: Hooks<Vec<Item>, Group>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_transport(mut self, transport: Rc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_results_field(mut self, field: impl Into<String>) -> Self {
        self.results_field = field.into();
        self
    }

    pub fn sending_form_as_post(mut self) -> Self {
        self.send_form_as_post = true;
        self
    }

    pub fn id_field(&self) -> &str {
        self.factory.id_field()
    }
}

impl Default for GroupSchema {
    fn default() -> Self {
        Self::new(Rc::new(Schema::default()))
    }
}

impl fmt::Debug for GroupSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupSchema")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("results_field", &self.results_field)
            .field("comparator", &self.comparator)
            .field("hooks", &self.hooks)
            .finish()
    }
}
