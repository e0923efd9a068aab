use super::{Entity, ValidationFailure, Validator};
use crate::config::TetherConfig;
use crate::hooks::Hooks;
use crate::sync::Transport;
use serde_json::{Map, Value};
use std::fmt;
use std::rc::Rc;

/// Rewrites a raw response into attributes
pub type Parser = Rc<dyn Fn(Value) -> Value>;

/// Shared behaviour of a kind of entity: identity field, defaults,
/// validation, parsing, construction hooks and where it syncs to.
#[derive(Clone)]
pub struct Schema {
    pub name: Option<String>,
    pub id_field: String,
    pub cid_prefix: String,
    pub defaults: Value,
    pub url_root: Option<String>,
    pub emulate_json: bool,
    pub(crate) validator: Option<Validator>,
    pub(crate) parser: Option<Parser>,
    pub(crate) hooks: Hooks<Value, Entity>,
    pub(crate) transport: Option<Rc<dyn Transport>>,
}

impl Schema {
    pub fn new() -> Self {
        Self::from_config(&TetherConfig::default())
    }

    pub fn from_config(config: &TetherConfig) -> Self {
        Self {
            name: None,
            id_field: config.entity.id_field.clone(),
            cid_prefix: config.entity.cid_prefix.clone(),
            defaults: Value::Object(Map::new()),
            url_root: None,
            emulate_json: config.sync.emulate_json,
            validator: None,
            parser: None,
            hooks: Hooks::new(),
            transport: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_id_field(mut self, id_field: impl Into<String>) -> Self {
        self.id_field = id_field.into();
        self
    }

    pub fn with_defaults(mut self, defaults: Value) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_url_root(mut self, url_root: impl Into<String>) -> Self {
        self.url_root = Some(url_root.into());
        self
    }

    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Value) -> Result<(), ValidationFailure> + 'static,
    {
        self.validator = Some(Rc::new(validator));
        self
    }

    pub fn with_parser<F>(mut self, parser: F) -> Self
    where
        F: Fn(Value) -> Value + 'static,
    {
        self.parser = Some(Rc::new(parser));
        self
    }

    pub fn with_hooks(mut self, hooks: Hooks<Value, Entity>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_transport(mut self, transport: Rc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("name", &self.name)
            .field("id_field", &self.id_field)
            .field("url_root", &self.url_root)
            .field("validator", &self.validator.is_some())
            .field("hooks", &self.hooks)
            .finish()
    }
}
