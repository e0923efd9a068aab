use serde_json::Value;
use std::fmt;
use std::rc::Rc;

/// Reason a prospective attribute set was rejected
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationFailure {
    pub reason: String,
    /// Offending attribute path, when the validator knows it
    pub path: Option<String>,
}

impl ValidationFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            path: None,
        }
    }

    pub fn at(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            path: Some(path.into()),
        }
    }
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{}: {}", path, self.reason),
            None => write!(f, "{}", self.reason),
        }
    }
}

impl std::error::Error for ValidationFailure {}

/// Checks a complete prospective attribute set
pub type Validator = Rc<dyn Fn(&Value) -> Result<(), ValidationFailure>>;
