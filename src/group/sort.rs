use crate::entity::Entity;
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;

/// Ordering a group keeps its members in
#[derive(Clone)]
pub enum Comparator {
    /// Attribute path to sort by
    Field(String),
    /// Projection to sort by
    Key(Rc<dyn Fn(&Entity) -> Value>),
    /// Total order over two members
    Order(Rc<dyn Fn(&Entity, &Entity) -> Ordering>),
}

impl Comparator {
    pub fn field(path: impl Into<String>) -> Self {
        Comparator::Field(path.into())
    }

    pub fn key<F>(f: F) -> Self
    where
        F: Fn(&Entity) -> Value + 'static,
    {
        Comparator::Key(Rc::new(f))
    }

    pub fn order<F>(f: F) -> Self
    where
        F: Fn(&Entity, &Entity) -> Ordering + 'static,
    {
        Comparator::Order(Rc::new(f))
    }

    /// Attribute path whose change requires a re-sort, when known
    pub fn field_path(&self) -> Option<&str> {
        match self {
            Comparator::Field(path) => Some(path),
            _ => None,
        }
    }

    /// Sort in place. Projections are computed once per member and ties keep
    /// their current relative order.
    pub(crate) fn sort(&self, members: &mut Vec<Entity>) {
        match self {
            Comparator::Order(order) => members.sort_by(|a, b| order(a, b)),
            Comparator::Field(path) => {
                sort_by_key(members, |entity| entity.get(path).unwrap_or(Value::Null))
            }
            Comparator::Key(key) => sort_by_key(members, |entity| key(entity)),
        }
    }
}

fn sort_by_key<F>(members: &mut Vec<Entity>, key: F)
where
    F: Fn(&Entity) -> Value,
{
    let mut decorated: Vec<(Value, Entity)> = members
        .drain(..)
        .map(|entity| (key(&entity), entity))
        .collect();
    decorated.sort_by(|(a, _), (b, _)| compare_values(a, b));
    members.extend(decorated.into_iter().map(|(_, entity)| entity));
}

// Bool < Number < String < Array < Object < Null
fn rank(value: &Value) -> u8 {
    match value {
        Value::Bool(_) => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Array(_) => 3,
        Value::Object(_) => 4,
        Value::Null => 5,
    }
}

/// Ordering used for projected sort keys. Numbers compare numerically,
/// strings lexicographically; values of different kinds by kind.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Number(a), Value::Number(b)) => {
            let (a, b) = (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
            a.partial_cmp(&b).unwrap_or(Ordering::Equal)
        }
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Array(a), Value::Array(b)) => a
            .iter()
            .zip(b.iter())
            .map(|(x, y)| compare_values(x, y))
            .find(|ordering| ordering.is_ne())
            .unwrap_or_else(|| a.len().cmp(&b.len())),
        _ => rank(a).cmp(&rank(b)),
    }
}

impl fmt::Debug for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Comparator::Field(path) => f.debug_tuple("Field").field(path).finish(),
            Comparator::Key(_) => f.write_str("Key(..)"),
            Comparator::Order(_) => f.write_str("Order(..)"),
        }
    }
}
