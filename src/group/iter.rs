use super::Group;
use crate::entity::Entity;
use serde_json::Value;

// Position-based walk; reads the member at the current index on every step
#[derive(Debug, Clone)]
struct Cursor {
    group: Option<Group>,
    index: usize,
}

impl Cursor {
    fn new(group: &Group) -> Self {
        Self {
            group: Some(group.clone()),
            index: 0,
        }
    }

    fn advance(&mut self) -> Option<Entity> {
        let group = self.group.as_ref()?;
        match group.members_at(self.index) {
            Some(entity) => {
                self.index += 1;
                Some(entity)
            }
            None => {
                self.group = None;
                None
            }
        }
    }
}

/// Members in order
#[derive(Debug, Clone)]
pub struct Values(Cursor);

/// Persistent ids in member order; `None` for members without one
#[derive(Debug, Clone)]
pub struct Keys(Cursor);

/// `(persistent id, member)` pairs in member order
#[derive(Debug, Clone)]
pub struct Entries(Cursor);

impl Iterator for Values {
    type Item = Entity;

    fn next(&mut self) -> Option<Entity> {
        self.0.advance()
    }
}

impl Iterator for Keys {
    type Item = Option<Value>;

    fn next(&mut self) -> Option<Option<Value>> {
        self.0.advance().map(|entity| entity.id())
    }
}

impl Iterator for Entries {
    type Item = (Option<Value>, Entity);

    fn next(&mut self) -> Option<Self::Item> {
        self.0.advance().map(|entity| (entity.id(), entity))
    }
}

impl Group {
    pub fn values(&self) -> Values {
        Values(Cursor::new(self))
    }

    pub fn keys(&self) -> Keys {
        Keys(Cursor::new(self))
    }

    pub fn entries(&self) -> Entries {
        Entries(Cursor::new(self))
    }

    pub fn iter(&self) -> Values {
        self.values()
    }
}

impl<'a> IntoIterator for &'a Group {
    type Item = Entity;
    type IntoIter = Values;

    fn into_iter(self) -> Values {
        self.values()
    }
}
