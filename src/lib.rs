// Configuration (TOML + env overrides)
pub mod config;

// Publish/subscribe core
pub mod events;

// Dotted-path flatten/search/merge
pub mod path;

// Construction hooks
pub mod hooks;

// Change-tracked records
pub mod entity;

// Ordered, indexed collections of entities
pub mod group;

// Transport boundary and mock transport
pub mod sync;

pub use entity::{BuildOptions, Entity, Schema, SetOptions, ValidationFailure};
pub use events::{callback, names, Callback, Changes, Emitter, Event, Observable, Payload};
pub use group::{Comparator, Group, GroupSchema, Item, UpdateOptions};
pub use sync::{MockTransport, SyncError, SyncOptions, Target, Transport};
