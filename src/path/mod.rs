use serde_json::{Map, Value};
use tracing::warn;


/// Separator between path segments
pub const SEPARATOR: char = '.';

/// Two-dot marker splitting a path into an array part and a per-element part
pub const WILDCARD: &str = "..";

/// Furthest a single write may reach past the end of an array
pub const MAX_INDEX_GAP: usize = 1024;

/// Result of resolving a path against a nested structure
#[derive(Debug, Clone, PartialEq)]
pub enum Found {
    /// Plain path resolved to a single value
    Value(Value),
    /// Wildcard path fanned out across the elements of an array
    Fanout(Vec<Slot>),
}

/// Per-element outcome of a wildcard search
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    Value(Value),
    /// The element exists but the trailing path does not resolve inside it
    Missing,
    /// The element itself is a vacated (null) array position
    Hole,
}

impl Found {
    /// Collapse into a plain JSON value. Missing elements and holes become `null`.
    pub fn into_value(self) -> Value {
        match self {
            Found::Value(value) => value,
            Found::Fanout(slots) => Value::Array(
                slots
                    .into_iter()
                    .map(|slot| match slot {
                        Slot::Value(value) => value,
                        Slot::Missing | Slot::Hole => Value::Null,
                    })
                    .collect(),
            ),
        }
    }
}

/// Options for [`merge_set`]
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeOptions {
    /// Remove the terminal entry of every path instead of writing it
    pub unset: bool,
}

/// A segment is numeric iff it is one or more ASCII digits.
pub fn is_numeric(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}

/// Flatten a nested structure into dotted paths.
///
/// Objects and arrays are walked depth-first; array positions become numeric
/// segments. Empty containers are kept as leaves. When two inputs map to the
/// same path (a literal dotted key next to a nested one), the first wins.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use tether::path::flatten;
///
/// let flat = flatten(&json!({"a": [{"b": 1}, {"b": 2}]}));
/// assert_eq!(flat.get("a.0.b"), Some(&json!(1)));
/// assert_eq!(flat.get("a.1.b"), Some(&json!(2)));
/// ```
pub fn flatten(value: &Value) -> Map<String, Value> {
    let mut flat = Map::new();
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                walk(child, key.clone(), &mut flat);
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                walk(child, index.to_string(), &mut flat);
            }
        }
        _ => {}
    }
    flat
}

fn walk(value: &Value, prefix: String, flat: &mut Map<String, Value>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                walk(child, format!("{}{}{}", prefix, SEPARATOR, key), flat);
            }
        }
        Value::Array(items) if !items.is_empty() => {
            for (index, child) in items.iter().enumerate() {
                walk(child, format!("{}{}{}", prefix, SEPARATOR, index), flat);
            }
        }
        _ => {
            flat.entry(prefix).or_insert_with(|| value.clone());
        }
    }
}

/// Rebuild a nested structure from dotted paths.
///
/// The container created for a segment is an array when the following
/// segment is numeric, an object otherwise.
pub fn unflatten(flat: &Map<String, Value>) -> Value {
    let mut root = Value::Object(Map::new());
    for (path, value) in flat {
        let segments: Vec<&str> = path.split(SEPARATOR).collect();
        if !within_bounds(Some(&root), &segments) {
            warn!(path = %path, "Skipping path past array bounds");
            continue;
        }
        assign(&mut root, &segments, value, false);
    }
    root
}

/// Every prefix of `path`, shortest first.
///
/// With `recursive`, prefixes holding an inner numeric segment also get a
/// wildcard variant (`a.0.b` -> `a..b`); those variants come first.
///
/// # Examples
///
/// ```
/// use tether::path::ancestry;
///
/// assert_eq!(ancestry("a.b.c", false), vec!["a", "a.b", "a.b.c"]);
/// assert_eq!(ancestry("a.0.b", true), vec!["a..b", "a", "a.0", "a.0.b"]);
/// ```
pub fn ancestry(path: &str, recursive: bool) -> Vec<String> {
    let mut trail: Vec<String> = Vec::new();
    let mut wildcards = Vec::new();

    for segment in path.split(SEPARATOR) {
        let item = match trail.last() {
            Some(previous) => format!("{}{}{}", previous, SEPARATOR, segment),
            None => segment.to_string(),
        };
        if recursive {
            let collapsed = collapse_indices(&item);
            if collapsed != item {
                wildcards.push(collapsed);
            }
        }
        trail.push(item);
    }

    wildcards.extend(trail);
    wildcards
}

// Inner numeric segments become empty. A collapsed segment consumes the
// separator after it, so `a.0.1.b` only collapses the first index.
fn collapse_indices(path: &str) -> String {
    let segments: Vec<&str> = path.split(SEPARATOR).collect();
    let last = segments.len().saturating_sub(1);
    let mut previous_collapsed = false;
    let mut out = Vec::with_capacity(segments.len());

    for (i, segment) in segments.iter().enumerate() {
        let collapse = i > 0 && i < last && is_numeric(segment) && !previous_collapsed;
        out.push(if collapse { "" } else { *segment });
        previous_collapsed = collapse;
    }

    out.join(".")
}

/// Resolve a dotted path against `root`.
///
/// A path with exactly one `..` marker resolves the part before it, then
/// resolves the part after it inside every element of the array found there.
/// Paths with more than one marker are not supported and resolve to `None`.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use tether::path::{search, Found, Slot};
///
/// let root = json!({"a": [{"b": {"c": 1}}, {"b": {"c": 2}}]});
/// assert_eq!(
///     search(&root, "a..b.c"),
///     Some(Found::Fanout(vec![Slot::Value(json!(1)), Slot::Value(json!(2))]))
/// );
/// assert_eq!(search(&root, "a.1.b.c"), Some(Found::Value(json!(2))));
/// assert_eq!(search(&root, "a.2"), None);
/// ```
pub fn search(root: &Value, path: &str) -> Option<Found> {
    let parts: Vec<&str> = path.split(WILDCARD).collect();
    if parts.len() == 2 {
        return Some(Found::Fanout(fan_out(root, parts[0], parts[1])));
    }
    resolve(root, path).map(|value| Found::Value(value.clone()))
}

/// [`search`] collapsed to a plain value, or `default` when nothing resolves.
pub fn search_or(root: &Value, path: &str, default: Value) -> Value {
    search(root, path).map(Found::into_value).unwrap_or(default)
}

fn fan_out(root: &Value, before: &str, after: &str) -> Vec<Slot> {
    match resolve(root, before) {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                if item.is_null() {
                    return Slot::Hole;
                }
                match resolve(item, after) {
                    Some(value) => Slot::Value(value.clone()),
                    None => Slot::Missing,
                }
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Sequential property access along a plain dotted path
pub fn resolve<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split(SEPARATOR).try_fold(root, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) if is_numeric(segment) => {
            segment.parse::<usize>().ok().and_then(|i| items.get(i))
        }
        _ => None,
    })
}

/// Merge `changes` into `current` path by path.
///
/// `changes` is flattened first (already-flat maps pass through untouched).
/// Missing intermediate containers are created as arrays or objects depending
/// on whether the next segment is numeric. With `unset`, the terminal entry
/// is removed instead and arrays close the gap so they stay dense.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use tether::path::{merge_set, MergeOptions};
///
/// let merged = merge_set(
///     json!({"x": [1, 2, 3]}),
///     &json!({"x.1": null}),
///     MergeOptions { unset: true },
/// );
/// assert_eq!(merged, json!({"x": [1, 3]}));
/// ```
pub fn merge_set(current: Value, changes: &Value, options: MergeOptions) -> Value {
    let mut result = match current {
        Value::Object(_) | Value::Array(_) => current,
        _ => Value::Object(Map::new()),
    };
    for (path, value) in flatten(changes) {
        let segments: Vec<&str> = path.split(SEPARATOR).collect();
        if !options.unset && !within_bounds(Some(&result), &segments) {
            warn!(path = %path, "Skipping path past array bounds");
            continue;
        }
        assign(&mut result, &segments, &value, options.unset);
    }
    result
}

/// Whether writing `path` into `root` keeps every array it touches within
/// [`MAX_INDEX_GAP`] of its current end.
pub fn writable(root: &Value, path: &str) -> bool {
    let segments: Vec<&str> = path.split(SEPARATOR).collect();
    within_bounds(Some(root), &segments)
}

fn within_bounds(target: Option<&Value>, segments: &[&str]) -> bool {
    let Some((key, rest)) = segments.split_first() else {
        return true;
    };
    match target {
        Some(Value::Object(map)) => within_bounds(map.get(*key), rest),
        Some(Value::Array(items)) => match array_index(key) {
            Some(index) => {
                index <= items.len().saturating_add(MAX_INDEX_GAP)
                    && within_bounds(items.get(index), rest)
            }
            None => true,
        },
        // Missing or scalar: replaced by an array when the segment is numeric
        _ => match array_index(key) {
            Some(index) => index <= MAX_INDEX_GAP && within_bounds(None, rest),
            None => within_bounds(None, rest),
        },
    }
}

fn array_index(key: &str) -> Option<usize> {
    key.parse::<usize>().ok().filter(|_| is_numeric(key))
}

fn assign(target: &mut Value, segments: &[&str], value: &Value, unset: bool) {
    let Some((key, rest)) = segments.split_first() else {
        return;
    };

    if rest.is_empty() {
        if unset {
            remove_entry(target, key);
        } else if let Some(slot) = entry(target, key, true) {
            *slot = value.clone();
        }
        return;
    }

    // Nothing to remove below a missing branch
    let Some(slot) = entry(target, key, !unset) else {
        return;
    };
    if !matches!(slot, Value::Object(_) | Value::Array(_)) {
        if unset {
            return;
        }
        *slot = if is_numeric(rest[0]) {
            Value::Array(Vec::new())
        } else {
            Value::Object(Map::new())
        };
    }
    assign(slot, rest, value, unset);
}

// Child slot of a container, optionally creating it. Arrays grow with nulls.
fn entry<'a>(target: &'a mut Value, key: &str, create: bool) -> Option<&'a mut Value> {
    match target {
        Value::Object(map) => {
            if create {
                Some(map.entry(key.to_string()).or_insert(Value::Null))
            } else {
                map.get_mut(key)
            }
        }
        Value::Array(items) => {
            let index = array_index(key)?;
            if create && index >= items.len() {
                items.resize(index.checked_add(1)?, Value::Null);
            }
            items.get_mut(index)
        }
        _ => None,
    }
}

fn remove_entry(target: &mut Value, key: &str) {
    match target {
        Value::Object(map) => {
            map.remove(key);
        }
        Value::Array(items) => {
            if let Some(index) = array_index(key) {
                if index < items.len() {
                    items.remove(index);
                }
            }
        }
        _ => {}
    }
}

/// Fill keys missing from `target` with the matching entries of `defaults`,
/// recursing into objects present on both sides.
pub fn fill_defaults(target: &mut Value, defaults: &Value) {
    let (Value::Object(target), Value::Object(defaults)) = (target, defaults) else {
        return;
    };
    for (key, default) in defaults {
        match target.get_mut(key) {
            Some(existing) => fill_defaults(existing, default),
            None => {
                target.insert(key.clone(), default.clone());
            }
        }
    }
}
