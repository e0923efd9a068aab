use super::*;
use crate::events::callback;
use crate::hooks::Hooks;
use serde_json::json;
use std::cell::Cell;

fn names_log(entity: &Entity) -> Rc<RefCell<Vec<String>>> {
    let log = Rc::new(RefCell::new(Vec::new()));
    let l = log.clone();
    entity.on(names::ALL, callback(move |event| l.borrow_mut().push(event.name.clone())));
    log
}

fn positive_count() -> Rc<Schema> {
    Rc::new(Schema::new().with_validator(|attrs| match attrs.get("count") {
        Some(count) if count.as_i64().is_some_and(|n| n < 0) => {
            Err(ValidationFailure::at("count", "must not be negative"))
        }
        _ => Ok(()),
    }))
}

#[test]
fn test_cids_are_unique() {
    let a = Entity::new(json!({}));
    let b = Entity::new(json!({}));
    assert_ne!(a.cid(), b.cid());
    assert!(a.cid().starts_with('m'));
}

#[test]
fn test_construction_fills_defaults_under_attributes() {
    let schema = Rc::new(Schema::new().with_defaults(json!({
        "title": "untitled",
        "meta": {"tags": [], "views": 0}
    })));
    let entity = Entity::with_schema(&schema, json!({"meta": {"views": 4}}));

    assert_eq!(entity.get("title"), Some(json!("untitled")));
    assert_eq!(entity.get("meta.views"), Some(json!(4)));
    assert_eq!(entity.get("meta.tags"), Some(json!([])));
    assert!(!entity.has_changed(None));
}

#[test]
fn test_non_object_input_builds_empty_entity() {
    let entity = Entity::new(json!("nope"));
    assert_eq!(entity.attributes(), json!({}));
    assert!(entity.is_new());
}

#[test]
fn test_construction_hooks_run_in_order() {
    let seen = Rc::new(Cell::new(0));
    let s = seen.clone();
    let hooks = Hooks::new()
        .pre_construct(|raw: &mut Value| raw["stamped"] = json!(true))
        .post_construct(move |entity: &Entity| {
            assert_eq!(entity.get("stamped"), Some(json!(true)));
            s.set(s.get() + 1);
        });
    let schema = Rc::new(Schema::new().with_hooks(hooks));

    Entity::with_schema(&schema, json!({"a": 1}));
    assert_eq!(seen.get(), 1);
}

#[test]
fn test_parse_on_build() {
    let schema = Rc::new(Schema::new().with_parser(|raw| raw["record"].clone()));
    let entity = Entity::build(
        schema,
        json!({"record": {"id": 9}}),
        BuildOptions {
            parse: true,
            ..BuildOptions::default()
        },
    );
    assert_eq!(entity.id(), Some(json!(9)));
}

#[test]
fn test_get_nested_and_wildcard() {
    let entity = Entity::new(json!({"a": [{"b": {"c": 1}}, {"b": {"c": 2}}]}));
    assert_eq!(entity.get("a.1.b.c"), Some(json!(2)));
    assert_eq!(entity.get("a..b.c"), Some(json!([1, 2])));
    assert_eq!(entity.get("a.5"), None);
    assert!(entity.has("a.0.b"));
    assert!(!entity.has("missing"));
}

#[test]
fn test_set_fires_path_then_changed_with_previous_visible() {
    let entity = Entity::new(json!({"id": 1, "name": "x"}));
    let seen = Rc::new(RefCell::new(Vec::new()));

    let (s, e) = (seen.clone(), entity.clone());
    entity.on(
        "changed:name",
        callback(move |_| s.borrow_mut().push(format!("path:{}", e.previous("name").unwrap()))),
    );
    let (s, e) = (seen.clone(), entity.clone());
    entity.on(
        names::CHANGED,
        callback(move |_| s.borrow_mut().push(format!("all:{}", e.previous("name").unwrap()))),
    );

    entity.set(json!({"name": "y"}), &SetOptions::default()).unwrap();

    assert_eq!(*seen.borrow(), vec!["path:\"x\"", "all:\"x\""]);
    assert_eq!(entity.get("name"), Some(json!("y")));
}

#[test]
fn test_change_payload_carries_new_value() {
    let entity = Entity::new(json!({"name": "x"}));
    let value = Rc::new(RefCell::new(None));
    let v = value.clone();
    entity.on(
        "changed:name",
        callback(move |event| {
            if let Payload::Change { value, .. } = &event.payload {
                *v.borrow_mut() = value.clone();
            }
        }),
    );

    entity.set_path("name", json!("z"), &SetOptions::default()).unwrap();
    assert_eq!(*value.borrow(), Some(json!("z")));
}

#[test]
fn test_nested_set_fires_reversed_ancestry() {
    let entity = Entity::new(json!({"list": [{"v": 1}, {"v": 2}]}));
    let log = names_log(&entity);

    entity.set(json!({"list.1.v": 5}), &SetOptions::default()).unwrap();

    assert_eq!(
        *log.borrow(),
        vec![
            "changed:list.1.v",
            "changed:list.1",
            "changed:list",
            "changed:list..v",
            "changed"
        ]
    );
    assert_eq!(entity.get("list..v"), Some(json!([1, 5])));
}

#[test]
fn test_unchanged_values_fire_nothing() {
    let entity = Entity::new(json!({"a": 1, "b": {"c": 2}}));
    let log = names_log(&entity);

    entity.set(json!({"a": 1, "b": {"c": 2}}), &SetOptions::default()).unwrap();

    assert!(log.borrow().is_empty());
    assert!(!entity.has_changed(None));
}

#[test]
fn test_silent_set_fires_nothing_but_tracks_changes() {
    let entity = Entity::new(json!({"a": 1}));
    let log = names_log(&entity);

    entity.set(json!({"a": 2}), &SetOptions::silent()).unwrap();

    assert!(log.borrow().is_empty());
    assert!(entity.has_changed(Some("a")));
    assert_eq!(entity.get("a"), Some(json!(2)));
}

#[test]
fn test_nested_set_joins_batch_and_changed_drains() {
    let entity = Entity::new(json!({"a": 1, "b": 1}));
    let changed = Rc::new(Cell::new(0));

    let e = entity.clone();
    entity.on(
        "changed:a",
        callback(move |_| {
            e.set(json!({"b": 2}), &SetOptions::default()).unwrap();
        }),
    );
    let (c, e) = (changed.clone(), entity.clone());
    entity.on(
        names::CHANGED,
        callback(move |_| {
            c.set(c.get() + 1);
            // Both changes belong to the same batch
            assert!(e.has_changed(Some("a")));
            assert!(e.has_changed(Some("b")));
        }),
    );

    entity.set(json!({"a": 2}), &SetOptions::default()).unwrap();

    assert_eq!(changed.get(), 1);
    assert_eq!(entity.previous("b"), Some(json!(1)));
}

#[test]
fn test_set_from_changed_handler_reissues_changed() {
    let entity = Entity::new(json!({"a": 1, "b": 1}));
    let changed = Rc::new(Cell::new(0));

    let (c, e) = (changed.clone(), entity.clone());
    entity.on(
        names::CHANGED,
        callback(move |_| {
            c.set(c.get() + 1);
            if e.get("b") == Some(json!(1)) {
                e.set(json!({"b": 2}), &SetOptions::default()).unwrap();
            }
        }),
    );

    entity.set(json!({"a": 2}), &SetOptions::default()).unwrap();

    assert_eq!(changed.get(), 2);
    assert_eq!(entity.get("b"), Some(json!(2)));
}

#[test]
fn test_reverting_a_value_is_still_a_change() {
    let entity = Entity::new(json!({"a": 1}));
    entity.set(json!({"a": 2}), &SetOptions::default()).unwrap();
    entity.set(json!({"a": 1}), &SetOptions::default()).unwrap();

    assert!(entity.has_changed(Some("a")));
    assert_eq!(entity.get("a"), Some(json!(1)));
}

#[test]
fn test_validation_blocks_mutation_and_fires_invalid() {
    let entity = Entity::with_schema(&positive_count(), json!({"count": 1}));
    let log = names_log(&entity);

    let result = entity.set(json!({"count": -1, "other": true}), &SetOptions::default());

    assert_eq!(result, Err(ValidationFailure::at("count", "must not be negative")));
    assert_eq!(*log.borrow(), vec![names::INVALID]);
    assert_eq!(entity.get("count"), Some(json!(1)));
    assert_eq!(entity.get("other"), None);
    assert!(entity.validation_error().is_some());
}

#[test]
fn test_validation_can_be_skipped() {
    let entity = Entity::with_schema(&positive_count(), json!({}));
    entity.set(json!({"count": -5}), &SetOptions::trusted()).unwrap();

    assert_eq!(entity.get("count"), Some(json!(-5)));
    assert!(!entity.is_valid());
    assert!(entity.validation_error().is_some());
}

#[test]
fn test_invalid_construction_records_error() {
    let entity = Entity::with_schema(&positive_count(), json!({"count": -1}));
    assert_eq!(entity.attributes(), json!({}));
    assert_eq!(entity.validation_error().map(|e| e.reason), Some("must not be negative".to_string()));
}

#[test]
fn test_unset_removes_nested_and_reports_change() {
    let entity = Entity::new(json!({"a": {"b": 1, "c": 2}, "list": [1, 2, 3]}));
    let log = names_log(&entity);

    entity.unset("a", &SetOptions::default()).unwrap();
    assert_eq!(entity.get("a"), None);
    assert!(entity.has_changed(Some("a")));
    assert!(log.borrow().contains(&"changed:a".to_string()));

    entity.unset("list.1", &SetOptions::default()).unwrap();
    assert_eq!(entity.get("list"), Some(json!([1, 3])));
}

#[test]
fn test_unset_missing_path_changes_nothing() {
    let entity = Entity::new(json!({"a": 1}));
    let log = names_log(&entity);

    entity.unset("zzz", &SetOptions::default()).unwrap();
    assert!(log.borrow().is_empty());
}

#[test]
fn test_clear_removes_everything() {
    let entity = Entity::new(json!({"a": 1, "b": {"c": 2}}));
    entity.clear(&SetOptions::default()).unwrap();

    assert_eq!(entity.attributes(), json!({}));
    assert!(entity.has_changed(Some("a")));
    assert!(entity.has_changed(Some("b")));
}

#[test]
fn test_changed_attributes() {
    let entity = Entity::new(json!({"a": 1, "b": {"c": 2}}));
    assert_eq!(entity.changed_attributes(None), None);

    entity.set(json!({"a": 5}), &SetOptions::default()).unwrap();
    let changed = entity.changed_attributes(None).unwrap();
    assert_eq!(changed.get("a"), Some(&json!(5)));

    let diff = entity
        .changed_attributes(Some(&json!({"a": 5, "b": {"c": 3}})))
        .unwrap();
    assert_eq!(diff.len(), 1);
    assert_eq!(diff.get("b.c"), Some(&json!(3)));
    assert_eq!(entity.changed_attributes(Some(&json!({"a": 5}))), None);
}

#[test]
fn test_previous_attributes_snapshot() {
    let entity = Entity::new(json!({"a": 1}));
    entity.set(json!({"a": 2, "b": 3}), &SetOptions::default()).unwrap();

    assert_eq!(entity.previous("a"), Some(json!(1)));
    assert_eq!(entity.previous("b"), None);
    assert_eq!(entity.previous_attributes(), json!({"a": 1}));
}

#[test]
fn test_id_tracking_and_id_changed() {
    let entity = Entity::new(json!({"name": "x"}));
    assert!(entity.is_new());

    let previous = Rc::new(RefCell::new(Vec::new()));
    let p = previous.clone();
    entity.on(
        names::ID_CHANGED,
        callback(move |event| {
            if let Payload::IdChanged { previous, .. } = &event.payload {
                p.borrow_mut().push(previous.clone());
            }
        }),
    );

    entity.set(json!({"id": 7}), &SetOptions::default()).unwrap();
    entity.set(json!({"id": 8}), &SetOptions::silent()).unwrap();

    assert_eq!(entity.id(), Some(json!(8)));
    assert!(!entity.is_new());
    assert_eq!(*previous.borrow(), vec![None, Some(json!(7))]);
}

#[test]
fn test_custom_id_field() {
    let schema = Rc::new(Schema::new().with_id_field("_key"));
    let entity = Entity::with_schema(&schema, json!({"_key": "k1", "id": 3}));
    assert_eq!(entity.id(), Some(json!("k1")));
    assert_eq!(entity.id_field(), "_key");
}

#[test]
fn test_attribute_keys_with_spaces_dispatch_as_is() {
    let entity = Entity::new(json!({}));
    let log = names_log(&entity);

    entity.set(json!({"first name": "Ada"}), &SetOptions::default()).unwrap();
    assert_eq!(*log.borrow(), vec!["changed:first name", "changed"]);
}

#[test]
fn test_matches_and_duplicate() {
    let entity = Entity::new(json!({"a": 1, "b": {"c": [1, 2]}}));
    assert!(entity.matches(&json!({"b": {"c": [1, 2]}})));
    assert!(!entity.matches(&json!({"a": 2})));

    let copy = entity.duplicate();
    assert_ne!(copy.cid(), entity.cid());
    assert_eq!(copy.attributes(), entity.attributes());

    copy.set(json!({"a": 9}), &SetOptions::default()).unwrap();
    assert_eq!(entity.get("a"), Some(json!(1)));
}

#[test]
fn test_returned_attributes_do_not_alias() {
    let entity = Entity::new(json!({"a": {"b": 1}}));
    let mut attrs = entity.attributes();
    attrs["a"]["b"] = json!(99);
    assert_eq!(entity.get("a.b"), Some(json!(1)));
}

#[test]
fn test_runaway_index_is_neither_written_nor_reported() {
    let entity = Entity::new(json!({"tags": ["a"]}));
    let log = names_log(&entity);

    entity
        .set(
            json!({"tags.18446744073709551615": "b", "title": "t"}),
            &SetOptions::default(),
        )
        .unwrap();

    assert_eq!(entity.attributes(), json!({"tags": ["a"], "title": "t"}));
    assert_eq!(*log.borrow(), vec!["changed:title", "changed"]);
    assert!(!entity.has_changed(Some("tags.18446744073709551615")));
}
