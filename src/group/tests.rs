use super::*;
use crate::entity::Schema;
use crate::sync::SyncOptions;
use serde_json::json;
use std::cell::Cell;
use std::cmp::Ordering;

fn group_of(items: Vec<Value>) -> Group {
    Group::new(
        Rc::new(GroupSchema::default()),
        items.into_iter().map(Item::Attrs).collect(),
    )
}

fn sorted_group(comparator: Comparator) -> Group {
    Group::new(
        Rc::new(GroupSchema::default().with_comparator(comparator)),
        Vec::new(),
    )
}

fn ids(group: &Group) -> Vec<Value> {
    group.pluck("id")
}

fn events(group: &Group) -> Rc<RefCell<Vec<String>>> {
    let log = Rc::new(RefCell::new(Vec::new()));
    let l = log.clone();
    group.on(names::ALL, callback(move |event| l.borrow_mut().push(event.name.clone())));
    log
}

fn items(values: Vec<Value>) -> Vec<Item> {
    values.into_iter().map(Item::Attrs).collect()
}

#[test]
fn test_initial_load_is_silent_and_indexed() {
    let group = group_of(vec![json!({"id": 1}), json!({"id": 2})]);

    assert_eq!(group.len(), 2);
    assert!(group.cid().starts_with('c'));
    assert_eq!(group.get(json!(2)).and_then(|e| e.id()), Some(json!(2)));
    assert!(group.get(json!({"id": 1})).is_some());

    let first = group.at(0).unwrap();
    assert!(group.get(first.cid()).unwrap().ptr_eq(&first));
    assert!(group.get(&first).unwrap().ptr_eq(&first));
    assert!(first.group().unwrap().ptr_eq(&group));
}

#[test]
fn test_get_by_string_and_numeric_id() {
    let group = group_of(vec![json!({"id": "a-1"}), json!({"id": 7})]);
    assert!(group.has("a-1"));
    assert!(group.has(json!(7)));
    assert!(group.has(json!({"id": 7})));
    assert!(!group.has(json!(8)));
    assert!(!group.has(json!(null)));
}

#[test]
fn test_add_sorts_by_descending_key_and_fires_one_sorted() {
    let group = sorted_group(Comparator::key(|e| {
        let id = e.get("id").and_then(|v| v.as_i64()).unwrap_or(0);
        json!(-id)
    }));
    let log = events(&group);

    group.add(
        items(vec![json!({"id": 1}), json!({"id": 3}), json!({"id": 2})]),
        &UpdateOptions::adding(),
    );

    assert_eq!(ids(&group), vec![json!(3), json!(2), json!(1)]);
    let sorted = log.borrow().iter().filter(|name| *name == names::SORTED).count();
    assert_eq!(sorted, 1);
}

#[test]
fn test_field_and_order_comparators() {
    let by_title = sorted_group(Comparator::field("title"));
    by_title.add(
        items(vec![json!({"title": "b"}), json!({"title": "c"}), json!({"title": "a"})]),
        &UpdateOptions::adding(),
    );
    assert_eq!(by_title.pluck("title"), vec![json!("a"), json!("b"), json!("c")]);

    let by_order = sorted_group(Comparator::order(|a, b| {
        let n = |e: &Entity| e.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
        n(b).cmp(&n(a))
    }));
    by_order.add(
        items(vec![json!({"n": 1}), json!({"n": 5}), json!({"n": 3})]),
        &UpdateOptions::adding(),
    );
    assert_eq!(by_order.pluck("n"), vec![json!(5), json!(3), json!(1)]);
}

#[test]
fn test_key_sort_is_stable() {
    let group = sorted_group(Comparator::field("rank"));
    group.add(
        items(vec![
            json!({"id": "x", "rank": 1}),
            json!({"id": "y", "rank": 0}),
            json!({"id": "z", "rank": 1}),
        ]),
        &UpdateOptions::adding(),
    );
    assert_eq!(ids(&group), vec![json!("y"), json!("x"), json!("z")]);
}

#[test]
fn test_compare_values_ranks_kinds() {
    assert_eq!(compare_values(&json!(2), &json!(10)), Ordering::Less);
    assert_eq!(compare_values(&json!("10"), &json!("2")), Ordering::Less);
    assert_eq!(compare_values(&json!(true), &json!(0)), Ordering::Less);
    assert_eq!(compare_values(&json!("a"), &Value::Null), Ordering::Less);
    assert_eq!(compare_values(&json!([1, 2]), &json!([1, 3])), Ordering::Less);
}

#[test]
fn test_sort_without_comparator_errors() {
    let group = group_of(vec![json!({"id": 1})]);
    assert_eq!(group.sort(false), Err(GroupError::MissingComparator));
}

#[test]
fn test_set_merges_in_place_and_keeps_identity() {
    let group = group_of(vec![json!({"id": 1, "name": "a"}), json!({"id": 2, "name": "b"})]);
    let original = group.get(json!(1)).unwrap();
    let changes = Rc::new(RefCell::new(Changes::default()));
    let c = changes.clone();
    group.on(
        names::UPDATED,
        callback(move |event| {
            if let Payload::Updated { changes, .. } = &event.payload {
                *c.borrow_mut() = changes.clone();
            }
        }),
    );

    let resolved = group.set(
        items(vec![json!({"id": 1, "name": "z"}), json!({"id": 3, "name": "c"})]),
        &UpdateOptions::default(),
    );

    assert!(resolved[0].as_ref().unwrap().ptr_eq(&original));
    assert_eq!(original.get("name"), Some(json!("z")));
    assert_eq!(ids(&group), vec![json!(1), json!(3)]);
    assert!(!group.has(json!(2)));

    let changes = changes.borrow();
    assert_eq!(changes.added.len(), 1);
    assert_eq!(changes.removed.len(), 1);
    assert_eq!(changes.merged.len(), 1);
}

#[test]
fn test_set_adopts_input_order() {
    let group = group_of(vec![json!({"id": 1}), json!({"id": 2}), json!({"id": 3})]);
    let log = events(&group);

    group.set(
        items(vec![json!({"id": 3}), json!({"id": 1}), json!({"id": 2})]),
        &UpdateOptions::default(),
    );

    assert_eq!(ids(&group), vec![json!(3), json!(1), json!(2)]);
    assert!(log.borrow().contains(&names::SORTED.to_string()));
}

#[test]
fn test_repeated_set_of_same_members_is_quiet() {
    let group = group_of(vec![json!({"id": 1}), json!({"id": 2})]);
    let same: Vec<Item> = group.members().into_iter().map(Item::Entity).collect();
    let log = events(&group);

    group.set(same.clone(), &UpdateOptions::default());
    group.set(same, &UpdateOptions::default());

    assert!(log.borrow().is_empty());
}

#[test]
fn test_merge_disabled_leaves_attributes() {
    let group = group_of(vec![json!({"id": 1, "name": "a"})]);
    group.add(items(vec![json!({"id": 1, "name": "b"})]), &UpdateOptions::adding());
    assert_eq!(group.get(json!(1)).unwrap().get("name"), Some(json!("a")));

    group.add(
        items(vec![json!({"id": 1, "name": "b"})]),
        &UpdateOptions::adding().merge(),
    );
    assert_eq!(group.get(json!(1)).unwrap().get("name"), Some(json!("b")));
}

#[test]
fn test_duplicate_input_collapses_to_first() {
    let group = group_of(Vec::new());
    let resolved = group.add(
        items(vec![json!({"id": 1, "v": "first"}), json!({"id": 1, "v": "second"})]),
        &UpdateOptions::adding(),
    );

    assert_eq!(group.len(), 1);
    assert!(resolved[0].as_ref().unwrap().ptr_eq(resolved[1].as_ref().unwrap()));
    assert_eq!(group.at(0).unwrap().get("v"), Some(json!("first")));
}

#[test]
fn test_merge_reorders_when_sort_field_changes() {
    let group = sorted_group(Comparator::field("rank"));
    group.add(
        items(vec![json!({"id": 1, "rank": 1}), json!({"id": 2, "rank": 2})]),
        &UpdateOptions::adding(),
    );
    let log = events(&group);

    group.set(
        items(vec![json!({"id": 1, "rank": 3}), json!({"id": 2, "rank": 2})]),
        &UpdateOptions::default(),
    );

    assert_eq!(ids(&group), vec![json!(2), json!(1)]);
    assert!(log.borrow().contains(&names::SORTED.to_string()));
}

#[test]
fn test_add_at_position_and_negative_index() {
    let group = group_of(vec![json!({"id": 1}), json!({"id": 2})]);
    let indices = Rc::new(RefCell::new(Vec::new()));
    let i = indices.clone();
    group.on(
        names::ADDED,
        callback(move |event| {
            if let Payload::Added { index, .. } = &event.payload {
                i.borrow_mut().push(*index);
            }
        }),
    );

    group.add(items(vec![json!({"id": 9})]), &UpdateOptions::adding().at(1));
    group.add(items(vec![json!({"id": 8})]), &UpdateOptions::adding().at(-1));
    group.add(items(vec![json!({"id": 7})]), &UpdateOptions::adding().at(99));
    group.add(items(vec![json!({"id": 6})]), &UpdateOptions::adding());

    assert_eq!(
        ids(&group),
        vec![json!(1), json!(9), json!(2), json!(8), json!(7), json!(6)]
    );
    assert_eq!(*indices.borrow(), vec![Some(1), Some(3), Some(4), None]);
}

#[test]
fn test_push_pop_shift_unshift() {
    let group = group_of(vec![json!({"id": 2})]);
    let options = UpdateOptions::adding();

    group.push(json!({"id": 3}), &options);
    group.unshift(json!({"id": 1}), &options);
    assert_eq!(ids(&group), vec![json!(1), json!(2), json!(3)]);

    assert_eq!(group.pop(&options).and_then(|e| e.id()), Some(json!(3)));
    assert_eq!(group.shift(&options).and_then(|e| e.id()), Some(json!(1)));
    assert_eq!(ids(&group), vec![json!(2)]);

    group.pop(&options);
    assert!(group.pop(&options).is_none());
    assert!(group.is_empty());
}

#[test]
fn test_remove_unindexes_before_removed_fires() {
    let group = group_of(vec![json!({"id": 1}), json!({"id": 2})]);
    let target = group.get(json!(1)).unwrap();
    let observed = Rc::new(RefCell::new(None));

    let (o, g) = (observed.clone(), group.clone());
    group.on(
        names::REMOVED,
        callback(move |event| {
            if let Payload::Removed { entity, index, .. } = &event.payload {
                *o.borrow_mut() = Some((g.has(entity), g.len(), *index));
                // Re-removing from the handler is a no-op
                g.remove_one(entity, &UpdateOptions::default());
            }
        }),
    );
    let log = events(&group);

    let removed = group.remove(vec![Item::from(&target)], &UpdateOptions::default());

    assert_eq!(removed.len(), 1);
    assert_eq!(*observed.borrow(), Some((false, 1, 0)));
    assert_eq!(*log.borrow(), vec![names::REMOVED, names::UPDATED]);
    assert!(target.group().is_none());
}

#[test]
fn test_removed_member_events_stop_relaying() {
    let group = group_of(vec![json!({"id": 1})]);
    let member = group.at(0).unwrap();
    group.remove_one(&member, &UpdateOptions::default());
    let log = events(&group);

    member.set(json!({"name": "x"}), &SetOptions::default()).unwrap();

    assert!(log.borrow().is_empty());
}

#[test]
fn test_remove_during_own_add_notification() {
    let group = group_of(Vec::new());
    let g = group.clone();
    group.on(
        names::ADDED,
        callback(move |event| {
            if let Payload::Added { entity, .. } = &event.payload {
                if entity.get("temporary") == Some(json!(true)) {
                    g.remove_one(entity, &UpdateOptions::default());
                }
            }
        }),
    );

    group.add(
        items(vec![json!({"id": 1, "temporary": true}), json!({"id": 2})]),
        &UpdateOptions::adding(),
    );

    assert_eq!(ids(&group), vec![json!(2)]);
    assert!(!group.has(json!(1)));
    assert_eq!(group.members().len(), group.len());
}

#[test]
fn test_member_events_relay_through_group() {
    let group = group_of(vec![json!({"id": 1, "name": "a"})]);
    let log = events(&group);

    group
        .at(0)
        .unwrap()
        .set(json!({"name": "b"}), &SetOptions::default())
        .unwrap();

    assert_eq!(*log.borrow(), vec!["changed:name", "changed"]);
}

#[test]
fn test_added_from_other_group_is_ignored() {
    let a = group_of(vec![json!({"id": 1})]);
    let b = group_of(Vec::new());
    let member = a.at(0).unwrap();
    let log = events(&a);

    b.add(vec![Item::from(&member)], &UpdateOptions::adding());

    assert!(!log.borrow().contains(&names::ADDED.to_string()));
    assert!(b.has(&member));
    // Ownership stays with the first group
    assert!(member.group().unwrap().ptr_eq(&a));
}

#[test]
fn test_id_change_reindexes() {
    let group = group_of(vec![json!({"name": "draft"})]);
    let member = group.at(0).unwrap();

    member.set(json!({"id": "p-1"}), &SetOptions::default()).unwrap();
    assert!(group.get("p-1").unwrap().ptr_eq(&member));

    member.set(json!({"id": "p-2"}), &SetOptions::default()).unwrap();
    assert!(group.get("p-1").is_none());
    assert!(group.get("p-2").is_some());
}

#[test]
fn test_invalid_input_is_dropped_with_notification() {
    let member = Rc::new(Schema::new().with_validator(|attrs| {
        if attrs.get("name").is_some() {
            Ok(())
        } else {
            Err(ValidationFailure::at("name", "required"))
        }
    }));
    let group = Group::new(Rc::new(GroupSchema::new(member)), Vec::new());
    let log = events(&group);

    let resolved = group.add(
        items(vec![json!({"id": 1}), json!({"id": 2, "name": "ok"})]),
        &UpdateOptions::adding(),
    );

    assert!(resolved[0].is_none());
    assert_eq!(group.len(), 1);
    assert_eq!(log.borrow()[0], names::INVALID);
}

#[test]
fn test_unresolved_lookup_key_adds_nothing() {
    let group = group_of(vec![json!({"id": 1})]);
    let log = events(&group);

    let resolved = group.add(
        vec![Item::from(json!("7")), Item::from(json!(8)), Item::from(json!(1))],
        &UpdateOptions::adding(),
    );

    assert!(resolved[0].is_none());
    assert!(resolved[1].is_none());
    assert!(resolved[2].as_ref().is_some_and(|entity| entity.get("id") == Some(json!(1))));
    assert_eq!(group.len(), 1);
    assert!(log.borrow().is_empty());

    let created = group.create(json!("7"), SyncOptions::default());
    assert!(matches!(created, Err(crate::sync::SyncError::Invalid(_))));
    assert_eq!(group.len(), 1);
}

#[test]
fn test_reset_replaces_and_reports_previous() {
    let group = group_of(vec![json!({"id": 1}), json!({"id": 2})]);
    let old = group.at(0).unwrap();
    let previous = Rc::new(Cell::new(0));
    let p = previous.clone();
    group.on(
        names::RESET,
        callback(move |event| {
            if let Payload::Reset { previous, .. } = &event.payload {
                p.set(previous.len());
            }
        }),
    );
    let log = events(&group);

    group.reset(items(vec![json!({"id": 3})]), &UpdateOptions::default());

    assert_eq!(ids(&group), vec![json!(3)]);
    assert_eq!(previous.get(), 2);
    assert_eq!(*log.borrow(), vec![names::RESET]);
    assert!(old.group().is_none());
    assert!(!group.has(json!(1)));
}

#[test]
fn test_destroyed_member_leaves_group() {
    let group = group_of(vec![json!({"name": "unsaved"})]);
    let member = group.at(0).unwrap();

    let result = member.destroy(SyncOptions::default()).unwrap();

    assert!(result.is_none());
    assert!(group.is_empty());
}

#[test]
fn test_iterators_walk_in_order() {
    let group = group_of(vec![json!({"id": 1}), json!({"name": "new"}), json!({"id": 3})]);

    let keys: Vec<Option<Value>> = group.keys().collect();
    assert_eq!(keys, vec![Some(json!(1)), None, Some(json!(3))]);

    let entries: Vec<(Option<Value>, Entity)> = group.entries().collect();
    assert!(entries[1].1.ptr_eq(&group.at(1).unwrap()));

    let mut count = 0;
    for member in &group {
        assert!(group.has(&member));
        count += 1;
    }
    assert_eq!(count, 3);

    // Each call starts over
    assert_eq!(group.values().count(), 3);
    assert_eq!(group.values().count(), 3);
}

#[test]
fn test_queries() {
    let group = group_of(vec![
        json!({"id": 1, "kind": "a"}),
        json!({"id": 2, "kind": "b"}),
        json!({"id": 3, "kind": "a"}),
    ]);

    assert_eq!(group.find_all(&json!({"kind": "a"})).len(), 2);
    assert_eq!(group.find_where(&json!({"kind": "b"})).and_then(|e| e.id()), Some(json!(2)));
    assert!(group.find_where(&json!({"kind": "z"})).is_none());
    assert_eq!(group.at(-1).and_then(|e| e.id()), Some(json!(3)));
    assert!(group.at(3).is_none());
    assert_eq!(group.slice(1, None).len(), 2);
    assert_eq!(group.slice(-2, Some(-1)).len(), 1);
    assert!(group.slice(2, Some(1)).is_empty());
    assert_eq!(group.index_of(&group.at(2).unwrap()), Some(2));
    assert_eq!(group.to_json()[0]["kind"], json!("a"));
}

#[test]
fn test_duplicate_shares_members() {
    let group = sorted_group(Comparator::field("id"));
    group.add(items(vec![json!({"id": 2}), json!({"id": 1})]), &UpdateOptions::adding());

    let copy = group.duplicate();

    assert_ne!(copy.cid(), group.cid());
    assert_eq!(ids(&copy), vec![json!(1), json!(2)]);
    assert!(copy.at(0).unwrap().ptr_eq(&group.at(0).unwrap()));
    assert!(copy.comparator().is_some());
}

#[test]
fn test_parse_runs_over_raw_input() {
    let schema = GroupSchema::default().with_parser(|raw| match raw {
        Value::Array(rows) => rows.into_iter().map(|row| row["record"].clone()).collect(),
        other => other,
    });
    let group = Group::new(Rc::new(schema), Vec::new());

    group.set(
        items(vec![json!({"record": {"id": 1}}), json!({"record": {"id": 2}})]),
        &UpdateOptions {
            parse: true,
            ..UpdateOptions::default()
        },
    );
    assert_eq!(ids(&group), vec![json!(1), json!(2)]);
}

#[test]
fn test_custom_factory_picks_schema_per_input() {
    struct ByKind {
        circle: Rc<Schema>,
        square: Rc<Schema>,
    }

    impl MemberFactory for ByKind {
        fn create_member(&self, attrs: Value, options: BuildOptions) -> Entity {
            let schema = if attrs["kind"] == json!("circle") { &self.circle } else { &self.square };
            Entity::build(schema.clone(), attrs, options)
        }
    }

    let factory = ByKind {
        circle: Rc::new(Schema::new().named("circle")),
        square: Rc::new(Schema::new().named("square")),
    };
    let group = Group::new(
        Rc::new(GroupSchema::default().with_factory(Rc::new(factory))),
        items(vec![json!({"id": 1, "kind": "circle"}), json!({"id": 2, "kind": "square"})]),
    );

    let kinds: Vec<Option<String>> = group.members().iter().map(|e| e.schema().name.clone()).collect();
    assert_eq!(kinds, vec![Some("circle".to_string()), Some("square".to_string())]);
}

#[test]
fn test_hooks_run_around_construction() {
    let seen = Rc::new(Cell::new(0));
    let s = seen.clone();
    let hooks = crate::hooks::Hooks::new()
        .pre_construct(|raw: &mut Vec<Item>| raw.push(Item::Attrs(json!({"id": "seeded"}))))
        .post_construct(move |_: &Group| s.set(s.get() + 1));
    let group = Group::new(Rc::new(GroupSchema::default().with_hooks(hooks)), Vec::new());

    assert_eq!(seen.get(), 1);
    assert!(group.has("seeded"));
}
