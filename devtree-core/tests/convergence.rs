//! Replica convergence tests.
//!
//! A source tree is mutated through its loud API while a replica is fed
//! only the patches the source publishes. After every step both trees must
//! serialize identically.

use devtree_core::{BoundsTable, EndpointParams, Patch, Tree, TreeError, TreeEvent};
use serde_json::json;
use std::sync::{Arc, Mutex};

type Outbox = Arc<Mutex<Vec<TreeEvent>>>;

fn record(tree: &mut Tree) -> Outbox {
    let outbox: Outbox = Arc::default();
    let sink = outbox.clone();
    tree.subscribe(move |e| sink.lock().unwrap().push(e.clone()));
    outbox
}

/// Encode a published patch as JSON text and decode it again, the way it
/// crosses a session.
fn over_the_wire(patch: &Patch) -> Patch {
    let text = serde_json::to_string(&patch.to_value()).unwrap();
    Patch::from_json(&text).unwrap()
}

/// Apply whatever the source published since the last call, then compare.
fn sync(outbox: &Outbox, replica: &mut Tree, source: &Tree) {
    for event in outbox.lock().unwrap().drain(..) {
        match event {
            TreeEvent::Update(patch) => replica.apply_update(&over_the_wire(&patch)).unwrap(),
            TreeEvent::Delete(patch) => replica.apply_deletion(&over_the_wire(&patch)).unwrap(),
        }
    }
    assert_eq!(replica.to_json(), source.to_json());
}

/// Source seeded with device fe80::1 carrying sensor 2, and a replica
/// hydrated from the same snapshot.
fn pair() -> (Tree, Tree, Outbox) {
    let mut source = Tree::new();
    source
        .add_endpoint(
            "fe80::1",
            2,
            &EndpointParams::sensor(3, "Power meter")
                .with_bounds(0.0, 3600.0)
                .with_device_name("Test Device"),
        )
        .unwrap();
    let replica = Tree::from_snapshot(&source.snapshot(), BoundsTable::default()).unwrap();
    let outbox = record(&mut source);
    (source, replica, outbox)
}

#[test]
fn test_regression_scenario_converges() {
    let (mut source, mut replica, outbox) = pair();
    sync(&outbox, &mut replica, &source);

    let view_id = source.add_view("FooBarz", vec!["fe80::1.2".into()]).id();
    sync(&outbox, &mut replica, &source);

    source.view_mut(view_id).unwrap().set_name("New Name");
    sync(&outbox, &mut replica, &source);

    source
        .view_mut(view_id)
        .unwrap()
        .set_endpoints(vec!["fe80::1.2".into()]);
    sync(&outbox, &mut replica, &source);

    source.remove_view(view_id).unwrap();
    sync(&outbox, &mut replica, &source);
    assert!(replica.view(view_id).is_none());

    source.device_mut("fe80::1").unwrap().rename("New Device Name");
    sync(&outbox, &mut replica, &source);

    source.add_device("fe80::42", "Doomsday").unwrap();
    sync(&outbox, &mut replica, &source);

    source.remove_device("fe80::42").unwrap();
    sync(&outbox, &mut replica, &source);

    source.add_device("fe80::42", "Doomsday").unwrap();
    sync(&outbox, &mut replica, &source);

    source
        .device_mut("fe80::42")
        .unwrap()
        .add_endpoint(666, &EndpointParams::actor(1, "Doomsday switch"))
        .unwrap();
    sync(&outbox, &mut replica, &source);

    source
        .device_mut("fe80::42")
        .unwrap()
        .add_endpoint(2, &EndpointParams::sensor(3, "Power").with_unit("TW"))
        .unwrap();
    sync(&outbox, &mut replica, &source);

    source
        .endpoint_mut("fe80::42.2")
        .unwrap()
        .set_last_value(json!(42))
        .unwrap();
    sync(&outbox, &mut replica, &source);

    {
        let mut ep = source.endpoint_mut("fe80::42.2").unwrap();
        ep.set_maxvalue(50.0).unwrap();
        ep.set_minvalue(2.0).unwrap();
    }
    sync(&outbox, &mut replica, &source);

    source.device_mut("fe80::42").unwrap().remove_endpoint(666).unwrap();
    sync(&outbox, &mut replica, &source);

    let ep = replica.endpoint_by_id("fe80::42.2").unwrap();
    assert_eq!(ep.last_value(), &json!(42));
    assert_eq!(ep.minvalue(), Some(2.0));
    assert_eq!(ep.maxvalue(), Some(50.0));
    assert_eq!(ep.unit(), Some("TW"));
    assert!(replica.endpoint_by_id("fe80::42.666").is_none());
}

#[test]
fn test_null_value_converges() {
    let (mut source, mut replica, outbox) = pair();
    source.record_value("fe80::1.2", json!(42)).unwrap();
    sync(&outbox, &mut replica, &source);

    source.record_value("fe80::1.2", serde_json::Value::Null).unwrap();
    sync(&outbox, &mut replica, &source);
    assert!(replica.endpoint_by_id("fe80::1.2").unwrap().last_value().is_null());
}

#[test]
fn test_blank_change_cannot_delete() {
    let (_source, mut replica, _outbox) = pair();
    let before = replica.to_json();

    for raw in [
        r#"{"devices":{"fe80::1":{"endpoints":{}}}}"#,
        r#"{"devices":{"fe80::1":{"name":null}}}"#,
        r#"{"devices":{"fe80::1":{"unknown":1}}}"#,
    ] {
        let err = Patch::from_json(raw).unwrap_err();
        assert!(matches!(err, TreeError::MalformedPatch(_)), "accepted {raw}");
    }
    assert_eq!(replica.to_json(), before);

    // A null value is an update, never an endpoint tombstone.
    let patch = Patch::from_json(r#"{"devices":{"fe80::1":{"endpoints":{"2":{"last_value":null}}}}}"#).unwrap();
    replica.apply_update(&over_the_wire(&patch)).unwrap();
    let ep = replica.endpoint_by_id("fe80::1.2").unwrap();
    assert!(ep.last_value().is_null());
}

#[test]
fn test_deletion_is_idempotent() {
    let (mut source, mut replica, outbox) = pair();
    source.add_device("fe80::42", "Doomsday").unwrap();
    sync(&outbox, &mut replica, &source);

    let patch = Patch::device_tombstone("fe80::42");
    replica.apply_deletion(&patch).unwrap();
    let after_first = replica.to_json();
    replica.apply_deletion(&patch).unwrap();
    assert_eq!(replica.to_json(), after_first);

    let endpoint_patch = Patch::endpoint_tombstone("fe80::1", 2);
    replica.apply_deletion(&endpoint_patch).unwrap();
    replica.apply_deletion(&endpoint_patch).unwrap();
    assert_eq!(replica.device("fe80::1").unwrap().endpoint_count(), 0);
}

#[test]
fn test_tombstone_disambiguation() {
    let (_source, mut replica, _outbox) = pair();

    let update = Patch::from_value(json!({
        "devices": { "fe80::1": { "endpoints": { "2": { "last_value": 1, "last_update": 100 } } } }
    }))
    .unwrap();
    replica.apply_update(&update).unwrap();
    let ep = replica.endpoint_by_id("fe80::1.2").unwrap();
    assert_eq!(ep.last_value(), &json!(1));
    assert_eq!(ep.last_update(), 100);

    let delete = Patch::from_value(json!({
        "devices": { "fe80::1": { "endpoints": { "2": {} } } }
    }))
    .unwrap();
    replica.apply_update(&delete).unwrap();
    assert!(replica.endpoint_by_id("fe80::1.2").is_none());
}

#[test]
fn test_quiet_apply_never_publishes() {
    let (mut source, mut replica, outbox) = pair();
    let echoes = record(&mut replica);

    source.add_view("Dashboard", vec!["fe80::1.2".into()]);
    source.record_value("fe80::1.2", json!(7)).unwrap();
    source.add_device("fe80::42", "Doomsday").unwrap();
    source.remove_device("fe80::42").unwrap();
    source.reset();
    sync(&outbox, &mut replica, &source);

    assert!(echoes.lock().unwrap().is_empty());
}

#[test]
fn test_multi_entity_patch_rejected_atomically() {
    let (_source, mut replica, _outbox) = pair();
    let before = replica.to_json();

    let patch = Patch::from_value(json!({
        "devices": {
            "fe80::1": { "name": "Renamed", "last_update": 5 },
            "fe80::7": {
                "name": "New", "last_update": 5,
                "endpoints": { "1": { "last_value": 0, "last_update": 5 } }
            }
        },
        "views": {
            "4b0c7d36-3b0f-4f4a-9d87-2f1d3a4b5c6d": { "name": "V", "devices": [] }
        }
    }))
    .unwrap();

    let err = replica.apply_update(&patch).unwrap_err();
    assert!(matches!(err, TreeError::MalformedPatch(_)));
    assert_eq!(replica.to_json(), before);
}

#[test]
fn test_last_write_wins() {
    let (_source, mut replica, _outbox) = pair();
    for (name, ts) in [("First", 10), ("Second", 11)] {
        let patch = Patch::from_value(json!({
            "devices": { "fe80::1": { "name": name, "last_update": ts } }
        }))
        .unwrap();
        replica.apply_update(&patch).unwrap();
    }
    assert_eq!(replica.device("fe80::1").unwrap().name(), "Second");
}
