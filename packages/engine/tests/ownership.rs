use std::sync::Arc;

use replicant_engine::{
    boot, DeclareOpts, ErrorKind, NoopTransport, Replicator, ReplicatorArgs, ReplicatorRole,
};
use serde_json::json;

fn local_replicator() -> Replicator {
    boot(ReplicatorArgs::new(
        ReplicatorRole::Authoritative,
        Arc::new(NoopTransport),
    ))
}

fn declare(
    replicator: &Replicator,
    name: &str,
    default: serde_json::Value,
) -> Arc<replicant_engine::Replicant> {
    replicator
        .find_or_declare(
            "bundle",
            name,
            DeclareOpts {
                persistent: false,
                default_value: Some(default),
                ..DeclareOpts::default()
            },
        )
        .unwrap()
}

#[test]
fn grafting_a_foreign_composite_fails_with_cross_ownership() {
    let replicator = local_replicator();
    let a = declare(&replicator, "a", json!({}));
    let b = declare(&replicator, "b", json!({}));

    a.set("/x", json!({"k": 1})).unwrap();
    let a_x = a.root().unwrap().at("x").unwrap();

    let error = b.set("/y", &a_x).unwrap_err();
    assert_eq!(error.kind, ErrorKind::CrossOwnership);
    let details = error.details.unwrap();
    assert_eq!(details["owner"]["name"], "a");
    assert_eq!(details["target"]["name"], "b");
    assert_eq!(details["value"], json!({"k": 1}));

    replicator.flush_pending();
    assert_eq!(b.get(), Some(json!({})));
    assert_eq!(b.revision(), 0);
}

#[test]
fn grafting_a_foreign_descendant_also_fails() {
    let replicator = local_replicator();
    let a = declare(&replicator, "a", json!({"x": {"deep": {"k": 1}}}));
    let b = declare(&replicator, "b", json!({}));

    let deep = a.root().unwrap().at("x").unwrap().at("deep").unwrap();
    let error = b.set("/y", &deep).unwrap_err();
    assert_eq!(error.kind, ErrorKind::CrossOwnership);
}

#[test]
fn detached_clones_are_owner_free() {
    let replicator = local_replicator();
    let a = declare(&replicator, "a", json!({"x": {"k": 1}}));
    let b = declare(&replicator, "b", json!({}));

    // A deep clone severs ownership; only live handles carry provenance.
    let clone = a.value_at("/x").unwrap().unwrap();
    b.set("/y", clone).unwrap();
    replicator.flush_pending();
    assert_eq!(b.value_at("/y").unwrap(), Some(json!({"k": 1})));
}

#[test]
fn moving_a_subtree_rebinds_its_handle_path() {
    let replicator = local_replicator();
    let a = declare(&replicator, "a", json!({"src": {"k": 1}}));

    let src = a.root().unwrap().at("src").unwrap();
    assert_eq!(src.path().unwrap(), "/src");

    a.set("/dst", &src).unwrap();
    // The handle follows the subtree to its new location.
    assert_eq!(src.path().unwrap(), "/dst");
    src.set("k", json!(2)).unwrap();
    replicator.flush_pending();

    assert_eq!(a.value_at("/dst").unwrap(), Some(json!({"k": 2})));
    // The source location keeps its raw value, tracked independently.
    assert_eq!(a.value_at("/src").unwrap(), Some(json!({"k": 1})));
}

#[test]
fn grafting_into_own_subtree_is_rejected() {
    let replicator = local_replicator();
    let a = declare(&replicator, "a", json!({"x": {"k": 1}}));

    let x = a.root().unwrap().at("x").unwrap();
    let error = a.set("/x/child", &x).unwrap_err();
    assert_eq!(error.kind, ErrorKind::Internal);

    let root = a.root().unwrap();
    let error = a.set("/x/self", &root).unwrap_err();
    assert_eq!(error.kind, ErrorKind::Internal);
}

#[test]
fn handles_into_spliced_arrays_keep_tracking_their_element() {
    let replicator = local_replicator();
    let a = declare(&replicator, "a", json!({"xs": [{"id": 0}, {"id": 1}, {"id": 2}]}));

    let xs = a.root().unwrap().at("xs").unwrap();
    let second = xs.at_index(1).unwrap();
    assert_eq!(second.path().unwrap(), "/xs/1");

    xs.shift().unwrap();
    assert_eq!(second.path().unwrap(), "/xs/0");
    assert_eq!(second.fetch().unwrap(), json!({"id": 1}));

    xs.unshift([json!({"id": -1})]).unwrap();
    assert_eq!(second.path().unwrap(), "/xs/1");
    replicator.flush_pending();
    assert_eq!(
        a.value_at("/xs").unwrap(),
        Some(json!([{"id": -1}, {"id": 1}, {"id": 2}]))
    );
}

#[test]
fn overwrite_releases_ownership_of_the_old_tree() {
    let replicator = local_replicator();
    let a = declare(&replicator, "a", json!({"x": {"k": 1}}));
    let b = declare(&replicator, "b", json!({}));

    let x = a.root().unwrap().at("x").unwrap();
    a.replace(json!({"fresh": true})).unwrap();

    // The old subtree is released; its handle no longer resolves anywhere.
    let error = b.set("/y", &x).unwrap_err();
    assert_eq!(error.kind, ErrorKind::Internal);
}

#[test]
fn delete_releases_the_removed_subtree() {
    let replicator = local_replicator();
    let a = declare(&replicator, "a", json!({"x": {"k": 1}}));

    let x = a.root().unwrap().at("x").unwrap();
    a.remove("/x").unwrap();
    assert!(x.fetch().is_err());
}
