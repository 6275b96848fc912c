use std::sync::Arc;

use replicant_engine::{
    boot, DeclareOpts, NoopTransport, Replicator, ReplicatorArgs, ReplicatorRole,
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
fn listener_added_in_declared_state_sees_the_current_value_synchronously() {
    let replicator = local_replicator();
    let replicant = declare(&replicator, "state", json!({"n": 0}));

    let changes = replicant.changes();
    let initial = changes.try_next().unwrap();
    assert!(initial.is_initial());
    assert_eq!(initial.new_value, Some(json!({"n": 0})));
    assert_eq!(initial.old_value, None);
    assert!(initial.operations.is_empty());
}

#[test]
fn one_shot_listener_fires_once_and_never_rearms() {
    let replicator = local_replicator();
    let replicant = declare(&replicator, "state", json!({"n": 0}));

    // A persistent listener registered beforehand.
    let persistent = replicant.changes();
    assert!(persistent.try_next().unwrap().is_initial());

    // The one-shot: consume exactly one event, then close.
    let one_shot = replicant.changes();
    let seed = one_shot.try_next().unwrap();
    assert!(seed.is_initial());
    assert_eq!(seed.new_value, Some(json!({"n": 0})));
    one_shot.close();

    replicant.set("/n", json!(1)).unwrap();
    replicator.flush_pending();

    // The one-shot must not observe the mutation; the persistent one must.
    assert!(one_shot.try_next().is_none());
    let event = persistent.try_next().unwrap();
    assert_eq!(event.new_value, Some(json!({"n": 1})));
    assert_eq!(event.old_value, Some(json!({"n": 0})));
    assert_eq!(event.operations.len(), 1);
}

#[test]
fn change_carries_new_value_old_value_and_operations() {
    let replicator = local_replicator();
    let replicant = declare(&replicator, "state", json!({"list": [1]}));
    let changes = replicant.changes();
    changes.try_next().unwrap();

    let list = replicant.root().unwrap().at("list").unwrap();
    list.push([json!(2)]).unwrap();
    replicant.set("/flag", json!(true)).unwrap();
    replicator.flush_pending();

    let event = changes.try_next().unwrap();
    assert_eq!(event.revision, 1);
    assert_eq!(event.old_value, Some(json!({"list": [1]})));
    assert_eq!(event.new_value, Some(json!({"list": [1, 2], "flag": true})));
    assert_eq!(event.operations.len(), 2);
}

#[test]
fn mutations_made_while_consuming_an_event_land_in_the_next_flush() {
    let replicator = local_replicator();
    let replicant = declare(&replicator, "state", json!({"n": 0}));
    let changes = replicant.changes();
    changes.try_next().unwrap();

    replicant.set("/n", json!(1)).unwrap();
    replicator.flush_pending();

    let event = changes.try_next().unwrap();
    assert_eq!(event.revision, 1);

    // React to the event with another mutation: it batches separately.
    replicant.set("/n", json!(2)).unwrap();
    assert!(changes.try_next().is_none());
    replicator.flush_pending();

    let next = changes.try_next().unwrap();
    assert_eq!(next.revision, 2);
    assert_eq!(next.old_value, Some(json!({"n": 1})));
}

#[tokio::test]
async fn streams_wake_when_a_flush_lands() {
    let replicator = Arc::new(local_replicator());
    let replicant = declare(&replicator, "state", json!({"n": 0}));
    let changes = replicant.changes();
    assert!(changes.next().await.unwrap().is_initial());

    let mutator = Arc::clone(&replicator);
    let target = Arc::clone(&replicant);
    let handle = tokio::spawn(async move {
        target.set("/n", json!(1)).unwrap();
        mutator.flush_pending();
    });

    let event = changes.next().await.unwrap();
    assert_eq!(event.new_value, Some(json!({"n": 1})));
    handle.await.unwrap();
}

#[test]
fn every_listener_observes_the_same_batch() {
    let replicator = local_replicator();
    let replicant = declare(&replicator, "state", json!({"n": 0}));

    let first = replicant.changes();
    let second = replicant.changes();
    first.try_next().unwrap();
    second.try_next().unwrap();

    replicant.set("/n", json!(5)).unwrap();
    replicator.flush_pending();

    let a = first.try_next().unwrap();
    let b = second.try_next().unwrap();
    assert_eq!(a, b);
}
