use super::*;
use gatekeeper_policy_controller_core::{object as obj, CancellationToken};
use gatekeeper_policy_controller_k8s_api::SYNC_FINALIZER;
use pretty_assertions::assert_eq;

async fn watching_pods(h: &Harness) {
    h.cache
        .upsert_source(&SourceKey::syncset("s1"), vec![pods()])
        .await
        .expect("must converge");
}

/// Creates the Config and records pods in its status.
async fn recorded(h: &Harness) -> Arc<FinalizerCleanup> {
    h.cluster.create(mk_config(vec![], &[]));
    let cleanup = h.cleanup(true);
    cleanup
        .record(&[pods()].into_iter().collect())
        .await
        .expect("must record");
    cleanup
}

#[tokio::test]
async fn applies_and_deletes_objects() {
    let h = Harness::new();
    watching_pods(&h).await;
    let handler = SyncHandler::new(h.cache.clone(), h.cluster.clone());

    let pod = mk_namespaced(&pods(), "ns-0", "a");
    handler
        .handle(SyncEvent::apply(pods(), pod.clone()))
        .await
        .expect("must apply");
    assert_eq!(h.cached(&pods()), vec![ObjectKey::namespaced("ns-0", "a")]);

    // Objects of unwatched kinds are dropped.
    handler
        .handle(SyncEvent::apply(
            configmaps(),
            mk_namespaced(&configmaps(), "ns-0", "x"),
        ))
        .await
        .expect("must apply");
    assert!(h.cached(&configmaps()).is_empty());

    handler
        .handle(SyncEvent::delete(pods(), pod))
        .await
        .expect("must delete");
    assert!(h.cached(&pods()).is_empty());
}

#[tokio::test]
async fn untyped_events_take_the_event_kind() {
    let h = Harness::new();
    watching_pods(&h).await;
    let handler = SyncHandler::new(h.cache.clone(), h.cluster.clone());

    let mut pod = mk_namespaced(&pods(), "ns-0", "a");
    pod.types = None;
    handler
        .handle(SyncEvent::apply(pods(), pod))
        .await
        .expect("must apply");
    assert_eq!(h.cached(&pods()), vec![ObjectKey::namespaced("ns-0", "a")]);
}

#[tokio::test]
async fn synced_objects_carry_the_finalizer() {
    let h = Harness::new();
    watching_pods(&h).await;
    let handler = SyncHandler::new(h.cache.clone(), h.cluster.clone())
        .with_finalizers(recorded(&h).await);

    let pod = h.cluster.create(mk_namespaced(&pods(), "ns-0", "a"));
    handler
        .handle(SyncEvent::apply(pods(), pod))
        .await
        .expect("must apply");
    let stored = h
        .cluster
        .get_obj(&pods(), &ObjectKey::namespaced("ns-0", "a"))
        .expect("pod must exist");
    assert!(obj::has_finalizer(&stored, SYNC_FINALIZER));
    assert_eq!(h.cached(&pods()), vec![ObjectKey::namespaced("ns-0", "a")]);

    // Deletion removes the object from the cache, then releases it.
    h.cluster.delete(&stored).await.expect("must delete");
    let deleting = h
        .cluster
        .get_obj(&pods(), &ObjectKey::namespaced("ns-0", "a"))
        .expect("finalizer holds the pod");
    handler
        .handle(SyncEvent::apply(pods(), deleting))
        .await
        .expect("must apply");
    assert!(h.cached(&pods()).is_empty());
    assert!(h
        .cluster
        .get_obj(&pods(), &ObjectKey::namespaced("ns-0", "a"))
        .is_none());
}

#[tokio::test]
async fn excluded_objects_are_not_finalized() {
    let h = Harness::new();
    watching_pods(&h).await;
    h.cache
        .exclude_processes(excluding("kube-system", "sync"))
        .await
        .expect("must converge");
    let handler = SyncHandler::new(h.cache.clone(), h.cluster.clone())
        .with_finalizers(recorded(&h).await);

    let pod = h.cluster.create(mk_namespaced(&pods(), "kube-system", "a"));
    handler
        .handle(SyncEvent::apply(pods(), pod))
        .await
        .expect("must apply");
    let stored = h
        .cluster
        .get_obj(&pods(), &ObjectKey::namespaced("kube-system", "a"))
        .expect("pod must exist");
    assert!(!obj::has_finalizer(&stored, SYNC_FINALIZER));
    assert!(h.cached(&pods()).is_empty());
}

#[tokio::test]
async fn unrecorded_kinds_are_not_finalized() {
    let h = Harness::new();
    watching_pods(&h).await;
    h.cluster.create(mk_config(vec![], &[]));
    let cleanup = h.cleanup(true);
    let handler =
        SyncHandler::new(h.cache.clone(), h.cluster.clone()).with_finalizers(cleanup.clone());

    let pod = h.cluster.create(mk_namespaced(&pods(), "ns-0", "a"));
    handler
        .handle(SyncEvent::apply(pods(), pod.clone()))
        .await
        .expect("must apply");
    let stored = h
        .cluster
        .get_obj(&pods(), &ObjectKey::namespaced("ns-0", "a"))
        .expect("pod must exist");
    assert!(!obj::has_finalizer(&stored, SYNC_FINALIZER));
    assert_eq!(h.cached(&pods()), vec![ObjectKey::namespaced("ns-0", "a")]);

    // Once the kind is recorded, later events add the finalizer.
    cleanup
        .record(&[pods()].into_iter().collect())
        .await
        .expect("must record");
    handler
        .handle(SyncEvent::apply(pods(), stored))
        .await
        .expect("must apply");
    let stored = h
        .cluster
        .get_obj(&pods(), &ObjectKey::namespaced("ns-0", "a"))
        .expect("pod must exist");
    assert!(obj::has_finalizer(&stored, SYNC_FINALIZER));
}

#[tokio::test]
async fn update_failures_are_reported() {
    let h = Harness::new();
    watching_pods(&h).await;
    let handler = SyncHandler::new(h.cache.clone(), h.cluster.clone())
        .with_finalizers(recorded(&h).await);
    let pod = h.cluster.create(mk_namespaced(&pods(), "ns-0", "a"));
    h.cluster.fail_updates(ObjectKey::namespaced("ns-0", "a"), 1);

    let error = handler
        .handle(SyncEvent::apply(pods(), pod.clone()))
        .await
        .expect_err("update must fail");
    assert!(matches!(error, Error::Client(_)), "{error}");
    assert!(h.cached(&pods()).is_empty());

    handler
        .handle(SyncEvent::apply(pods(), pod))
        .await
        .expect("retry must apply");
    assert_eq!(h.cached(&pods()), vec![ObjectKey::namespaced("ns-0", "a")]);
}

#[tokio::test]
async fn run_drains_the_queue() {
    let h = Harness::new();
    watching_pods(&h).await;
    let handler = SyncHandler::new(h.cache.clone(), h.cluster.clone());
    let (tx, rx) = crate::events::channel(EVENT_QUEUE_CAPACITY, Duration::from_secs(1));
    let task = tokio::spawn(handler.run(rx, CancellationToken::new()));

    for name in ["a", "b", "c"] {
        tx.send(SyncEvent::apply(pods(), mk_namespaced(&pods(), "ns-0", name)))
            .await
            .expect("queue must accept");
    }
    tx.send(SyncEvent::delete(pods(), mk_namespaced(&pods(), "ns-0", "b")))
        .await
        .expect("queue must accept");
    drop(tx);
    task.await.expect("handler must not panic");

    assert_eq!(
        h.cached(&pods()),
        vec![
            ObjectKey::namespaced("ns-0", "a"),
            ObjectKey::namespaced("ns-0", "c")
        ]
    );
}

#[tokio::test]
async fn run_stops_on_shutdown() {
    let h = Harness::new();
    let handler = SyncHandler::new(h.cache.clone(), h.cluster.clone());
    let (_tx, rx) = crate::events::channel(EVENT_QUEUE_CAPACITY, Duration::from_secs(1));
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(handler.run(rx, shutdown.clone()));
    shutdown.cancel();
    task.await.expect("handler must not panic");
}
