use super::*;
use gatekeeper_policy_controller_core::{object as obj, Expectations};
use gatekeeper_policy_controller_k8s_api::SOURCE_FINALIZER;
use pretty_assertions::assert_eq;

fn stored(h: &Harness, name: &str) -> Option<DynamicObject> {
    h.cluster
        .get_obj(&Gvk::of_resource::<SyncSet>(), &ObjectKey::cluster(name))
}

#[tokio::test]
async fn syncsets_share_kinds() {
    let h = Harness::new();
    let reconciler = h.syncset_reconciler();
    h.cluster
        .create(mk_syncset("s1", vec![pods(), namespaces()]));
    h.cluster
        .create(mk_syncset("s2", vec![namespaces(), configmaps()]));

    for name in ["s1", "s2"] {
        reconciler
            .reconcile(&ObjectKey::cluster(name))
            .await
            .expect("must reconcile");
        let syncset = stored(&h, name).expect("syncset must exist");
        assert!(obj::has_finalizer(&syncset, SOURCE_FINALIZER));
    }
    assert_eq!(
        h.registrar.watching(),
        vec![configmaps(), namespaces(), pods()]
    );

    let s1 = stored(&h, "s1").expect("syncset must exist");
    h.cluster.delete(&s1).await.expect("must delete");
    reconciler
        .reconcile(&ObjectKey::cluster("s1"))
        .await
        .expect("must reconcile");
    assert!(stored(&h, "s1").is_none());
    assert_eq!(h.registrar.watching(), vec![configmaps(), namespaces()]);
    assert_eq!(h.registrar.count(&Call::Add(namespaces())), 1);
    assert_eq!(h.registrar.count(&Call::Remove(namespaces())), 0);
}

#[tokio::test]
async fn missing_syncset_withdraws_its_kinds() {
    let h = Harness::new();
    let reconciler = h.syncset_reconciler();
    h.cluster.create(mk_syncset("s1", vec![pods()]));
    reconciler
        .reconcile(&ObjectKey::cluster("s1"))
        .await
        .expect("must reconcile");
    assert_eq!(h.registrar.watching(), vec![pods()]);

    h.cluster
        .remove_obj(&Gvk::of_resource::<SyncSet>(), &ObjectKey::cluster("s1"));
    reconciler
        .reconcile(&ObjectKey::cluster("s1"))
        .await
        .expect("must reconcile");
    assert!(h.registrar.watching().is_empty());
    assert!(h.cache.aggregator().sources().is_empty());
}

#[tokio::test]
async fn updated_syncset_replaces_its_kinds() {
    let h = Harness::new();
    let reconciler = h.syncset_reconciler();
    let created = h.cluster.create(mk_syncset("s1", vec![pods()]));
    h.tracker
        .tracker(&Gvk::of_resource::<SyncSet>())
        .expect(&created);
    reconciler
        .reconcile(&ObjectKey::cluster("s1"))
        .await
        .expect("must reconcile");
    assert!(h.tracker.satisfied());

    let mut updated = mk_syncset("s1", vec![deployments()]);
    obj::add_finalizer(&mut updated, SOURCE_FINALIZER);
    h.cluster.create(updated);
    reconciler
        .reconcile(&ObjectKey::cluster("s1"))
        .await
        .expect("must reconcile");
    assert_eq!(h.registrar.watching(), vec![deployments()]);
    assert_eq!(
        h.cache.aggregator().list(&SourceKey::syncset("s1")).items(),
        vec![deployments()]
    );
}
