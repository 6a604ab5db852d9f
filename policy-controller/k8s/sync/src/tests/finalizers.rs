use super::*;
use gatekeeper_policy_controller_core::{object as obj, GvkSet};
use gatekeeper_policy_controller_k8s_api::SYNC_FINALIZER;
use pretty_assertions::assert_eq;
use tokio::{sync::watch, time};

/// Creates the Config with the given recorded kinds, and `count` finalized
/// objects of each kind.
fn seed(cluster: &FakeCluster, recorded: &[Gvk], count: usize) {
    let mut config = mk_config(vec![], &[]);
    set_recorded_finalizers(&mut config, recorded);
    cluster.create(config);
    for gvk in recorded {
        for i in 0..count {
            let mut o = mk_namespaced(gvk, "ns-0", &format!("obj-{i}"));
            obj::add_finalizer(&mut o, SYNC_FINALIZER);
            cluster.create(o);
        }
    }
}

fn finalized(cluster: &FakeCluster, gvk: &Gvk) -> usize {
    cluster
        .objects_of(gvk)
        .iter()
        .filter(|o| obj::has_finalizer(*o, SYNC_FINALIZER))
        .count()
}

fn recorded(cluster: &FakeCluster) -> Vec<Gvk> {
    let config = cluster
        .get_obj(&Gvk::of_resource::<Config>(), &config_key())
        .expect("config must exist");
    recorded_finalizers(&config)
}

async fn finished(rx: &mut watch::Receiver<CleanupStatus>) -> CleanupStatus {
    time::timeout(Duration::from_secs(600), async {
        loop {
            {
                let status = rx.borrow_and_update();
                if matches!(
                    status.state,
                    CleanupState::Completed | CleanupState::Exhausted { .. }
                ) {
                    return status.clone();
                }
            }
            rx.changed().await.expect("cleanup must be alive");
        }
    })
    .await
    .expect("cleanup must finish")
}

fn set(gvks: Vec<Gvk>) -> GvkSet {
    gvks.into_iter().collect()
}

#[tokio::test(start_paused = true)]
async fn kinds_no_longer_synced_are_cleaned() {
    let h = Harness::new();
    seed(&h.cluster, &[pods(), configmaps()], 5);
    let cleanup = h.cleanup(true);
    let mut rx = cleanup.subscribe();

    let config = cleanup
        .reconcile(&set(vec![configmaps()]))
        .await
        .expect("must reconcile")
        .expect("config must exist");
    assert_eq!(recorded_finalizers(&config), vec![configmaps(), pods()]);

    let status = finished(&mut rx).await;
    assert_eq!(status.job, 1);
    assert_eq!(status.state, CleanupState::Completed);
    assert_eq!(finalized(&h.cluster, &pods()), 0);
    assert_eq!(finalized(&h.cluster, &configmaps()), 5);
    assert_eq!(recorded(&h.cluster), vec![configmaps()]);
}

#[tokio::test(start_paused = true)]
async fn desired_kinds_are_recorded() {
    let h = Harness::new();
    seed(&h.cluster, &[], 0);
    let cleanup = h.cleanup(true);

    cleanup
        .reconcile(&set(vec![pods(), deployments()]))
        .await
        .expect("must reconcile");
    assert_eq!(recorded(&h.cluster), vec![pods(), deployments()]);
    assert_eq!(cleanup.subscribe().borrow().state, CleanupState::Idle);
}

#[tokio::test(start_paused = true)]
async fn disabled_finalization_cleans_everything_recorded() {
    let h = Harness::new();
    seed(&h.cluster, &[pods()], 3);
    let cleanup = h.cleanup(false);
    let mut rx = cleanup.subscribe();

    cleanup
        .reconcile(&set(vec![pods()]))
        .await
        .expect("must reconcile");
    assert_eq!(finished(&mut rx).await.state, CleanupState::Completed);
    assert_eq!(finalized(&h.cluster, &pods()), 0);
    assert!(recorded(&h.cluster).is_empty());
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried() {
    let h = Harness::new();
    seed(&h.cluster, &[pods(), configmaps()], 4);
    h.cluster.fail_lists(pods(), 2);
    h.cluster.fail_updates(ObjectKey::namespaced("ns-0", "obj-1"), 1);
    let cleanup = h.cleanup(true);
    let mut rx = cleanup.subscribe();

    cleanup
        .reconcile(&GvkSet::new())
        .await
        .expect("must reconcile");
    assert_eq!(finished(&mut rx).await.state, CleanupState::Completed);
    assert_eq!(h.cluster.list_calls(&pods()), 3);
    assert_eq!(finalized(&h.cluster, &pods()), 0);
    assert_eq!(finalized(&h.cluster, &configmaps()), 0);
    assert!(recorded(&h.cluster).is_empty());
}

#[tokio::test(start_paused = true)]
async fn unserved_kinds_count_as_clean() {
    let h = Harness::new();
    seed(&h.cluster, &[deployments()], 0);
    h.cluster.unserve(deployments());
    let cleanup = h.cleanup(true);
    let mut rx = cleanup.subscribe();

    cleanup
        .reconcile(&GvkSet::new())
        .await
        .expect("must reconcile");
    assert_eq!(finished(&mut rx).await.state, CleanupState::Completed);
    assert!(recorded(&h.cluster).is_empty());
}

#[tokio::test(start_paused = true)]
async fn exhausted_cleanup_reports_remaining_kinds() {
    let h = Harness::new();
    seed(&h.cluster, &[pods(), configmaps()], 2);
    h.cluster.fail_lists(pods(), 100);
    let cleanup = h.cleanup(true);
    let mut rx = cleanup.subscribe();

    cleanup
        .reconcile(&GvkSet::new())
        .await
        .expect("must reconcile");
    assert_eq!(
        finished(&mut rx).await.state,
        CleanupState::Exhausted {
            remaining: vec![pods()]
        }
    );
    assert_eq!(h.cluster.list_calls(&pods()), 3);
    assert_eq!(recorded(&h.cluster), vec![pods()]);
    assert_eq!(finalized(&h.cluster, &configmaps()), 0);
}

#[tokio::test(start_paused = true)]
async fn new_jobs_replace_running_ones() {
    let h = Harness::new();
    seed(&h.cluster, &[pods(), configmaps()], 20);
    h.cluster.delay_updates(Duration::from_millis(50));
    let cleanup = h.cleanup(true);
    let mut rx = cleanup.subscribe();

    cleanup
        .reconcile(&GvkSet::new())
        .await
        .expect("must reconcile");
    time::sleep(Duration::from_millis(120)).await;
    assert!(matches!(
        rx.borrow().state,
        CleanupState::Running { .. }
    ));

    // Configmaps are wanted again; only pods still need cleaning.
    cleanup
        .reconcile(&set(vec![configmaps()]))
        .await
        .expect("must reconcile");
    let status = finished(&mut rx).await;
    assert_eq!(status.job, 2);
    assert_eq!(status.state, CleanupState::Completed);
    assert_eq!(h.cluster.max_in_flight(), 1);
    assert_eq!(finalized(&h.cluster, &pods()), 0);
    assert_eq!(recorded(&h.cluster), vec![configmaps()]);

    // Reconciling the same targets doesn't start another job.
    cleanup
        .reconcile(&set(vec![configmaps()]))
        .await
        .expect("must reconcile");
    assert_eq!(rx.borrow().job, 2);
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_the_running_job() {
    let h = Harness::new();
    seed(&h.cluster, &[pods()], 20);
    h.cluster.delay_updates(Duration::from_millis(50));
    let cleanup = h.cleanup(true);
    let rx = cleanup.subscribe();

    cleanup
        .reconcile(&GvkSet::new())
        .await
        .expect("must reconcile");
    time::sleep(Duration::from_millis(120)).await;
    cleanup.stop().await;

    assert_eq!(
        rx.borrow().state,
        CleanupState::Cancelled {
            remaining: vec![pods()]
        }
    );
    assert!(finalized(&h.cluster, &pods()) > 0);
    assert_eq!(recorded(&h.cluster), vec![pods()]);
}

#[tokio::test(start_paused = true)]
async fn missing_config_is_not_an_error() {
    let h = Harness::new();
    let cleanup = h.cleanup(true);
    let config = cleanup
        .reconcile(&set(vec![pods()]))
        .await
        .expect("must reconcile");
    assert!(config.is_none());
    assert!(cleanup.finalize_objects());
}
