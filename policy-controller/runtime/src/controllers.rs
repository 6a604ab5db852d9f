//! Drives the `Config` and `SyncSet` reconcilers from Kubernetes watches.

use crate::{
    core::{CancellationToken, ObjectKey},
    k8s::{Config, Resource, SyncSet},
    sync::{CacheManager, ConfigReconciler, Error, FinalizerCleanup, SyncSetReconciler},
};
use futures::prelude::*;
use kube::{
    runtime::{
        controller::{Action, Controller},
        watcher,
    },
    Api, Client,
};
use std::{fmt, sync::Arc, time::Duration};
use tracing::{debug, info, warn};

/// Reconciles one resource type by key.
#[async_trait::async_trait]
pub(crate) trait Reconcile: Send + Sync + 'static {
    async fn reconcile(&self, key: &ObjectKey) -> Result<(), Error>;
}

struct Context<R> {
    reconciler: Arc<R>,
    requeue_after: Duration,
}

#[async_trait::async_trait]
impl Reconcile for ConfigReconciler {
    async fn reconcile(&self, key: &ObjectKey) -> Result<(), Error> {
        ConfigReconciler::reconcile(self, key).await
    }
}

#[async_trait::async_trait]
impl Reconcile for SyncSetReconciler {
    async fn reconcile(&self, key: &ObjectKey) -> Result<(), Error> {
        SyncSetReconciler::reconcile(self, key).await
    }
}

pub(crate) async fn configs(
    client: Client,
    namespace: String,
    reconciler: Arc<ConfigReconciler>,
    requeue_after: Duration,
    shutdown: CancellationToken,
) {
    let api = Api::<Config>::namespaced(client, &namespace);
    run(api, reconciler, requeue_after, shutdown).await
}

pub(crate) async fn syncsets(
    client: Client,
    reconciler: Arc<SyncSetReconciler>,
    requeue_after: Duration,
    shutdown: CancellationToken,
) {
    let api = Api::<SyncSet>::all(client);
    run(api, reconciler, requeue_after, shutdown).await
}

async fn run<K, R>(
    api: Api<K>,
    reconciler: Arc<R>,
    requeue_after: Duration,
    shutdown: CancellationToken,
) where
    K: Resource<DynamicType = ()>
        + Clone
        + fmt::Debug
        + serde::de::DeserializeOwned
        + Send
        + Sync
        + 'static,
    R: Reconcile,
{
    let ctx = Arc::new(Context {
        reconciler,
        requeue_after,
    });
    Controller::new(api, watcher::Config::default())
        .graceful_shutdown_on(async move { shutdown.cancelled().await })
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(name = %obj.name, "Reconciled"),
                Err(error) => warn!(%error, "Reconcile failed"),
            }
        })
        .await;
    info!(kind = %K::kind(&()), "Controller stopped");
}

async fn reconcile<K, R>(obj: Arc<K>, ctx: Arc<Context<R>>) -> Result<Action, Error>
where
    K: Resource,
    R: Reconcile,
{
    ctx.reconciler.reconcile(&ObjectKey::of(obj.as_ref())).await?;
    Ok(Action::await_change())
}

fn error_policy<K, R>(_: Arc<K>, error: &Error, ctx: Arc<Context<R>>) -> Action {
    warn!(%error, requeue_after = ?ctx.requeue_after, "Requeuing");
    Action::requeue(ctx.requeue_after)
}

/// Re-runs finalizer bookkeeping whenever the set of watched kinds changes,
/// stopping any running cleanup on shutdown.
pub(crate) async fn cleanup_on_changes(
    cache: Arc<CacheManager>,
    cleanup: Arc<FinalizerCleanup>,
    shutdown: CancellationToken,
) {
    let mut changes = cache.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            res = changes.changed() => if res.is_err() {
                break;
            },
        }
        if let Err(error) = cleanup.reconcile(&cache.desired_gvks()).await {
            warn!(%error, "Failed to reconcile sync finalizers");
        }
    }
    cleanup.stop().await;
}
