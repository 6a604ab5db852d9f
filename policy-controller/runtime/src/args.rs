use crate::{
    client::ClusterClient,
    controllers,
    core::{CancellationToken, Gvk, ObjectKey, Reader, Tracker},
    k8s::{Config, SyncSet, CONFIG_NAME},
    sync::{
        events, CacheManager, ConfigReconciler, FinalizerCleanup, Inventory, ReadinessTracker,
        SyncHandler, SyncMetrics, SyncSetReconciler, EVENT_QUEUE_CAPACITY,
    },
    watch::WatchManager,
};
use anyhow::{bail, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use std::{sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time};
use tracing::{error, info, info_span, warn, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "gatekeeper-policy-controller",
    about = "Syncs cluster resources into the policy engine's data cache"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "gatekeeper=info,warn",
        env = "GATEKEEPER_POLICY_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Namespace holding the `config` Config resource
    #[clap(long, default_value = "gatekeeper-system")]
    operation_namespace: String,

    /// Hold a finalizer on every synced object until it leaves the data cache
    #[clap(long)]
    finalize_synced_objects: bool,

    /// How long a watch blocks on a full event queue before retrying
    #[clap(long, default_value = "5000")]
    event_send_timeout_ms: u64,

    /// How long a new finalizer cleanup waits for the previous one to stop
    #[clap(long, default_value = "5000")]
    cleanup_stop_timeout_ms: u64,

    #[clap(long, default_value = "5")]
    requeue_after_secs: u64,
}

impl Args {
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            operation_namespace,
            finalize_synced_objects,
            event_send_timeout_ms,
            cleanup_stop_timeout_ms,
            requeue_after_secs,
        } = self;
        let requeue_after = Duration::from_secs(requeue_after_secs);

        let mut prom = <Registry>::default();
        let metrics = SyncMetrics::register(prom.sub_registry_with_prefix("sync"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let shutdown = CancellationToken::new();
        let cluster = ClusterClient::new(runtime.client());
        let reader = Arc::new(cluster.clone());

        let (events_tx, events_rx) = events::channel(
            EVENT_QUEUE_CAPACITY,
            Duration::from_millis(event_send_timeout_ms),
        );
        let events_tx = events_tx.with_timeout_counter(metrics.event_send_timeouts());
        let registrar = Arc::new(WatchManager::new(
            cluster.clone(),
            events_tx,
            shutdown.clone(),
        ));

        let tracker = Arc::new(ReadinessTracker::default());
        expect_sources(&cluster, tracker.as_ref(), &operation_namespace).await;
        tracker.populated();

        let cache = Arc::new(
            CacheManager::builder()
                .registrar(registrar)
                .data_client(Arc::new(Inventory::new()))
                .reader(reader.clone())
                .tracker(tracker.clone())
                .shutdown(shutdown.clone())
                .metrics(metrics.clone())
                .build()?,
        );

        let config_key = ObjectKey::namespaced(operation_namespace.clone(), CONFIG_NAME);
        let cleanup = Arc::new(
            FinalizerCleanup::new(config_key, reader.clone(), reader.clone())
                .with_object_finalizers(finalize_synced_objects)
                .with_stop_timeout(Duration::from_millis(cleanup_stop_timeout_ms))
                .with_metrics(metrics),
        );

        let handler =
            SyncHandler::new(cache.clone(), reader.clone()).with_finalizers(cleanup.clone());
        let handler = tokio::spawn(
            handler
                .run(events_rx, shutdown.clone())
                .instrument(info_span!("sync_handler")),
        );

        let configs = Arc::new(ConfigReconciler::new(
            operation_namespace.clone(),
            reader.clone(),
            reader.clone(),
            cache.clone(),
            tracker.clone(),
            cleanup.clone(),
        ));
        tokio::spawn(
            controllers::configs(
                runtime.client(),
                operation_namespace,
                configs,
                requeue_after,
                shutdown.clone(),
            )
            .instrument(info_span!("configs")),
        );

        let syncsets = Arc::new(
            SyncSetReconciler::new(reader.clone(), reader, cache.clone(), tracker.clone())
                .with_finalizers(cleanup.clone()),
        );
        tokio::spawn(
            controllers::syncsets(runtime.client(), syncsets, requeue_after, shutdown.clone())
                .instrument(info_span!("syncsets")),
        );

        let cleanup = tokio::spawn(
            controllers::cleanup_on_changes(cache, cleanup, shutdown.clone())
                .instrument(info_span!("finalizer_cleanup")),
        );

        tokio::spawn(
            report_readiness(tracker, shutdown.clone()).instrument(info_span!("readiness")),
        );

        tokio::spawn(drain_on_shutdown(
            runtime.shutdown_handle(),
            shutdown,
            handler,
            cleanup,
        ));

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

/// Once shutdown is signaled, stops the controllers and holds the runtime open
/// until the event queue and finalizer cleanup have drained.
async fn drain_on_shutdown(
    drain: drain::Watch,
    shutdown: CancellationToken,
    handler: JoinHandle<()>,
    cleanup: JoinHandle<()>,
) {
    let release = drain.signaled().await;
    shutdown.cancel();
    release
        .release_after(async move {
            let (handler, cleanup) = tokio::join!(handler, cleanup);
            for (task, res) in [("sync_handler", handler), ("finalizer_cleanup", cleanup)] {
                if let Err(error) = res {
                    error!(task, %error, "Task failed during shutdown");
                }
            }
        })
        .await;
}

/// Registers the sources that exist at startup so that readiness waits for
/// each of them to be reconciled once.
async fn expect_sources(cluster: &ClusterClient, tracker: &ReadinessTracker, namespace: &str) {
    let config_gvk = Gvk::of_resource::<Config>();
    let config_key = ObjectKey::namespaced(namespace, CONFIG_NAME);
    match cluster.get(&config_gvk, &config_key).await {
        Ok(config) => tracker.for_gvk(&config_gvk).expect(&config),
        Err(error) if error.is_not_found() || error.is_no_match() => {}
        Err(error) => warn!(%error, "Failed to read Config; not waiting on it for readiness"),
    }

    let syncset_gvk = Gvk::of_resource::<SyncSet>();
    match cluster.list(&syncset_gvk).await {
        Ok(syncsets) => {
            let expectations = tracker.for_gvk(&syncset_gvk);
            for syncset in &syncsets {
                expectations.expect(syncset);
            }
        }
        Err(error) if error.is_no_match() => {}
        Err(error) => warn!(%error, "Failed to list SyncSets; not waiting on them for readiness"),
    }
}

async fn report_readiness(tracker: Arc<ReadinessTracker>, shutdown: CancellationToken) {
    let mut interval = time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => {}
        }
        if tracker.satisfied() {
            info!("Synced every expected source");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_is_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn defaults() {
        let args = Args::try_parse_from(["gatekeeper-policy-controller"]).expect("must parse");
        assert_eq!(args.operation_namespace, "gatekeeper-system");
        assert!(!args.finalize_synced_objects);
        assert_eq!(args.event_send_timeout_ms, 5000);
        assert_eq!(args.cleanup_stop_timeout_ms, 5000);
        assert_eq!(args.requeue_after_secs, 5);
    }

    #[test]
    fn overrides() {
        let args = Args::try_parse_from([
            "gatekeeper-policy-controller",
            "--operation-namespace=opa",
            "--finalize-synced-objects",
            "--event-send-timeout-ms=100",
        ])
        .expect("must parse");
        assert_eq!(args.operation_namespace, "opa");
        assert!(args.finalize_synced_objects);
        assert_eq!(args.event_send_timeout_ms, 100);
    }

    #[tokio::test]
    async fn shutdown_waits_for_tasks_that_fail() {
        let (signal, watch) = drain::channel();
        let shutdown = CancellationToken::new();
        let handler = tokio::spawn(async { panic!("handler failed") });
        let cleanup = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { shutdown.cancelled().await }
        });
        let task = tokio::spawn(drain_on_shutdown(watch, shutdown.clone(), handler, cleanup));

        signal.drain().await;
        assert!(shutdown.is_cancelled());
        task.await.expect("draining must not panic");
    }
}
