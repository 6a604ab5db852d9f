//! Bookkeeping and cleanup of the sync finalizer on synced objects.
//!
//! When object finalization is enabled, every synced object carries
//! [`SYNC_FINALIZER`], and the Config's `status.allFinalizers` lists each kind
//! whose objects may carry it. Once a kind is no longer synced, a background
//! job strips the finalizer from its objects and then drops the kind from the
//! status. At most one job runs at a time: starting a job stops the previous
//! one and waits, up to a timeout, for it to finish.

use crate::{metrics::SyncMetrics, Error};
use gatekeeper_policy_controller_core::{
    object, Attempt, Backoff, CancellationToken, Gvk, GvkSet, ObjectKey, Reader, RetryError,
    Writer,
};
use gatekeeper_policy_controller_k8s_api::{
    Config, ConfigStatus, DynamicObject, GvkEntry, SYNC_FINALIZER,
};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time,
};
use tracing::{info_span, Instrument};

pub const CLEANUP_BACKOFF: Backoff = Backoff::new(Duration::from_secs(1), 2.0, 1.0, 5);

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct FinalizerCleanup {
    ctx: Arc<Context>,
    finalize_objects: bool,
    backoff: Backoff,
    stop_timeout: Duration,
    metrics: SyncMetrics,
    job: Mutex<Option<Job>>,
    jobs: AtomicU64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CleanupState {
    Idle,
    Running { remaining: Vec<Gvk> },
    /// The job was asked to stop and is winding down.
    Draining,
    Completed,
    Cancelled { remaining: Vec<Gvk> },
    /// The retry budget ran out with kinds still carrying finalizers.
    Exhausted { remaining: Vec<Gvk> },
}

/// The state of the most recently started job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CleanupStatus {
    pub job: u64,
    pub state: CleanupState,
}

struct Context {
    config: ObjectKey,
    reader: Arc<dyn Reader>,
    writer: Arc<dyn Writer>,

    /// Serializes writes to the Config's status.
    status: Mutex<()>,
    /// The kinds last read from or written to `status.allFinalizers`.
    recorded: GvkSet,
    state: watch::Sender<CleanupStatus>,
}

struct Job {
    id: u64,
    targets: GvkSet,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

// === impl FinalizerCleanup ===

impl FinalizerCleanup {
    pub fn new(config: ObjectKey, reader: Arc<dyn Reader>, writer: Arc<dyn Writer>) -> Self {
        let (state, _) = watch::channel(CleanupStatus {
            job: 0,
            state: CleanupState::Idle,
        });
        Self {
            ctx: Arc::new(Context {
                config,
                reader,
                writer,
                status: Mutex::new(()),
                recorded: GvkSet::new(),
                state,
            }),
            finalize_objects: false,
            backoff: CLEANUP_BACKOFF,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            metrics: SyncMetrics::default(),
            job: Mutex::new(None),
            jobs: AtomicU64::new(0),
        }
    }

    /// Records synced kinds in the Config's status so their finalizers can be
    /// cleaned up later.
    pub fn with_object_finalizers(mut self, enabled: bool) -> Self {
        self.finalize_objects = enabled;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: SyncMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn finalize_objects(&self) -> bool {
        self.finalize_objects
    }

    pub fn subscribe(&self) -> watch::Receiver<CleanupStatus> {
        self.ctx.state.subscribe()
    }

    /// True if objects of `gvk` may be given the sync finalizer: object
    /// finalization is enabled and the kind is listed in the Config's status.
    pub fn is_recorded(&self, gvk: &Gvk) -> bool {
        self.finalize_objects && self.ctx.recorded.contains(gvk)
    }

    /// Adds kinds to the Config's status without starting a cleanup. Kinds
    /// must be recorded before their objects are synced.
    pub async fn record(&self, kinds: &GvkSet) -> Result<(), Error> {
        if !self.finalize_objects || kinds.is_empty() {
            return Ok(());
        }
        let _status = self.ctx.status.lock().await;
        let Some(mut config) = self.ctx.get_config().await? else {
            return Ok(());
        };
        let recorded = all_finalizers(&config)?;
        let next = recorded.clone();
        next.add_set(kinds);
        if !next.equals(&recorded) {
            tracing::debug!(kinds = %next, "Recording finalized kinds");
            set_all_finalizers(&mut config, &next)?;
            self.ctx.writer.update_status(&config).await?;
        }
        self.ctx.recorded.replace(&next);
        Ok(())
    }

    /// Records the kinds that may now carry finalizers and starts cleaning up
    /// the recorded kinds that are no longer synced.
    ///
    /// Returns the latest Config, or `None` when it does not exist.
    pub async fn reconcile(&self, desired: &GvkSet) -> Result<Option<DynamicObject>, Error> {
        let (config, to_clean) = {
            let _status = self.ctx.status.lock().await;
            let Some(mut config) = self.ctx.get_config().await? else {
                self.ctx.recorded.clear();
                return Ok(None);
            };
            let recorded = all_finalizers(&config)?;
            let finalized = if self.finalize_objects {
                desired.clone()
            } else {
                GvkSet::new()
            };
            let to_clean = recorded.difference(&finalized);
            let next = recorded.clone();
            next.add_set(&finalized);
            if !next.equals(&recorded) {
                tracing::debug!(kinds = %next, "Recording finalized kinds");
                set_all_finalizers(&mut config, &next)?;
                config = self.ctx.writer.update_status(&config).await?;
            }
            self.ctx.recorded.replace(&next);
            (config, to_clean)
        };

        self.start(to_clean).await;
        Ok(Some(config))
    }

    /// Stops the running job, if any.
    pub async fn stop(&self) {
        if let Some(job) = self.job.lock().await.take() {
            self.stop_job(job).await;
        }
    }

    async fn start(&self, targets: GvkSet) {
        let mut job = self.job.lock().await;
        if let Some(current) = job.as_ref() {
            if !current.task.is_finished() && current.targets.equals(&targets) {
                return;
            }
        }
        if let Some(previous) = job.take() {
            self.stop_job(previous).await;
        }
        if targets.is_empty() {
            return;
        }

        let id = self.jobs.fetch_add(1, Ordering::Relaxed) + 1;
        let stop = CancellationToken::new();
        let task = tokio::spawn(
            run(
                self.ctx.clone(),
                id,
                targets.clone(),
                stop.clone(),
                self.backoff.clone(),
                self.metrics.clone(),
            )
            .instrument(info_span!("finalizer_cleanup", job = id)),
        );
        *job = Some(Job {
            id,
            targets,
            stop,
            task,
        });
    }

    async fn stop_job(&self, job: Job) {
        if job.task.is_finished() {
            return;
        }
        job.stop.cancel();
        self.ctx.set_state(job.id, CleanupState::Draining);
        if time::timeout(self.stop_timeout, job.task).await.is_err() {
            tracing::warn!(
                job = job.id,
                timeout = ?self.stop_timeout,
                "Finalizer cleanup did not stop in time"
            );
        }
    }
}

async fn run(
    ctx: Arc<Context>,
    id: u64,
    pending: GvkSet,
    stop: CancellationToken,
    backoff: Backoff,
    metrics: SyncMetrics,
) {
    ctx.set_state(
        id,
        CleanupState::Running {
            remaining: pending.items(),
        },
    );
    tracing::info!(kinds = %pending, "Removing sync finalizers");

    let res = {
        let ctx = &*ctx;
        let pending = &pending;
        let stop = &stop;
        let metrics = &metrics;
        backoff
            .retry(stop, move || ctx.pass(id, pending, stop, metrics))
            .await
    };

    let remaining = pending.items();
    let state = match res {
        Ok(()) => {
            tracing::info!("Removed sync finalizers");
            CleanupState::Completed
        }
        Err(_) if stop.is_cancelled() => {
            tracing::debug!(kinds = %pending, "Finalizer cleanup stopped");
            CleanupState::Cancelled { remaining }
        }
        Err(RetryError::Exhausted { steps, last }) => {
            let error = last.map(|e| e.to_string()).unwrap_or_default();
            tracing::error!(kinds = %pending, steps, %error, "Could not remove all sync finalizers");
            CleanupState::Exhausted { remaining }
        }
        Err(error) => {
            tracing::error!(kinds = %pending, %error, "Finalizer cleanup failed");
            CleanupState::Exhausted { remaining }
        }
    };
    ctx.set_state(id, state);
}

// === impl Context ===

impl Context {
    /// Publishes a job's state unless a newer job has already reported.
    fn set_state(&self, job: u64, state: CleanupState) {
        self.state.send_if_modified(|status| {
            if status.job > job || (status.job == job && status.state == state) {
                return false;
            }
            *status = CleanupStatus { job, state };
            true
        });
    }

    async fn get_config(&self) -> Result<Option<DynamicObject>, Error> {
        match self
            .reader
            .get(&Gvk::of_resource::<Config>(), &self.config)
            .await
        {
            Ok(config) => Ok(Some(config)),
            Err(error) if error.is_not_found() => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    /// One sweep over the pending kinds.
    async fn pass(
        &self,
        job: u64,
        pending: &GvkSet,
        stop: &CancellationToken,
        metrics: &SyncMetrics,
    ) -> Attempt<Error> {
        let mut last = None;
        for gvk in pending.items() {
            if stop.is_cancelled() {
                return Attempt::Retry(Some(Error::Cancelled));
            }
            let res = match self.strip_kind(&gvk, stop, metrics).await {
                Ok(()) => self.forget(&gvk).await,
                Err(error) => Err(error),
            };
            match res {
                Ok(()) => {
                    tracing::debug!(%gvk, "Removed sync finalizers from kind");
                    pending.remove([&gvk]);
                }
                Err(Error::Cancelled) => return Attempt::Retry(Some(Error::Cancelled)),
                Err(error) => {
                    tracing::warn!(%gvk, %error, "Failed to remove sync finalizers");
                    last = Some(error);
                }
            }
        }

        if pending.is_empty() {
            return Attempt::Done;
        }
        self.set_state(
            job,
            CleanupState::Running {
                remaining: pending.items(),
            },
        );
        Attempt::Retry(last)
    }

    async fn strip_kind(
        &self,
        gvk: &Gvk,
        stop: &CancellationToken,
        metrics: &SyncMetrics,
    ) -> Result<(), Error> {
        let objs = match self.reader.list(gvk).await {
            Ok(objs) => objs,
            Err(error) if error.is_no_match() => {
                tracing::debug!(%gvk, "Kind is not served; nothing to clean");
                return Ok(());
            }
            Err(error) => return Err(error.into()),
        };

        let mut failed = None;
        for mut obj in objs {
            if stop.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if !object::remove_finalizer(&mut obj, SYNC_FINALIZER) {
                continue;
            }
            if obj.types.is_none() {
                object::set_type(&mut obj, gvk);
            }
            match self.writer.update(&obj).await {
                Ok(_) => {
                    metrics.finalizers_removed.inc();
                }
                Err(error) if error.is_not_found() => {}
                Err(error) => {
                    tracing::debug!(%gvk, key = %ObjectKey::of(&obj), %error, "Failed to update object");
                    failed = Some(error);
                }
            }
        }
        match failed {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }

    /// Drops a cleaned kind from the Config's status.
    async fn forget(&self, gvk: &Gvk) -> Result<(), Error> {
        let _status = self.status.lock().await;
        let Some(mut config) = self.get_config().await? else {
            self.recorded.remove([gvk]);
            return Ok(());
        };
        let recorded = all_finalizers(&config)?;
        if recorded.contains(gvk) {
            recorded.remove([gvk]);
            set_all_finalizers(&mut config, &recorded)?;
            match self.writer.update_status(&config).await {
                Ok(_) => {}
                Err(error) if error.is_not_found() => {}
                Err(error) => return Err(error.into()),
            }
        }
        self.recorded.replace(&recorded);
        Ok(())
    }
}

fn all_finalizers(config: &DynamicObject) -> Result<GvkSet, Error> {
    let Some(status) = config.data.get("status") else {
        return Ok(GvkSet::new());
    };
    let status = serde_json::from_value::<ConfigStatus>(status.clone())
        .map_err(|source| Error::Parse {
            kind: "ConfigStatus",
            source,
        })?;
    Ok(status.all_finalizers.iter().map(Gvk::from).collect())
}

fn set_all_finalizers(config: &mut DynamicObject, kinds: &GvkSet) -> Result<(), Error> {
    let status = ConfigStatus {
        all_finalizers: kinds.items().iter().map(GvkEntry::from).collect(),
    };
    let status = serde_json::to_value(status).map_err(|source| Error::Parse {
        kind: "ConfigStatus",
        source,
    })?;
    match config.data.as_object_mut() {
        Some(data) => {
            data.insert("status".to_string(), status);
        }
        None => config.data = serde_json::json!({ "status": status }),
    }
    Ok(())
}
