//! Bridges watch-source registration to the watch registrar and the policy
//! engine's data cache.
//!
//! Sources (the Config resource and each SyncSet) declare the kinds they want
//! synced. The [`CacheManager`] keeps the registrar's watch set equal to the
//! union of those requests, and keeps the data cache holding exactly the
//! objects of watched kinds that no process exclusion filters out.
//!
//! Convergence passes are serialized: each source update commits to the
//! aggregator and then converges against the resulting union while holding the
//! convergence lock, so concurrent updates are applied one at a time and the
//! last pass always observes every committed request. Failures are reported to
//! the caller, which requeues; the committed request is never rolled back.

use crate::{
    aggregator::{GvkAggregator, SourceKey},
    error::WatchFailures,
    excluder::{Process, ProcessExcluder},
    metrics::{DataOp, SyncMetrics},
    Error,
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use gatekeeper_policy_controller_core::{
    object, Attempt, Backoff, CancellationToken, DataClient, Gvk, GvkSet, ObjectKey, Reader,
    Registrar, RemoveTarget, RetryError, Tracker,
};
use gatekeeper_policy_controller_k8s_api::DynamicObject;
use parking_lot::RwLock;
use std::{collections::BTreeSet, sync::Arc, time::Duration};
use tokio::sync::{watch, Mutex};

/// Retry policy for listing a newly watched kind.
pub const POPULATION_BACKOFF: Backoff = Backoff::new(Duration::from_millis(100), 2.0, 0.1, 5);

pub struct CacheManager {
    aggregator: GvkAggregator,
    registrar: Arc<dyn Registrar>,
    data: Arc<dyn DataClient>,
    reader: Arc<dyn Reader>,
    tracker: Arc<dyn Tracker>,
    excluder: RwLock<Arc<ProcessExcluder>>,

    /// The kinds the registrar is actually watching. Only updated while
    /// `objects` is held.
    watched: GvkSet,

    convergence: Mutex<Pending>,

    /// Held across data-cache writes so that per-object writes never
    /// interleave with bulk removals.
    objects: Mutex<ObjectIndex>,

    population: Backoff,
    generation: watch::Sender<u64>,
    shutdown: CancellationToken,
    metrics: SyncMetrics,
}

#[derive(Default)]
pub struct Builder {
    registrar: Option<Arc<dyn Registrar>>,
    data: Option<Arc<dyn DataClient>>,
    reader: Option<Arc<dyn Reader>>,
    tracker: Option<Arc<dyn Tracker>>,
    excluder: ProcessExcluder,
    population: Option<Backoff>,
    shutdown: Option<CancellationToken>,
    metrics: SyncMetrics,
}

/// Work left over from earlier convergence passes.
#[derive(Debug, Default)]
struct Pending {
    /// Watched kinds whose existing objects have not all been loaded.
    unpopulated: GvkSet,

    /// A removal from the data cache failed, so it may hold objects that
    /// should be gone. Resolved by wiping the cache and reloading.
    stale: bool,
}

/// The objects this manager has written to the data cache.
#[derive(Debug, Default)]
struct ObjectIndex {
    by_kind: HashMap<Gvk, BTreeSet<ObjectKey>>,

    /// Keys touched by watch events since the kind's current list request was
    /// issued. Listed copies of these keys are stale and are not written.
    listing: HashMap<Gvk, HashSet<ObjectKey>>,
}

// === impl Builder ===

impl Builder {
    pub fn registrar(mut self, registrar: Arc<dyn Registrar>) -> Self {
        self.registrar = Some(registrar);
        self
    }

    pub fn data_client(mut self, data: Arc<dyn DataClient>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn reader(mut self, reader: Arc<dyn Reader>) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn tracker(mut self, tracker: Arc<dyn Tracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn excluder(mut self, excluder: ProcessExcluder) -> Self {
        self.excluder = excluder;
        self
    }

    pub fn population_backoff(mut self, backoff: Backoff) -> Self {
        self.population = Some(backoff);
        self
    }

    /// Cancels in-progress population retries when fired.
    pub fn shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn metrics(mut self, metrics: SyncMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn build(self) -> Result<CacheManager, Error> {
        let registrar = self.registrar.ok_or(Error::MissingDependency("registrar"))?;
        let data = self.data.ok_or(Error::MissingDependency("data client"))?;
        let reader = self.reader.ok_or(Error::MissingDependency("reader"))?;
        let tracker = self.tracker.ok_or(Error::MissingDependency("tracker"))?;
        let (generation, _) = watch::channel(0);
        Ok(CacheManager {
            aggregator: GvkAggregator::new(),
            registrar,
            data,
            reader,
            tracker,
            excluder: RwLock::new(Arc::new(self.excluder)),
            watched: GvkSet::new(),
            convergence: Mutex::new(Pending::default()),
            objects: Mutex::new(ObjectIndex::default()),
            population: self.population.unwrap_or(POPULATION_BACKOFF),
            generation,
            shutdown: self.shutdown.unwrap_or_default(),
            metrics: self.metrics,
        })
    }
}

// === impl CacheManager ===

impl CacheManager {
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Replaces the kinds requested by `key` and converges the watch set.
    ///
    /// The request is committed even when convergence fails; the error tells
    /// the caller to retry.
    pub async fn upsert_source(
        &self,
        key: &SourceKey,
        gvks: impl IntoIterator<Item = Gvk>,
    ) -> Result<(), Error> {
        let mut pending = self.convergence.lock().await;
        self.aggregator.upsert(key, gvks);
        tracing::debug!(source = %key, gvks = %self.aggregator.list(key), "Updated source");
        self.converge(&mut pending).await
    }

    /// Drops every kind requested by `key` and converges the watch set.
    /// Removing an unknown source still retries any unfinished convergence.
    pub async fn remove_source(&self, key: &SourceKey) -> Result<(), Error> {
        let mut pending = self.convergence.lock().await;
        self.aggregator.remove(key);
        tracing::debug!(source = %key, "Removed source");
        self.converge(&mut pending).await
    }

    /// Installs a new process excluder. Cached objects that are now excluded
    /// are evicted and every watched kind is reloaded, picking up objects that
    /// are no longer excluded.
    pub async fn exclude_processes(&self, excluder: ProcessExcluder) -> Result<(), Error> {
        let mut pending = self.convergence.lock().await;
        if *self.excluder() == excluder {
            return Ok(());
        }
        let excluder = Arc::new(excluder);
        *self.excluder.write() = excluder.clone();
        tracing::info!("Process exclusions changed");

        {
            let mut objects = self.objects.lock().await;
            let evicted = objects.drain_matching(|gvk, key| {
                excluder.excludes_key(Process::Sync, gvk, key)
            });
            for (gvk, key) in evicted {
                let target = RemoveTarget::Object(object::stub(&gvk, &key));
                match self.data.remove_data(&target).await {
                    Ok(_) => self.metrics.data_op(DataOp::Remove),
                    Err(error) => {
                        tracing::warn!(%gvk, %key, %error, "Failed to evict excluded object");
                        pending.stale = true;
                    }
                }
            }
        }

        pending.unpopulated.add_set(&self.watched);
        self.converge(&mut pending).await
    }

    /// Writes a watched object to the data cache. Objects of kinds that are
    /// not watched, or that the sync process excludes, are skipped.
    pub async fn add_object(&self, obj: &DynamicObject) -> Result<(), Error> {
        self.write_object(obj, false).await
    }

    async fn write_object(&self, obj: &DynamicObject, listed: bool) -> Result<(), Error> {
        let gvk = Gvk::of(obj).ok_or(Error::MissingType)?;
        let key = ObjectKey::of(obj);
        let expectations = self.tracker.for_gvk(&gvk);

        let mut objects = self.objects.lock().await;
        if !listed {
            objects.touch(&gvk, &key);
        } else if objects.touched_while_listing(&gvk, &key) {
            tracing::debug!(%gvk, %key, "Skipping listed object superseded by a watch event");
            return Ok(());
        }
        if !self.is_wanted(&gvk) {
            tracing::debug!(%gvk, %key, "Skipping object of unwatched kind");
            expectations.cancel_expect(obj);
            return Ok(());
        }

        if self.excluder().is_excluded(Process::Sync, &gvk, obj) {
            tracing::debug!(%gvk, %key, "Skipping excluded object");
            if objects.remove(&gvk, &key) {
                self.data
                    .remove_data(&RemoveTarget::Object(obj.clone()))
                    .await?;
                self.metrics.data_op(DataOp::Remove);
            }
            expectations.cancel_expect(obj);
            return Ok(());
        }

        match self.data.add_data(obj).await {
            Ok(rsps) => {
                for target in rsps.unhandled() {
                    tracing::debug!(%gvk, %key, target, "Data target did not handle object");
                }
                self.metrics.data_op(DataOp::Add);
                objects.insert(gvk, key);
                expectations.observe(obj);
                Ok(())
            }
            Err(error) => {
                expectations.try_cancel_expect(obj);
                Err(error.into())
            }
        }
    }

    /// Removes an object from the data cache, whether or not its kind is
    /// still watched.
    pub async fn remove_object(&self, obj: &DynamicObject) -> Result<(), Error> {
        let gvk = Gvk::of(obj).ok_or(Error::MissingType)?;
        let key = ObjectKey::of(obj);

        let mut objects = self.objects.lock().await;
        objects.touch(&gvk, &key);
        self.data
            .remove_data(&RemoveTarget::Object(obj.clone()))
            .await?;
        self.metrics.data_op(DataOp::Remove);
        objects.remove(&gvk, &key);
        self.tracker.for_gvk(&gvk).cancel_expect(obj);
        Ok(())
    }

    /// Indicates whether objects of this kind should currently be cached: it is
    /// both requested by a source and watched.
    pub fn is_wanted(&self, gvk: &Gvk) -> bool {
        self.watched.contains(gvk) && self.aggregator.is_present(gvk)
    }

    /// Indicates whether this object would currently be written to the cache.
    pub fn is_synced(&self, obj: &DynamicObject) -> bool {
        match Gvk::of(obj) {
            Some(gvk) => {
                self.is_wanted(&gvk) && !self.excluder().is_excluded(Process::Sync, &gvk, obj)
            }
            None => false,
        }
    }

    pub fn watched_gvks(&self) -> GvkSet {
        self.watched.clone()
    }

    /// The union of every source's requested kinds.
    pub fn desired_gvks(&self) -> GvkSet {
        self.aggregator.list_all()
    }

    pub fn aggregator(&self) -> &GvkAggregator {
        &self.aggregator
    }

    pub fn excluder(&self) -> Arc<ProcessExcluder> {
        self.excluder.read().clone()
    }

    /// The keys of cached objects of a kind, in order.
    pub async fn cached_keys(&self, gvk: &Gvk) -> Vec<ObjectKey> {
        let objects = self.objects.lock().await;
        objects
            .by_kind
            .get(gvk)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Observes changes to the watched kinds. The value is a counter bumped
    /// each time the watch set changes.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// Brings the registrar's watch set to the aggregated union and reloads
    /// kinds that have not been fully loaded.
    async fn converge(&self, pending: &mut Pending) -> Result<(), Error> {
        let desired = self.aggregator.list_all();
        let removed = self.watched.difference(&desired);
        let added = desired.difference(&self.watched);
        if removed.is_empty() && added.is_empty() && pending.unpopulated.is_empty() && !pending.stale
        {
            return Ok(());
        }
        self.metrics.convergences.inc();

        let mut failures = WatchFailures::default();
        if !removed.is_empty() || !added.is_empty() || pending.stale {
            tracing::info!(%added, %removed, "Updating watches");
            let paused = self.registrar.pause().await.map_err(|error| {
                self.metrics.convergence_failures.inc();
                Error::Pause(error)
            })?;

            let replaced = self.replace_watches(&removed, &added).await;
            failures = replaced.failures;

            let mut objects = self.objects.lock().await;
            // When nothing previously watched survives, one bulk wipe replaces
            // the per-object removals.
            let full_swap = !removed.is_empty() && self.watched.intersection(&desired).is_empty();
            self.watched.remove(replaced.stopped.iter());
            self.watched.add(replaced.started.iter().cloned());

            if pending.stale || full_swap {
                match self.wipe_all(&mut objects).await {
                    Ok(()) => {
                        if pending.stale {
                            pending.unpopulated.add_set(&self.watched);
                        }
                        pending.stale = false;
                    }
                    Err(error) => {
                        tracing::warn!(%error, "Failed to wipe data cache");
                        pending.stale = true;
                    }
                }
            } else {
                for gvk in replaced.stopped.iter() {
                    if !self.evict_kind(&mut objects, gvk).await {
                        pending.stale = true;
                    }
                }
            }
            drop(objects);
            drop(paused);

            let changed = !replaced.stopped.is_empty() || !replaced.started.is_empty();
            pending.unpopulated.remove(replaced.stopped.iter());
            pending.unpopulated.add(replaced.started);
            if changed {
                self.metrics.watched_kinds.set(self.watched.size() as i64);
                self.generation.send_modify(|g| *g += 1);
            }
        }

        let unpopulated = self.populate(&pending.unpopulated).await;
        pending.unpopulated.replace(&unpopulated);

        if failures.is_empty() && pending.unpopulated.is_empty() && !pending.stale {
            tracing::debug!(watched = %self.watched, "Converged");
            return Ok(());
        }
        self.metrics.convergence_failures.inc();
        Err(Error::Convergence {
            watch: failures,
            unpopulated: pending.unpopulated.clone(),
            stale: pending.stale,
        })
    }

    async fn replace_watches(&self, removed: &GvkSet, added: &GvkSet) -> Replaced {
        let mut replaced = Replaced::default();
        for gvk in removed.items() {
            match self.registrar.remove_watch(&gvk).await {
                Ok(()) => {
                    tracing::debug!(%gvk, "Stopped watch");
                    replaced.stopped.push(gvk);
                }
                Err(error) => {
                    tracing::warn!(%gvk, %error, "Failed to stop watch");
                    replaced.failures.0.push(error);
                }
            }
        }
        for gvk in added.items() {
            match self.registrar.add_watch(&gvk).await {
                Ok(()) => {
                    tracing::debug!(%gvk, "Started watch");
                    replaced.started.push(gvk);
                }
                Err(error) => {
                    if error.is_no_match() {
                        tracing::info!(%gvk, "Kind is not served; will retry");
                    } else {
                        tracing::warn!(%gvk, %error, "Failed to start watch");
                    }
                    replaced.failures.0.push(error);
                }
            }
        }
        replaced
    }

    async fn wipe_all(&self, objects: &mut ObjectIndex) -> Result<(), Error> {
        self.data.remove_data(&RemoveTarget::WipeAll).await?;
        self.metrics.data_op(DataOp::Wipe);
        objects.by_kind.clear();
        Ok(())
    }

    /// Removes a kind's cached objects. Returns false if any removal failed;
    /// keys that failed to be removed are kept in the index.
    async fn evict_kind(&self, objects: &mut ObjectIndex, gvk: &Gvk) -> bool {
        let keys = match objects.by_kind.remove(gvk) {
            Some(keys) => keys,
            None => return true,
        };
        let mut failed = BTreeSet::new();
        for key in keys {
            let target = RemoveTarget::Object(object::stub(gvk, &key));
            match self.data.remove_data(&target).await {
                Ok(_) => self.metrics.data_op(DataOp::Remove),
                Err(error) => {
                    tracing::warn!(%gvk, %key, %error, "Failed to remove object");
                    failed.insert(key);
                }
            }
        }
        if failed.is_empty() {
            return true;
        }
        objects.by_kind.insert(gvk.clone(), failed);
        false
    }

    /// Lists each kind and writes its objects to the data cache, retrying
    /// with backoff. Returns the kinds that could not be loaded.
    async fn populate(&self, gvks: &GvkSet) -> GvkSet {
        let failed = GvkSet::new();
        for gvk in gvks.items() {
            if !self.watched.contains(&gvk) {
                continue;
            }
            let this = self;
            let kind = &gvk;
            let res = self
                .population
                .retry(&self.shutdown, move || this.populate_kind(kind))
                .await;
            self.objects.lock().await.end_listing(&gvk);
            match res {
                Ok(()) => tracing::debug!(%gvk, "Loaded existing objects"),
                Err(RetryError::Cancelled) => {
                    failed.insert(gvk);
                }
                Err(error) => {
                    tracing::warn!(%gvk, %error, "Failed to load existing objects");
                    failed.insert(gvk);
                }
            }
        }
        failed
    }

    async fn populate_kind(&self, gvk: &Gvk) -> Attempt<Error> {
        // Watch events handled from here on are newer than the listed copies.
        self.objects.lock().await.begin_listing(gvk);
        let objs = match self.reader.list(gvk).await {
            Ok(objs) => objs,
            Err(error) if error.is_no_match() => {
                tracing::debug!(%gvk, "Kind is not served; nothing to load");
                return Attempt::Done;
            }
            Err(error) => return Attempt::Retry(Some(error.into())),
        };
        let mut last = None;
        for mut obj in objs {
            if obj.types.is_none() {
                object::set_type(&mut obj, gvk);
            }
            if object::is_deleting(&obj) {
                continue;
            }
            if let Err(error) = self.write_object(&obj, true).await {
                last = Some(error);
            }
        }
        match last {
            None => Attempt::Done,
            Some(error) => Attempt::Retry(Some(error)),
        }
    }
}

#[derive(Debug, Default)]
struct Replaced {
    started: Vec<Gvk>,
    stopped: Vec<Gvk>,
    failures: WatchFailures,
}

// === impl ObjectIndex ===

impl ObjectIndex {
    fn insert(&mut self, gvk: Gvk, key: ObjectKey) {
        self.by_kind.entry(gvk).or_default().insert(key);
    }

    fn remove(&mut self, gvk: &Gvk, key: &ObjectKey) -> bool {
        let Some(keys) = self.by_kind.get_mut(gvk) else {
            return false;
        };
        let removed = keys.remove(key);
        if keys.is_empty() {
            self.by_kind.remove(gvk);
        }
        removed
    }

    fn begin_listing(&mut self, gvk: &Gvk) {
        self.listing.insert(gvk.clone(), HashSet::new());
    }

    fn end_listing(&mut self, gvk: &Gvk) {
        self.listing.remove(gvk);
    }

    fn touch(&mut self, gvk: &Gvk, key: &ObjectKey) {
        if let Some(keys) = self.listing.get_mut(gvk) {
            keys.insert(key.clone());
        }
    }

    fn touched_while_listing(&self, gvk: &Gvk, key: &ObjectKey) -> bool {
        self.listing.get(gvk).is_some_and(|keys| keys.contains(key))
    }

    fn drain_matching(&mut self, f: impl Fn(&Gvk, &ObjectKey) -> bool) -> Vec<(Gvk, ObjectKey)> {
        let mut drained = Vec::new();
        for (gvk, keys) in self.by_kind.iter_mut() {
            keys.retain(|key| {
                if f(gvk, key) {
                    drained.push((gvk.clone(), key.clone()));
                    return false;
                }
                true
            });
        }
        self.by_kind.retain(|_, keys| !keys.is_empty());
        drained
    }
}
