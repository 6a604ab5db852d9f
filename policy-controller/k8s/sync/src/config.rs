use crate::{
    aggregator::SourceKey, dynamic, excluder::ProcessExcluder, finalizers::FinalizerCleanup,
    CacheManager, Error,
};
use gatekeeper_policy_controller_core::{
    object, Expectations, Gvk, GvkSet, ObjectKey, Reader, Tracker, Writer,
};
use gatekeeper_policy_controller_k8s_api::{
    Config, DynamicObject, CONFIG_NAME, LEGACY_CONFIG_FINALIZER, SOURCE_FINALIZER,
};
use std::sync::Arc;

/// Reconciles the singleton `Config` into a watch source and the process
/// excluder.
pub struct ConfigReconciler {
    namespace: String,
    reader: Arc<dyn Reader>,
    writer: Arc<dyn Writer>,
    cache: Arc<CacheManager>,
    tracker: Arc<dyn Tracker>,
    finalizers: Arc<FinalizerCleanup>,
}

// === impl ConfigReconciler ===

impl ConfigReconciler {
    pub fn new(
        namespace: impl Into<String>,
        reader: Arc<dyn Reader>,
        writer: Arc<dyn Writer>,
        cache: Arc<CacheManager>,
        tracker: Arc<dyn Tracker>,
        finalizers: Arc<FinalizerCleanup>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            reader,
            writer,
            cache,
            tracker,
            finalizers,
        }
    }

    /// The key of the only `Config` this reconciler acts on.
    pub fn config_key(&self) -> ObjectKey {
        ObjectKey::namespaced(self.namespace.clone(), CONFIG_NAME)
    }

    pub async fn reconcile(&self, key: &ObjectKey) -> Result<(), Error> {
        if *key != self.config_key() {
            tracing::debug!(%key, "Ignoring Config");
            return Ok(());
        }

        let gvk = Gvk::of_resource::<Config>();
        let source = SourceKey::config(key.to_string());
        let expectations = self.tracker.for_gvk(&gvk);

        let mut obj = match self.reader.get(&gvk, key).await {
            Ok(obj) => obj,
            Err(error) if error.is_not_found() => {
                tracing::debug!(%key, "Config not found");
                self.cache.remove_source(&source).await?;
                self.cache
                    .exclude_processes(ProcessExcluder::default())
                    .await?;
                return Ok(());
            }
            Err(error) => return Err(error.into()),
        };

        if object::remove_finalizer(&mut obj, LEGACY_CONFIG_FINALIZER) {
            tracing::info!(%key, "Removing legacy finalizer");
            obj = self.writer.update(&obj).await?;
        }

        if object::is_deleting(&obj) {
            return self.finalize(&source, obj, &*expectations).await;
        }

        let config = dynamic::parse::<Config>("Config", &obj)?;
        if object::add_finalizer(&mut obj, SOURCE_FINALIZER) {
            obj = self.writer.update(&obj).await?;
        }

        let gvks = config
            .spec
            .sync
            .sync_only
            .iter()
            .map(Gvk::from)
            .collect::<GvkSet>();
        tracing::debug!(%key, %gvks, "Applying Config");
        let applied = match self.finalizers.record(&gvks).await {
            Ok(()) => {
                self.cache
                    .exclude_processes(ProcessExcluder::from_config(&config.spec))
                    .await
            }
            Err(error) => Err(error),
        };
        let applied = match applied {
            Ok(()) => self.cache.upsert_source(&source, gvks.items()).await,
            Err(error) => Err(error),
        };
        if let Err(error) = applied {
            expectations.try_cancel_expect(&obj);
            return Err(error);
        }

        self.finalizers
            .reconcile(&self.cache.desired_gvks())
            .await?;
        expectations.observe(&obj);
        Ok(())
    }

    /// Withdraws the Config's kinds and exclusions, then releases it.
    async fn finalize(
        &self,
        source: &SourceKey,
        obj: DynamicObject,
        expectations: &dyn Expectations,
    ) -> Result<(), Error> {
        tracing::info!(key = %ObjectKey::of(&obj), "Config is being deleted");
        expectations.cancel_expect(&obj);

        self.cache.remove_source(source).await?;
        self.cache
            .exclude_processes(ProcessExcluder::default())
            .await?;

        let mut obj = self
            .finalizers
            .reconcile(&self.cache.desired_gvks())
            .await?
            .unwrap_or(obj);
        if object::remove_finalizer(&mut obj, SOURCE_FINALIZER) {
            match self.writer.update(&obj).await {
                Ok(_) => {}
                Err(error) if error.is_not_found() => {}
                Err(error) => return Err(error.into()),
            }
        }
        Ok(())
    }
}
