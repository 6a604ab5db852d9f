use crate::{aggregator::SourceKey, dynamic, CacheManager, Error, FinalizerCleanup};
use gatekeeper_policy_controller_core::{
    object, Gvk, GvkSet, ObjectKey, Reader, Tracker, Writer,
};
use gatekeeper_policy_controller_k8s_api::{SyncSet, SOURCE_FINALIZER};
use std::sync::Arc;

/// Reconciles each `SyncSet` into a watch source.
pub struct SyncSetReconciler {
    reader: Arc<dyn Reader>,
    writer: Arc<dyn Writer>,
    cache: Arc<CacheManager>,
    tracker: Arc<dyn Tracker>,
    finalizers: Option<Arc<FinalizerCleanup>>,
}

// === impl SyncSetReconciler ===

impl SyncSetReconciler {
    pub fn new(
        reader: Arc<dyn Reader>,
        writer: Arc<dyn Writer>,
        cache: Arc<CacheManager>,
        tracker: Arc<dyn Tracker>,
    ) -> Self {
        Self {
            reader,
            writer,
            cache,
            tracker,
            finalizers: None,
        }
    }

    /// Records each SyncSet's kinds in the Config's status before they are
    /// watched.
    pub fn with_finalizers(mut self, finalizers: Arc<FinalizerCleanup>) -> Self {
        self.finalizers = Some(finalizers);
        self
    }

    pub async fn reconcile(&self, key: &ObjectKey) -> Result<(), Error> {
        let gvk = Gvk::of_resource::<SyncSet>();
        let source = SourceKey::syncset(key.name.clone());
        let expectations = self.tracker.for_gvk(&gvk);

        let mut obj = match self.reader.get(&gvk, key).await {
            Ok(obj) => obj,
            Err(error) if error.is_not_found() => {
                tracing::debug!(%key, "SyncSet not found");
                return self.cache.remove_source(&source).await;
            }
            Err(error) => return Err(error.into()),
        };

        if object::is_deleting(&obj) {
            tracing::info!(%key, "SyncSet is being deleted");
            expectations.cancel_expect(&obj);
            self.cache.remove_source(&source).await?;
            if object::remove_finalizer(&mut obj, SOURCE_FINALIZER) {
                match self.writer.update(&obj).await {
                    Ok(_) => {}
                    Err(error) if error.is_not_found() => {}
                    Err(error) => return Err(error.into()),
                }
            }
            return Ok(());
        }

        let syncset = dynamic::parse::<SyncSet>("SyncSet", &obj)?;
        if object::add_finalizer(&mut obj, SOURCE_FINALIZER) {
            obj = self.writer.update(&obj).await?;
        }

        let gvks = syncset.spec.gvks.iter().map(Gvk::from).collect::<GvkSet>();
        let applied = match &self.finalizers {
            Some(finalizers) => finalizers.record(&gvks).await,
            None => Ok(()),
        };
        let applied = match applied {
            Ok(()) => self.cache.upsert_source(&source, gvks.items()).await,
            Err(error) => Err(error),
        };
        if let Err(error) = applied {
            expectations.try_cancel_expect(&obj);
            return Err(error);
        }
        expectations.observe(&obj);
        Ok(())
    }
}
