use crate::{
    events::{EventKind, EventReceiver, SyncEvent},
    CacheManager, Error, FinalizerCleanup,
};
use gatekeeper_policy_controller_core::{object, CancellationToken, ObjectKey, Writer};
use gatekeeper_policy_controller_k8s_api::{DynamicObject, SYNC_FINALIZER};
use std::sync::Arc;

/// Applies watch events to the data cache.
pub struct SyncHandler {
    cache: Arc<CacheManager>,
    writer: Arc<dyn Writer>,
    finalizers: Option<Arc<FinalizerCleanup>>,
}

// === impl SyncHandler ===

impl SyncHandler {
    pub fn new(cache: Arc<CacheManager>, writer: Arc<dyn Writer>) -> Self {
        Self {
            cache,
            writer,
            finalizers: None,
        }
    }

    /// Keeps [`SYNC_FINALIZER`] on synced objects until they have been removed
    /// from the data cache. Only objects of kinds that `finalizers` has
    /// recorded in the Config's status are finalized.
    pub fn with_finalizers(mut self, finalizers: Arc<FinalizerCleanup>) -> Self {
        self.finalizers = Some(finalizers);
        self
    }

    /// Drains the event queue until it closes or `shutdown` fires.
    pub async fn run(self, mut events: EventReceiver, shutdown: CancellationToken) {
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let gvk = event.gvk.clone();
            let key = ObjectKey::of(&event.object);
            if let Err(error) = self.handle(event).await {
                tracing::warn!(%gvk, %key, %error, "Failed to sync object");
            }
        }
        tracing::debug!("Sync handler stopped");
    }

    pub async fn handle(&self, event: SyncEvent) -> Result<(), Error> {
        let SyncEvent {
            gvk,
            kind,
            mut object,
        } = event;
        if object.types.is_none() {
            object::set_type(&mut object, &gvk);
        }

        if kind == EventKind::Delete || object::is_deleting(&object) {
            self.cache.remove_object(&object).await?;
            if kind == EventKind::Apply && object::remove_finalizer(&mut object, SYNC_FINALIZER) {
                self.update(&object).await?;
            }
            return Ok(());
        }

        let finalize = self
            .finalizers
            .as_ref()
            .is_some_and(|f| f.is_recorded(&gvk));
        if finalize
            && self.cache.is_synced(&object)
            && object::add_finalizer(&mut object, SYNC_FINALIZER)
        {
            match self.update(&object).await? {
                Some(updated) => object = updated,
                None => return Ok(()),
            }
        }
        self.cache.add_object(&object).await
    }

    /// Writes the object back, tolerating its disappearance.
    async fn update(&self, obj: &DynamicObject) -> Result<Option<DynamicObject>, Error> {
        match self.writer.update(obj).await {
            Ok(mut updated) => {
                if updated.types.is_none() {
                    updated.types = obj.types.clone();
                }
                Ok(Some(updated))
            }
            Err(error) if error.is_not_found() => Ok(None),
            Err(error) => Err(error.into()),
        }
    }
}
