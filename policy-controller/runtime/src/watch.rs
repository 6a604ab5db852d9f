use crate::{
    client::ClusterClient,
    core::{CancellationToken, ClientError, Gvk, PauseGuard, Registrar, WatchError},
    k8s::DynamicObject,
    sync::{events::SendError, EventKind, EventSender, SyncEvent},
};
use futures::prelude::*;
use kube::{
    api::Api,
    runtime::{watcher, WatchStreamExt},
};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{RwLock, RwLockReadGuard},
    task::JoinHandle,
};
use tracing::{debug, info, info_span, warn, Instrument};

/// Runs one watch per registered kind, forwarding every event into the sync
/// handler's queue.
///
/// Forwarding passes through a gate: each delivery holds it shared, and
/// [`Registrar::pause`] holds it exclusively until the returned guard drops.
pub struct WatchManager {
    client: ClusterClient,
    events: EventSender,
    gate: Gate,
    watches: Mutex<HashMap<Gvk, Watch>>,
    shutdown: CancellationToken,
}

struct Watch {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Shared while an event is delivered; held exclusively while paused.
#[derive(Clone, Debug, Default)]
struct Gate(Arc<RwLock<()>>);

// === impl WatchManager ===

impl WatchManager {
    pub fn new(client: ClusterClient, events: EventSender, shutdown: CancellationToken) -> Self {
        Self {
            client,
            events,
            gate: Default::default(),
            watches: Default::default(),
            shutdown,
        }
    }

    pub fn watched(&self) -> Vec<Gvk> {
        let mut gvks = self.watches.lock().keys().cloned().collect::<Vec<_>>();
        gvks.sort();
        gvks
    }
}

#[async_trait::async_trait]
impl Registrar for WatchManager {
    async fn add_watch(&self, gvk: &Gvk) -> Result<(), WatchError> {
        if self.shutdown.is_cancelled() {
            return Err(WatchError::Closed);
        }
        if self
            .watches
            .lock()
            .get(gvk)
            .is_some_and(|w| !w.task.is_finished())
        {
            return Ok(());
        }

        let served = self.client.resolve(gvk).await.map_err(|error| match error {
            ClientError::NoMatch(gvk) => WatchError::NoMatch(gvk),
            error => WatchError::Failed {
                gvk: gvk.clone(),
                source: error.into(),
            },
        })?;
        let api = Api::<DynamicObject>::all_with(self.client.client(), &served.resource);

        let stop = self.shutdown.child_token();
        let task = tokio::spawn(
            forward(
                gvk.clone(),
                api,
                self.events.clone(),
                self.gate.clone(),
                stop.clone(),
            )
            .instrument(info_span!("watch", %gvk)),
        );
        info!(%gvk, "Started watch");
        if let Some(prior) = self.watches.lock().insert(gvk.clone(), Watch { stop, task }) {
            prior.stop.cancel();
        }
        Ok(())
    }

    async fn remove_watch(&self, gvk: &Gvk) -> Result<(), WatchError> {
        if let Some(watch) = self.watches.lock().remove(gvk) {
            watch.stop.cancel();
            info!(%gvk, "Stopped watch");
        }
        Ok(())
    }

    async fn pause(&self) -> Result<PauseGuard, WatchError> {
        if self.events.is_closed() {
            return Err(WatchError::Closed);
        }
        Ok(self.gate.pause().await)
    }
}

// === impl Gate ===

impl Gate {
    async fn pause(&self) -> PauseGuard {
        let paused = self.0.clone().write_owned().await;
        debug!("Paused watch event delivery");
        PauseGuard::new(move || {
            drop(paused);
            debug!("Resumed watch event delivery");
        })
    }

    /// Waits until delivery is not paused. Returns `None` once `stop` fires,
    /// including when it fired while delivery was paused.
    async fn enter(&self, stop: &CancellationToken) -> Option<RwLockReadGuard<'_, ()>> {
        let guard = tokio::select! {
            biased;
            _ = stop.cancelled() => return None,
            guard = self.0.read() => guard,
        };
        if stop.is_cancelled() {
            return None;
        }
        Some(guard)
    }
}

async fn forward(
    gvk: Gvk,
    api: Api<DynamicObject>,
    events: EventSender,
    gate: Gate,
    stop: CancellationToken,
) {
    let stream = watcher(api, watcher::Config::default()).default_backoff();
    deliver_events(gvk, stream, events, gate, stop).await;
    debug!("Watch finished");
}

async fn deliver_events<S>(
    gvk: Gvk,
    stream: S,
    events: EventSender,
    gate: Gate,
    stop: CancellationToken,
) where
    S: Stream<Item = Result<watcher::Event<DynamicObject>, watcher::Error>>,
{
    tokio::pin!(stream);

    loop {
        let event = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            event = stream.next() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let (kind, object) = match event {
            Ok(watcher::Event::Apply(obj) | watcher::Event::InitApply(obj)) => {
                (EventKind::Apply, obj)
            }
            Ok(watcher::Event::Delete(obj)) => (EventKind::Delete, obj),
            Ok(watcher::Event::Init | watcher::Event::InitDone) => continue,
            Err(error) => {
                warn!(%error, "Watch failed");
                continue;
            }
        };

        let Some(_delivering) = gate.enter(&stop).await else {
            break;
        };
        let event = SyncEvent {
            gvk: gvk.clone(),
            kind,
            object,
        };
        match events.deliver(event, &stop).await {
            Ok(()) => {}
            Err(SendError::Stopped(_)) => break,
            Err(error) => {
                debug!(%error, "Event queue unavailable");
                break;
            }
        }
    }
}
