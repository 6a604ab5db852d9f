use prometheus_client::{
    encoding::{EncodeLabelSet, EncodeLabelValue},
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

/// Metrics for the watch-set and data-cache machinery.
#[derive(Clone, Debug, Default)]
pub struct SyncMetrics {
    pub(crate) watched_kinds: Gauge,
    pub(crate) convergences: Counter,
    pub(crate) convergence_failures: Counter,
    data_operations: Family<DataOpLabels, Counter>,
    pub(crate) finalizers_removed: Counter,
    event_send_timeouts: Counter,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct DataOpLabels {
    op: DataOp,
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub(crate) enum DataOp {
    Add,
    Remove,
    Wipe,
}

impl SyncMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let metrics = Self::default();
        prom.register(
            "watched_kinds",
            "Number of kinds currently watched",
            metrics.watched_kinds.clone(),
        );
        prom.register(
            "convergences",
            "Count of watch convergence passes",
            metrics.convergences.clone(),
        );
        prom.register(
            "convergence_failures",
            "Count of watch convergence passes that did not complete",
            metrics.convergence_failures.clone(),
        );
        prom.register(
            "data_operations",
            "Count of writes to the policy engine's data cache",
            metrics.data_operations.clone(),
        );
        prom.register(
            "finalizers_removed",
            "Count of sync finalizers stripped from objects",
            metrics.finalizers_removed.clone(),
        );
        prom.register(
            "event_send_timeouts",
            "Count of watch events that waited out the queue timeout and were retried",
            metrics.event_send_timeouts.clone(),
        );
        metrics
    }

    /// The counter to hand to [`crate::EventSender::with_timeout_counter`].
    pub fn event_send_timeouts(&self) -> Counter {
        self.event_send_timeouts.clone()
    }

    pub(crate) fn data_op(&self, op: DataOp) {
        self.data_operations
            .get_or_create(&DataOpLabels { op })
            .inc();
    }
}
