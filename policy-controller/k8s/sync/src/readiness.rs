//! Readiness tracking: the process reports ready once every object it was told
//! to expect has been handled once, or given up on.

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use gatekeeper_policy_controller_core::{Expectations, Gvk, ObjectKey, Tracker};
use gatekeeper_policy_controller_k8s_api::DynamicObject;
use parking_lot::{Mutex, RwLock};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Failed attempts after which [`Expectations::try_cancel_expect`] gives up on
/// an object.
pub const DEFAULT_TRY_CANCEL_LIMIT: u32 = 3;

#[derive(Debug)]
pub struct ReadinessTracker {
    kinds: RwLock<HashMap<Gvk, Arc<ObjectTracker>>>,
    populated: Arc<AtomicBool>,
    try_cancel_limit: u32,
}

/// Expectations for the objects of one kind.
#[derive(Debug)]
pub struct ObjectTracker {
    state: Mutex<State>,
    populated: Arc<AtomicBool>,
    try_cancel_limit: u32,
}

#[derive(Debug, Default)]
struct State {
    expected: HashSet<ObjectKey>,
    /// Objects observed before they were expected. Only recorded until the
    /// startup expectations are populated.
    seen: HashSet<ObjectKey>,
    failures: HashMap<ObjectKey, u32>,
}

// === impl ReadinessTracker ===

impl Default for ReadinessTracker {
    fn default() -> Self {
        Self::new(DEFAULT_TRY_CANCEL_LIMIT)
    }
}

impl ReadinessTracker {
    pub fn new(try_cancel_limit: u32) -> Self {
        Self {
            kinds: RwLock::new(HashMap::new()),
            populated: Arc::new(AtomicBool::new(false)),
            try_cancel_limit: try_cancel_limit.max(1),
        }
    }

    /// Marks every startup expectation as registered. Observations of
    /// unexpected objects are no longer remembered after this.
    pub fn populated(&self) {
        self.populated.store(true, Ordering::Release);
        for tracker in self.kinds.read().values() {
            tracker.state.lock().seen.clear();
        }
    }

    pub fn tracker(&self, gvk: &Gvk) -> Arc<ObjectTracker> {
        if let Some(tracker) = self.kinds.read().get(gvk) {
            return tracker.clone();
        }
        self.kinds
            .write()
            .entry(gvk.clone())
            .or_insert_with(|| {
                Arc::new(ObjectTracker::new(
                    self.populated.clone(),
                    self.try_cancel_limit,
                ))
            })
            .clone()
    }

    /// True once no kind has outstanding expectations.
    pub fn satisfied(&self) -> bool {
        self.kinds.read().values().all(|t| t.satisfied())
    }

    /// Kinds that still have outstanding expectations, in order.
    pub fn unsatisfied(&self) -> Vec<Gvk> {
        let mut kinds = self
            .kinds
            .read()
            .iter()
            .filter(|(_, t)| !t.satisfied())
            .map(|(gvk, _)| gvk.clone())
            .collect::<Vec<_>>();
        kinds.sort();
        kinds
    }
}

impl Tracker for ReadinessTracker {
    fn for_gvk(&self, gvk: &Gvk) -> Arc<dyn Expectations> {
        self.tracker(gvk)
    }
}

// === impl ObjectTracker ===

impl ObjectTracker {
    fn new(populated: Arc<AtomicBool>, try_cancel_limit: u32) -> Self {
        Self {
            state: Mutex::new(State::default()),
            populated,
            try_cancel_limit,
        }
    }

    pub fn satisfied(&self) -> bool {
        self.state.lock().expected.is_empty()
    }

    pub fn pending(&self) -> Vec<ObjectKey> {
        let mut keys = self
            .state
            .lock()
            .expected
            .iter()
            .cloned()
            .collect::<Vec<_>>();
        keys.sort();
        keys
    }
}

impl Expectations for ObjectTracker {
    fn expect(&self, obj: &DynamicObject) {
        let key = ObjectKey::of(obj);
        let mut state = self.state.lock();
        if state.seen.remove(&key) {
            return;
        }
        state.expected.insert(key);
    }

    fn observe(&self, obj: &DynamicObject) {
        let key = ObjectKey::of(obj);
        let mut state = self.state.lock();
        state.failures.remove(&key);
        if !state.expected.remove(&key) && !self.populated.load(Ordering::Acquire) {
            state.seen.insert(key);
        }
    }

    fn cancel_expect(&self, obj: &DynamicObject) {
        let key = ObjectKey::of(obj);
        let mut state = self.state.lock();
        state.expected.remove(&key);
        state.seen.remove(&key);
        state.failures.remove(&key);
    }

    fn try_cancel_expect(&self, obj: &DynamicObject) -> bool {
        let key = ObjectKey::of(obj);
        let mut state = self.state.lock();
        if !state.expected.contains(&key) {
            state.seen.remove(&key);
            return true;
        }
        let failures = state.failures.entry(key.clone()).or_default();
        *failures += 1;
        if *failures < self.try_cancel_limit {
            return false;
        }
        state.failures.remove(&key);
        state.expected.remove(&key);
        tracing::debug!(%key, "Gave up waiting on object");
        true
    }
}
