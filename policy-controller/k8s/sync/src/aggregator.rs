use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use gatekeeper_policy_controller_core::{Gvk, GvkSet};
use parking_lot::RwLock;
use std::fmt;

/// The kind of controller contributing a set of GVKs.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceKind {
    Config,
    SyncSet,
}

/// Identifies the resource that requested a set of GVKs.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceKey {
    pub kind: SourceKind,
    pub id: String,
}

/// Tracks which GVKs each source wants watched.
///
/// Each GVK also maps back to the sources requesting it, so a GVK leaves the
/// union exactly when its last source lets go of it.
#[derive(Debug, Default)]
pub struct GvkAggregator {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    sources: HashMap<SourceKey, HashSet<Gvk>>,
    requesters: HashMap<Gvk, HashSet<SourceKey>>,
}

// === impl SourceKind ===

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config => f.write_str("config"),
            Self::SyncSet => f.write_str("syncset"),
        }
    }
}

// === impl SourceKey ===

impl SourceKey {
    pub fn new(kind: SourceKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn config(id: impl Into<String>) -> Self {
        Self::new(SourceKind::Config, id)
    }

    pub fn syncset(id: impl Into<String>) -> Self {
        Self::new(SourceKind::SyncSet, id)
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

// === impl GvkAggregator ===

impl GvkAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the source's GVKs. An empty set removes the source.
    pub fn upsert(&self, key: &SourceKey, gvks: impl IntoIterator<Item = Gvk>) {
        let gvks = gvks.into_iter().collect::<HashSet<_>>();
        let mut inner = self.inner.write();
        inner.remove(key);
        if gvks.is_empty() {
            return;
        }
        for gvk in gvks.iter() {
            inner
                .requesters
                .entry(gvk.clone())
                .or_default()
                .insert(key.clone());
        }
        inner.sources.insert(key.clone(), gvks);
    }

    pub fn remove(&self, key: &SourceKey) {
        self.inner.write().remove(key);
    }

    /// Returns a snapshot of the GVKs requested by a single source.
    pub fn list(&self, key: &SourceKey) -> GvkSet {
        self.inner
            .read()
            .sources
            .get(key)
            .map(|gvks| gvks.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns a snapshot of the union of every source's GVKs.
    pub fn list_all(&self) -> GvkSet {
        self.inner.read().requesters.keys().cloned().collect()
    }

    pub fn is_present(&self, gvk: &Gvk) -> bool {
        self.inner.read().requesters.contains_key(gvk)
    }

    /// Lists the sources requesting a GVK.
    pub fn sources_for(&self, gvk: &Gvk) -> Vec<SourceKey> {
        let mut keys = self
            .inner
            .read()
            .requesters
            .get(gvk)
            .map(|keys| keys.iter().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    pub fn sources(&self) -> Vec<SourceKey> {
        let mut keys = self.inner.read().sources.keys().cloned().collect::<Vec<_>>();
        keys.sort();
        keys
    }
}

// === impl Inner ===

impl Inner {
    fn remove(&mut self, key: &SourceKey) {
        let Some(gvks) = self.sources.remove(key) else {
            return;
        };
        for gvk in gvks {
            if let Some(keys) = self.requesters.get_mut(&gvk) {
                keys.remove(key);
                if keys.is_empty() {
                    self.requesters.remove(&gvk);
                }
            }
        }
    }
}
