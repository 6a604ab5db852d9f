use ahash::AHashSet as HashSet;
use gatekeeper_policy_controller_k8s_api::{
    ApiResource, DynamicObject, GroupVersionKind, GvkEntry, Resource,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a Kubernetes resource type.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

/// A set of [`Gvk`]s that may be shared between tasks.
///
/// Every operation takes the internal lock for its own duration only.
/// Operations that involve a second set copy that set's contents out before
/// touching this one, so no two set locks are ever held at once.
#[derive(Default)]
pub struct GvkSet {
    inner: RwLock<HashSet<Gvk>>,
}

// === impl Gvk ===

impl Gvk {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }

    /// Splits an `apiVersion` (`group/version`, or `version` for the core
    /// group) into a GVK.
    pub fn from_api_version(api_version: &str, kind: impl Into<String>) -> Self {
        match api_version.split_once('/') {
            Some((group, version)) => Self::new(group, version, kind),
            None => Self::new("", api_version, kind),
        }
    }

    /// Reads the type of a dynamic object, if it has one.
    pub fn of(obj: &DynamicObject) -> Option<Self> {
        obj.types
            .as_ref()
            .map(|tm| Self::from_api_version(&tm.api_version, tm.kind.clone()))
    }

    pub fn of_resource<K>() -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        Self::new(K::group(&()), K::version(&()), K::kind(&()))
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// The kind of the list type for this GVK.
    pub fn list_kind(&self) -> String {
        format!("{}List", self.kind)
    }

    pub fn is_namespace(&self) -> bool {
        self.group.is_empty() && self.kind == "Namespace"
    }

    pub fn api_resource(&self) -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind::from(self))
    }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.kind)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

impl From<&GvkEntry> for Gvk {
    fn from(entry: &GvkEntry) -> Self {
        Self::new(&*entry.group, &*entry.version, &*entry.kind)
    }
}

impl From<&Gvk> for GvkEntry {
    fn from(gvk: &Gvk) -> Self {
        GvkEntry::new(&*gvk.group, &*gvk.version, &*gvk.kind)
    }
}

impl From<&Gvk> for GroupVersionKind {
    fn from(gvk: &Gvk) -> Self {
        GroupVersionKind::gvk(&gvk.group, &gvk.version, &gvk.kind)
    }
}

// === impl GvkSet ===

impl GvkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, gvks: impl IntoIterator<Item = Gvk>) {
        self.inner.write().extend(gvks);
    }

    /// Inserts a single GVK, returning true if it was not already present.
    pub fn insert(&self, gvk: Gvk) -> bool {
        self.inner.write().insert(gvk)
    }

    pub fn remove<'a>(&self, gvks: impl IntoIterator<Item = &'a Gvk>) {
        let mut inner = self.inner.write();
        for gvk in gvks {
            inner.remove(gvk);
        }
    }

    pub fn contains(&self, gvk: &Gvk) -> bool {
        self.inner.read().contains(gvk)
    }

    /// Returns a sorted snapshot of the set's contents.
    pub fn items(&self) -> Vec<Gvk> {
        let mut items = self.inner.read().iter().cloned().collect::<Vec<_>>();
        items.sort();
        items
    }

    pub fn size(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }

    pub fn add_set(&self, other: &GvkSet) {
        if std::ptr::eq(self, other) {
            return;
        }
        let theirs = other.snapshot();
        self.inner.write().extend(theirs);
    }

    pub fn remove_set(&self, other: &GvkSet) {
        if std::ptr::eq(self, other) {
            self.clear();
            return;
        }
        let theirs = other.snapshot();
        self.inner.write().retain(|gvk| !theirs.contains(gvk));
    }

    pub fn equals(&self, other: &GvkSet) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        let theirs = other.snapshot();
        *self.inner.read() == theirs
    }

    /// Atomically replaces this set's contents with a copy of `other`'s.
    pub fn replace(&self, other: &GvkSet) {
        if std::ptr::eq(self, other) {
            return;
        }
        let theirs = other.snapshot();
        *self.inner.write() = theirs;
    }

    /// Returns the members of this set that are not in `other`.
    pub fn difference(&self, other: &GvkSet) -> GvkSet {
        if std::ptr::eq(self, other) {
            return GvkSet::new();
        }
        let theirs = other.snapshot();
        self.inner
            .read()
            .iter()
            .filter(|gvk| !theirs.contains(*gvk))
            .cloned()
            .collect()
    }

    pub fn intersection(&self, other: &GvkSet) -> GvkSet {
        if std::ptr::eq(self, other) {
            return self.clone();
        }
        let theirs = other.snapshot();
        self.inner
            .read()
            .iter()
            .filter(|gvk| theirs.contains(*gvk))
            .cloned()
            .collect()
    }

    fn snapshot(&self) -> HashSet<Gvk> {
        self.inner.read().clone()
    }
}

impl Clone for GvkSet {
    fn clone(&self) -> Self {
        Self {
            inner: RwLock::new(self.snapshot()),
        }
    }
}

impl PartialEq for GvkSet {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other)
    }
}

impl Eq for GvkSet {}

impl FromIterator<Gvk> for GvkSet {
    fn from_iter<I: IntoIterator<Item = Gvk>>(iter: I) -> Self {
        Self {
            inner: RwLock::new(iter.into_iter().collect()),
        }
    }
}

impl fmt::Display for GvkSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, gvk) in self.items().iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            fmt::Display::fmt(gvk, f)?;
        }
        f.write_str("]")
    }
}

impl fmt::Debug for GvkSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.items()).finish()
    }
}
