use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use gatekeeper_policy_controller_core::{Gvk, ObjectKey};
use gatekeeper_policy_controller_k8s_api::{ConfigSpec, DynamicObject};
use std::str::FromStr;

/// A pipeline whose view of the cluster can be narrowed by namespace.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Process {
    Audit,
    Sync,
    Webhook,
    MutationWebhook,
}

/// Decides which namespaces each process ignores.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessExcluder {
    excluded: HashMap<Process, HashSet<Wildcard>>,
}

/// A namespace pattern: an exact name, `prefix*`, or `*suffix`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Wildcard {
    Exact(String),
    Prefix(String),
    Suffix(String),
}

#[derive(Debug, thiserror::Error)]
#[error("unknown process: {0}")]
pub struct UnknownProcess(String);

// === impl Process ===

impl Process {
    pub const ALL: [Process; 4] = [
        Process::Audit,
        Process::Sync,
        Process::Webhook,
        Process::MutationWebhook,
    ];

    /// Parses a process name. `*` names every process.
    pub fn parse_all(s: &str) -> Result<Vec<Process>, UnknownProcess> {
        if s == "*" {
            return Ok(Self::ALL.to_vec());
        }
        s.parse().map(|p| vec![p])
    }
}

impl FromStr for Process {
    type Err = UnknownProcess;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "audit" => Ok(Self::Audit),
            "sync" => Ok(Self::Sync),
            "webhook" => Ok(Self::Webhook),
            "mutation-webhook" => Ok(Self::MutationWebhook),
            _ => Err(UnknownProcess(s.to_string())),
        }
    }
}

// === impl Wildcard ===

impl Wildcard {
    pub fn matches(&self, namespace: &str) -> bool {
        match self {
            Self::Exact(name) => name == namespace,
            Self::Prefix(prefix) => namespace.starts_with(prefix.as_str()),
            Self::Suffix(suffix) => namespace.ends_with(suffix.as_str()),
        }
    }
}

impl From<&str> for Wildcard {
    fn from(s: &str) -> Self {
        if let Some(prefix) = s.strip_suffix('*') {
            return Self::Prefix(prefix.to_string());
        }
        if let Some(suffix) = s.strip_prefix('*') {
            return Self::Suffix(suffix.to_string());
        }
        Self::Exact(s.to_string())
    }
}

// === impl ProcessExcluder ===

impl ProcessExcluder {
    pub fn from_config(spec: &ConfigSpec) -> Self {
        let mut excluder = Self::default();
        for entry in spec.matches.iter() {
            for name in entry.processes.iter() {
                let processes = match Process::parse_all(name) {
                    Ok(processes) => processes,
                    Err(error) => {
                        tracing::warn!(%error, "Ignoring match entry process");
                        continue;
                    }
                };
                for process in processes {
                    let patterns = excluder.excluded.entry(process).or_default();
                    patterns.extend(
                        entry
                            .excluded_namespaces
                            .iter()
                            .map(|ns| Wildcard::from(ns.as_str())),
                    );
                }
            }
        }
        excluder.excluded.retain(|_, patterns| !patterns.is_empty());
        excluder
    }

    pub fn is_empty(&self) -> bool {
        self.excluded.is_empty()
    }

    pub fn excludes_namespace(&self, process: Process, namespace: &str) -> bool {
        self.excluded
            .get(&process)
            .map(|patterns| patterns.iter().any(|p| p.matches(namespace)))
            .unwrap_or(false)
    }

    /// Checks whether the object falls in an excluded namespace. A `Namespace`
    /// is judged by its own name; other cluster-scoped objects are never
    /// excluded.
    pub fn is_excluded(&self, process: Process, gvk: &Gvk, obj: &DynamicObject) -> bool {
        self.excludes_key(process, gvk, &ObjectKey::of(obj))
    }

    pub fn excludes_key(&self, process: Process, gvk: &Gvk, key: &ObjectKey) -> bool {
        if gvk.is_namespace() {
            return self.excludes_namespace(process, &key.name);
        }
        match key.namespace.as_deref() {
            Some(ns) => self.excludes_namespace(process, ns),
            None => false,
        }
    }
}
