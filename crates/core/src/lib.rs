//! ekspose core types: the watched Deployment view, the managed Service view,
//! logical keys and the events that flow between the watcher, the cache mirror
//! and the dispatch queue.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

mod config;
mod error;

pub use config::{ControllerConfig, PortPolicy};
pub use error::{ApiError, ConfigError, KeyError, ReconcileError};

/// Annotation carrying the back-reference from a managed Service to its Deployment.
pub const OWNER_ANNOTATION: &str = "ekspose.io/owner";
/// Label stamped on every Service this controller creates.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "ekspose";

/// `(namespace, name)` identity used as queue item and reconcile argument.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogicalKey {
    pub namespace: String,
    pub name: String,
}

impl LogicalKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for LogicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for LogicalKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ns, name) = s.split_once('/').ok_or_else(|| KeyError::MissingSeparator(s.to_string()))?;
        if ns.is_empty() || name.is_empty() || name.contains('/') {
            return Err(KeyError::Malformed(s.to_string()));
        }
        Ok(Self::new(ns, name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerPort {
    pub container: String,
    pub name: Option<String>,
    pub container_port: i32,
    pub protocol: Option<String>,
}

/// Read-only view of a watched Deployment, as held by the cache mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PrimaryObject {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    /// Labels carried by the pods this object manages.
    pub pod_labels: BTreeMap<String, String>,
    pub container_ports: Vec<ContainerPort>,
    pub generation: Option<i64>,
    pub resource_version: Option<String>,
    /// RFC 3339 timestamp, set once deletion is in progress.
    pub deletion_timestamp: Option<String>,
}

impl PrimaryObject {
    pub fn key(&self) -> LogicalKey {
        LogicalKey::new(self.namespace.clone(), self.name.clone())
    }

    pub fn is_terminating(&self) -> bool {
        self.deletion_timestamp.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    pub name: Option<String>,
    pub port: i32,
    pub target_port: i32,
    pub protocol: Option<String>,
}

/// The managed Service, either desired (computed) or observed (read from the cluster).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DependentObject {
    pub namespace: String,
    pub name: String,
    pub selector: BTreeMap<String, String>,
    pub ports: Vec<ServicePort>,
    pub owner_key: Option<LogicalKey>,
    pub resource_version: Option<String>,
}

impl DependentObject {
    pub fn is_owned_by(&self, key: &LogicalKey) -> bool {
        self.owner_key.as_ref() == Some(key)
    }

    /// Fields of `self` (desired) that differ from `observed`. `None` when already converged.
    pub fn diff(&self, observed: &DependentObject) -> Option<DependentPatch> {
        let selector = (self.selector != observed.selector).then(|| self.selector.clone());
        let ports = (self.ports != observed.ports).then(|| self.ports.clone());
        if selector.is_none() && ports.is_none() {
            return None;
        }
        let selector_removed = observed.selector.keys().filter(|k| !self.selector.contains_key(*k)).cloned().collect();
        Some(DependentPatch { selector, selector_removed, ports, resource_version: observed.resource_version.clone() })
    }
}

/// Partial update for a managed Service; only the changed fields are set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DependentPatch {
    /// Complete desired selector when it changed.
    pub selector: Option<BTreeMap<String, String>>,
    /// Selector keys present on the observed object but no longer desired.
    pub selector_removed: Vec<String>,
    pub ports: Option<Vec<ServicePort>>,
    /// Observed version the patch was computed against; a mismatch is a conflict.
    pub resource_version: Option<String>,
}

impl DependentPatch {
    pub fn changed_fields(&self) -> Vec<&'static str> {
        let mut out = Vec::with_capacity(2);
        if self.selector.is_some() { out.push("selector"); }
        if self.ports.is_some() { out.push("ports"); }
        out
    }
}

/// Change notification for a primary object, collapsed to a key by the listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchEvent {
    Added(PrimaryObject),
    Updated(PrimaryObject),
    /// Carries the last known state.
    Deleted(PrimaryObject),
}

impl WatchEvent {
    pub fn object(&self) -> &PrimaryObject {
        match self {
            WatchEvent::Added(o) | WatchEvent::Updated(o) | WatchEvent::Deleted(o) => o,
        }
    }

    pub fn key(&self) -> LogicalKey {
        self.object().key()
    }
}

/// What the watcher feeds into the cache mirror ingest loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamEvent {
    Event(WatchEvent),
    /// Full listing; replaces the mirror content and marks it warm.
    Relisted(Vec<PrimaryObject>),
}

/// Receives every change applied to the cache mirror, after it is visible to readers.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &WatchEvent);
}

pub mod prelude {
    pub use super::{
        ApiError, ContainerPort, ControllerConfig, DependentObject, DependentPatch, EventHandler, LogicalKey,
        PortPolicy, PrimaryObject, ReconcileError, ServicePort, StreamEvent, WatchEvent,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_roundtrips_through_display() {
        let k: LogicalKey = "app/web".parse().unwrap();
        assert_eq!(k, LogicalKey::new("app", "web"));
        assert_eq!(k.to_string(), "app/web");
    }

    #[test]
    fn key_rejects_malformed_input() {
        assert!(matches!("web".parse::<LogicalKey>(), Err(KeyError::MissingSeparator(_))));
        assert!(matches!("/web".parse::<LogicalKey>(), Err(KeyError::Malformed(_))));
        assert!(matches!("app/".parse::<LogicalKey>(), Err(KeyError::Malformed(_))));
        assert!(matches!("a/b/c".parse::<LogicalKey>(), Err(KeyError::Malformed(_))));
    }

    fn svc(selector: &[(&str, &str)], ports: &[i32]) -> DependentObject {
        DependentObject {
            namespace: "app".into(),
            name: "web".into(),
            selector: selector.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            ports: ports
                .iter()
                .map(|p| ServicePort { name: None, port: *p, target_port: *p, protocol: None })
                .collect(),
            owner_key: Some(LogicalKey::new("app", "web")),
            resource_version: Some("7".into()),
        }
    }

    #[test]
    fn diff_is_empty_when_converged() {
        let a = svc(&[("app", "web")], &[8080]);
        assert!(a.diff(&a.clone()).is_none());
    }

    #[test]
    fn diff_carries_only_changed_fields() {
        let desired = svc(&[("app", "web"), ("tier", "front")], &[8080]);
        let observed = svc(&[("app", "web")], &[8080]);
        let patch = desired.diff(&observed).unwrap();
        assert_eq!(patch.changed_fields(), vec!["selector"]);
        assert!(patch.ports.is_none());
        assert!(patch.selector_removed.is_empty());

        let shrink = observed.diff(&desired).unwrap();
        assert_eq!(shrink.selector_removed, vec!["tier".to_string()]);
        assert_eq!(patch.resource_version.as_deref(), Some("7"));
    }
}
