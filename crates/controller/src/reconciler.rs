//! Level-triggered reconcile of one Deployment key into its managed Service.
//!
//! The primary side is read from the cache mirror; the dependent side is read
//! straight from the cluster since that is the side being mutated. Every path is
//! idempotent: a second call on converged state performs no writes.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use ekspose_core::{
    ApiError, ControllerConfig, DependentObject, LogicalKey, PortPolicy, PrimaryObject, ReconcileError, ServicePort,
};
use ekspose_kubehub::ClusterApi;
use ekspose_store::{CacheMirror, Lookup};
use tracing::{debug, info};

const DEFAULT_PROTOCOL: &str = "TCP";

/// What a successful reconcile did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Created,
    /// Create raced with another writer; the object is there.
    AlreadyExists,
    Updated(Vec<&'static str>),
    Unchanged,
    Deleted,
    /// Delete intent with nothing (of ours) left to delete.
    AlreadyAbsent,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Created => "created",
            Outcome::AlreadyExists => "already_exists",
            Outcome::Updated(_) => "updated",
            Outcome::Unchanged => "unchanged",
            Outcome::Deleted => "deleted",
            Outcome::AlreadyAbsent => "already_absent",
        }
    }

    pub fn is_mutation(&self) -> bool {
        matches!(self, Outcome::Created | Outcome::Updated(_) | Outcome::Deleted)
    }
}

/// The unit of work the worker pool drives.
#[async_trait]
pub trait Reconcile: Send + Sync {
    async fn reconcile(&self, key: &LogicalKey) -> Result<Outcome, ReconcileError>;
}

/// Name of the managed Service for a key.
pub fn dependent_name(key: &LogicalKey) -> &str {
    &key.name
}

fn valid_port(key: &LogicalKey, port: i32) -> Result<i32, ReconcileError> {
    if (1..=65535).contains(&port) {
        Ok(port)
    } else {
        Err(ReconcileError::Permanent(format!("{}: port {} outside 1..=65535", key, port)))
    }
}

fn derive_ports(primary: &PrimaryObject, cfg: &ControllerConfig) -> Result<Vec<ServicePort>, ReconcileError> {
    let key = primary.key();
    let picked: Vec<_> = match &cfg.port_policy {
        PortPolicy::AllContainerPorts => primary.container_ports.iter().collect(),
        PortPolicy::FirstContainerPort => primary.container_ports.iter().take(1).collect(),
        PortPolicy::Named(name) => primary
            .container_ports
            .iter()
            .filter(|p| p.name.as_deref() == Some(name.as_str()))
            .take(1)
            .collect(),
    };

    let mut seen = BTreeSet::new();
    let mut ports = Vec::with_capacity(picked.len().max(1));
    for cp in picked {
        let port = valid_port(&key, cp.container_port)?;
        let protocol = cp.protocol.clone().unwrap_or_else(|| DEFAULT_PROTOCOL.to_string());
        if !seen.insert((port, protocol.clone())) {
            continue;
        }
        ports.push(ServicePort { name: cp.name.clone(), port, target_port: port, protocol: Some(protocol) });
    }

    if ports.is_empty() {
        let port = valid_port(&key, cfg.fallback_port)?;
        ports.push(ServicePort {
            name: Some(cfg.fallback_port_name.clone()),
            port,
            target_port: port,
            protocol: Some(DEFAULT_PROTOCOL.to_string()),
        });
    }

    // Multi-port Services need unique, non-empty port names.
    if ports.len() > 1 {
        let mut names = BTreeSet::new();
        for p in ports.iter_mut() {
            let unique = p.name.as_ref().map_or(false, |n| !n.is_empty() && names.insert(n.clone()));
            if !unique {
                let proto = p.protocol.as_deref().unwrap_or(DEFAULT_PROTOCOL).to_ascii_lowercase();
                let generated = format!("{}-{}", proto, p.port);
                names.insert(generated.clone());
                p.name = Some(generated);
            }
        }
    }
    Ok(ports)
}

/// Desired managed Service for a primary object. Deterministic in its input.
pub fn desired_dependent(primary: &PrimaryObject, cfg: &ControllerConfig) -> Result<DependentObject, ReconcileError> {
    let key = primary.key();
    if primary.pod_labels.is_empty() {
        return Err(ReconcileError::Permanent(format!("{}: pod template carries no labels to select on", key)));
    }
    Ok(DependentObject {
        namespace: primary.namespace.clone(),
        name: dependent_name(&key).to_string(),
        selector: primary.pod_labels.clone(),
        ports: derive_ports(primary, cfg)?,
        owner_key: Some(key),
        resource_version: None,
    })
}

pub struct Reconciler<C: ?Sized> {
    cluster: Arc<C>,
    mirror: CacheMirror,
    cfg: Arc<ControllerConfig>,
}

impl<C: ClusterApi + ?Sized> Reconciler<C> {
    pub fn new(cluster: Arc<C>, mirror: CacheMirror, cfg: Arc<ControllerConfig>) -> Self {
        Self { cluster, mirror, cfg }
    }

    async fn delete_intent(&self, key: &LogicalKey, why: &str) -> Result<Outcome, ReconcileError> {
        let name = dependent_name(key);
        let Some(observed) = self.cluster.get_dependent(&key.namespace, name).await? else {
            return Ok(Outcome::AlreadyAbsent);
        };
        if !observed.is_owned_by(key) {
            debug!(key = %key, "service with derived name is not ours; leaving it");
            return Ok(Outcome::AlreadyAbsent);
        }
        // A Service replaced since the read fails the precondition and is retried.
        match self.cluster.delete_dependent(&key.namespace, name, observed.resource_version.as_deref()).await {
            Ok(()) => {
                info!(key = %key, reason = why, "deleted service");
                Ok(Outcome::Deleted)
            }
            Err(ApiError::NotFound(_)) => Ok(Outcome::AlreadyAbsent),
            Err(e) => Err(e.into()),
        }
    }

    async fn converge(&self, primary: &PrimaryObject) -> Result<Outcome, ReconcileError> {
        let key = primary.key();
        let desired = desired_dependent(primary, &self.cfg)?;
        let observed = self.cluster.get_dependent(&desired.namespace, &desired.name).await?;
        let Some(observed) = observed else {
            return match self.cluster.create_dependent(&desired).await {
                Ok(_) => {
                    info!(key = %key, ports = desired.ports.len(), "created service");
                    Ok(Outcome::Created)
                }
                Err(ApiError::AlreadyExists(_)) => {
                    debug!(key = %key, "service created concurrently");
                    Ok(Outcome::AlreadyExists)
                }
                Err(e) => Err(e.into()),
            };
        };
        if !observed.is_owned_by(&key) {
            return Err(ReconcileError::Permanent(format!(
                "{}: service {}/{} exists and is not managed by this controller",
                key, observed.namespace, observed.name
            )));
        }
        let Some(patch) = desired.diff(&observed) else {
            return Ok(Outcome::Unchanged);
        };
        let fields = patch.changed_fields();
        // A conflict maps to a transient error: retry re-reads instead of overwriting.
        self.cluster.update_dependent(&desired.namespace, &desired.name, &patch).await?;
        info!(key = %key, fields = ?fields, "updated service");
        Ok(Outcome::Updated(fields))
    }
}

#[async_trait]
impl<C: ClusterApi + ?Sized> Reconcile for Reconciler<C> {
    async fn reconcile(&self, key: &LogicalKey) -> Result<Outcome, ReconcileError> {
        match self.mirror.lookup(key) {
            Lookup::NotWarm => Err(ReconcileError::Transient("cache mirror not warm yet".into())),
            Lookup::Absent => self.delete_intent(key, "deployment gone").await,
            Lookup::Found(p) if p.is_terminating() => self.delete_intent(key, "deployment terminating").await,
            Lookup::Found(p) => self.converge(&p).await,
        }
    }
}
