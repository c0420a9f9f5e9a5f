//! ekspose kubehub: the cluster state API the controller talks to.
//!
//! Two halves: [`start_watcher`] lists and watches Deployments and feeds the
//! cache mirror ingest channel, and [`ClusterApi`] reads and writes the managed
//! Services, classifying every failure into an [`ApiError`].

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use ekspose_core::{
    ApiError, DependentObject, DependentPatch, LogicalKey, StreamEvent, WatchEvent, MANAGED_BY_LABEL, MANAGED_BY_VALUE,
};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, Preconditions},
    runtime::watcher::{self, Event},
    runtime::WatchStreamExt,
    Client,
};
use metrics::counter;
use rustc_hash::FxHashSet;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub mod convert;
pub mod memory;

pub use memory::MemoryCluster;

/// Reads and writes of the managed Service. Implementations map server
/// responses onto the distinguishable outcomes of [`ApiError`].
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_dependent(&self, namespace: &str, name: &str) -> Result<Option<DependentObject>, ApiError>;
    async fn create_dependent(&self, obj: &DependentObject) -> Result<DependentObject, ApiError>;
    async fn update_dependent(&self, namespace: &str, name: &str, patch: &DependentPatch) -> Result<DependentObject, ApiError>;
    /// Delete the Service. With `resource_version` set, a Service that changed
    /// since it was read is left alone and the call fails with `Conflict`.
    async fn delete_dependent(&self, namespace: &str, name: &str, resource_version: Option<&str>) -> Result<(), ApiError>;
    /// Every Service carrying the managed-by label, in one namespace or all of them.
    async fn list_dependents(&self, namespace: Option<&str>) -> Result<Vec<DependentObject>, ApiError>;
}

pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client from kubeconfig or in-cluster env")
}

/// Classify a kube-rs error by HTTP status and reason.
pub fn classify(e: kube::Error) -> ApiError {
    match e {
        kube::Error::Api(resp) => match (resp.code, resp.reason.as_str()) {
            (409, "AlreadyExists") => ApiError::AlreadyExists(resp.message),
            (409, _) => ApiError::Conflict(resp.message),
            (404, _) => ApiError::NotFound(resp.message),
            (400, _) | (422, _) => ApiError::Invalid(resp.message),
            (code, reason) => ApiError::Transport(format!("{} {}: {}", code, reason, resp.message)),
        },
        other => ApiError::Transport(other.to_string()),
    }
}

/// [`ClusterApi`] backed by a kube-rs client.
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
    field_manager: String,
}

impl KubeClusterApi {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self { client, field_manager: field_manager.into() }
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get_dependent(&self, namespace: &str, name: &str) -> Result<Option<DependentObject>, ApiError> {
        let svc = self.services(namespace).get_opt(name).await.map_err(classify)?;
        Ok(svc.as_ref().map(convert::service_to_dependent))
    }

    async fn create_dependent(&self, obj: &DependentObject) -> Result<DependentObject, ApiError> {
        let svc = convert::dependent_to_service(obj);
        let pp = PostParams { field_manager: Some(self.field_manager.clone()), ..Default::default() };
        let created = self.services(&obj.namespace).create(&pp, &svc).await.map_err(classify)?;
        counter!("cluster_writes", 1u64, "op" => "create");
        Ok(convert::service_to_dependent(&created))
    }

    async fn update_dependent(&self, namespace: &str, name: &str, patch: &DependentPatch) -> Result<DependentObject, ApiError> {
        let body = convert::patch_to_merge_json(patch);
        let pp = PatchParams { field_manager: Some(self.field_manager.clone()), ..Default::default() };
        let updated = self.services(namespace).patch(name, &pp, &Patch::Merge(&body)).await.map_err(classify)?;
        counter!("cluster_writes", 1u64, "op" => "update");
        Ok(convert::service_to_dependent(&updated))
    }

    async fn delete_dependent(&self, namespace: &str, name: &str, resource_version: Option<&str>) -> Result<(), ApiError> {
        let dp = DeleteParams {
            preconditions: resource_version.map(|rv| Preconditions { resource_version: Some(rv.to_string()), uid: None }),
            ..Default::default()
        };
        self.services(namespace).delete(name, &dp).await.map_err(classify)?;
        counter!("cluster_writes", 1u64, "op" => "delete");
        Ok(())
    }

    async fn list_dependents(&self, namespace: Option<&str>) -> Result<Vec<DependentObject>, ApiError> {
        let api: Api<Service> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let lp = ListParams::default().labels(&format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY_VALUE));
        let list = api.list(&lp).await.map_err(classify)?;
        Ok(list.items.iter().map(convert::service_to_dependent).collect())
    }
}

/// Translate one watcher event, tracking which keys were already seen so
/// applies split into `Added` and `Updated`.
fn translate(ev: Event<Deployment>, seen: &mut FxHashSet<LogicalKey>) -> StreamEvent {
    match ev {
        Event::Applied(d) => {
            let o = convert::deployment_to_primary(&d);
            if seen.insert(o.key()) {
                StreamEvent::Event(WatchEvent::Added(o))
            } else {
                StreamEvent::Event(WatchEvent::Updated(o))
            }
        }
        Event::Deleted(d) => {
            let o = convert::deployment_to_primary(&d);
            seen.remove(&o.key());
            StreamEvent::Event(WatchEvent::Deleted(o))
        }
        Event::Restarted(list) => {
            let objs: Vec<_> = list.iter().map(convert::deployment_to_primary).collect();
            *seen = objs.iter().map(|o| o.key()).collect();
            StreamEvent::Relisted(objs)
        }
    }
}

/// List+watch Deployments and forward events into the ingest channel. The
/// watcher re-lists and resumes on its own; stream errors are retried with
/// backoff. Returns when the receiving side is gone.
pub async fn start_watcher(client: Client, namespace: Option<&str>, tx: mpsc::Sender<StreamEvent>) -> Result<()> {
    let api: Api<Deployment> = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!(ns = ?namespace, "deployment watcher started");
    let mut seen = FxHashSet::default();
    while let Some(item) = stream.next().await {
        match item {
            Ok(ev) => {
                counter!("watch_events", 1u64);
                let out = translate(ev, &mut seen);
                if let StreamEvent::Relisted(list) = &out {
                    debug!(count = list.len(), "watch restart");
                }
                if tx.send(out).await.is_err() {
                    info!("ingest channel closed; stopping watcher");
                    return Ok(());
                }
            }
            Err(e) => {
                counter!("watch_errors", 1u64);
                warn!(error = %e, "watch stream error; retrying");
            }
        }
    }
    warn!("watcher stream ended");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_err(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("{} {}", code, reason),
            reason: reason.into(),
            code,
        })
    }

    #[test]
    fn classifies_server_responses() {
        assert!(matches!(classify(api_err(409, "AlreadyExists")), ApiError::AlreadyExists(_)));
        assert!(matches!(classify(api_err(409, "Conflict")), ApiError::Conflict(_)));
        assert!(matches!(classify(api_err(404, "NotFound")), ApiError::NotFound(_)));
        assert!(matches!(classify(api_err(422, "Invalid")), ApiError::Invalid(_)));
        assert!(matches!(classify(api_err(400, "BadRequest")), ApiError::Invalid(_)));
        assert!(matches!(classify(api_err(503, "ServiceUnavailable")), ApiError::Transport(_)));
        assert!(matches!(classify(api_err(403, "Forbidden")), ApiError::Transport(_)));
    }

    fn dep(ns: &str, name: &str) -> Deployment {
        serde_json::from_value(serde_json::json!({
            "metadata": { "namespace": ns, "name": name },
            "spec": { "selector": {}, "template": {} }
        }))
        .unwrap()
    }

    #[test]
    fn applies_split_into_added_and_updated() {
        let mut seen = FxHashSet::default();
        let first = translate(Event::Applied(dep("app", "web")), &mut seen);
        let second = translate(Event::Applied(dep("app", "web")), &mut seen);
        assert!(matches!(first, StreamEvent::Event(WatchEvent::Added(_))));
        assert!(matches!(second, StreamEvent::Event(WatchEvent::Updated(_))));
        let gone = translate(Event::Deleted(dep("app", "web")), &mut seen);
        assert!(matches!(gone, StreamEvent::Event(WatchEvent::Deleted(_))));
        assert!(seen.is_empty());

        let relist = translate(Event::Restarted(vec![dep("app", "a"), dep("app", "b")]), &mut seen);
        assert!(matches!(relist, StreamEvent::Relisted(ref l) if l.len() == 2));
        assert!(matches!(translate(Event::Applied(dep("app", "a")), &mut seen), StreamEvent::Event(WatchEvent::Updated(_))));
    }
}
