//! Mapping between k8s-openapi objects and the ekspose views.

use std::collections::BTreeMap;

use ekspose_core::{
    ContainerPort, DependentObject, DependentPatch, LogicalKey, PrimaryObject, ServicePort, MANAGED_BY_LABEL,
    MANAGED_BY_VALUE, OWNER_ANNOTATION,
};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Service, ServicePort as KubeServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde_json::{json, Map, Value as Json};

pub fn deployment_to_primary(dep: &Deployment) -> PrimaryObject {
    let meta = &dep.metadata;
    let template = dep.spec.as_ref().map(|s| &s.template);
    let pod_labels = template
        .and_then(|t| t.metadata.as_ref())
        .and_then(|m| m.labels.clone())
        .unwrap_or_default();
    let container_ports = template
        .and_then(|t| t.spec.as_ref())
        .map(|ps| {
            ps.containers
                .iter()
                .flat_map(|c| {
                    c.ports.iter().flatten().map(move |p| ContainerPort {
                        container: c.name.clone(),
                        name: p.name.clone(),
                        container_port: p.container_port,
                        protocol: p.protocol.clone(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    PrimaryObject {
        namespace: meta.namespace.clone().unwrap_or_default(),
        name: meta.name.clone().unwrap_or_default(),
        uid: meta.uid.clone().unwrap_or_default(),
        pod_labels,
        container_ports,
        generation: meta.generation,
        resource_version: meta.resource_version.clone(),
        deletion_timestamp: meta.deletion_timestamp.as_ref().map(|t| t.0.to_rfc3339()),
    }
}

pub fn service_to_dependent(svc: &Service) -> DependentObject {
    let meta = &svc.metadata;
    let owner_key = meta
        .annotations
        .as_ref()
        .and_then(|a| a.get(OWNER_ANNOTATION))
        .and_then(|v| v.parse::<LogicalKey>().ok());
    let spec = svc.spec.as_ref();
    let ports = spec
        .and_then(|s| s.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .map(|p| ServicePort {
                    name: p.name.clone(),
                    port: p.port,
                    target_port: match &p.target_port {
                        Some(IntOrString::Int(i)) => *i,
                        // Named target ports never match a derived port, so they read as drift.
                        Some(IntOrString::String(_)) => 0,
                        None => p.port,
                    },
                    protocol: p.protocol.clone(),
                })
                .collect()
        })
        .unwrap_or_default();
    DependentObject {
        namespace: meta.namespace.clone().unwrap_or_default(),
        name: meta.name.clone().unwrap_or_default(),
        selector: spec.and_then(|s| s.selector.clone()).unwrap_or_default(),
        ports,
        owner_key,
        resource_version: meta.resource_version.clone(),
    }
}

fn kube_port(p: &ServicePort) -> KubeServicePort {
    KubeServicePort {
        name: p.name.clone(),
        port: p.port,
        target_port: Some(IntOrString::Int(p.target_port)),
        protocol: p.protocol.clone(),
        ..Default::default()
    }
}

pub fn dependent_to_service(obj: &DependentObject) -> Service {
    let mut labels = BTreeMap::new();
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
    let annotations = obj.owner_key.as_ref().map(|k| {
        let mut a = BTreeMap::new();
        a.insert(OWNER_ANNOTATION.to_string(), k.to_string());
        a
    });
    Service {
        metadata: ObjectMeta {
            name: Some(obj.name.clone()),
            namespace: Some(obj.namespace.clone()),
            labels: Some(labels),
            annotations,
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(obj.selector.clone()),
            ports: Some(obj.ports.iter().map(kube_port).collect()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// JSON merge patch touching only the changed fields. The resource version acts
/// as a precondition, so a concurrent writer surfaces as 409 Conflict.
pub fn patch_to_merge_json(patch: &DependentPatch) -> Json {
    let mut spec = Map::new();
    if let Some(selector) = &patch.selector {
        let mut sel: Map<String, Json> = selector.iter().map(|(k, v)| (k.clone(), Json::String(v.clone()))).collect();
        for k in patch.selector_removed.iter() {
            sel.insert(k.clone(), Json::Null);
        }
        spec.insert("selector".into(), Json::Object(sel));
    }
    if let Some(ports) = &patch.ports {
        let ports: Vec<Json> = ports
            .iter()
            .map(|p| serde_json::to_value(kube_port(p)).unwrap_or(Json::Null))
            .collect();
        spec.insert("ports".into(), Json::Array(ports));
    }
    let mut out = json!({ "spec": spec });
    if let Some(rv) = &patch.resource_version {
        out["metadata"] = json!({ "resourceVersion": rv });
    }
    out
}
