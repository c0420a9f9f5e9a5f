//! In-memory cluster for tests and dry runs. Mirrors the server behaviors the
//! reconciler relies on: `AlreadyExists` on create, `NotFound` on delete and
//! update of missing objects, and resource-version preconditions on update.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use ekspose_core::{ApiError, DependentObject, DependentPatch, LogicalKey};

use crate::ClusterApi;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Op {
    Get,
    Create,
    Update,
    Delete,
    List,
}

/// Per-operation call counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Calls {
    pub gets: u64,
    pub creates: u64,
    pub updates: u64,
    pub deletes: u64,
    pub lists: u64,
}

impl Calls {
    pub fn mutations(&self) -> u64 {
        self.creates + self.updates + self.deletes
    }
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<LogicalKey, DependentObject>,
    faults: BTreeMap<Op, VecDeque<ApiError>>,
    calls: Calls,
}

#[derive(Default)]
pub struct MemoryCluster {
    inner: Mutex<Inner>,
    rv: AtomicU64,
}

impl MemoryCluster {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_rv(&self) -> String {
        (self.rv.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    /// Store an object as if another actor created it. Does not count as a call.
    pub fn insert(&self, mut obj: DependentObject) -> DependentObject {
        obj.resource_version = Some(self.next_rv());
        let key = LogicalKey::new(obj.namespace.clone(), obj.name.clone());
        let mut inner = self.lock();
        inner.objects.insert(key, obj.clone());
        obj
    }

    pub fn object(&self, namespace: &str, name: &str) -> Option<DependentObject> {
        self.lock().objects.get(&LogicalKey::new(namespace, name)).cloned()
    }

    pub fn len(&self) -> usize { self.lock().objects.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn calls(&self) -> Calls { self.lock().calls }

    pub fn reset_calls(&self) { self.lock().calls = Calls::default(); }

    /// Make the next call of `op` fail with `err`. Faults queue up per operation.
    pub fn fail_next(&self, op: Op, err: ApiError) {
        self.lock().faults.entry(op).or_default().push_back(err);
    }

    fn take_fault(inner: &mut Inner, op: Op) -> Option<ApiError> {
        inner.faults.get_mut(&op).and_then(|q| q.pop_front())
    }
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn get_dependent(&self, namespace: &str, name: &str) -> Result<Option<DependentObject>, ApiError> {
        let mut inner = self.lock();
        inner.calls.gets += 1;
        if let Some(e) = Self::take_fault(&mut inner, Op::Get) {
            return Err(e);
        }
        Ok(inner.objects.get(&LogicalKey::new(namespace, name)).cloned())
    }

    async fn create_dependent(&self, obj: &DependentObject) -> Result<DependentObject, ApiError> {
        let rv = self.next_rv();
        let mut inner = self.lock();
        inner.calls.creates += 1;
        if let Some(e) = Self::take_fault(&mut inner, Op::Create) {
            return Err(e);
        }
        let key = LogicalKey::new(obj.namespace.clone(), obj.name.clone());
        if inner.objects.contains_key(&key) {
            return Err(ApiError::AlreadyExists(key.to_string()));
        }
        let mut stored = obj.clone();
        stored.resource_version = Some(rv);
        inner.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn update_dependent(&self, namespace: &str, name: &str, patch: &DependentPatch) -> Result<DependentObject, ApiError> {
        let rv = self.next_rv();
        let mut inner = self.lock();
        inner.calls.updates += 1;
        if let Some(e) = Self::take_fault(&mut inner, Op::Update) {
            return Err(e);
        }
        let key = LogicalKey::new(namespace, name);
        let Some(cur) = inner.objects.get_mut(&key) else {
            return Err(ApiError::NotFound(key.to_string()));
        };
        if patch.resource_version.is_some() && patch.resource_version != cur.resource_version {
            return Err(ApiError::Conflict(format!(
                "{}: resourceVersion {:?} is stale (current {:?})",
                key, patch.resource_version, cur.resource_version
            )));
        }
        if let Some(sel) = &patch.selector {
            cur.selector = sel.clone();
        }
        if let Some(ports) = &patch.ports {
            cur.ports = ports.clone();
        }
        cur.resource_version = Some(rv);
        Ok(cur.clone())
    }

    async fn delete_dependent(&self, namespace: &str, name: &str, resource_version: Option<&str>) -> Result<(), ApiError> {
        let mut inner = self.lock();
        inner.calls.deletes += 1;
        if let Some(e) = Self::take_fault(&mut inner, Op::Delete) {
            return Err(e);
        }
        let key = LogicalKey::new(namespace, name);
        let Some(cur) = inner.objects.get(&key) else {
            return Err(ApiError::NotFound(key.to_string()));
        };
        if resource_version.is_some() && resource_version != cur.resource_version.as_deref() {
            return Err(ApiError::Conflict(format!(
                "{}: delete precondition {:?} does not match {:?}",
                key, resource_version, cur.resource_version
            )));
        }
        inner.objects.remove(&key);
        Ok(())
    }

    /// Objects written through this API carry an owner; that stands in for the managed-by label.
    async fn list_dependents(&self, namespace: Option<&str>) -> Result<Vec<DependentObject>, ApiError> {
        let mut inner = self.lock();
        inner.calls.lists += 1;
        if let Some(e) = Self::take_fault(&mut inner, Op::List) {
            return Err(e);
        }
        Ok(inner
            .objects
            .values()
            .filter(|o| o.owner_key.is_some())
            .filter(|o| namespace.map_or(true, |ns| o.namespace == ns))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc(ns: &str, name: &str, owner: Option<&str>) -> DependentObject {
        DependentObject {
            namespace: ns.into(),
            name: name.into(),
            owner_key: owner.map(|o| o.parse().unwrap()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn stale_delete_precondition_conflicts_and_keeps_the_object() {
        let c = MemoryCluster::new();
        let first = c.insert(svc("app", "web", Some("app/web")));
        let second = c.insert(svc("app", "web", None));
        assert_ne!(first.resource_version, second.resource_version);

        let err = c.delete_dependent("app", "web", first.resource_version.as_deref()).await.unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
        assert!(c.object("app", "web").is_some());

        c.delete_dependent("app", "web", second.resource_version.as_deref()).await.unwrap();
        assert!(c.is_empty());
        assert!(matches!(c.delete_dependent("app", "web", None).await, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn listing_returns_only_managed_objects() {
        let c = MemoryCluster::new();
        c.insert(svc("app", "web", Some("app/web")));
        c.insert(svc("app", "legacy", None));
        c.insert(svc("other", "api", Some("other/api")));

        let mut all: Vec<_> = c.list_dependents(None).await.unwrap().into_iter().map(|o| o.name).collect();
        all.sort();
        assert_eq!(all, vec!["api", "web"]);
        let app = c.list_dependents(Some("app")).await.unwrap();
        assert_eq!(app.len(), 1);
        assert_eq!(c.calls().lists, 2);
        assert_eq!(c.calls().mutations(), 0);
    }
}
