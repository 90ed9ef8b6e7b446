//! Cluster-state accessor.
//!
//! Every read and write the operator performs goes through [`ClusterClient`],
//! keyed by `(kind, namespace, name)`. Production uses [`kubernetes::KubeCluster`];
//! tests use `memory::MemoryCluster` (behind the `testing` feature), which
//! models the API server semantics the reconcile logic depends on.

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::core::DynamicObject;

use crate::error::{Error, Result};
use crate::registry::{Managed, ResourceKind};

pub mod kubernetes;
#[cfg(any(test, feature = "testing"))]
pub mod memory;

/// Accessor errors are reported as [`Error::NotFound`], [`Error::Conflict`]
/// or any other variant for everything else.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>>;

    /// List objects of `kind`, optionally restricted to one namespace.
    async fn list(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        query: &LabelQuery,
    ) -> Result<Vec<DynamicObject>>;

    /// Fails with [`Error::Conflict`] when the object already exists.
    async fn create(&self, kind: ResourceKind, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Optimistic-concurrency replace: fails with [`Error::Conflict`] when the
    /// object's resourceVersion is stale and [`Error::NotFound`] when it is gone.
    async fn update(&self, kind: ResourceKind, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Returns false when there was nothing to delete.
    async fn delete(&self, kind: ResourceKind, namespace: Option<&str>, name: &str)
        -> Result<bool>;

    /// Merge `status` into the object's status subresource.
    async fn patch_status(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
        status: &serde_json::Value,
    ) -> Result<()>;
}

// ── Label selection ───────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
}

/// Equality-based label selector. `Display` renders the Kubernetes selector
/// syntax (`a=b,c!=d`).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelQuery {
    requirements: Vec<Requirement>,
}

impl LabelQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn equals(mut self, key: &str, value: &str) -> Self {
        self.requirements
            .push(Requirement::Equals(key.into(), value.into()));
        self
    }

    /// Like the API server, also matches objects that lack `key` entirely.
    pub fn not_equals(mut self, key: &str, value: &str) -> Self {
        self.requirements
            .push(Requirement::NotEquals(key.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        self.requirements.iter().all(|req| {
            let get = |k: &str| labels.and_then(|l| l.get(k));
            match req {
                Requirement::Equals(k, v) => get(k) == Some(v),
                Requirement::NotEquals(k, v) => get(k) != Some(v),
            }
        })
    }
}

impl std::fmt::Display for LabelQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .requirements
            .iter()
            .map(|req| match req {
                Requirement::Equals(k, v) => format!("{k}={v}"),
                Requirement::NotEquals(k, v) => format!("{k}!={v}"),
            })
            .collect();
        write!(f, "{}", parts.join(","))
    }
}

// ── Typed helpers ─────────────────────────────────────────────────────────────

pub fn to_dynamic<K: Managed>(obj: &K) -> Result<DynamicObject> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

pub fn from_dynamic<K: Managed>(obj: DynamicObject) -> Result<K> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

fn scoped<K: Managed>(namespace: Option<&str>) -> Option<&str> {
    if K::NAMESPACED {
        namespace
    } else {
        None
    }
}

pub async fn get<K: Managed>(
    client: &dyn ClusterClient,
    namespace: Option<&str>,
    name: &str,
) -> Result<Option<K>> {
    client
        .get(K::KIND, scoped::<K>(namespace), name)
        .await?
        .map(from_dynamic)
        .transpose()
}

pub async fn list<K: Managed>(
    client: &dyn ClusterClient,
    namespace: Option<&str>,
    query: &LabelQuery,
) -> Result<Vec<K>> {
    client
        .list(K::KIND, scoped::<K>(namespace), query)
        .await?
        .into_iter()
        .map(from_dynamic)
        .collect()
}

pub async fn create<K: Managed>(client: &dyn ClusterClient, obj: &K) -> Result<K> {
    from_dynamic(client.create(K::KIND, &to_dynamic(obj)?).await?)
}

pub async fn update<K: Managed>(client: &dyn ClusterClient, obj: &K) -> Result<K> {
    from_dynamic(client.update(K::KIND, &to_dynamic(obj)?).await?)
}

pub async fn delete<K: Managed>(
    client: &dyn ClusterClient,
    namespace: Option<&str>,
    name: &str,
) -> Result<bool> {
    client.delete(K::KIND, scoped::<K>(namespace), name).await
}

pub async fn patch_status<K: Managed>(
    client: &dyn ClusterClient,
    obj: &K,
    status: &serde_json::Value,
) -> Result<()> {
    let meta = obj.meta();
    let name = meta
        .name
        .as_deref()
        .ok_or_else(|| Error::reconcile(format!("{} without a name", K::KIND)))?;
    client
        .patch_status(K::KIND, scoped::<K>(meta.namespace.as_deref()), name, status)
        .await
}
