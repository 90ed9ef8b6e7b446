//! [`ClusterClient`] backed by the Kubernetes API server.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::DynamicObject;
use kube::Client;
use serde_json::{json, Value};

use super::{ClusterClient, LabelQuery};
use crate::controller::helpers::FIELD_MANAGER;
use crate::error::{Error, Result};
use crate::registry::{Registry, ResourceKind};

pub struct KubeCluster {
    client: Client,
    registry: Arc<Registry>,
}

impl KubeCluster {
    pub fn new(client: Client, registry: Arc<Registry>) -> Self {
        Self { client, registry }
    }

    fn api(&self, kind: ResourceKind, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
        let reg = self.registry.lookup(kind)?;
        Ok(match (reg.namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &reg.resource),
            _ => Api::all_with(self.client.clone(), &reg.resource),
        })
    }

    fn api_for(&self, kind: ResourceKind, obj: &DynamicObject) -> Result<(Api<DynamicObject>, String)> {
        let name = obj
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::reconcile(format!("{kind} without a name")))?;
        Ok((self.api(kind, obj.metadata.namespace.as_deref())?, name))
    }

    fn with_types(&self, kind: ResourceKind, obj: &DynamicObject) -> Result<DynamicObject> {
        let reg = self.registry.lookup(kind)?;
        let mut obj = obj.clone();
        obj.types = Some(kube::core::TypeMeta {
            api_version: reg.resource.api_version.clone(),
            kind: reg.resource.kind.clone(),
        });
        Ok(obj)
    }
}

/// Map API status codes onto the accessor's error vocabulary.
fn classify(err: kube::Error, what: impl std::fmt::Display) -> Error {
    match &err {
        kube::Error::Api(ae) if ae.code == 404 => Error::NotFound(format!("{what}: {}", ae.message)),
        kube::Error::Api(ae) if ae.code == 409 => Error::Conflict(format!("{what}: {}", ae.message)),
        _ => Error::Kube(err),
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        self.api(kind, namespace)?
            .get_opt(name)
            .await
            .map_err(|e| classify(e, format!("get {kind} {name}")))
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        query: &LabelQuery,
    ) -> Result<Vec<DynamicObject>> {
        let mut lp = ListParams::default();
        if !query.is_empty() {
            lp = lp.labels(&query.to_string());
        }
        let list = self
            .api(kind, namespace)?
            .list(&lp)
            .await
            .map_err(|e| classify(e, format!("list {kind}")))?;
        Ok(list.items)
    }

    async fn create(&self, kind: ResourceKind, obj: &DynamicObject) -> Result<DynamicObject> {
        let (api, name) = self.api_for(kind, obj)?;
        let pp = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        api.create(&pp, &self.with_types(kind, obj)?)
            .await
            .map_err(|e| classify(e, format!("create {kind} {name}")))
    }

    async fn update(&self, kind: ResourceKind, obj: &DynamicObject) -> Result<DynamicObject> {
        let (api, name) = self.api_for(kind, obj)?;
        let pp = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        api.replace(&name, &pp, &self.with_types(kind, obj)?)
            .await
            .map_err(|e| classify(e, format!("update {kind} {name}")))
    }

    async fn delete(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<bool> {
        match self
            .api(kind, namespace)?
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(classify(e, format!("delete {kind} {name}"))),
        }
    }

    async fn patch_status(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
        status: &Value,
    ) -> Result<()> {
        let patch = json!({ "status": status });
        let pp = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        self.api(kind, namespace)?
            .patch_status(name, &pp, &Patch::Merge(&patch))
            .await
            .map_err(|e| classify(e, format!("patch status of {kind} {name}")))?;
        Ok(())
    }
}
