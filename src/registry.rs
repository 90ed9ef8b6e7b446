//! Explicit type registry.
//!
//! Maps every kind the operator reads or writes to its `ApiResource` and
//! scope. Built once at startup and handed to the cluster accessors, so no
//! component depends on ambient global type state.

use std::collections::BTreeMap;

use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{Namespace, Service, ServiceAccount},
    rbac::v1::{ClusterRole, Role, RoleBinding},
};
use kube::discovery::ApiResource;
use kube::Resource;
use serde::{de::DeserializeOwned, Serialize};

use crate::crd::ssp::Ssp;
use crate::crd::template::Template;
use crate::error::{Error, Result};

/// Identity of a managed kind, used as the first component of every
/// cluster-accessor key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    Ssp,
    Template,
    Namespace,
    Role,
    RoleBinding,
    ClusterRole,
    ServiceAccount,
    Service,
    Deployment,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ssp => "SSP",
            Self::Template => "Template",
            Self::Namespace => "Namespace",
            Self::Role => "Role",
            Self::RoleBinding => "RoleBinding",
            Self::ClusterRole => "ClusterRole",
            Self::ServiceAccount => "ServiceAccount",
            Self::Service => "Service",
            Self::Deployment => "Deployment",
        };
        write!(f, "{s}")
    }
}

/// A typed Kubernetes object the operator manages through the accessor.
pub trait Managed:
    Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const KIND: ResourceKind;
    const NAMESPACED: bool;
}

macro_rules! managed {
    ($ty:ty, $kind:ident, $namespaced:expr) => {
        impl Managed for $ty {
            const KIND: ResourceKind = ResourceKind::$kind;
            const NAMESPACED: bool = $namespaced;
        }
    };
}

managed!(Ssp, Ssp, true);
managed!(Template, Template, true);
managed!(Namespace, Namespace, false);
managed!(Role, Role, true);
managed!(RoleBinding, RoleBinding, true);
managed!(ClusterRole, ClusterRole, false);
managed!(ServiceAccount, ServiceAccount, true);
managed!(Service, Service, true);
managed!(Deployment, Deployment, true);

/// One registry row.
#[derive(Clone, Debug)]
pub struct Registration {
    pub resource: ApiResource,
    pub namespaced: bool,
}

#[derive(Clone, Debug)]
pub struct Registry {
    entries: BTreeMap<ResourceKind, Registration>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Registry with every kind the operator manages.
    pub fn new() -> Self {
        let mut registry = Self {
            entries: BTreeMap::new(),
        };
        registry.register::<Ssp>();
        registry.register::<Template>();
        registry.register::<Namespace>();
        registry.register::<Role>();
        registry.register::<RoleBinding>();
        registry.register::<ClusterRole>();
        registry.register::<ServiceAccount>();
        registry.register::<Service>();
        registry.register::<Deployment>();
        registry
    }

    pub fn register<K: Managed>(&mut self) {
        self.entries.insert(
            K::KIND,
            Registration {
                resource: ApiResource::erase::<K>(&()),
                namespaced: K::NAMESPACED,
            },
        );
    }

    pub fn lookup(&self, kind: ResourceKind) -> Result<&Registration> {
        self.entries
            .get(&kind)
            .ok_or_else(|| Error::config(format!("kind {kind} is not registered")))
    }
}
