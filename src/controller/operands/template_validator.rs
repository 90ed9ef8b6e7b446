//! Template-validator operand.
//!
//! Runs the template validator webhook backend next to the SSP. All of its
//! resources are structurally owned, so garbage collection removes them and
//! cleanup has nothing to do.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, Service, ServiceAccount, ServicePort,
    ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use kube::ResourceExt;

use super::{create_or_update, CleanupResult, Operand, ReconcileResult, Request};
use crate::controller::helpers::apply_ownership;
use crate::crd::ssp::Ssp;
use crate::error::Result;

pub const VIRT_TEMPLATE_VALIDATOR: &str = "virt-template-validator";
pub const KUBEVIRT_IO_LABEL: &str = "kubevirt.io";
const CONTAINER_PORT: i32 = 8443;

pub struct TemplateValidator {
    image: String,
}

impl TemplateValidator {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
        }
    }
}

fn pod_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(
        KUBEVIRT_IO_LABEL.to_string(),
        VIRT_TEMPLATE_VALIDATOR.to_string(),
    )])
}

fn owned_meta(ssp: &Ssp) -> ObjectMeta {
    let mut meta = ObjectMeta {
        name: Some(VIRT_TEMPLATE_VALIDATOR.to_string()),
        namespace: ssp.namespace(),
        labels: Some(pod_labels()),
        ..Default::default()
    };
    apply_ownership(&mut meta, ssp);
    meta
}

pub fn service_account(ssp: &Ssp) -> ServiceAccount {
    ServiceAccount {
        metadata: owned_meta(ssp),
        ..Default::default()
    }
}

pub fn service(ssp: &Ssp) -> Service {
    Service {
        metadata: owned_meta(ssp),
        spec: Some(ServiceSpec {
            selector: Some(pod_labels()),
            ports: Some(vec![ServicePort {
                name: Some("webhook".to_string()),
                port: 443,
                protocol: Some("TCP".to_string()),
                target_port: Some(IntOrString::Int(CONTAINER_PORT)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn deployment(ssp: &Ssp, image: &str) -> Deployment {
    Deployment {
        metadata: owned_meta(ssp),
        spec: Some(DeploymentSpec {
            replicas: Some(ssp.validator_replicas()),
            selector: LabelSelector {
                match_labels: Some(pod_labels()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(VIRT_TEMPLATE_VALIDATOR.to_string()),
                    containers: vec![Container {
                        name: "webhook".to_string(),
                        image: Some(image.to_string()),
                        args: Some(vec![format!("--port={CONTAINER_PORT}")]),
                        ports: Some(vec![ContainerPort {
                            name: Some("webhook".to_string()),
                            container_port: CONTAINER_PORT,
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn merge_owner<K: kube::Resource>(desired: &K, live: &mut K) -> bool {
    let wanted = desired.meta().owner_references.clone();
    if live.meta().owner_references != wanted {
        live.meta_mut().owner_references = wanted;
        return true;
    }
    false
}

fn merge_service(desired: &Service, live: &mut Service) -> bool {
    let mut changed = merge_owner(desired, live);
    let (Some(want), Some(have)) = (desired.spec.as_ref(), live.spec.as_mut()) else {
        live.spec = desired.spec.clone();
        return true;
    };
    if have.selector != want.selector {
        have.selector = want.selector.clone();
        changed = true;
    }
    if have.ports != want.ports {
        have.ports = want.ports.clone();
        changed = true;
    }
    changed
}

fn validator_container(d: &mut Deployment) -> Option<&mut Container> {
    d.spec
        .as_mut()?
        .template
        .spec
        .as_mut()?
        .containers
        .iter_mut()
        .find(|c| c.name == "webhook")
}

/// Only replicas, image and ownership are managed; everything else is left
/// to API server defaulting.
fn merge_deployment(desired: &Deployment, live: &mut Deployment) -> bool {
    let mut changed = merge_owner(desired, live);
    let Some(want) = desired.spec.as_ref() else {
        return changed;
    };
    let Some(have) = live.spec.as_mut() else {
        live.spec = desired.spec.clone();
        return true;
    };
    if have.replicas != want.replicas {
        have.replicas = want.replicas;
        changed = true;
    }
    let want_image = want
        .template
        .spec
        .as_ref()
        .and_then(|s| s.containers.first())
        .and_then(|c| c.image.clone());
    match validator_container(live) {
        Some(c) if c.image != want_image => {
            c.image = want_image;
            changed = true;
        }
        Some(_) => {}
        None => {
            live.spec = desired.spec.clone();
            changed = true;
        }
    }
    changed
}

#[async_trait]
impl Operand for TemplateValidator {
    fn name(&self) -> &'static str {
        "template-validator"
    }

    async fn reconcile(&self, req: &Request<'_>) -> Result<ReconcileResult> {
        let ssp = req.instance;
        let mut result = ReconcileResult::default();

        let account = service_account(ssp);
        result.record(create_or_update(req, &account, merge_owner::<ServiceAccount>).await?);
        result.record(create_or_update(req, &service(ssp), merge_service).await?);
        let desired = deployment(ssp, &self.image);
        result.record(create_or_update(req, &desired, merge_deployment).await?);

        let live = req
            .get::<Deployment>(ssp.namespace().as_deref(), VIRT_TEMPLATE_VALIDATOR)
            .await?;
        let ready = live
            .as_ref()
            .and_then(|d| d.status.as_ref())
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0);
        if ready < ssp.validator_replicas() {
            result.wait_for(format!(
                "deployment {VIRT_TEMPLATE_VALIDATOR}: {ready}/{} ready",
                ssp.validator_replicas()
            ));
        }
        Ok(result)
    }

    async fn cleanup(&self, _req: &Request<'_>) -> Result<CleanupResult> {
        Ok(CleanupResult::default())
    }
}
