//! Shared test harness for engine-level integration tests.
//!
//! Every test builds its own [`TestContext`]: a fresh in-memory cluster with
//! the SSP namespace and the common-templates namespace already present, an
//! SSP seeded into it, and an engine running both operands.
//!
//! There is no kubelet, so Deployment readiness must be faked by patching
//! the status subresource.

use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::ObjectMeta;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use ssp_operator::bundle::TemplateBundle;
use ssp_operator::cluster::memory::MemoryCluster;
use ssp_operator::cluster;
use ssp_operator::controller::engine::{Engine, PassOutcome};
use ssp_operator::controller::operands::common_templates::CommonTemplates;
use ssp_operator::controller::operands::template_validator::{
    TemplateValidator, VIRT_TEMPLATE_VALIDATOR,
};
use ssp_operator::controller::operands::Operand;
use ssp_operator::crd::ssp::{CommonTemplates as CommonTemplatesSpec, Ssp, SspSpec};
use ssp_operator::error::Result;
use ssp_operator::fingerprint::VersionCache;

pub const SSP_NAMESPACE: &str = "kubevirt";
pub const SSP_NAME: &str = "ssp-sample";
pub const TEMPLATES_NAMESPACE: &str = "common-templates";
pub const TEMPLATES_VERSION: &str = "v0.13.1";
pub const VALIDATOR_IMAGE: &str = "quay.io/kubevirt/kubevirt-template-validator:v0.13.1";

/// Two templates: one pinned to the golden-images namespace, one deployed to
/// the SSP's common-templates namespace.
pub const SAMPLE_BUNDLE: &str = r#"
apiVersion: template.openshift.io/v1
kind: Template
metadata:
  name: centos8-server-medium
  annotations:
    ssp.kubevirt.io/namespace-affinity: golden-images
    openshift.io/display-name: CentOS 8.0+ VM
  labels:
    os.template.kubevirt.io/centos8: "true"
    flavor.template.kubevirt.io/medium: "true"
    workload.template.kubevirt.io/server: "true"
message: CentOS 8 VM
objects:
  - apiVersion: kubevirt.io/v1
    kind: VirtualMachine
    metadata:
      name: ${NAME}
parameters:
  - name: NAME
    generate: expression
    from: centos8-[a-z0-9]{16}
---
apiVersion: template.openshift.io/v1
kind: Template
metadata:
  name: windows10-desktop-medium
  annotations:
    openshift.io/display-name: Microsoft Windows 10 VM
  labels:
    os.template.kubevirt.io/win10: "true"
    flavor.template.kubevirt.io/medium: "true"
    workload.template.kubevirt.io/desktop: "true"
objects:
  - apiVersion: kubevirt.io/v1
    kind: VirtualMachine
    metadata:
      name: ${NAME}
parameters:
  - name: NAME
    required: true
"#;

pub fn namespace(name: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn ssp(namespace: &str, name: &str, templates_namespace: &str) -> Ssp {
    let mut ssp = Ssp::new(
        name,
        SspSpec {
            common_templates: CommonTemplatesSpec {
                namespace: templates_namespace.to_string(),
                ..Default::default()
            },
            template_validator: None,
        },
    );
    ssp.metadata.namespace = Some(namespace.to_string());
    ssp
}

pub fn sample_bundle() -> TemplateBundle {
    TemplateBundle::from_yaml(TEMPLATES_VERSION, SAMPLE_BUNDLE).expect("sample bundle parses")
}

pub struct TestContext {
    pub cluster: Arc<MemoryCluster>,
    pub engine: Engine,
    pub versions: VersionCache,
    pub cancel: CancellationToken,
}

impl TestContext {
    pub fn new() -> Self {
        let cluster = Arc::new(MemoryCluster::default());
        cluster.seed(&namespace(SSP_NAMESPACE)).expect("seed namespace");
        cluster
            .seed(&namespace(TEMPLATES_NAMESPACE))
            .expect("seed namespace");
        cluster
            .seed(&ssp(SSP_NAMESPACE, SSP_NAME, TEMPLATES_NAMESPACE))
            .expect("seed ssp");

        let operands: Vec<Box<dyn Operand>> = vec![
            Box::new(CommonTemplates::new(Arc::new(sample_bundle()))),
            Box::new(TemplateValidator::new(VALIDATOR_IMAGE)),
        ];
        Self {
            cluster,
            engine: Engine::new(operands),
            versions: VersionCache::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// The SSP as currently stored.
    pub fn ssp(&self) -> Ssp {
        self.cluster
            .fetch(Some(SSP_NAMESPACE), SSP_NAME)
            .expect("ssp exists")
    }

    /// Run one engine pass against the current SSP.
    pub async fn pass(&self) -> Result<PassOutcome> {
        let ssp = self.ssp();
        self.engine
            .reconcile(&ssp, &*self.cluster, &self.versions, &self.cancel)
            .await
    }

    /// Pretend the validator pods came up.
    pub async fn fake_validator_ready(&self, ready: i32) -> Result<()> {
        let deployment: Deployment = self
            .cluster
            .fetch(Some(SSP_NAMESPACE), VIRT_TEMPLATE_VALIDATOR)
            .expect("validator deployment exists");
        cluster::patch_status(
            &*self.cluster,
            &deployment,
            &json!({ "readyReplicas": ready }),
        )
        .await
    }

    /// Drive the SSP to `Deployed`: apply everything, mark the validator
    /// ready, and run the pass that records convergence.
    pub async fn deploy(&self) -> Result<()> {
        self.pass().await?;
        self.fake_validator_ready(2).await?;
        let outcome = self.pass().await?;
        assert!(outcome.result.converged(), "{:?}", outcome.result);
        Ok(())
    }

    /// Request deletion of the SSP the way the API server does.
    pub async fn request_deletion(&self) -> Result<bool> {
        cluster::delete::<Ssp>(&*self.cluster, Some(SSP_NAMESPACE), SSP_NAME).await
    }
}
