use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Shared namespace hosting OS images and their templates, independent of
/// the namespace the SSP itself lives in.
pub const GOLDEN_IMAGES_NAMESPACE: &str = "kubevirt-os-images";

/// Replica count for the template validator when the spec leaves it unset.
pub const DEFAULT_VALIDATOR_REPLICAS: i32 = 2;

// ── Spec sub-types ────────────────────────────────────────────────────────────

/// DataImportCronTemplate references a periodic-import template by name.
///
/// An empty namespace resolves to [`GOLDEN_IMAGES_NAMESPACE`].
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct DataImportCronTemplate {
    #[serde(default)]
    pub metadata: ObjectMeta,
}

impl DataImportCronTemplate {
    pub fn new(namespace: Option<&str>, name: Option<&str>) -> Self {
        Self {
            metadata: ObjectMeta {
                name: name.map(str::to_string),
                namespace: namespace.map(str::to_string),
                ..Default::default()
            },
        }
    }

    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or_default()
    }
}

/// CommonTemplates configures where the bundled VM templates are deployed.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommonTemplates {
    pub namespace: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_import_cron_templates: Vec<DataImportCronTemplate>,
}

/// TemplateValidator configures the template validator deployment.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct TemplateValidator {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
}

// ── CRD ───────────────────────────────────────────────────────────────────────

/// SSP is the Schema for the ssps API. At most one may exist per cluster.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "ssp.kubevirt.io",
    version = "v1beta1",
    kind = "SSP",
    root = "Ssp",
    plural = "ssps",
    shortname = "ssp",
    namespaced,
    status = "SspStatus",
    printcolumn = r#"{"name": "Templates", "type": "string", "jsonPath": ".spec.commonTemplates.namespace"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SspSpec {
    pub common_templates: CommonTemplates,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_validator: Option<TemplateValidator>,
}

impl Ssp {
    pub fn templates_namespace(&self) -> &str {
        &self.spec.common_templates.namespace
    }

    pub fn validator_replicas(&self) -> i32 {
        self.spec
            .template_validator
            .as_ref()
            .and_then(|v| v.replicas)
            .unwrap_or(DEFAULT_VALIDATOR_REPLICAS)
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or(0)
    }

    pub fn phase(&self) -> Option<SspPhase> {
        self.status.as_ref().and_then(|s| s.phase.clone())
    }

    pub fn observed_generation(&self) -> Option<i64> {
        self.status.as_ref().and_then(|s| s.observed_generation)
    }
}

// ── Status ────────────────────────────────────────────────────────────────────

/// SspPhase represents the lifecycle state of an SSP.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum SspPhase {
    Deploying,
    Deployed,
    Deleting,
}

impl std::fmt::Display for SspPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Deploying => "Deploying",
            Self::Deployed => "Deployed",
            Self::Deleting => "Deleting",
        };
        write!(f, "{s}")
    }
}

/// SspStatus is written only by the reconciliation engine.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SspStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<SspPhase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
