//! Bundled common-template definitions.
//!
//! The bundle is a multi-document YAML file of `Template` objects shipped next
//! to the operator binary. It is read once at startup.

use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use crate::crd::template::Template;
use crate::error::{Error, Result};

/// Bundle-only annotation selecting the namespace a template is deployed to.
/// Stripped by the loader.
pub const NAMESPACE_AFFINITY_ANNOTATION: &str = "ssp.kubevirt.io/namespace-affinity";
pub const GOLDEN_IMAGES_AFFINITY: &str = "golden-images";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NamespaceAffinity {
    /// `spec.commonTemplates.namespace` of the SSP.
    CommonTemplates,
    /// The shared golden-images namespace.
    GoldenImages,
}

#[derive(Clone, Debug)]
pub struct TemplateDefinition {
    pub affinity: NamespaceAffinity,
    pub template: Template,
}

impl TemplateDefinition {
    pub fn name(&self) -> &str {
        self.template.metadata.name.as_deref().unwrap_or_default()
    }
}

#[derive(Clone, Debug, Default)]
pub struct TemplateBundle {
    pub version: String,
    pub definitions: Vec<TemplateDefinition>,
}

impl TemplateBundle {
    /// Parse a multi-document YAML bundle. Empty documents are skipped; any
    /// document that is not a named `Template` fails the whole bundle.
    pub fn from_yaml(version: &str, yaml: &str) -> Result<Self> {
        let mut definitions = Vec::new();
        for (idx, doc) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
            let value = serde_yaml::Value::deserialize(doc)?;
            if value.is_null() {
                continue;
            }
            let mut template: Template = serde_yaml::from_value(value)?;

            let kind = template.types.as_ref().map(|t| t.kind.as_str());
            if kind != Some("Template") {
                return Err(Error::template(format!(
                    "document {idx}: expected kind Template, got {}",
                    kind.unwrap_or("<none>")
                )));
            }
            if template.metadata.name.as_deref().unwrap_or_default().is_empty() {
                return Err(Error::template(format!("document {idx}: template without a name")));
            }

            let affinity = match template
                .metadata
                .annotations
                .as_mut()
                .and_then(|a| a.remove(NAMESPACE_AFFINITY_ANNOTATION))
                .as_deref()
            {
                Some(GOLDEN_IMAGES_AFFINITY) => NamespaceAffinity::GoldenImages,
                Some(other) if other != "common-templates" => {
                    return Err(Error::template(format!(
                        "document {idx}: unknown namespace affinity {other:?}"
                    )))
                }
                _ => NamespaceAffinity::CommonTemplates,
            };
            if template.metadata.annotations.as_ref().is_some_and(|a| a.is_empty()) {
                template.metadata.annotations = None;
            }

            debug!(name = ?template.metadata.name, ?affinity, "loaded bundled template");
            definitions.push(TemplateDefinition { affinity, template });
        }
        Ok(Self {
            version: version.to_string(),
            definitions,
        })
    }

    /// Load the bundle at `path`. Without an explicit version, the version is
    /// taken from a `common-templates-<version>.yaml` file name.
    pub fn load(path: &Path, version: Option<&str>) -> Result<Self> {
        let version = match version {
            Some(v) => v.to_string(),
            None => version_from_path(path).ok_or_else(|| {
                Error::config(format!(
                    "cannot derive templates version from {}; pass --templates-version",
                    path.display()
                ))
            })?,
        };
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml(&version, &yaml)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

/// `common-templates-v0.13.1.yaml` → `v0.13.1`.
pub fn version_from_path(path: &Path) -> Option<String> {
    let stem = path.file_name()?.to_str()?;
    let stem = stem
        .strip_suffix(".yaml")
        .or_else(|| stem.strip_suffix(".yml"))?;
    let version = stem.strip_prefix("common-templates-")?;
    (!version.is_empty()).then(|| version.to_string())
}
