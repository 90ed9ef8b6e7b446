//! Admission rules for SSP create and update.
//!
//! Side-effect free: the validator only reads cluster state (sibling SSPs,
//! namespace existence) and holds no mutable state of its own, so one
//! instance may serve any number of concurrent admission calls.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Namespace;
use kube::ResourceExt;

use crate::cluster::{self, ClusterClient, LabelQuery};
use crate::crd::ssp::{DataImportCronTemplate, Ssp, GOLDEN_IMAGES_NAMESPACE};
use crate::error::{Error, Result};

#[derive(Clone)]
pub struct SspValidator {
    client: Arc<dyn ClusterClient>,
}

impl SspValidator {
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self { client }
    }

    /// Singleton check, templates namespace existence, then the
    /// DataImportCronTemplate rules.
    pub async fn validate_create(&self, candidate: &Ssp) -> Result<()> {
        let existing: Vec<Ssp> =
            cluster::list(self.client.as_ref(), None, &LabelQuery::new()).await?;
        let candidate_ns = candidate.namespace().unwrap_or_default();
        let candidate_name = candidate.name_any();
        let is_candidate =
            |s: &Ssp| s.namespace().unwrap_or_default() == candidate_ns && s.name_any() == candidate_name;
        if let Some(other) = existing.iter().find(|s| !is_candidate(s)) {
            return Err(Error::validation(format!(
                "creation failed, an SSP CR already exists in namespace {}: {}",
                other.namespace().unwrap_or_default(),
                other.name_any()
            )));
        }

        let templates_ns = candidate.templates_namespace();
        let found: Option<Namespace> =
            cluster::get(self.client.as_ref(), None, templates_ns).await?;
        if found.is_none() {
            return Err(Error::validation(format!(
                "creation failed, the configured namespace for common templates does not exist: {templates_ns}"
            )));
        }

        validate_data_import_cron_templates(candidate)
    }

    /// Only the DataImportCronTemplate rules are re-checked; moving the
    /// templates namespace is always allowed.
    pub async fn validate_update(&self, candidate: &Ssp, _previous: &Ssp) -> Result<()> {
        validate_data_import_cron_templates(candidate)
    }
}

/// An empty namespace resolves to the golden-images namespace; any other
/// explicit namespace is rejected, and a name is always required.
pub fn validate_data_import_cron_templates(ssp: &Ssp) -> Result<()> {
    for (idx, tpl) in ssp
        .spec
        .common_templates
        .data_import_cron_templates
        .iter()
        .enumerate()
    {
        validate_data_import_cron_template(idx, tpl)?;
    }
    Ok(())
}

fn validate_data_import_cron_template(idx: usize, tpl: &DataImportCronTemplate) -> Result<()> {
    let field = format!("spec.commonTemplates.dataImportCronTemplates[{idx}]");
    let ns = tpl.namespace();
    if !ns.is_empty() && ns != GOLDEN_IMAGES_NAMESPACE {
        return Err(Error::validation(format!(
            "{field}: invalid namespace {ns:?} for {:?}, only {GOLDEN_IMAGES_NAMESPACE} is allowed",
            tpl.name()
        )));
    }
    if tpl.name().is_empty() {
        let ns = if ns.is_empty() { GOLDEN_IMAGES_NAMESPACE } else { ns };
        return Err(Error::validation(format!(
            "{field}: missing name for DataImportCronTemplate in namespace {ns}"
        )));
    }
    Ok(())
}
