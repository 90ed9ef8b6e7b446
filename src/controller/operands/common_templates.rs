//! Common-templates operand.
//!
//! Deploys the bundled VM templates, the shared golden-images namespace and
//! the RBAC that opens that namespace to every authenticated user. Templates
//! of any other version are deprecated in place, never deleted.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::rbac::v1::{ClusterRole, PolicyRule, Role, RoleBinding, RoleRef, Subject};
use kube::api::ObjectMeta;
use kube::ResourceExt;
use tracing::info;

use super::{
    create_if_absent, create_or_update, delete_and_check, update_existing, CleanupResult, Operand,
    ReconcileResult, Request,
};
use crate::bundle::{NamespaceAffinity, TemplateBundle, TemplateDefinition};
use crate::cluster::LabelQuery;
use crate::controller::helpers::{apply_ownership, is_owned_by_annotation, migrate_ownership};
use crate::crd::ssp::{Ssp, GOLDEN_IMAGES_NAMESPACE};
use crate::crd::template::Template;
use crate::error::Result;
use crate::fingerprint::{
    desired_digest, is_classification_label, TEMPLATE_DEPRECATED_ANNOTATION, TEMPLATE_TYPE_BASE,
    TEMPLATE_TYPE_LABEL, TEMPLATE_VERSION_LABEL,
};

pub const VIEW_ROLE_NAME: &str = "os-images.kubevirt.io:view";
pub const EDIT_ROLE_NAME: &str = "os-images.kubevirt.io:edit";
const AGGREGATE_TO_EDIT_LABEL: &str = "rbac.authorization.k8s.io/aggregate-to-edit";
const CDI_GROUP: &str = "cdi.kubevirt.io";
const RBAC_GROUP: &str = "rbac.authorization.k8s.io";

pub struct CommonTemplates {
    bundle: Arc<TemplateBundle>,
}

impl CommonTemplates {
    pub fn new(bundle: Arc<TemplateBundle>) -> Self {
        Self { bundle }
    }

    fn target_namespace<'a>(&self, ssp: &'a Ssp, def: &TemplateDefinition) -> &'a str {
        match def.affinity {
            NamespaceAffinity::CommonTemplates => ssp.templates_namespace(),
            NamespaceAffinity::GoldenImages => GOLDEN_IMAGES_NAMESPACE,
        }
    }

    fn target_namespaces<'a>(&self, ssp: &'a Ssp) -> BTreeSet<&'a str> {
        self.bundle
            .definitions
            .iter()
            .map(|def| self.target_namespace(ssp, def))
            .chain([ssp.templates_namespace()])
            .collect()
    }

    /// The bundled template as it should look in the cluster.
    pub fn desired_template(&self, ssp: &Ssp, def: &TemplateDefinition) -> Template {
        let mut template = def.template.clone();
        template.types = Some(Template::type_meta());
        let meta = &mut template.metadata;
        meta.namespace = Some(self.target_namespace(ssp, def).to_string());
        meta.resource_version = None;
        meta.uid = None;
        meta.owner_references = None;
        let labels = meta.labels.get_or_insert_with(BTreeMap::new);
        labels.insert(TEMPLATE_VERSION_LABEL.into(), self.bundle.version.clone());
        labels.insert(TEMPLATE_TYPE_LABEL.into(), TEMPLATE_TYPE_BASE.into());
        if let Some(annotations) = meta.annotations.as_mut() {
            annotations.remove(TEMPLATE_DEPRECATED_ANNOTATION);
        }
        apply_ownership(meta, ssp);
        template
    }

    async fn reconcile_templates(&self, req: &Request<'_>, result: &mut ReconcileResult) -> Result<()> {
        let ssp = req.instance;
        for def in &self.bundle.definitions {
            let desired = self.desired_template(ssp, def);
            let outcome =
                create_or_update(req, &desired, |desired, live| merge_template(desired, live, ssp))
                    .await?;
            result.record(outcome);
        }
        Ok(())
    }

    async fn deprecate_old_templates(&self, req: &Request<'_>, result: &mut ReconcileResult) -> Result<()> {
        let ssp = req.instance;
        let query = LabelQuery::new()
            .equals(TEMPLATE_TYPE_LABEL, TEMPLATE_TYPE_BASE)
            .not_equals(TEMPLATE_VERSION_LABEL, &self.bundle.version);
        let digest = desired_digest(&("deprecated", &self.bundle.version))?;
        for ns in self.target_namespaces(ssp) {
            for old in req.list::<Template>(Some(ns), &query).await? {
                let outcome = update_existing(req, &old, &digest, |tpl| deprecate(tpl, ssp)).await?;
                if outcome.is_mutation() {
                    info!(parent: &req.span, template = %old.name_any(), %ns, "deprecated old template");
                }
                result.record(outcome);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Operand for CommonTemplates {
    fn name(&self) -> &'static str {
        "common-templates"
    }

    async fn reconcile(&self, req: &Request<'_>) -> Result<ReconcileResult> {
        let ssp = req.instance;
        let mut result = ReconcileResult::default();

        result.record(create_if_absent(req, &golden_images_namespace()).await?);
        self.reconcile_templates(req, &mut result).await?;
        self.deprecate_old_templates(req, &mut result).await?;

        result.record(create_if_absent(req, &view_role(ssp)).await?);
        result.record(create_if_absent(req, &view_role_binding(ssp)).await?);
        result.record(create_if_absent(req, &edit_role(ssp)).await?);

        Ok(result)
    }

    /// Owner references do not reach across namespaces, so everything owned
    /// by annotation is deleted here. The golden-images namespace stays.
    async fn cleanup(&self, req: &Request<'_>) -> Result<CleanupResult> {
        let ssp = req.instance;
        let mut result = CleanupResult::default();

        let query = LabelQuery::new().equals(TEMPLATE_TYPE_LABEL, TEMPLATE_TYPE_BASE);
        for tpl in req.list::<Template>(None, &query).await? {
            if !is_owned_by_annotation(&tpl.metadata, ssp) {
                continue;
            }
            let ns = tpl.namespace();
            delete_and_check::<Template>(req, ns.as_deref(), &tpl.name_any(), &mut result).await?;
        }

        if let Some(role) = req.get::<Role>(Some(GOLDEN_IMAGES_NAMESPACE), VIEW_ROLE_NAME).await? {
            if is_owned_by_annotation(&role.metadata, ssp) {
                delete_and_check::<Role>(req, Some(GOLDEN_IMAGES_NAMESPACE), VIEW_ROLE_NAME, &mut result)
                    .await?;
            }
        }
        if let Some(binding) = req
            .get::<RoleBinding>(Some(GOLDEN_IMAGES_NAMESPACE), VIEW_ROLE_NAME)
            .await?
        {
            if is_owned_by_annotation(&binding.metadata, ssp) {
                delete_and_check::<RoleBinding>(
                    req,
                    Some(GOLDEN_IMAGES_NAMESPACE),
                    VIEW_ROLE_NAME,
                    &mut result,
                )
                .await?;
            }
        }
        if let Some(role) = req.get::<ClusterRole>(None, EDIT_ROLE_NAME).await? {
            if is_owned_by_annotation(&role.metadata, ssp) {
                delete_and_check::<ClusterRole>(req, None, EDIT_ROLE_NAME, &mut result).await?;
            }
        }

        Ok(result)
    }
}

// ── Diffing ───────────────────────────────────────────────────────────────────

/// Copy the managed parts of `desired` onto `live`. Labels and annotations
/// not managed here are preserved, except classification labels the bundle
/// no longer carries.
pub fn merge_template(desired: &Template, live: &mut Template, ssp: &Ssp) -> bool {
    let mut changed = false;

    let desired_labels = desired.labels();
    let labels = live.metadata.labels.get_or_insert_with(BTreeMap::new);
    let before = labels.len();
    labels.retain(|k, _| !is_classification_label(k) || desired_labels.contains_key(k));
    changed |= labels.len() != before;
    for (k, v) in desired_labels {
        if labels.get(k) != Some(v) {
            labels.insert(k.clone(), v.clone());
            changed = true;
        }
    }

    let annotations = live.metadata.annotations.get_or_insert_with(BTreeMap::new);
    changed |= annotations.remove(TEMPLATE_DEPRECATED_ANNOTATION).is_some();
    for (k, v) in desired.annotations() {
        if annotations.get(k) != Some(v) {
            annotations.insert(k.clone(), v.clone());
            changed = true;
        }
    }

    if live.message != desired.message {
        live.message = desired.message.clone();
        changed = true;
    }
    if live.objects != desired.objects {
        live.objects = desired.objects.clone();
        changed = true;
    }
    if live.parameters != desired.parameters {
        live.parameters = desired.parameters.clone();
        changed = true;
    }
    if live.labels != desired.labels {
        live.labels = desired.labels.clone();
        changed = true;
    }

    changed |= apply_ownership(&mut live.metadata, ssp);
    changed
}

/// Deprecate a template of a non-current version: no classification labels,
/// deprecated annotation set, annotation-based ownership.
pub fn deprecate(tpl: &mut Template, ssp: &Ssp) -> bool {
    let mut changed = false;
    if let Some(labels) = tpl.metadata.labels.as_mut() {
        let before = labels.len();
        labels.retain(|k, _| !is_classification_label(k));
        changed |= labels.len() != before;
    }
    let annotations = tpl.metadata.annotations.get_or_insert_with(BTreeMap::new);
    if annotations.get(TEMPLATE_DEPRECATED_ANNOTATION).map(String::as_str) != Some("true") {
        annotations.insert(TEMPLATE_DEPRECATED_ANNOTATION.into(), "true".into());
        changed = true;
    }
    if tpl
        .metadata
        .owner_references
        .as_ref()
        .is_some_and(|r| !r.is_empty())
    {
        changed |= migrate_ownership(&mut tpl.metadata, ssp);
    }
    changed
}

// ── Desired resources ─────────────────────────────────────────────────────────

pub fn golden_images_namespace() -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(GOLDEN_IMAGES_NAMESPACE.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn owned_meta(ssp: &Ssp, namespace: Option<&str>, name: &str) -> ObjectMeta {
    let mut meta = ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        ..Default::default()
    };
    apply_ownership(&mut meta, ssp);
    meta
}

fn datavolume_rule(resources: &str, verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![CDI_GROUP.to_string()]),
        resources: Some(vec![resources.to_string()]),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    }
}

pub fn view_role(ssp: &Ssp) -> Role {
    Role {
        metadata: owned_meta(ssp, Some(GOLDEN_IMAGES_NAMESPACE), VIEW_ROLE_NAME),
        rules: Some(vec![
            datavolume_rule("datavolumes", &["get", "list", "watch"]),
            datavolume_rule("datavolumes/source", &["create"]),
        ]),
    }
}

pub fn view_role_binding(ssp: &Ssp) -> RoleBinding {
    RoleBinding {
        metadata: owned_meta(ssp, Some(GOLDEN_IMAGES_NAMESPACE), VIEW_ROLE_NAME),
        role_ref: RoleRef {
            api_group: RBAC_GROUP.to_string(),
            kind: "Role".to_string(),
            name: VIEW_ROLE_NAME.to_string(),
        },
        subjects: Some(vec![Subject {
            api_group: Some(RBAC_GROUP.to_string()),
            kind: "Group".to_string(),
            name: "system:authenticated".to_string(),
            ..Default::default()
        }]),
    }
}

pub fn edit_role(ssp: &Ssp) -> ClusterRole {
    let mut metadata = owned_meta(ssp, None, EDIT_ROLE_NAME);
    metadata.labels = Some(BTreeMap::from([(
        AGGREGATE_TO_EDIT_LABEL.to_string(),
        "true".to_string(),
    )]));
    ClusterRole {
        metadata,
        rules: Some(vec![datavolume_rule("datavolumes", &["*"])]),
        ..Default::default()
    }
}
