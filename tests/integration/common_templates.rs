use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::rbac::v1::{ClusterRole, Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;

use ssp_operator::cluster::memory::Verb;
use ssp_operator::controller::helpers::{OWNER_NAME_ANNOTATION, OWNER_TYPE_ANNOTATION};
use ssp_operator::controller::operands::common_templates::{EDIT_ROLE_NAME, VIEW_ROLE_NAME};
use ssp_operator::crd::ssp::GOLDEN_IMAGES_NAMESPACE;
use ssp_operator::crd::template::Template;
use ssp_operator::fingerprint::{
    TEMPLATE_DEPRECATED_ANNOTATION, TEMPLATE_TYPE_LABEL, TEMPLATE_VERSION_LABEL,
};
use ssp_operator::registry::ResourceKind;

use super::common::*;

fn old_template(name: &str) -> Template {
    Template {
        types: Some(Template::type_meta()),
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(TEMPLATES_NAMESPACE.to_string()),
            labels: Some(BTreeMap::from([
                (TEMPLATE_TYPE_LABEL.to_string(), "base".to_string()),
                (TEMPLATE_VERSION_LABEL.to_string(), "v0.11.3".to_string()),
                ("os.template.kubevirt.io/centos7.0".to_string(), "true".to_string()),
                ("flavor.template.kubevirt.io/small".to_string(), "true".to_string()),
                ("app".to_string(), "legacy".to_string()),
            ])),
            owner_references: Some(vec![OwnerReference {
                api_version: "template.openshift.io/v1".into(),
                kind: "Template".into(),
                name: "centos7-parent".into(),
                uid: "uid-parent".into(),
                ..Default::default()
            }]),
            ..Default::default()
        },
        message: Some("CentOS 7 VM".into()),
        ..Default::default()
    }
}

/// Templates land in the namespace their affinity selects, labelled with the
/// bundle version and owned by annotation.
#[tokio::test]
async fn templates_deploy_to_their_namespaces() -> anyhow::Result<()> {
    let ctx = TestContext::new();
    ctx.pass().await?;

    let centos: Template = ctx
        .cluster
        .fetch(Some(GOLDEN_IMAGES_NAMESPACE), "centos8-server-medium")
        .expect("centos template in golden-images namespace");
    let windows: Template = ctx
        .cluster
        .fetch(Some(TEMPLATES_NAMESPACE), "windows10-desktop-medium")
        .expect("windows template in common-templates namespace");

    for tpl in [&centos, &windows] {
        let labels = tpl.labels();
        assert_eq!(labels.get(TEMPLATE_VERSION_LABEL).map(String::as_str), Some(TEMPLATES_VERSION));
        assert_eq!(labels.get(TEMPLATE_TYPE_LABEL).map(String::as_str), Some("base"));
        let annotations = tpl.annotations();
        assert_eq!(
            annotations.get(OWNER_NAME_ANNOTATION).map(String::as_str),
            Some("kubevirt/ssp-sample")
        );
        assert_eq!(
            annotations.get(OWNER_TYPE_ANNOTATION).map(String::as_str),
            Some("SSP.ssp.kubevirt.io")
        );
        assert!(tpl.metadata.owner_references.is_none());
    }
    assert!(!centos
        .annotations()
        .contains_key("ssp.kubevirt.io/namespace-affinity"));
    assert_eq!(ctx.cluster.all::<Template>().len(), 2);
    Ok(())
}

/// The golden-images namespace is created on first pass.
#[tokio::test]
async fn golden_images_namespace_is_created() -> anyhow::Result<()> {
    let ctx = TestContext::new();
    assert!(ctx
        .cluster
        .fetch::<Namespace>(None, GOLDEN_IMAGES_NAMESPACE)
        .is_none());

    ctx.pass().await?;
    assert!(ctx
        .cluster
        .fetch::<Namespace>(None, GOLDEN_IMAGES_NAMESPACE)
        .is_some());
    Ok(())
}

/// Templates of an older version are deprecated in place: classification
/// labels go, the deprecated annotation appears, and ownership moves to the
/// annotation pair.
#[tokio::test]
async fn old_templates_are_deprecated() -> anyhow::Result<()> {
    let ctx = TestContext::new();
    ctx.cluster.seed(&old_template("centos7-server-small"))?;

    ctx.pass().await?;

    let old: Template = ctx
        .cluster
        .fetch(Some(TEMPLATES_NAMESPACE), "centos7-server-small")
        .expect("deprecated templates are kept");
    let labels = old.labels();
    assert!(!labels.keys().any(|k| k.starts_with("os.template.kubevirt.io/")));
    assert!(!labels.keys().any(|k| k.starts_with("flavor.template.kubevirt.io/")));
    assert_eq!(labels.get("app").map(String::as_str), Some("legacy"));
    assert_eq!(labels.get(TEMPLATE_VERSION_LABEL).map(String::as_str), Some("v0.11.3"));

    let annotations = old.annotations();
    assert_eq!(
        annotations.get(TEMPLATE_DEPRECATED_ANNOTATION).map(String::as_str),
        Some("true")
    );
    assert_eq!(
        annotations.get(OWNER_NAME_ANNOTATION).map(String::as_str),
        Some("kubevirt/ssp-sample")
    );
    assert!(old.metadata.owner_references.is_none());
    assert_eq!(old.message.as_deref(), Some("CentOS 7 VM"));
    Ok(())
}

/// Deprecation happens once; later passes leave the old template alone.
#[tokio::test]
async fn deprecation_is_not_repeated() -> anyhow::Result<()> {
    let ctx = TestContext::new();
    ctx.cluster.seed(&old_template("centos7-server-small"))?;
    ctx.pass().await?;
    ctx.cluster.clear_journal();

    ctx.pass().await?;
    let touched = ctx
        .cluster
        .journal()
        .into_iter()
        .filter(|m| m.key.kind == ResourceKind::Template)
        .count();
    assert_eq!(touched, 0);
    Ok(())
}

/// A template that lost a classification label in the bundle loses it in
/// the cluster too; unrelated labels survive.
#[tokio::test]
async fn stale_classification_labels_are_removed() -> anyhow::Result<()> {
    let ctx = TestContext::new();
    ctx.pass().await?;

    let mut tpl: Template = ctx
        .cluster
        .fetch(Some(TEMPLATES_NAMESPACE), "windows10-desktop-medium")
        .expect("template deployed");
    let labels = tpl.metadata.labels.get_or_insert_with(BTreeMap::new);
    labels.insert("workload.template.kubevirt.io/highperformance".into(), "true".into());
    labels.insert("team".into(), "virt".into());
    ssp_operator::cluster::update(&*ctx.cluster, &tpl).await?;

    ctx.pass().await?;
    let tpl: Template = ctx
        .cluster
        .fetch(Some(TEMPLATES_NAMESPACE), "windows10-desktop-medium")
        .expect("template deployed");
    let labels = tpl.labels();
    assert!(!labels.contains_key("workload.template.kubevirt.io/highperformance"));
    assert!(labels.contains_key("workload.template.kubevirt.io/desktop"));
    assert_eq!(labels.get("team").map(String::as_str), Some("virt"));
    Ok(())
}

/// The RBAC for the golden-images namespace exists exactly once, no matter
/// how many passes run.
#[tokio::test]
async fn rbac_is_created_once() -> anyhow::Result<()> {
    let ctx = TestContext::new();
    for _ in 0..3 {
        ctx.pass().await?;
    }

    assert_eq!(ctx.cluster.all::<Role>().len(), 1);
    assert_eq!(ctx.cluster.all::<RoleBinding>().len(), 1);
    assert_eq!(ctx.cluster.all::<ClusterRole>().len(), 1);

    let creates = |kind: ResourceKind| {
        ctx.cluster
            .journal()
            .iter()
            .filter(|m| m.verb == Verb::Create && m.key.kind == kind)
            .count()
    };
    assert_eq!(creates(ResourceKind::Role), 1);
    assert_eq!(creates(ResourceKind::RoleBinding), 1);
    assert_eq!(creates(ResourceKind::ClusterRole), 1);

    let binding: RoleBinding = ctx
        .cluster
        .fetch(Some(GOLDEN_IMAGES_NAMESPACE), VIEW_ROLE_NAME)
        .expect("view binding");
    let subjects = binding.subjects.unwrap_or_default();
    assert_eq!(subjects.len(), 1);
    assert_eq!(subjects[0].name, "system:authenticated");

    let edit: ClusterRole = ctx
        .cluster
        .fetch(None, EDIT_ROLE_NAME)
        .expect("edit cluster role");
    assert_eq!(
        edit.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get("rbac.authorization.k8s.io/aggregate-to-edit"))
            .map(String::as_str),
        Some("true")
    );
    Ok(())
}

/// RBAC objects that already exist are never rewritten.
#[tokio::test]
async fn existing_rbac_is_left_alone() -> anyhow::Result<()> {
    let ctx = TestContext::new();
    ctx.cluster.seed(&namespace(GOLDEN_IMAGES_NAMESPACE))?;
    ctx.cluster.seed(&Role {
        metadata: ObjectMeta {
            name: Some(VIEW_ROLE_NAME.into()),
            namespace: Some(GOLDEN_IMAGES_NAMESPACE.into()),
            ..Default::default()
        },
        rules: None,
    })?;

    ctx.pass().await?;
    let role: Role = ctx
        .cluster
        .fetch(Some(GOLDEN_IMAGES_NAMESPACE), VIEW_ROLE_NAME)
        .expect("role exists");
    assert!(role.rules.is_none());
    Ok(())
}

/// Templates owned by another SSP survive this SSP's cleanup.
#[tokio::test]
async fn cleanup_only_removes_own_templates() -> anyhow::Result<()> {
    let ctx = TestContext::new();
    ctx.deploy().await?;

    let mut foreign = old_template("fedora-server-small");
    foreign.metadata.owner_references = None;
    foreign.metadata.annotations = Some(BTreeMap::from([
        (OWNER_NAME_ANNOTATION.to_string(), "other/ssp-other".to_string()),
        (OWNER_TYPE_ANNOTATION.to_string(), "SSP.ssp.kubevirt.io".to_string()),
        (TEMPLATE_DEPRECATED_ANNOTATION.to_string(), "true".to_string()),
    ]));
    ctx.cluster.seed(&foreign)?;

    ctx.request_deletion().await?;
    let outcome = ctx.pass().await?;
    assert!(outcome.finalizer_removed);

    let left: Vec<String> = ctx
        .cluster
        .all::<Template>()
        .iter()
        .filter_map(|t| t.metadata.name.clone())
        .collect();
    assert_eq!(left, vec!["fedora-server-small".to_string()]);
    assert!(ctx
        .cluster
        .fetch::<Namespace>(None, GOLDEN_IMAGES_NAMESPACE)
        .is_some());
    Ok(())
}
