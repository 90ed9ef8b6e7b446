use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Service, ServiceAccount};

use ssp_operator::controller::operands::template_validator::VIRT_TEMPLATE_VALIDATOR;
use ssp_operator::crd::ssp::SspPhase;

use super::common::*;

/// The validator runs next to the SSP and is owned by it structurally.
#[tokio::test]
async fn validator_resources_are_owned_by_the_ssp() -> anyhow::Result<()> {
    let ctx = TestContext::new();
    ctx.pass().await?;
    let uid = ctx.ssp().metadata.uid.expect("seeded ssp has a uid");

    let account: ServiceAccount = ctx
        .cluster
        .fetch(Some(SSP_NAMESPACE), VIRT_TEMPLATE_VALIDATOR)
        .expect("service account");
    let service: Service = ctx
        .cluster
        .fetch(Some(SSP_NAMESPACE), VIRT_TEMPLATE_VALIDATOR)
        .expect("service");
    let deployment: Deployment = ctx
        .cluster
        .fetch(Some(SSP_NAMESPACE), VIRT_TEMPLATE_VALIDATOR)
        .expect("deployment");

    for refs in [
        account.metadata.owner_references,
        service.metadata.owner_references,
        deployment.metadata.owner_references.clone(),
    ] {
        let refs = refs.expect("owner references");
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].uid, uid);
        assert_eq!(refs[0].controller, Some(true));
    }

    let spec = deployment.spec.expect("deployment spec");
    assert_eq!(spec.replicas, Some(2));
    let pod = spec.template.spec.expect("pod spec");
    assert_eq!(pod.containers[0].image.as_deref(), Some(VALIDATOR_IMAGE));
    Ok(())
}

/// The SSP cannot reach Deployed while the validator is not ready.
#[tokio::test]
async fn waits_for_validator_readiness() -> anyhow::Result<()> {
    let ctx = TestContext::new();
    ctx.pass().await?;

    let outcome = ctx.pass().await?;
    assert_eq!(outcome.result.mutations, 0);
    assert_eq!(outcome.result.waiting_on.len(), 1);
    assert!(outcome.result.waiting_on[0].contains(VIRT_TEMPLATE_VALIDATOR));
    assert_eq!(outcome.phase, SspPhase::Deploying);

    ctx.fake_validator_ready(1).await?;
    let outcome = ctx.pass().await?;
    assert_eq!(outcome.phase, SspPhase::Deploying);

    ctx.fake_validator_ready(2).await?;
    let outcome = ctx.pass().await?;
    assert!(outcome.result.waiting_on.is_empty());
    assert_eq!(outcome.phase, SspPhase::Deployed);
    Ok(())
}

/// Hand edits to the managed deployment fields are reverted; unmanaged
/// fields are kept.
#[tokio::test]
async fn deployment_drift_is_reverted() -> anyhow::Result<()> {
    let ctx = TestContext::new();
    ctx.deploy().await?;

    let mut deployment: Deployment = ctx
        .cluster
        .fetch(Some(SSP_NAMESPACE), VIRT_TEMPLATE_VALIDATOR)
        .expect("deployment");
    if let Some(spec) = deployment.spec.as_mut() {
        spec.replicas = Some(5);
        spec.revision_history_limit = Some(3);
    }
    ssp_operator::cluster::update(&*ctx.cluster, &deployment).await?;

    let outcome = ctx.pass().await?;
    assert_eq!(outcome.result.mutations, 1);

    let deployment: Deployment = ctx
        .cluster
        .fetch(Some(SSP_NAMESPACE), VIRT_TEMPLATE_VALIDATOR)
        .expect("deployment");
    let spec = deployment.spec.expect("deployment spec");
    assert_eq!(spec.replicas, Some(2));
    assert_eq!(spec.revision_history_limit, Some(3));
    Ok(())
}
