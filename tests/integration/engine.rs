use ssp_operator::cluster::memory::Verb;
use ssp_operator::controller::engine::{has_finalizer, FINALIZER};
use ssp_operator::crd::ssp::SspPhase;
use ssp_operator::crd::template::Template;
use ssp_operator::error::Error;
use ssp_operator::registry::ResourceKind;

use super::common::*;

/// First pass adds the finalizer and applies everything; the SSP stays
/// Deploying until the validator reports ready.
#[tokio::test]
async fn first_pass_applies_and_stays_deploying() -> anyhow::Result<()> {
    let ctx = TestContext::new();

    let outcome = ctx.pass().await?;
    assert_eq!(outcome.previous_phase, None);
    assert_eq!(outcome.phase, SspPhase::Deploying);
    assert!(outcome.result.mutations > 0);
    assert!(!outcome.result.converged());

    let ssp = ctx.ssp();
    assert!(has_finalizer(&ssp), "expected {FINALIZER} on the SSP");
    assert_eq!(ssp.phase(), Some(SspPhase::Deploying));
    assert_eq!(ssp.observed_generation(), None);
    Ok(())
}

/// Deploying → Deployed once a pass changes nothing, and observedGeneration
/// catches up only then.
#[tokio::test]
async fn converged_pass_records_deployed() -> anyhow::Result<()> {
    let ctx = TestContext::new();
    ctx.pass().await?;
    ctx.fake_validator_ready(2).await?;

    let outcome = ctx.pass().await?;
    assert_eq!(outcome.result.mutations, 0);
    assert_eq!(outcome.previous_phase, Some(SspPhase::Deploying));
    assert_eq!(outcome.phase, SspPhase::Deployed);
    assert!(outcome.phase_changed());

    let ssp = ctx.ssp();
    assert_eq!(ssp.phase(), Some(SspPhase::Deployed));
    assert_eq!(ssp.observed_generation(), Some(ssp.generation()));
    Ok(())
}

/// Once Deployed, further passes write nothing at all.
#[tokio::test]
async fn steady_state_is_idempotent() -> anyhow::Result<()> {
    let ctx = TestContext::new();
    ctx.deploy().await?;
    ctx.cluster.clear_journal();

    for _ in 0..3 {
        let outcome = ctx.pass().await?;
        assert_eq!(outcome.phase, SspPhase::Deployed);
        assert!(!outcome.phase_changed());
    }
    let journal = ctx.cluster.journal();
    assert!(journal.is_empty(), "steady-state passes must not write: {journal:?}");
    Ok(())
}

/// Drift in a managed object sends the SSP back to Deploying for one pass.
#[tokio::test]
async fn drift_is_repaired_and_reported() -> anyhow::Result<()> {
    let ctx = TestContext::new();
    ctx.deploy().await?;

    let mut tpl: Template = ctx
        .cluster
        .fetch(Some(TEMPLATES_NAMESPACE), "windows10-desktop-medium")
        .expect("template deployed");
    tpl.message = Some("edited by hand".into());
    ssp_operator::cluster::update(&*ctx.cluster, &tpl).await?;

    let outcome = ctx.pass().await?;
    assert_eq!(outcome.result.mutations, 1);
    assert_eq!(outcome.phase, SspPhase::Deploying);

    let repaired: Template = ctx
        .cluster
        .fetch(Some(TEMPLATES_NAMESPACE), "windows10-desktop-medium")
        .expect("template deployed");
    assert_eq!(repaired.message, None);

    let outcome = ctx.pass().await?;
    assert_eq!(outcome.phase, SspPhase::Deployed);
    Ok(())
}

/// A single conflicting write is retried within the pass.
#[tokio::test]
async fn single_conflict_is_retried() -> anyhow::Result<()> {
    let ctx = TestContext::new();
    ctx.deploy().await?;

    let mut tpl: Template = ctx
        .cluster
        .fetch(Some(TEMPLATES_NAMESPACE), "windows10-desktop-medium")
        .expect("template deployed");
    tpl.message = Some("edited by hand".into());
    ssp_operator::cluster::update(&*ctx.cluster, &tpl).await?;

    ctx.cluster.inject_conflicts(ResourceKind::Template, 1);
    let outcome = ctx.pass().await?;
    assert_eq!(outcome.result.mutations, 1);
    Ok(())
}

/// Repeated conflicts fail the pass and leave the SSP Deploying with the
/// previous observedGeneration.
#[tokio::test]
async fn persistent_conflict_fails_the_pass() -> anyhow::Result<()> {
    let ctx = TestContext::new();
    ctx.deploy().await?;
    let observed = ctx.ssp().observed_generation();

    let mut tpl: Template = ctx
        .cluster
        .fetch(Some(TEMPLATES_NAMESPACE), "windows10-desktop-medium")
        .expect("template deployed");
    tpl.message = Some("edited by hand".into());
    ssp_operator::cluster::update(&*ctx.cluster, &tpl).await?;

    ctx.cluster.inject_conflicts(ResourceKind::Template, 2);
    let err = ctx.pass().await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)), "{err}");
    assert!(err.is_retryable());

    let ssp = ctx.ssp();
    assert_eq!(ssp.phase(), Some(SspPhase::Deploying));
    assert_eq!(ssp.observed_generation(), observed);
    Ok(())
}

/// A spec change bumps the generation; observedGeneration follows once the
/// new spec has converged.
#[tokio::test]
async fn observed_generation_tracks_spec_changes() -> anyhow::Result<()> {
    let ctx = TestContext::new();
    ctx.deploy().await?;

    let mut ssp = ctx.ssp();
    ssp.spec.template_validator = Some(ssp_operator::crd::ssp::TemplateValidator {
        replicas: Some(3),
    });
    let updated = ssp_operator::cluster::update(&*ctx.cluster, &ssp).await?;
    assert_eq!(updated.generation(), 2);

    ctx.pass().await?;
    let ssp = ctx.ssp();
    assert_eq!(ssp.phase(), Some(SspPhase::Deploying));
    assert_eq!(ssp.observed_generation(), Some(1));

    ctx.fake_validator_ready(3).await?;
    ctx.pass().await?;
    let ssp = ctx.ssp();
    assert_eq!(ssp.phase(), Some(SspPhase::Deployed));
    assert_eq!(ssp.observed_generation(), Some(2));
    Ok(())
}

/// Deletion: Deleting is recorded first, cleanup follows, observedGeneration
/// catches up, and the finalizer goes last.
#[tokio::test]
async fn deletion_runs_cleanup_before_releasing_finalizer() -> anyhow::Result<()> {
    let ctx = TestContext::new();
    ctx.deploy().await?;

    assert!(ctx.request_deletion().await?);
    let deleting = ctx.ssp();
    assert!(deleting.is_deleting());
    ctx.cluster.clear_journal();

    let outcome = ctx.pass().await?;
    assert_eq!(outcome.phase, SspPhase::Deleting);
    assert!(outcome.finalizer_removed);
    let cleanup = outcome.cleanup.expect("cleanup ran");
    assert!(cleanup.done());
    // Two templates, the view Role and RoleBinding, the edit ClusterRole.
    assert_eq!(cleanup.deleted, 5);

    let journal = ctx.cluster.journal();
    let ssp_writes: Vec<(usize, Verb)> = journal
        .iter()
        .enumerate()
        .filter(|(_, m)| m.key.kind == ResourceKind::Ssp)
        .map(|(i, m)| (i, m.verb))
        .collect();
    let deletes: Vec<usize> = journal
        .iter()
        .enumerate()
        .filter(|(_, m)| m.verb == Verb::Delete)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(
        ssp_writes.iter().map(|(_, v)| *v).collect::<Vec<_>>(),
        vec![Verb::PatchStatus, Verb::PatchStatus, Verb::Update]
    );
    assert_eq!(deletes.len(), 5);
    assert!(ssp_writes[0].0 < deletes[0], "Deleting must be recorded first");
    assert!(
        *deletes.last().unwrap() < ssp_writes[1].0,
        "observedGeneration catches up after cleanup"
    );

    assert!(ctx
        .cluster
        .fetch::<ssp_operator::crd::ssp::Ssp>(Some(SSP_NAMESPACE), SSP_NAME)
        .is_none());
    assert!(ctx.cluster.all::<Template>().is_empty());
    Ok(())
}

/// Cleanup that cannot finish keeps the finalizer in place.
#[tokio::test]
async fn pending_cleanup_keeps_finalizer() -> anyhow::Result<()> {
    let ctx = TestContext::new();
    ctx.deploy().await?;

    // A foreign finalizer holds one template.
    let mut tpl: Template = ctx
        .cluster
        .fetch(Some(TEMPLATES_NAMESPACE), "windows10-desktop-medium")
        .expect("template deployed");
    tpl.metadata.finalizers = Some(vec!["example.com/hold".into()]);
    ssp_operator::cluster::update(&*ctx.cluster, &tpl).await?;

    ctx.request_deletion().await?;
    let outcome = ctx.pass().await?;
    assert!(!outcome.finalizer_removed);
    let cleanup = outcome.cleanup.expect("cleanup ran");
    assert_eq!(cleanup.pending.len(), 1);

    let ssp = ctx.ssp();
    assert!(has_finalizer(&ssp));
    assert_eq!(ssp.phase(), Some(SspPhase::Deleting));
    Ok(())
}

/// A cancelled pass stops before writing anything.
#[tokio::test]
async fn cancelled_pass_writes_nothing() -> anyhow::Result<()> {
    let ctx = TestContext::new();
    ctx.cancel.cancel();

    let err = ctx.pass().await.unwrap_err();
    assert!(matches!(err, Error::Cancelled), "{err}");
    assert_eq!(ctx.cluster.mutation_count(), 0);
    Ok(())
}
