//! SSP controller: kube-rs `Controller` wiring around the [`Engine`].
//!
//! Watches SSPs, the validator resources they own, and `base` templates
//! (mapped back to their SSP through the owner annotation). Each reconcile
//! call runs one engine pass under the configured timeout.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{ObjectReference, Service, ServiceAccount},
};
use kube::{
    api::{Api, ResourceExt},
    runtime::{
        controller::{Action, Controller},
        events::{Event as KubeEvent, EventType, Recorder, Reporter},
        reflector::ObjectRef,
        watcher::Config as WatcherConfig,
    },
    Client, Resource,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::engine::{Engine, PassOutcome};
use super::helpers::annotated_owner;
use crate::cluster::ClusterClient;
use crate::crd::ssp::Ssp;
use crate::crd::template::Template;
use crate::error::{Error, Result};
use crate::fingerprint::{VersionCache, TEMPLATE_TYPE_BASE, TEMPLATE_TYPE_LABEL};
use crate::helpers::OperatorConfig;

pub const REQUEUE_WAITING: Duration = Duration::from_secs(10);
pub const REQUEUE_RETRYABLE: Duration = Duration::from_secs(30);
pub const REQUEUE_FATAL: Duration = Duration::from_secs(300);

/// Build an ObjectReference from any kube Resource.
pub fn kube_object_ref<K: Resource<DynamicType = ()>>(obj: &K) -> ObjectReference {
    ObjectReference {
        api_version: Some(K::api_version(&()).to_string()),
        kind: Some(K::kind(&()).to_string()),
        name: Some(obj.name_any()),
        namespace: obj.namespace(),
        uid: obj.meta().uid.clone(),
        resource_version: obj.meta().resource_version.clone(),
        ..Default::default()
    }
}

/// Publish a Kubernetes event attached to the given resource.
/// Errors are logged but never block reconciliation.
pub async fn publish_event<K: Resource<DynamicType = ()>>(
    ctx: &Context,
    obj: &K,
    type_: EventType,
    reason: &str,
    note: Option<String>,
) {
    let rec = Recorder::new(ctx.client.clone(), ctx.reporter.clone());
    let oref = kube_object_ref(obj);
    if let Err(e) = rec
        .publish(
            &KubeEvent {
                type_,
                reason: reason.to_string(),
                note,
                action: "Reconcile".to_string(),
                secondary: None,
            },
            &oref,
        )
        .await
    {
        warn!(%e, "failed to publish event");
    }
}

// ── Shared context passed to every reconcile call ─────────────────────────────

pub struct Context {
    pub client: Client,
    pub cluster: Arc<dyn ClusterClient>,
    pub engine: Engine,
    pub versions: VersionCache,
    pub config: OperatorConfig,
    pub reporter: Reporter,
    /// Root token; cancelled on shutdown.
    pub cancel: CancellationToken,
}

// ── Controller entry point ────────────────────────────────────────────────────

/// Start the SSP controller. Returns a future that runs until shutdown.
pub async fn run(ctx: Arc<Context>) {
    let client = ctx.client.clone();
    let ssps: Api<Ssp> = Api::all(client.clone());
    let deployments: Api<Deployment> = Api::all(client.clone());
    let services: Api<Service> = Api::all(client.clone());
    let accounts: Api<ServiceAccount> = Api::all(client.clone());
    let templates: Api<Template> = Api::all(client.clone());
    let base_templates =
        WatcherConfig::default().labels(&format!("{TEMPLATE_TYPE_LABEL}={TEMPLATE_TYPE_BASE}"));

    info!(operands = ?ctx.engine.operand_names(), "starting SSP controller");
    Controller::new(ssps, WatcherConfig::default())
        .owns(deployments, WatcherConfig::default())
        .owns(services, WatcherConfig::default())
        .owns(accounts, WatcherConfig::default())
        .watches(templates, base_templates, map_template_to_ssp)
        .graceful_shutdown_on(ctx.cancel.clone().cancelled_owned())
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _action)) => debug!(ssp = %obj.name, "reconciled"),
                Err(e) => warn!("reconcile failed: {e:?}"),
            }
        })
        .await;
}

/// Templates owned by annotation map back to their SSP.
pub fn map_template_to_ssp(tpl: Template) -> Option<ObjectRef<Ssp>> {
    let (ns, name) = annotated_owner(&tpl.metadata)?;
    Some(ObjectRef::new(&name).within(&ns))
}

// ── Reconcile ─────────────────────────────────────────────────────────────────

async fn reconcile(ssp: Arc<Ssp>, ctx: Arc<Context>) -> Result<Action> {
    let cancel = ctx.cancel.child_token();
    let pass = ctx
        .engine
        .reconcile(&ssp, ctx.cluster.as_ref(), &ctx.versions, &cancel);

    let outcome = match tokio::time::timeout(ctx.config.reconcile_timeout, pass).await {
        Ok(res) => res,
        Err(_) => {
            cancel.cancel();
            warn!(name = %ssp.name_any(), timeout = ?ctx.config.reconcile_timeout, "reconcile timed out");
            Err(Error::Cancelled)
        }
    };

    match outcome {
        Ok(outcome) => {
            if outcome.phase_changed() {
                let prev = outcome
                    .previous_phase
                    .as_ref()
                    .map(|p| p.to_string())
                    .unwrap_or_default();
                publish_event(
                    &ctx,
                    ssp.as_ref(),
                    EventType::Normal,
                    "PhaseChanged",
                    Some(format!("Phase changed from {prev} to {}", outcome.phase)),
                )
                .await;
            }
            Ok(requeue_action(&outcome))
        }
        Err(e) => {
            publish_event(
                &ctx,
                ssp.as_ref(),
                EventType::Warning,
                "ReconcileFailed",
                Some(e.to_string()),
            )
            .await;
            Err(e)
        }
    }
}

fn error_policy(ssp: Arc<Ssp>, error: &Error, _ctx: Arc<Context>) -> Action {
    let name = ssp.name_any();
    let delay = error_requeue(error);
    warn!(%name, %error, retryable = error.is_retryable(), "reconcile error, requeuing in {delay:?}");
    Action::requeue(delay)
}

pub fn error_requeue(error: &Error) -> Duration {
    if error.is_retryable() {
        REQUEUE_RETRYABLE
    } else {
        REQUEUE_FATAL
    }
}

/// Converged passes wait for the next change; passes that wrote something
/// run again at once; passes waiting on readiness or cleanup poll.
pub fn requeue_action(outcome: &PassOutcome) -> Action {
    if outcome.finalizer_removed {
        return Action::await_change();
    }
    if outcome.cleanup.as_ref().is_some_and(|c| !c.done()) {
        return Action::requeue(REQUEUE_WAITING);
    }
    if outcome.result.mutations > 0 {
        return Action::requeue(Duration::ZERO);
    }
    if !outcome.result.waiting_on.is_empty() {
        return Action::requeue(REQUEUE_WAITING);
    }
    Action::await_change()
}
