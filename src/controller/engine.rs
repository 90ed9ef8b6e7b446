//! Reconciliation engine.
//!
//! One pass drives every operand, in registration order, against a single
//! SSP snapshot and records the outcome in the SSP status. Operand failures
//! abort the pass; whatever earlier operands applied stays applied and is
//! picked up again by the next pass.
//!
//! Deletion is finalizer driven: the phase flips to `Deleting` first, the
//! operands clean up in reverse order, `observedGeneration` catches up, and
//! only then is the finalizer released.

use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::operands::{retry_on_conflict, CleanupResult, Operand, ReconcileResult, Request};
use super::state_machine::{next_phase, PhaseInputs};
use crate::cluster::{self, ClusterClient};
use crate::crd::ssp::{Ssp, SspPhase, SspStatus};
use crate::error::{Error, Result};
use crate::fingerprint::VersionCache;

pub const FINALIZER: &str = "ssp.kubevirt.io/finalizer";

/// Result of one engine pass.
#[derive(Clone, Debug, PartialEq)]
pub struct PassOutcome {
    pub previous_phase: Option<SspPhase>,
    pub phase: SspPhase,
    /// Aggregated operand results. Empty while deleting.
    pub result: ReconcileResult,
    /// Aggregated cleanup results, only while deleting.
    pub cleanup: Option<CleanupResult>,
    /// The finalizer is gone and the SSP may disappear at any moment.
    pub finalizer_removed: bool,
}

impl PassOutcome {
    pub fn phase_changed(&self) -> bool {
        self.previous_phase.as_ref() != Some(&self.phase)
    }
}

pub struct Engine {
    operands: Vec<Box<dyn Operand>>,
}

impl Engine {
    pub fn new(operands: Vec<Box<dyn Operand>>) -> Self {
        Self { operands }
    }

    pub fn operand_names(&self) -> Vec<&'static str> {
        self.operands.iter().map(|o| o.name()).collect()
    }

    pub async fn reconcile(
        &self,
        ssp: &Ssp,
        client: &dyn ClusterClient,
        versions: &VersionCache,
        cancel: &CancellationToken,
    ) -> Result<PassOutcome> {
        let span = info_span!(
            "reconcile",
            namespace = %ssp.namespace().unwrap_or_default(),
            name = %ssp.name_any(),
            generation = ssp.generation(),
        );
        let req = Request {
            instance: ssp,
            client,
            versions,
            cancel,
            span: span.clone(),
        };
        let pass = async {
            if ssp.is_deleting() {
                self.finalize(&req).await
            } else {
                self.deploy(&req).await
            }
        };
        pass.instrument(span).await
    }

    async fn deploy(&self, req: &Request<'_>) -> Result<PassOutcome> {
        let previous_phase = req.instance.phase();
        let Some(ssp) = set_finalizer(req, true).await? else {
            return Err(Error::NotFound(format!(
                "SSP {} vanished during reconcile",
                req.instance.name_any()
            )));
        };
        let req = Request {
            instance: &ssp,
            client: req.client,
            versions: req.versions,
            cancel: req.cancel,
            span: req.span.clone(),
        };

        let mut total = ReconcileResult::default();
        for operand in &self.operands {
            let span = info_span!(parent: &req.span, "operand", operand = operand.name());
            match operand.reconcile(&req).instrument(span).await {
                Ok(result) => {
                    debug!(
                        operand = operand.name(),
                        mutations = result.mutations,
                        waiting = result.waiting_on.len(),
                        "operand reconciled"
                    );
                    total.merge(result);
                }
                Err(e) => {
                    warn!(operand = operand.name(), error = %e, "operand failed, aborting pass");
                    let stalled = SspStatus {
                        phase: Some(SspPhase::Deploying),
                        observed_generation: ssp.observed_generation(),
                    };
                    if let Err(status_err) = write_status(&req, stalled).await {
                        warn!(error = %status_err, "failed to record stalled phase");
                    }
                    return Err(e);
                }
            }
        }

        let inputs = PhaseInputs {
            deletion_requested: false,
            converged: total.converged(),
        };
        let phase = next_phase(previous_phase.as_ref(), &inputs);
        let observed_generation = if inputs.converged {
            Some(ssp.generation())
        } else {
            ssp.observed_generation()
        };
        write_status(
            &req,
            SspStatus {
                phase: Some(phase.clone()),
                observed_generation,
            },
        )
        .await?;

        if !total.waiting_on.is_empty() {
            debug!(waiting_on = ?total.waiting_on, "waiting for resources to become ready");
        }
        Ok(PassOutcome {
            previous_phase,
            phase,
            result: total,
            cleanup: None,
            finalizer_removed: false,
        })
    }

    async fn finalize(&self, req: &Request<'_>) -> Result<PassOutcome> {
        let ssp = req.instance;
        let previous_phase = ssp.phase();
        let inputs = PhaseInputs {
            deletion_requested: true,
            converged: false,
        };
        let phase = next_phase(previous_phase.as_ref(), &inputs);

        if !has_finalizer(ssp) {
            return Ok(PassOutcome {
                previous_phase,
                phase,
                result: ReconcileResult::default(),
                cleanup: None,
                finalizer_removed: true,
            });
        }

        write_status(
            req,
            SspStatus {
                phase: Some(phase.clone()),
                observed_generation: ssp.observed_generation(),
            },
        )
        .await?;

        let mut cleanup = CleanupResult::default();
        for operand in self.operands.iter().rev() {
            let span = info_span!(parent: &req.span, "operand", operand = operand.name());
            let result = operand.cleanup(req).instrument(span).await?;
            debug!(
                operand = operand.name(),
                deleted = result.deleted,
                pending = result.pending.len(),
                "operand cleaned up"
            );
            cleanup.merge(result);
        }

        let done = cleanup.done();
        if done {
            // Generation catch-up is its own observable write, strictly
            // before the finalizer goes away.
            write_status(
                req,
                SspStatus {
                    phase: Some(phase.clone()),
                    observed_generation: Some(ssp.generation()),
                },
            )
            .await?;
            set_finalizer(req, false).await?;
            info!("cleanup finished, finalizer removed");
        } else {
            debug!(pending = ?cleanup.pending, "cleanup still in progress");
        }

        Ok(PassOutcome {
            previous_phase,
            phase,
            result: ReconcileResult::default(),
            cleanup: Some(cleanup),
            finalizer_removed: done,
        })
    }
}

pub fn has_finalizer(ssp: &Ssp) -> bool {
    ssp.finalizers().iter().any(|f| f == FINALIZER)
}

/// Patch the status subresource if `status` differs from what the snapshot
/// already carries.
async fn write_status(req: &Request<'_>, status: SspStatus) -> Result<()> {
    let current = req.instance.status.clone().unwrap_or_default();
    if current == status {
        return Ok(());
    }
    if current.phase != status.phase {
        info!(
            from = ?current.phase,
            to = ?status.phase,
            "phase changed"
        );
    }
    let patch = serde_json::to_value(&status)?;
    req.guard(cluster::patch_status(req.client, req.instance, &patch))
        .await
}

/// Add (`present = true`) or remove our finalizer. Returns the SSP as
/// written, or `None` if it no longer exists.
async fn set_finalizer(req: &Request<'_>, present: bool) -> Result<Option<Ssp>> {
    let ssp = req.instance;
    if has_finalizer(ssp) == present {
        return Ok(Some(ssp.clone()));
    }
    let ns = ssp.namespace();
    let name = ssp.name_any();
    // Removal follows status writes that moved the resourceVersion, so it
    // starts from a fresh read.
    let mut snapshot = present.then(|| ssp.clone());
    retry_on_conflict("finalizer", || {
        let snapshot = snapshot.take();
        let (ns, name) = (ns.clone(), name.clone());
        async move {
            let mut current = match snapshot {
                Some(obj) => obj,
                None => match req.get::<Ssp>(ns.as_deref(), &name).await? {
                    Some(obj) => obj,
                    None => return Ok(None),
                },
            };
            if has_finalizer(&current) == present {
                return Ok(Some(current));
            }
            let finalizers = current.metadata.finalizers.get_or_insert_with(Vec::new);
            if present {
                finalizers.push(FINALIZER.to_string());
            } else {
                finalizers.retain(|f| f != FINALIZER);
            }
            req.update(&current).await.map(Some)
        }
    })
    .await
}
