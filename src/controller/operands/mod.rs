//! Operands and the contract the engine drives them through.
//!
//! An operand owns one category of cluster resources. The engine calls
//! [`Operand::reconcile`] on every pass and [`Operand::cleanup`] once the SSP
//! is being deleted. Both must be idempotent.

use std::future::Future;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, Span};

use crate::cluster::{self, ClusterClient, LabelQuery};
use crate::crd::ssp::Ssp;
use crate::error::{Error, Result};
use crate::fingerprint::{desired_digest, ObjectKey, VersionCache};
use crate::registry::Managed;

pub mod common_templates;
pub mod template_validator;

// ── Request ───────────────────────────────────────────────────────────────────

/// Everything an operand needs for one pass. Every cluster call made through
/// the typed methods aborts with [`Error::Cancelled`] once `cancel` fires.
pub struct Request<'a> {
    pub instance: &'a Ssp,
    pub client: &'a dyn ClusterClient,
    pub versions: &'a VersionCache,
    pub cancel: &'a CancellationToken,
    pub span: Span,
}

impl Request<'_> {
    pub async fn guard<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            res = fut => res,
        }
    }

    pub async fn get<K: Managed>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        self.guard(cluster::get(self.client, namespace, name)).await
    }

    pub async fn list<K: Managed>(
        &self,
        namespace: Option<&str>,
        query: &LabelQuery,
    ) -> Result<Vec<K>> {
        self.guard(cluster::list(self.client, namespace, query)).await
    }

    pub async fn create<K: Managed>(&self, obj: &K) -> Result<K> {
        self.guard(cluster::create(self.client, obj)).await
    }

    pub async fn update<K: Managed>(&self, obj: &K) -> Result<K> {
        self.guard(cluster::update(self.client, obj)).await
    }

    pub async fn delete<K: Managed>(&self, namespace: Option<&str>, name: &str) -> Result<bool> {
        self.guard(cluster::delete::<K>(self.client, namespace, name))
            .await
    }
}

// ── Results ───────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Updated,
    Unchanged,
}

impl Outcome {
    pub fn is_mutation(self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// What one operand (or a whole pass) did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    /// Number of writes applied to the cluster.
    pub mutations: usize,
    /// Resources that exist as desired but are not ready yet.
    pub waiting_on: Vec<String>,
}

impl ReconcileResult {
    /// Nothing was written and nothing is pending.
    pub fn converged(&self) -> bool {
        self.mutations == 0 && self.waiting_on.is_empty()
    }

    pub fn record(&mut self, outcome: Outcome) {
        if outcome.is_mutation() {
            self.mutations += 1;
        }
    }

    pub fn wait_for(&mut self, what: impl Into<String>) {
        self.waiting_on.push(what.into());
    }

    pub fn merge(&mut self, other: ReconcileResult) {
        self.mutations += other.mutations;
        self.waiting_on.extend(other.waiting_on);
    }
}

/// Progress of an operand's cleanup.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CleanupResult {
    pub deleted: usize,
    /// Resources whose deletion was requested but which still exist.
    pub pending: Vec<String>,
}

impl CleanupResult {
    pub fn done(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn merge(&mut self, other: CleanupResult) {
        self.deleted += other.deleted;
        self.pending.extend(other.pending);
    }
}

// ── Operand ───────────────────────────────────────────────────────────────────

#[async_trait]
pub trait Operand: Send + Sync {
    fn name(&self) -> &'static str;

    async fn reconcile(&self, req: &Request<'_>) -> Result<ReconcileResult>;

    async fn cleanup(&self, req: &Request<'_>) -> Result<CleanupResult>;
}

// ── Converge helpers ──────────────────────────────────────────────────────────

/// Run `op`, re-running it once if it failed on a conflict or on an object
/// that vanished mid-flight. `op` must re-read live state each time.
pub async fn retry_on_conflict<T, F, Fut>(what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match op().await {
        Err(e) if e.is_transient() => {
            debug!(%what, error = %e, "transient error, retrying once");
            op().await
        }
        other => other,
    }
}

fn name_of<K: Managed>(obj: &K) -> Result<(Option<String>, String)> {
    let meta = obj.meta();
    let name = meta
        .name
        .clone()
        .ok_or_else(|| Error::reconcile(format!("desired {} without a name", K::KIND)))?;
    Ok((meta.namespace.clone(), name))
}

/// Create `desired` unless an object with its identity exists. Existing
/// objects are never modified.
pub async fn create_if_absent<K: Managed>(req: &Request<'_>, desired: &K) -> Result<Outcome> {
    let (ns, name) = name_of(desired)?;
    let key = ObjectKey::of(desired);
    retry_on_conflict(&key.to_string(), || async {
        if req.get::<K>(ns.as_deref(), &name).await?.is_some() {
            return Ok(Outcome::Unchanged);
        }
        req.create(desired).await?;
        debug!(parent: &req.span, %key, "created");
        Ok(Outcome::Created)
    })
    .await
}

/// Converge the live object towards `desired`: create it when absent,
/// otherwise let `merge` copy the managed fields of `desired` onto the live
/// copy and write it back if `merge` reports a change.
pub async fn create_or_update<K, F>(req: &Request<'_>, desired: &K, merge: F) -> Result<Outcome>
where
    K: Managed,
    F: Fn(&K, &mut K) -> bool + Send + Sync,
{
    let (ns, name) = name_of(desired)?;
    let key = ObjectKey::of(desired);
    let digest = desired_digest(desired)?;
    retry_on_conflict(&key.to_string(), || async {
        let Some(live) = req.get::<K>(ns.as_deref(), &name).await? else {
            let created = req.create(desired).await?;
            req.versions.record(&created, digest.clone());
            debug!(parent: &req.span, %key, "created");
            return Ok(Outcome::Created);
        };
        if req.versions.is_current(&live, &digest) {
            return Ok(Outcome::Unchanged);
        }
        let mut next = live.clone();
        if !merge(desired, &mut next) {
            req.versions.record(&live, digest.clone());
            return Ok(Outcome::Unchanged);
        }
        let updated = req.update(&next).await?;
        req.versions.record(&updated, digest.clone());
        debug!(parent: &req.span, %key, "updated");
        Ok(Outcome::Updated)
    })
    .await
}

/// Apply `mutate` to an existing object identified by `live`. Objects that
/// are gone by the time they are re-read are left alone. `digest` names the
/// state `mutate` converges to, for the version cache.
pub async fn update_existing<K, F>(
    req: &Request<'_>,
    live: &K,
    digest: &str,
    mutate: F,
) -> Result<Outcome>
where
    K: Managed,
    F: Fn(&mut K) -> bool + Send + Sync,
{
    let (ns, name) = name_of(live)?;
    let key = ObjectKey::of(live);
    if req.versions.is_current(live, digest) {
        return Ok(Outcome::Unchanged);
    }
    let mut first = Some(live.clone());
    retry_on_conflict(&key.to_string(), || {
        // The first attempt uses the listed copy; a retry re-reads.
        let listed = first.take();
        let (ns, name) = (ns.clone(), name.clone());
        let key = &key;
        let mutate = &mutate;
        async move {
            let current = match listed {
                Some(obj) => obj,
                None => match req.get::<K>(ns.as_deref(), &name).await? {
                    Some(obj) => obj,
                    None => return Ok(Outcome::Unchanged),
                },
            };
            let mut next = current.clone();
            if !mutate(&mut next) {
                req.versions.record(&current, digest.to_string());
                return Ok(Outcome::Unchanged);
            }
            let updated = req.update(&next).await?;
            req.versions.record(&updated, digest.to_string());
            debug!(parent: &req.span, %key, "updated in place");
            Ok(Outcome::Updated)
        }
    })
    .await
}

/// Delete an object and report whether it is still present afterwards
/// (held by finalizers).
pub async fn delete_and_check<K: Managed>(
    req: &Request<'_>,
    namespace: Option<&str>,
    name: &str,
    result: &mut CleanupResult,
) -> Result<()> {
    let key = ObjectKey::new(K::KIND, if K::NAMESPACED { namespace } else { None }, name);
    if req.delete::<K>(namespace, name).await? {
        result.deleted += 1;
        req.versions.forget(&key);
        debug!(parent: &req.span, %key, "deleted");
    }
    if req.get::<K>(namespace, name).await?.is_some() {
        result.pending.push(key.to_string());
    }
    Ok(())
}
