//! Identity, version and deprecation model for managed resources.
//!
//! The label and annotation keys here are a wire contract: anything selecting
//! templates by classification label relies on deprecated templates never
//! carrying those labels.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;

use crate::error::Result;
use crate::helpers::sha256_hex;
use crate::registry::{Managed, ResourceKind};

pub const TEMPLATE_VERSION_LABEL: &str = "template.kubevirt.io/version";
pub const TEMPLATE_TYPE_LABEL: &str = "template.kubevirt.io/type";
pub const TEMPLATE_TYPE_BASE: &str = "base";

pub const TEMPLATE_OS_LABEL_PREFIX: &str = "os.template.kubevirt.io/";
pub const TEMPLATE_FLAVOR_LABEL_PREFIX: &str = "flavor.template.kubevirt.io/";
pub const TEMPLATE_WORKLOAD_LABEL_PREFIX: &str = "workload.template.kubevirt.io/";

pub const TEMPLATE_DEPRECATED_ANNOTATION: &str = "template.kubevirt.io/deprecated";

/// Labels that drive workload discovery. Stripped from deprecated templates.
pub const CLASSIFICATION_LABEL_PREFIXES: [&str; 3] = [
    TEMPLATE_OS_LABEL_PREFIX,
    TEMPLATE_FLAVOR_LABEL_PREFIX,
    TEMPLATE_WORKLOAD_LABEL_PREFIX,
];

pub fn is_classification_label(key: &str) -> bool {
    CLASSIFICATION_LABEL_PREFIXES
        .iter()
        .any(|prefix| key.starts_with(prefix))
}

// ── Object identity ───────────────────────────────────────────────────────────

/// `(kind, namespace, name)`: the key every accessor operation uses.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub kind: ResourceKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: ResourceKind, namespace: Option<&str>, name: &str) -> Self {
        Self {
            kind,
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        }
    }

    pub fn of<K: Managed>(obj: &K) -> Self {
        let meta = obj.meta();
        Self::new(
            K::KIND,
            if K::NAMESPACED {
                meta.namespace.as_deref()
            } else {
                None
            },
            meta.name.as_deref().unwrap_or_default(),
        )
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

// ── Version cache ─────────────────────────────────────────────────────────────

/// What the operator last saw for an object it converged: the live
/// resourceVersion and a digest of the desired state it was converged to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fingerprint {
    pub resource_version: String,
    pub desired_digest: String,
}

/// SHA-256 of the serialized desired object.
pub fn desired_digest<T: Serialize>(desired: &T) -> Result<String> {
    let raw = serde_json::to_string(desired)?;
    Ok(sha256_hex(&raw))
}

/// Cache of fingerprints shared by every operand. A live object whose
/// resourceVersion and desired digest both match its entry has not changed
/// since it was last converged and needs no diff.
#[derive(Debug, Default)]
pub struct VersionCache {
    entries: Mutex<HashMap<ObjectKey, Fingerprint>>,
}

impl VersionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_current<K: Managed>(&self, live: &K, digest: &str) -> bool {
        let Some(rv) = live.meta().resource_version.as_deref() else {
            return false;
        };
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(&ObjectKey::of(live))
            .is_some_and(|fp| fp.resource_version == rv && fp.desired_digest == digest)
    }

    pub fn record<K: Managed>(&self, live: &K, digest: String) {
        let Some(rv) = live.meta().resource_version.clone() else {
            return;
        };
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            ObjectKey::of(live),
            Fingerprint {
                resource_version: rv,
                desired_digest: digest,
            },
        );
    }

    pub fn forget(&self, key: &ObjectKey) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
