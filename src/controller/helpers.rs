//! Shared helpers for controller modules.
//!
//! Ownership comes in two flavours. Objects in the SSP's own namespace carry
//! a structural controller owner reference and are garbage collected with it.
//! Objects anywhere else carry the owner annotation pair instead, because the
//! garbage collector does not honour owner references across namespaces.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};

use crate::crd::ssp::Ssp;
use crate::helpers::namespaced_name;

/// Field manager name used for writes and status patches.
pub const FIELD_MANAGER: &str = "ssp-operator";

pub const OWNER_NAME_ANNOTATION: &str = "operator-sdk/primary-resource";
pub const OWNER_TYPE_ANNOTATION: &str = "operator-sdk/primary-resource-type";

/// Build a controller OwnerReference for any kube-rs `Resource`.
pub fn controller_owner_ref<K: Resource<DynamicType = ()>>(obj: &K) -> OwnerReference {
    OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: obj.name_any(),
        uid: obj.meta().uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// `Kind.group` of the SSP, the value of [`OWNER_TYPE_ANNOTATION`].
pub fn owner_type() -> String {
    format!("{}.{}", Ssp::kind(&()), Ssp::group(&()))
}

pub fn owner_annotations(ssp: &Ssp) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            OWNER_NAME_ANNOTATION.to_string(),
            namespaced_name(&ssp.namespace().unwrap_or_default(), &ssp.name_any()),
        ),
        (OWNER_TYPE_ANNOTATION.to_string(), owner_type()),
    ])
}

pub fn is_owned_by_annotation(meta: &ObjectMeta, ssp: &Ssp) -> bool {
    let Some(annotations) = meta.annotations.as_ref() else {
        return false;
    };
    owner_annotations(ssp)
        .iter()
        .all(|(k, v)| annotations.get(k) == Some(v))
}

/// Parse the owner annotation back into `(namespace, name)`.
pub fn annotated_owner(meta: &ObjectMeta) -> Option<(String, String)> {
    let annotations = meta.annotations.as_ref()?;
    if annotations.get(OWNER_TYPE_ANNOTATION)? != &owner_type() {
        return None;
    }
    let (ns, name) = annotations.get(OWNER_NAME_ANNOTATION)?.split_once('/')?;
    Some((ns.to_string(), name.to_string()))
}

/// Whether objects in `namespace` can be structurally owned by `ssp`.
pub fn can_own_structurally(ssp: &Ssp, namespace: Option<&str>) -> bool {
    namespace.is_some() && namespace == ssp.meta().namespace.as_deref()
}

/// Drop every owner reference and record `ssp` as owner by annotation.
/// Returns whether `meta` changed; a second call is always a no-op.
pub fn migrate_ownership(meta: &mut ObjectMeta, ssp: &Ssp) -> bool {
    let mut changed = false;
    if meta.owner_references.as_ref().is_some_and(|r| !r.is_empty()) {
        meta.owner_references = None;
        changed = true;
    }
    let annotations = meta.annotations.get_or_insert_with(BTreeMap::new);
    for (k, v) in owner_annotations(ssp) {
        if annotations.get(&k) != Some(&v) {
            annotations.insert(k, v);
            changed = true;
        }
    }
    changed
}

/// Set the ownership scheme the object's namespace calls for: a controller
/// owner reference next to the SSP, the annotation pair anywhere else.
pub fn apply_ownership(meta: &mut ObjectMeta, ssp: &Ssp) -> bool {
    if !can_own_structurally(ssp, meta.namespace.as_deref()) {
        return migrate_ownership(meta, ssp);
    }
    let wanted = controller_owner_ref(ssp);
    let refs = meta.owner_references.get_or_insert_with(Vec::new);
    if refs.iter().any(|r| r == &wanted) {
        return false;
    }
    refs.retain(|r| r.controller != Some(true));
    refs.push(wanted);
    true
}
