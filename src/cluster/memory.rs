//! In-memory [`ClusterClient`].
//!
//! Models the parts of API server behaviour the reconcile logic relies on:
//! resourceVersion-based optimistic concurrency, `metadata.generation`,
//! finalizers that hold deletion, status as a separate subresource, and
//! namespaced objects requiring their namespace to exist. Every mutation is
//! appended to a journal so tests can assert on what a pass actually wrote.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::{DynamicObject, TypeMeta};
use serde_json::Value;

use super::{from_dynamic, to_dynamic, ClusterClient, LabelQuery};
use crate::error::{Error, Result};
use crate::fingerprint::ObjectKey;
use crate::registry::{Managed, Registry, ResourceKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    Create,
    Update,
    Delete,
    PatchStatus,
}

/// One journal entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mutation {
    pub verb: Verb,
    pub key: ObjectKey,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectKey, DynamicObject>,
    next_version: u64,
    journal: Vec<Mutation>,
    injected_conflicts: HashMap<ResourceKind, usize>,
}

impl State {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn namespace_exists(&self, ns: &str) -> bool {
        self.objects
            .contains_key(&ObjectKey::new(ResourceKind::Namespace, None, ns))
    }
}

pub struct MemoryCluster {
    registry: Arc<Registry>,
    state: Mutex<State>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new(Arc::new(Registry::new()))
    }
}

impl MemoryCluster {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn key(&self, kind: ResourceKind, obj: &DynamicObject) -> Result<ObjectKey> {
        let reg = self.registry.lookup(kind)?;
        let name = obj
            .metadata
            .name
            .as_deref()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::reconcile(format!("{kind} without a name")))?;
        let namespace = if reg.namespaced {
            let ns = obj
                .metadata
                .namespace
                .as_deref()
                .filter(|n| !n.is_empty())
                .ok_or_else(|| Error::reconcile(format!("{kind} {name} without a namespace")))?;
            Some(ns)
        } else {
            None
        };
        Ok(ObjectKey::new(kind, namespace, name))
    }

    fn type_meta(&self, kind: ResourceKind) -> Result<TypeMeta> {
        let reg = self.registry.lookup(kind)?;
        Ok(TypeMeta {
            api_version: reg.resource.api_version.clone(),
            kind: reg.resource.kind.clone(),
        })
    }

    fn record(state: &mut State, verb: Verb, key: ObjectKey) {
        state.journal.push(Mutation { verb, key });
    }

    /// Insert an object as pre-existing cluster state. Not journaled and not
    /// subject to the namespace-existence check.
    pub fn seed<K: Managed>(&self, obj: &K) -> Result<K> {
        let mut dynamic = to_dynamic(obj)?;
        let key = self.key(K::KIND, &dynamic)?;
        dynamic.types = Some(self.type_meta(K::KIND)?);
        let mut state = self.lock();
        let rv = state.bump();
        let meta = &mut dynamic.metadata;
        meta.resource_version = Some(rv.clone());
        meta.uid.get_or_insert_with(|| format!("uid-{rv}"));
        meta.generation.get_or_insert(1);
        meta.creation_timestamp
            .get_or_insert_with(|| Time(chrono::Utc::now()));
        state.objects.insert(key, dynamic.clone());
        drop(state);
        from_dynamic(dynamic)
    }

    /// Typed read that bypasses the async trait, for assertions.
    pub fn fetch<K: Managed>(&self, namespace: Option<&str>, name: &str) -> Option<K> {
        let ns = if K::NAMESPACED { namespace } else { None };
        let key = ObjectKey::new(K::KIND, ns, name);
        let obj = self.lock().objects.get(&key).cloned()?;
        from_dynamic(obj).ok()
    }

    /// Typed listing of every object of `K`, for assertions.
    pub fn all<K: Managed>(&self) -> Vec<K> {
        self.lock()
            .objects
            .iter()
            .filter(|(k, _)| k.kind == K::KIND)
            .filter_map(|(_, o)| from_dynamic(o.clone()).ok())
            .collect()
    }

    pub fn journal(&self) -> Vec<Mutation> {
        self.lock().journal.clone()
    }

    pub fn mutation_count(&self) -> usize {
        self.lock().journal.len()
    }

    pub fn clear_journal(&self) {
        self.lock().journal.clear();
    }

    /// Make the next `count` updates of `kind` fail with a conflict, as if a
    /// concurrent writer had won the race.
    pub fn inject_conflicts(&self, kind: ResourceKind, count: usize) {
        self.lock().injected_conflicts.insert(kind, count);
    }
}

/// RFC 7386 JSON merge patch.
fn merge(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(target) = target {
        for (k, v) in patch {
            if v.is_null() {
                target.remove(k);
            } else {
                merge(target.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
    }
}

/// Everything but status: what `metadata.generation` tracks.
fn generation_relevant(data: &Value) -> Value {
    let mut data = data.clone();
    if let Value::Object(map) = &mut data {
        map.remove("status");
    }
    data
}

#[async_trait]
impl ClusterClient for MemoryCluster {
    async fn get(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        let reg = self.registry.lookup(kind)?;
        let ns = if reg.namespaced { namespace } else { None };
        Ok(self
            .lock()
            .objects
            .get(&ObjectKey::new(kind, ns, name))
            .cloned())
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        query: &LabelQuery,
    ) -> Result<Vec<DynamicObject>> {
        let reg = self.registry.lookup(kind)?;
        let ns = if reg.namespaced { namespace } else { None };
        Ok(self
            .lock()
            .objects
            .iter()
            .filter(|(k, _)| k.kind == kind)
            .filter(|(k, _)| ns.is_none() || k.namespace.as_deref() == ns)
            .filter(|(_, o)| query.matches(o.metadata.labels.as_ref()))
            .map(|(_, o)| o.clone())
            .collect())
    }

    async fn create(&self, kind: ResourceKind, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = self.key(kind, obj)?;
        let types = self.type_meta(kind)?;
        let mut state = self.lock();
        if state.objects.contains_key(&key) {
            return Err(Error::Conflict(format!("{key} already exists")));
        }
        if let Some(ns) = key.namespace.as_deref() {
            if !state.namespace_exists(ns) {
                return Err(Error::NotFound(format!("namespace {ns}")));
            }
        }
        let rv = state.bump();
        let mut stored = obj.clone();
        stored.types = Some(types);
        let meta = &mut stored.metadata;
        meta.resource_version = Some(rv.clone());
        meta.uid = Some(format!("uid-{rv}"));
        meta.generation = Some(1);
        meta.creation_timestamp = Some(Time(chrono::Utc::now()));
        meta.deletion_timestamp = None;
        state.objects.insert(key.clone(), stored.clone());
        Self::record(&mut state, Verb::Create, key);
        Ok(stored)
    }

    async fn update(&self, kind: ResourceKind, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = self.key(kind, obj)?;
        let mut state = self.lock();
        if let Some(remaining) = state.injected_conflicts.get_mut(&kind) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::Conflict(format!("{key}: injected conflict")));
            }
        }
        let Some(current) = state.objects.get(&key).cloned() else {
            return Err(Error::NotFound(key.to_string()));
        };
        if let Some(rv) = obj.metadata.resource_version.as_deref() {
            if current.metadata.resource_version.as_deref() != Some(rv) {
                return Err(Error::Conflict(format!(
                    "{key}: the object has been modified; please apply your changes to the latest version"
                )));
            }
        }

        let rv = state.bump();
        let mut stored = obj.clone();
        stored.types = current.types.clone();
        // Status is a subresource: a plain update never changes it.
        match current.data.get("status") {
            Some(status) => {
                if let Value::Object(map) = &mut stored.data {
                    map.insert("status".into(), status.clone());
                }
            }
            None => {
                if let Value::Object(map) = &mut stored.data {
                    map.remove("status");
                }
            }
        }
        let meta = &mut stored.metadata;
        meta.resource_version = Some(rv);
        meta.uid = current.metadata.uid.clone();
        meta.creation_timestamp = current.metadata.creation_timestamp.clone();
        meta.deletion_timestamp = current.metadata.deletion_timestamp.clone();
        let mut generation = current.metadata.generation.unwrap_or(1);
        if generation_relevant(&current.data) != generation_relevant(&stored.data) {
            generation += 1;
        }
        meta.generation = Some(generation);

        let finalized = stored.metadata.deletion_timestamp.is_some()
            && stored
                .metadata
                .finalizers
                .as_ref()
                .is_none_or(|f| f.is_empty());
        if finalized {
            state.objects.remove(&key);
        } else {
            state.objects.insert(key.clone(), stored.clone());
        }
        Self::record(&mut state, Verb::Update, key);
        Ok(stored)
    }

    async fn delete(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<bool> {
        let reg = self.registry.lookup(kind)?;
        let ns = if reg.namespaced { namespace } else { None };
        let key = ObjectKey::new(kind, ns, name);
        let mut state = self.lock();
        let Some(current) = state.objects.get(&key).cloned() else {
            return Ok(false);
        };
        let held = current
            .metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| !f.is_empty());
        if held {
            if current.metadata.deletion_timestamp.is_none() {
                let rv = state.bump();
                if let Some(obj) = state.objects.get_mut(&key) {
                    obj.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
                    obj.metadata.generation = Some(obj.metadata.generation.unwrap_or(1) + 1);
                    obj.metadata.resource_version = Some(rv);
                }
            }
        } else {
            state.objects.remove(&key);
        }
        Self::record(&mut state, Verb::Delete, key);
        Ok(true)
    }

    async fn patch_status(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
        status: &Value,
    ) -> Result<()> {
        let reg = self.registry.lookup(kind)?;
        let ns = if reg.namespaced { namespace } else { None };
        let key = ObjectKey::new(kind, ns, name);
        let mut state = self.lock();
        if !state.objects.contains_key(&key) {
            return Err(Error::NotFound(key.to_string()));
        }
        let rv = state.bump();
        if let Some(obj) = state.objects.get_mut(&key) {
            if !obj.data.is_object() {
                obj.data = Value::Object(serde_json::Map::new());
            }
            if let Value::Object(map) = &mut obj.data {
                merge(map.entry("status").or_insert(Value::Null), status);
            }
            obj.metadata.resource_version = Some(rv);
        }
        Self::record(&mut state, Verb::PatchStatus, key);
        Ok(())
    }
}
