// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! An in-memory API server for controller tests.
//!
//! Objects are stored as JSON keyed by kind, namespace and name. Writes
//! assign UIDs and resource versions the way the real API server does, and
//! merge patches carrying a stale `metadata.resourceVersion` fail with a
//! conflict.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, PodCondition, PodStatus};
use kube::api::ObjectMeta;
use kube::core::ErrorResponse;
use serde_json::Value;

use crate::k8s::{ClusterApi, Created, ExecOutcome, Kind};

type Key = (String, String, String);

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<Key, Value>,
    next_version: u64,
    execs: Vec<(String, Vec<String>)>,
    failing_execs: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryApi {
    state: Arc<Mutex<State>>,
}

fn key<K: Kind>(namespace: &str, name: &str) -> Key {
    (K::kind(&()).to_string(), namespace.to_owned(), name.to_owned())
}

fn api_error(code: u16, reason: &str, message: String) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".into(),
        message,
        reason: reason.into(),
        code,
    })
}

/// Applies an RFC 7386 merge patch.
fn merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (k, v) in patch {
                if v.is_null() {
                    target.remove(k);
                } else {
                    merge(target.entry(k.clone()).or_insert(Value::Null), v);
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

fn labels_match(object: &Value, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|s| !s.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => object["metadata"]["labels"][k].as_str() == Some(v),
            None => false,
        })
}

impl MemoryApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bump(state: &mut State, object: &mut Value) {
        state.next_version += 1;
        object["metadata"]["resourceVersion"] = Value::String(state.next_version.to_string());
    }

    /// Stores `object` as is, assigning a UID if it has none.
    pub fn insert<K: Kind>(&self, object: K) {
        let meta = object.meta();
        let namespace = meta.namespace.clone().unwrap_or_else(|| "default".into());
        let name = meta.name.clone().unwrap_or_default();
        let mut value = serde_json::to_value(&object).unwrap();
        value["metadata"]["namespace"] = Value::String(namespace.clone());
        let mut state = self.lock();
        if value["metadata"]["uid"].is_null() {
            value["metadata"]["uid"] = Value::String(format!("uid-{}", state.next_version + 1));
        }
        Self::bump(&mut state, &mut value);
        state.objects.insert(key::<K>(&namespace, &name), value);
    }

    /// Reads an object synchronously.
    pub fn object<K: Kind>(&self, namespace: &str, name: &str) -> Option<K> {
        self.lock()
            .objects
            .get(&key::<K>(namespace, name))
            .map(|v| serde_json::from_value(v.clone()).unwrap())
    }

    /// Edits a stored object in place, as another actor in the cluster would.
    pub fn modify<K: Kind>(&self, namespace: &str, name: &str, f: impl FnOnce(&mut K)) {
        let mut object: K = self.object(namespace, name).expect("object exists");
        f(&mut object);
        self.insert(object);
    }

    /// Creates a pod with the given readiness, as the StatefulSet controller
    /// and kubelet would.
    pub fn set_pod(&self, namespace: &str, name: &str, ready: bool) {
        self.insert(Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some(namespace.into()),
                ..Default::default()
            },
            status: Some(PodStatus {
                conditions: Some(vec![PodCondition {
                    type_: "Ready".into(),
                    status: if ready { "True" } else { "False" }.into(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    pub fn count<K: Kind>(&self, namespace: &str) -> usize {
        let kind = K::kind(&()).to_string();
        self.lock()
            .objects
            .keys()
            .filter(|(k, ns, _)| *k == kind && ns == namespace)
            .count()
    }

    pub fn execs(&self) -> Vec<(String, Vec<String>)> {
        self.lock().execs.clone()
    }

    pub fn fail_execs(&self, failing: bool) {
        self.lock().failing_execs = failing;
    }
}

#[async_trait]
impl ClusterApi for MemoryApi {
    async fn get<K: Kind>(&self, namespace: &str, name: &str) -> Result<Option<K>, kube::Error> {
        let value = self.lock().objects.get(&key::<K>(namespace, name)).cloned();
        value
            .map(serde_json::from_value)
            .transpose()
            .map_err(kube::Error::SerdeError)
    }

    async fn list<K: Kind>(&self, namespace: &str, labels: &str) -> Result<Vec<K>, kube::Error> {
        let kind = K::kind(&()).to_string();
        let values: Vec<Value> = self
            .lock()
            .objects
            .iter()
            .filter(|((k, ns, _), v)| *k == kind && ns == namespace && labels_match(v, labels))
            .map(|(_, v)| v.clone())
            .collect();
        values
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<_, _>>()
            .map_err(kube::Error::SerdeError)
    }

    async fn create<K: Kind>(&self, namespace: &str, object: &K) -> Result<Created, kube::Error> {
        let name = object.meta().name.clone().unwrap_or_default();
        if self.lock().objects.contains_key(&key::<K>(namespace, &name)) {
            return Ok(Created::AlreadyExists);
        }
        let mut object = object.clone();
        object.meta_mut().namespace = Some(namespace.to_owned());
        object.meta_mut().uid = None;
        self.insert(object);
        Ok(Created::New)
    }

    async fn patch<K: Kind>(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<K, kube::Error> {
        let mut state = self.lock();
        let k = key::<K>(namespace, name);
        let Some(mut current) = state.objects.get(&k).cloned() else {
            return Err(api_error(404, "NotFound", format!("{name} not found")));
        };
        if let Some(expected) = patch["metadata"]["resourceVersion"].as_str() {
            if current["metadata"]["resourceVersion"].as_str() != Some(expected) {
                return Err(api_error(409, "Conflict", format!("{name} has been modified")));
            }
        }
        let mut patch = patch.clone();
        if let Some(p) = patch.as_object_mut() {
            p.remove("status");
        }
        merge(&mut current, &patch);
        Self::bump(&mut state, &mut current);
        state.objects.insert(k, current.clone());
        serde_json::from_value(current).map_err(kube::Error::SerdeError)
    }

    async fn patch_status<K: Kind>(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<K, kube::Error> {
        let mut state = self.lock();
        let k = key::<K>(namespace, name);
        let Some(mut current) = state.objects.get(&k).cloned() else {
            return Err(api_error(404, "NotFound", format!("{name} not found")));
        };
        let status_patch = serde_json::json!({"status": patch["status"].clone()});
        merge(&mut current, &status_patch);
        Self::bump(&mut state, &mut current);
        state.objects.insert(k, current.clone());
        serde_json::from_value(current).map_err(kube::Error::SerdeError)
    }

    async fn delete<K: Kind>(&self, namespace: &str, name: &str) -> Result<bool, kube::Error> {
        Ok(self
            .lock()
            .objects
            .remove(&key::<K>(namespace, name))
            .is_some())
    }

    async fn delete_all<K: Kind>(&self, namespace: &str, labels: &str) -> Result<(), kube::Error> {
        let kind = K::kind(&()).to_string();
        self.lock()
            .objects
            .retain(|(k, ns, _), v| !(*k == kind && ns == namespace && labels_match(v, labels)));
        Ok(())
    }

    async fn exec(
        &self,
        _namespace: &str,
        pod: &str,
        _container: &str,
        command: Vec<String>,
    ) -> Result<ExecOutcome, kube::Error> {
        let mut state = self.lock();
        state.execs.push((pod.to_owned(), command));
        Ok(ExecOutcome {
            success: !state.failing_execs,
            message: state.failing_execs.then(|| "permission denied".to_owned()),
        })
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::ConfigMap;

    use super::*;

    fn config_map(name: &str, labels: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("ns".into()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn stale_patches_conflict() {
        let api = MemoryApi::new();
        api.insert(config_map("a", &[]));
        let current: ConfigMap = api.get("ns", "a").await.unwrap().unwrap();
        let rv = current.metadata.resource_version.clone().unwrap();
        let patch = serde_json::json!({"metadata": {"resourceVersion": rv}, "data": {"k": "v"}});
        api.patch::<ConfigMap>("ns", "a", &patch).await.unwrap();
        let err = api.patch::<ConfigMap>("ns", "a", &patch).await.unwrap_err();
        assert!(matches!(err, kube::Error::Api(e) if e.code == 409));
    }

    #[tokio::test]
    async fn label_selection() {
        let api = MemoryApi::new();
        api.insert(config_map("a", &[("app", "citus")]));
        api.insert(config_map("b", &[("app", "other")]));
        let found: Vec<ConfigMap> = api.list("ns", "app=citus").await.unwrap();
        assert_eq!(found.len(), 1);
        api.delete_all::<ConfigMap>("ns", "app=other").await.unwrap();
        assert_eq!(api.count::<ConfigMap>("ns"), 1);
        assert_eq!(
            api.create("ns", &config_map("a", &[])).await.unwrap(),
            Created::AlreadyExists
        );
    }
}
