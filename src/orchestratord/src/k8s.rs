// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Access to the Kubernetes API.
//!
//! Controllers go through [`ClusterApi`] rather than [`kube::Api`] directly
//! so that their state machines can be exercised against an in-memory API
//! server in tests.

use std::fmt::{self, Debug};

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Pod, Secret};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{AttachParams, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::reflector::{self, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use citus_cloud_resources::crd::SecretKeyRef;
use citus_ore::task;
use citus_ore::wait::Poll;

use crate::Error;

/// A namespaced Kubernetes object the operator reads or writes.
pub trait Kind:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + DeserializeOwned
    + Serialize
    + Debug
    + Send
    + Sync
    + 'static
{
}

impl<K> Kind for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static
{
}

/// The result of a create-if-absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Created {
    New,
    AlreadyExists,
}

/// The result of running a command in a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    pub success: bool,
    pub message: Option<String>,
}

/// The subset of the Kubernetes API the controllers use.
///
/// Patches are JSON merge patches. Including `metadata.resourceVersion` in a
/// patch makes it conditional: it fails with a conflict if the object
/// changed since that version was read.
#[async_trait]
pub trait ClusterApi: Debug + Send + Sync + 'static {
    async fn get<K: Kind>(&self, namespace: &str, name: &str) -> Result<Option<K>, kube::Error>;

    async fn list<K: Kind>(&self, namespace: &str, labels: &str) -> Result<Vec<K>, kube::Error>;

    /// Creates `object` unless an object with its name exists. Existing
    /// objects are never modified.
    async fn create<K: Kind>(&self, namespace: &str, object: &K) -> Result<Created, kube::Error>;

    async fn patch<K: Kind>(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K, kube::Error>;

    async fn patch_status<K: Kind>(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K, kube::Error>;

    /// Deletes an object, reporting whether it existed.
    async fn delete<K: Kind>(&self, namespace: &str, name: &str) -> Result<bool, kube::Error>;

    /// Deletes every object matching the label selector.
    async fn delete_all<K: Kind>(&self, namespace: &str, labels: &str) -> Result<(), kube::Error>;

    /// Runs `command` in a container of a pod and waits for it to exit.
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<ExecOutcome, kube::Error>;
}

/// [`ClusterApi`] backed by a real API server.
#[derive(Clone)]
pub struct KubeApi {
    client: Client,
}

impl KubeApi {
    pub fn new(client: Client) -> Self {
        KubeApi { client }
    }

    fn api<K: Kind>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

impl Debug for KubeApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeApi").finish_non_exhaustive()
    }
}

fn is_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == code)
}

#[async_trait]
impl ClusterApi for KubeApi {
    async fn get<K: Kind>(&self, namespace: &str, name: &str) -> Result<Option<K>, kube::Error> {
        self.api::<K>(namespace).get_opt(name).await
    }

    async fn list<K: Kind>(&self, namespace: &str, labels: &str) -> Result<Vec<K>, kube::Error> {
        let list = self
            .api::<K>(namespace)
            .list(&ListParams::default().labels(labels))
            .await?;
        Ok(list.items)
    }

    async fn create<K: Kind>(&self, namespace: &str, object: &K) -> Result<Created, kube::Error> {
        match self
            .api::<K>(namespace)
            .create(&PostParams::default(), object)
            .await
        {
            Ok(_) => Ok(Created::New),
            Err(e) if is_status(&e, 409) => Ok(Created::AlreadyExists),
            Err(e) => Err(e),
        }
    }

    async fn patch<K: Kind>(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K, kube::Error> {
        self.api::<K>(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
    }

    async fn patch_status<K: Kind>(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K, kube::Error> {
        self.api::<K>(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
    }

    async fn delete<K: Kind>(&self, namespace: &str, name: &str) -> Result<bool, kube::Error> {
        match self
            .api::<K>(namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_status(&e, 404) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn delete_all<K: Kind>(&self, namespace: &str, labels: &str) -> Result<(), kube::Error> {
        self.api::<K>(namespace)
            .delete_collection(
                &DeleteParams::background(),
                &ListParams::default().labels(labels),
            )
            .await?;
        Ok(())
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<ExecOutcome, kube::Error> {
        let params = AttachParams::default()
            .container(container)
            .stdout(false)
            .stderr(true);
        let mut attached = self
            .api::<Pod>(namespace)
            .exec(pod, command, &params)
            .await?;
        let mut stderr = String::new();
        if let Some(mut reader) = attached.stderr() {
            if let Err(e) = reader.read_to_string(&mut stderr).await {
                warn!(pod, "reading exec stderr failed: {e}");
            }
        }
        let status = match attached.take_status() {
            Some(status) => status.await,
            None => None,
        };
        let stderr = Some(stderr.trim().to_owned()).filter(|s| !s.is_empty());
        let outcome = match status {
            Some(status) => ExecOutcome {
                success: status.status.as_deref() == Some("Success"),
                message: stderr.or(status.message),
            },
            None => ExecOutcome {
                success: false,
                message: Some("no exit status received".into()),
            },
        };
        Ok(outcome)
    }
}

/// Reads one key of a secret as UTF-8.
pub async fn read_secret_key<A: ClusterApi>(
    api: &A,
    namespace: &str,
    key_ref: &SecretKeyRef,
) -> Result<String, Error> {
    let missing = || Error::MissingSecretKey {
        name: key_ref.name.clone(),
        key: key_ref.key.clone(),
    };
    let secret: Secret = api
        .get(namespace, &key_ref.name)
        .await?
        .ok_or_else(missing)?;
    secret_value(&secret, &key_ref.key).ok_or_else(missing)
}

/// Reads one key of a secret, whether it was written as `stringData` or is
/// stored as `data`.
pub fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    if let Some(value) = secret.string_data.as_ref().and_then(|d| d.get(key)) {
        return Some(value.clone());
    }
    let bytes = secret.data.as_ref().and_then(|d| d.get(key))?;
    String::from_utf8(bytes.0.clone()).ok()
}

/// Reports whether the pod's `Ready` condition is true.
pub fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_deref())
        .unwrap_or_default()
        .iter()
        .any(|c| c.type_ == "Ready" && c.status == "True")
}

/// Waits until the named pod exists and is ready.
pub async fn wait_for_pod_ready<A: ClusterApi>(
    api: &A,
    namespace: &str,
    name: &str,
    poll: Poll,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    poll.until(cancel, move || async move {
        let pod: Option<Pod> = api.get(namespace, name).await?;
        trace!(pod = name, ready = pod.as_ref().is_some_and(pod_is_ready), "polled pod");
        Ok::<_, Error>(pod.filter(pod_is_ready).map(|_| ()))
    })
    .await
    .map_err(|e| Error::from_wait(e, format!("pod {namespace}/{name} to become ready")))
}

/// Waits until the named object is gone, or has been replaced by an object
/// with a different UID.
pub async fn wait_for_deletion<A: ClusterApi, K: Kind>(
    api: &A,
    namespace: &str,
    name: &str,
    uid: Option<&str>,
    poll: Poll,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    poll.until(cancel, move || async move {
        let object: Option<K> = api.get(namespace, name).await?;
        let gone = match (&object, uid) {
            (None, _) => true,
            (Some(o), Some(uid)) => o.meta().uid.as_deref() != Some(uid),
            (Some(_), None) => false,
        };
        Ok::<_, Error>(gone.then_some(()))
    })
    .await
    .map_err(|e| {
        Error::from_wait(
            e,
            format!("{} {namespace}/{name} to be deleted", K::kind(&())),
        )
    })
}

/// Starts a cluster-wide reflector for `K` and returns its store once the
/// initial list has been received.
pub async fn make_reflector<K>(client: Client) -> Store<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let api: Api<K> = Api::all(client);
    let (store, writer) = reflector::store();
    task::spawn(
        || format!("{} reflector", K::kind(&())),
        async move {
            watcher(api, watcher::Config::default())
                .default_backoff()
                .reflect(writer)
                .touched_objects()
                .for_each(|res| async move {
                    if let Err(e) = res {
                        warn!("reflector watch error: {e}");
                    }
                })
                .await;
        },
    );
    if let Err(e) = store.wait_until_ready().await {
        warn!("reflector stopped before becoming ready: {e}");
    }
    store
}
