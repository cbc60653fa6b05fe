// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Admin credential rotation.
//!
//! The admin identity lives in two places: the pod template of the
//! workload, and the roles inside every node. Rotation first rewrites the
//! pod template and then walks the nodes in ordinal order, logging in with
//! the old identity and installing the new one. Until every node has been
//! visited, the old identity and every identity the rotation has aimed for
//! are kept in a stash secret owned by the cluster, so that a rotation
//! interrupted after the pod template changed is still resumed on the next
//! pass, even if the desired identity has changed again in between.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use maplit::btreemap;
use serde_json::json;
use tracing::{debug, info, instrument, trace};

use citus_cloud_resources::crd::cluster::v1alpha1::CitusCluster;
use citus_cloud_resources::crd::ManagedResource;
use citus_cloud_resources::naming::{
    pod_name, ADMIN_SECRET_PASSWORD_KEY, ADMIN_SECRET_USERNAME_KEY, ENV_ADMIN_PASSWORD,
    ENV_ADMIN_USER, POSTGRES_PORT,
};
use citus_ore::wait;
use citus_postgres_util::node::connect_with_fallback;
use citus_postgres_util::NodeConfig;

use crate::controller::cluster::resources::{database_container, AdminEnv, EnvSource};
use crate::controller::cluster::AdminIdentity;
use crate::controller::Shared;
use crate::k8s::{self, ClusterApi, Created};
use crate::{Error, NodeResultExt};

/// The outcome of comparing the live workload against the desired identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationCheck {
    pub required: bool,
    /// The identity the workload currently carries.
    pub old: AdminIdentity,
}

async fn resolve<A: ClusterApi>(
    api: &A,
    namespace: &str,
    source: Option<EnvSource>,
) -> Result<String, Error> {
    match source {
        Some(EnvSource::Literal(value)) => Ok(value),
        Some(EnvSource::Secret(r)) => k8s::read_secret_key(api, namespace, &r).await,
        None => Ok(String::new()),
    }
}

/// Resolves the identity a set of admin environment sources stands for.
pub async fn resolve_env<A: ClusterApi>(
    api: &A,
    namespace: &str,
    env: &AdminEnv,
) -> Result<AdminIdentity, Error> {
    Ok(AdminIdentity {
        user: resolve(api, namespace, Some(env.user.clone())).await?,
        password: resolve(api, namespace, Some(env.password.clone())).await?,
    })
}

/// Compares `desired` against the identity embedded in the live workload,
/// reading secret references as needed.
pub async fn must_update_admin_user<A: ClusterApi>(
    api: &A,
    workload: &StatefulSet,
    desired: &AdminIdentity,
) -> Result<RotationCheck, Error> {
    let namespace = workload.namespace().unwrap_or_default();
    let env = database_container(workload)
        .and_then(|c| c.env.clone())
        .unwrap_or_default();
    let source = |name: &str| {
        env.iter()
            .find(|v| v.name == name)
            .and_then(EnvSource::from_env_var)
    };
    let old = AdminIdentity {
        user: resolve(api, &namespace, source(ENV_ADMIN_USER)).await?,
        password: resolve(api, &namespace, source(ENV_ADMIN_PASSWORD)).await?,
    };
    Ok(RotationCheck {
        required: &old != desired,
        old,
    })
}

fn stash_name(cluster: &CitusCluster) -> String {
    format!("{}-rotation", cluster.name_unchecked())
}

fn target_keys(n: usize) -> (String, String) {
    (
        format!("target-{n}-{ADMIN_SECRET_USERNAME_KEY}"),
        format!("target-{n}-{ADMIN_SECRET_PASSWORD_KEY}"),
    )
}

/// A rotation that has not yet reached every node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rotation {
    /// The identity every node carried before the rotation began.
    pub from: AdminIdentity,
    /// Each identity the rotation has moved nodes to, oldest first. The
    /// desired identity can change again before every node has been
    /// visited, so nodes may be left on any of these.
    pub targets: Vec<AdminIdentity>,
}

impl Rotation {
    pub fn start(from: AdminIdentity) -> Self {
        Rotation {
            from,
            targets: vec![],
        }
    }

    fn stash_data(&self) -> BTreeMap<String, String> {
        let mut data = btreemap! {
            ADMIN_SECRET_USERNAME_KEY.to_owned() => self.from.user.clone(),
            ADMIN_SECRET_PASSWORD_KEY.to_owned() => self.from.password.clone(),
        };
        for (n, target) in self.targets.iter().enumerate() {
            let (user, password) = target_keys(n);
            data.insert(user, target.user.clone());
            data.insert(password, target.password.clone());
        }
        data
    }

    fn from_stash(secret: &Secret) -> Result<Self, Error> {
        let name = secret.name_any();
        let value = |key: &str| {
            k8s::secret_value(secret, key).ok_or_else(|| Error::MissingSecretKey {
                name: name.clone(),
                key: key.to_owned(),
            })
        };
        let from = AdminIdentity {
            user: value(ADMIN_SECRET_USERNAME_KEY)?,
            password: value(ADMIN_SECRET_PASSWORD_KEY)?,
        };
        let mut targets = vec![];
        loop {
            let (user, password) = target_keys(targets.len());
            let Some(user) = k8s::secret_value(secret, &user) else {
                break;
            };
            targets.push(AdminIdentity {
                user,
                password: value(&password)?,
            });
        }
        Ok(Rotation { from, targets })
    }

    /// The identities a node may still accept, besides `new`, most recent
    /// target first.
    fn previous<'a>(&'a self, new: &'a AdminIdentity) -> Vec<&'a AdminIdentity> {
        let mut previous = vec![&self.from];
        for target in self.targets.iter().rev() {
            if target != new && !previous.contains(&target) {
                previous.push(target);
            }
        }
        previous
    }
}

pub struct Rotator<A> {
    shared: Shared<A>,
}

impl<A: ClusterApi> Rotator<A> {
    pub fn new(shared: Shared<A>) -> Self {
        Rotator { shared }
    }

    /// The rotation left unfinished by an earlier pass, if any.
    pub async fn in_progress(&self, cluster: &CitusCluster) -> Result<Option<Rotation>, Error> {
        let stash: Option<Secret> = self
            .shared
            .api
            .get(&cluster.namespace_or_default(), &stash_name(cluster))
            .await?;
        stash.as_ref().map(Rotation::from_stash).transpose()
    }

    /// Records `rotation` before any node is touched, so that a later pass
    /// still knows every identity a node may have been left on.
    async fn stash(&self, cluster: &CitusCluster, rotation: &Rotation) -> Result<(), Error> {
        let api = &*self.shared.api;
        let namespace = cluster.namespace_or_default();
        let data = rotation.stash_data();
        let stash = Secret {
            metadata: cluster.managed_resource_meta(stash_name(cluster)),
            string_data: Some(data.clone()),
            ..Default::default()
        };
        if api.create(&namespace, &stash).await? == Created::AlreadyExists {
            api.patch::<Secret>(&namespace, &stash_name(cluster), &json!({ "stringData": data }))
                .await?;
        }
        Ok(())
    }

    /// Moves every node to `new`.
    ///
    /// Nodes are visited in ordinal order. The first failure aborts the
    /// walk and names the node; every statement is idempotent, so the next
    /// attempt starts over from ordinal 0.
    #[instrument(skip_all, fields(cluster = %cluster.name_unchecked()))]
    pub async fn rotate(
        &self,
        cluster: &CitusCluster,
        rotation: &Rotation,
        new: &AdminIdentity,
    ) -> Result<(), Error> {
        let api = &*self.shared.api;
        let namespace = cluster.namespace_or_default();

        let mut rotation = rotation.clone();
        if !rotation.targets.contains(new) {
            rotation.targets.push(new.clone());
        }
        self.stash(cluster, &rotation).await?;

        let workload: StatefulSet = api
            .get(&namespace, &cluster.statefulset_name())
            .await?
            .ok_or_else(|| Error::NotFound {
                what: format!("statefulset {namespace}/{}", cluster.statefulset_name()),
            })?;
        self.patch_admin_env(&workload, &AdminEnv::desired(cluster))
            .await?;
        let replicas = workload
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(1);

        let previous = rotation.previous(new);
        for ordinal in 0..replicas {
            let pod = pod_name(&cluster.name_unchecked(), ordinal);
            let (timings, cancel) = (&self.shared.timings, &self.shared.cancel);
            k8s::wait_for_pod_ready(api, &namespace, &pod, timings.pod_ready, cancel).await?;
            wait::sleep(timings.settle, cancel)
                .await
                .map_err(|e| Error::from_wait(e, "node to settle"))?;
            trace!(ordinal, "rotating admin identity on node");
            let host = cluster.node_address(ordinal);
            let configs: Vec<_> = previous
                .iter()
                .chain([&new])
                .map(|id| NodeConfig::new(host.clone(), POSTGRES_PORT, id.user.clone(), id.password.clone()))
                .collect();
            let mut client = connect_with_fallback(&*self.shared.nodes, &configs[0], &configs[1..])
                .await
                .on_node(ordinal)?;
            let connected_as = client.config().user.clone();
            client
                .ensure_role(&new.user, Some(&new.password), true)
                .await
                .on_node(ordinal)?;
            let mut revoke = vec![&rotation.from.user, &connected_as];
            revoke.dedup();
            for user in revoke.into_iter().filter(|u| **u != new.user) {
                client.revoke_superuser(user).await.on_node(ordinal)?;
            }
        }

        api.delete::<Secret>(&namespace, &stash_name(cluster)).await?;
        self.shared.metrics.credential_rotations.inc();
        info!(nodes = replicas, "admin identity rotated");
        Ok(())
    }

    async fn patch_admin_env(&self, workload: &StatefulSet, env: &AdminEnv) -> Result<(), Error> {
        let namespace = workload.namespace().unwrap_or_default();
        let mut containers = workload
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .map(|p| p.containers.clone())
            .unwrap_or_default();
        for container in &mut containers {
            if container.name == super::resources::CONTAINER_NAME {
                env.apply_to(container.env.get_or_insert_with(Vec::new));
            }
        }
        debug!(workload = %workload.name_any(), "patching admin environment");
        // Merge patches replace arrays wholesale, hence the full container list.
        let patch = json!({"spec": {"template": {"spec": {"containers": containers}}}});
        self.shared
            .api
            .patch::<StatefulSet>(&namespace, &workload.name_any(), &patch)
            .await?;
        Ok(())
    }
}
