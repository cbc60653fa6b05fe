// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Turns a cluster definition into its workload, admin secret and headless
//! service. Objects are only ever created; an existing object is left as
//! the operator or a human last wrote it.

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, info, trace};

use citus_cloud_resources::crd::cluster::v1alpha1::CitusCluster;
use citus_cloud_resources::crd::ManagedResource;
use citus_cloud_resources::naming::{ADMIN_SECRET_NAME, ADMIN_SECRET_PASSWORD_KEY, POSTGRES_PORT};
use citus_cloud_resources::ClusterCredentials;

use crate::controller::cluster::resources::{self, AdminEnv, ClusterArgs};
use crate::controller::cluster::rotator::resolve_env;
use crate::controller::cluster::AdminIdentity;
use crate::k8s::{ClusterApi, Created};
use crate::Error;

/// The admin identity a definition resolves to: the definition's own
/// fields first, the namespace's default admin secret for the rest.
pub async fn admin_identity<A: ClusterApi>(
    api: &A,
    cluster: &CitusCluster,
) -> Result<AdminIdentity, Error> {
    resolve_env(api, &cluster.namespace_or_default(), &AdminEnv::desired(cluster)).await
}

/// How clients reach the cluster: its coordinator, as the admin user.
pub async fn credentials<A: ClusterApi>(
    api: &A,
    cluster: &CitusCluster,
) -> Result<ClusterCredentials, Error> {
    let admin = admin_identity(api, cluster).await?;
    Ok(ClusterCredentials {
        host: cluster.coordinator_address(),
        port: POSTGRES_PORT,
        admin_user: admin.user,
        admin_password: admin.password,
    })
}

pub struct Provisioner<'a, A> {
    api: &'a A,
    args: &'a ClusterArgs,
}

impl<'a, A: ClusterApi> Provisioner<'a, A> {
    pub fn new(api: &'a A, args: &'a ClusterArgs) -> Self {
        Provisioner { api, args }
    }

    /// Ensures the admin secret, workload and headless service exist, and
    /// returns the workload as stored.
    pub async fn provision(&self, cluster: &CitusCluster) -> Result<StatefulSet, Error> {
        let namespace = cluster.namespace_or_default();

        trace!("ensuring admin secret");
        if self.api.create(&namespace, &resources::admin_secret(cluster)).await? == Created::New {
            debug!(secret = ADMIN_SECRET_NAME, "created admin secret");
        }

        trace!("ensuring workload");
        let workload = resources::statefulset(cluster, self.args);
        if self.api.create(&namespace, &workload).await? == Created::New {
            info!(replicas = cluster.spec.replicas, "created workload");
        }

        trace!("ensuring headless service");
        self.api
            .create::<Service>(&namespace, &resources::headless_service(cluster))
            .await?;

        self.api
            .get(&namespace, &cluster.statefulset_name())
            .await?
            .ok_or_else(|| Error::NotFound {
                what: format!("statefulset {namespace}/{}", cluster.statefulset_name()),
            })
    }

    /// Records the resolved admin identity in the definition, which is
    /// authoritative from then on.
    ///
    /// The write is conditional on the definition being unchanged since it
    /// was read, so concurrent edits by a user are never overwritten.
    pub async fn backfill(
        &self,
        cluster: &CitusCluster,
        admin: &AdminIdentity,
    ) -> Result<(), Error> {
        let mut spec = serde_json::Map::new();
        if cluster.admin_user().is_none() {
            spec.insert("adminUser".into(), json!(admin.user));
        }
        if cluster.spec.password.is_none() {
            spec.insert(
                "password".into(),
                json!({"secretRef": {"name": ADMIN_SECRET_NAME, "key": ADMIN_SECRET_PASSWORD_KEY}}),
            );
        }
        if spec.is_empty() {
            return Ok(());
        }
        let patch = json!({
            "metadata": {"resourceVersion": cluster.resource_version()},
            "spec": spec,
        });
        debug!("back-filling admin identity");
        self.api
            .patch::<CitusCluster>(&cluster.namespace_or_default(), &cluster.name_any(), &patch)
            .await?;
        Ok(())
    }

    /// Deletes the workload. Volumes and the admin secret are kept.
    pub async fn teardown(&self, cluster: &CitusCluster) -> Result<(), Error> {
        let deleted = self
            .api
            .delete::<StatefulSet>(&cluster.namespace_or_default(), &cluster.statefulset_name())
            .await?;
        if deleted {
            info!("deleted workload");
        }
        Ok(())
    }
}
