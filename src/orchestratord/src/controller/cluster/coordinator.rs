// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Worker registration and shard rebalancing for distributed databases.
//!
//! Ordinal 0 is the coordinator of every distributed database. Workers are
//! registered through the coordinator, and a database is rebalanced once
//! after all of the workers added in a pass have been registered for it.

use k8s_openapi::api::apps::v1::StatefulSet;
use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, info, instrument, trace};

use citus_cloud_resources::crd::cluster::v1alpha1::CitusCluster;
use citus_cloud_resources::crd::database::v1alpha1::DatabaseRequest;
use citus_cloud_resources::crd::ManagedResource;
use citus_cloud_resources::naming::{pod_name, COORDINATOR_ORDINAL, POSTGRES_PORT};
use citus_postgres_util::sql::{trust_host_rule, CITUS_EXTENSION};
use citus_postgres_util::{NodeClient, NodeConfig, MAINTENANCE_DATABASE};

use crate::controller::cluster::resources::CONTAINER_NAME;
use crate::controller::cluster::AdminIdentity;
use crate::controller::Shared;
use crate::k8s::{self, ClusterApi};
use crate::{Error, NodeResultExt};

/// A tenant's databases with every name resolved to its physical form.
#[derive(Clone, PartialEq, Eq)]
pub struct Tenant {
    pub user: String,
    pub password: Option<String>,
    pub databases: Vec<TenantDatabase>,
}

impl std::fmt::Debug for Tenant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tenant")
            .field("user", &self.user)
            .field("databases", &self.databases)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantDatabase {
    pub name: String,
    pub distributed: bool,
    pub extensions: Vec<String>,
    pub init_scripts: Vec<String>,
}

impl TenantDatabase {
    /// The extensions to enable, `citus` first for distributed databases.
    fn extensions(&self) -> impl Iterator<Item = &str> {
        let citus = self.distributed.then_some(CITUS_EXTENSION);
        citus.into_iter().chain(
            self.extensions
                .iter()
                .map(String::as_str)
                .filter(move |e| !(self.distributed && *e == CITUS_EXTENSION)),
        )
    }
}

/// Resolves database requests into tenants, reading each tenant's password
/// from its own namespace.
pub async fn tenants<A: ClusterApi>(
    api: &A,
    requests: &[DatabaseRequest],
) -> Result<Vec<Tenant>, Error> {
    let mut tenants = Vec::with_capacity(requests.len());
    for request in requests {
        let password = match &request.spec.password_secret_ref {
            Some(r) => Some(k8s::read_secret_key(api, &request.tenant_namespace(), r).await?),
            None => None,
        };
        tenants.push(Tenant {
            user: request.physical_user(),
            password,
            databases: request
                .spec
                .databases
                .iter()
                .map(|db| TenantDatabase {
                    name: request.physical_database(db),
                    distributed: db.distributed,
                    extensions: db.extensions.clone(),
                    init_scripts: db.init_scripts.clone(),
                })
                .collect(),
        });
    }
    Ok(tenants)
}

fn distributed(tenants: &[Tenant]) -> impl Iterator<Item = (&Tenant, &TenantDatabase)> {
    tenants
        .iter()
        .flat_map(|t| t.databases.iter().map(move |db| (t, db)))
        .filter(|(_, db)| db.distributed)
}

pub struct Coordinator<A> {
    shared: Shared<A>,
}

impl<A: ClusterApi> Coordinator<A> {
    pub fn new(shared: Shared<A>) -> Self {
        Coordinator { shared }
    }

    async fn wait_ready(&self, cluster: &CitusCluster, ordinal: i32) -> Result<(), Error> {
        let pod = pod_name(&cluster.name_unchecked(), ordinal);
        k8s::wait_for_pod_ready(
            &*self.shared.api,
            &cluster.namespace_or_default(),
            &pod,
            self.shared.timings.pod_ready,
            &self.shared.cancel,
        )
        .await
    }

    async fn connect(
        &self,
        cluster: &CitusCluster,
        admin: &AdminIdentity,
        ordinal: i32,
    ) -> Result<Box<dyn NodeClient>, Error> {
        let config = NodeConfig::new(
            cluster.node_address(ordinal),
            POSTGRES_PORT,
            admin.user.clone(),
            admin.password.clone(),
        );
        self.shared.nodes.connect(&config).await.on_node(ordinal)
    }

    /// Lets the coordinator into a worker without a password, then makes
    /// the worker pick up the change.
    async fn trust_coordinator(
        &self,
        cluster: &CitusCluster,
        ordinal: i32,
        client: &mut dyn NodeClient,
    ) -> Result<(), Error> {
        let pod = pod_name(&cluster.name_unchecked(), ordinal);
        let rule = trust_host_rule(&cluster.coordinator_address());
        // First match wins in pg_hba.conf, so the rule goes on top.
        let script = format!(
            r#"rule='{rule}'; f="$PGDATA/pg_hba.conf"; grep -qxF "$rule" "$f" || sed -i "1i $rule" "$f""#
        );
        let outcome = self
            .shared
            .api
            .exec(
                &cluster.namespace_or_default(),
                &pod,
                CONTAINER_NAME,
                vec!["sh".into(), "-c".into(), script],
            )
            .await?;
        if !outcome.success {
            return Err(Error::Exec {
                pod,
                message: outcome.message.unwrap_or_default(),
            });
        }
        client.reload_config().await.on_node(ordinal)
    }

    /// Creates a tenant's role, database and extensions on one node and
    /// leaves the client connected to that database.
    async fn prepare_database(
        client: &mut dyn NodeClient,
        ordinal: i32,
        tenant: &Tenant,
        database: &TenantDatabase,
    ) -> Result<(), Error> {
        client.use_database(MAINTENANCE_DATABASE).await.on_node(ordinal)?;
        client
            .ensure_role(&tenant.user, tenant.password.as_deref(), false)
            .await
            .on_node(ordinal)?;
        client
            .ensure_database(&database.name, &tenant.user)
            .await
            .on_node(ordinal)?;
        client.use_database(&database.name).await.on_node(ordinal)?;
        for extension in database.extensions() {
            client.create_extension(extension).await.on_node(ordinal)?;
        }
        Ok(())
    }

    /// Creates every requested database on a freshly created cluster of
    /// `replicas` nodes and wires up the distributed ones.
    #[instrument(skip_all, fields(cluster = %cluster.name_unchecked()))]
    pub async fn initialize(
        &self,
        cluster: &CitusCluster,
        admin: &AdminIdentity,
        replicas: i32,
        tenants: &[Tenant],
    ) -> Result<(), Error> {
        let coordinator_host = cluster.coordinator_address();
        for ordinal in 0..replicas {
            self.wait_ready(cluster, ordinal).await?;
            let mut client = self.connect(cluster, admin, ordinal).await?;
            if ordinal != COORDINATOR_ORDINAL {
                self.trust_coordinator(cluster, ordinal, &mut *client).await?;
            }
            for tenant in tenants {
                for database in &tenant.databases {
                    if ordinal != COORDINATOR_ORDINAL && !database.distributed {
                        continue;
                    }
                    trace!(ordinal, database = %database.name, "preparing database");
                    Self::prepare_database(&mut *client, ordinal, tenant, database).await?;
                    if ordinal == COORDINATOR_ORDINAL && database.distributed {
                        client
                            .set_coordinator_host(&coordinator_host, POSTGRES_PORT)
                            .await
                            .on_node(ordinal)?;
                    }
                }
            }
        }

        let mut coordinator = self.connect(cluster, admin, COORDINATOR_ORDINAL).await?;
        for (_, database) in distributed(tenants) {
            coordinator
                .use_database(&database.name)
                .await
                .on_node(COORDINATOR_ORDINAL)?;
            for ordinal in (COORDINATOR_ORDINAL + 1)..replicas {
                coordinator
                    .add_worker(&cluster.node_address(ordinal), POSTGRES_PORT)
                    .await
                    .on_node(COORDINATOR_ORDINAL)?;
            }
        }
        for database in tenants.iter().flat_map(|t| &t.databases) {
            if database.init_scripts.is_empty() {
                continue;
            }
            coordinator
                .use_database(&database.name)
                .await
                .on_node(COORDINATOR_ORDINAL)?;
            for script in &database.init_scripts {
                coordinator.run_script(script).await.on_node(COORDINATOR_ORDINAL)?;
            }
        }
        info!(nodes = replicas, tenants = tenants.len(), "cluster initialized");
        Ok(())
    }

    /// Grows the workload to the definition's replica count, registers the
    /// new nodes as workers and rebalances each distributed database once.
    ///
    /// Shrinking is refused without touching the workload.
    #[instrument(skip_all, fields(cluster = %cluster.name_unchecked()))]
    pub async fn scale(
        &self,
        cluster: &CitusCluster,
        admin: &AdminIdentity,
        current: i32,
        tenants: &[Tenant],
    ) -> Result<(), Error> {
        let desired = cluster.spec.replicas;
        let effected = desired - current;
        if effected < 0 {
            return Err(Error::ScaleDownUnsupported { current, desired });
        }
        if effected == 0 {
            return Ok(());
        }
        debug!(current, desired, "scaling up");
        self.shared
            .api
            .patch::<StatefulSet>(
                &cluster.namespace_or_default(),
                &cluster.statefulset_name(),
                &json!({"spec": {"replicas": desired}}),
            )
            .await?;

        let mut coordinator = self.connect(cluster, admin, COORDINATOR_ORDINAL).await?;
        for ordinal in current..desired {
            self.wait_ready(cluster, ordinal).await?;
            let mut client = self.connect(cluster, admin, ordinal).await?;
            self.trust_coordinator(cluster, ordinal, &mut *client).await?;
            for (tenant, database) in distributed(tenants) {
                Self::prepare_database(&mut *client, ordinal, tenant, database).await?;
                coordinator
                    .use_database(&database.name)
                    .await
                    .on_node(COORDINATOR_ORDINAL)?;
                coordinator
                    .add_worker(&cluster.node_address(ordinal), POSTGRES_PORT)
                    .await
                    .on_node(COORDINATOR_ORDINAL)?;
                self.shared.metrics.workers_registered.inc();
            }
        }
        for (_, database) in distributed(tenants) {
            coordinator
                .use_database(&database.name)
                .await
                .on_node(COORDINATOR_ORDINAL)?;
            coordinator.rebalance().await.on_node(COORDINATOR_ORDINAL)?;
            self.shared.metrics.rebalances.inc();
        }
        info!(added = effected, "scaled up");
        Ok(())
    }
}
