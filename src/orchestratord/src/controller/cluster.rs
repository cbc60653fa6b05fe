// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The `CitusCluster` controller.
//!
//! Every pass re-reads the workload and picks one [`Plan`]: provision a
//! missing workload, replay recorded database requests against a freshly
//! created one, or maintain an established one by rotating credentials and
//! then scaling.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::runtime::controller::Action;
use kube::runtime::reflector::Store;
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use citus_cloud_resources::crd::cluster::v1alpha1::{
    CitusCluster, CitusClusterStatus, ClusterState,
};
use citus_cloud_resources::crd::database::v1alpha1::DatabaseRequest;
use citus_cloud_resources::crd::{condition, display_name, has_condition, ManagedResource};

use crate::controller::{requeue_conflicts, Shared};
use crate::k8s::ClusterApi;
use crate::Error;

pub mod coordinator;
pub mod provisioner;
pub mod resources;
pub mod rotator;

pub use provisioner::credentials as cluster_credentials;

use coordinator::{tenants, Coordinator};
use provisioner::{admin_identity, Provisioner};
use resources::ClusterArgs;
use rotator::{must_update_admin_user, Rotation, Rotator};

/// The controller's name in metrics.
const CONTROLLER: &str = "cluster";

/// A resolved admin user and password.
#[derive(Clone, PartialEq, Eq)]
pub struct AdminIdentity {
    pub user: String,
    pub password: String,
}

impl std::fmt::Debug for AdminIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminIdentity")
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

/// Read access to the recorded database requests.
pub trait DatabaseRequests: Send + Sync + 'static {
    /// The requests targeting the named cluster, in a stable order.
    fn for_cluster(&self, namespace: &str, name: &str) -> Vec<DatabaseRequest>;
}

fn sorted_targets<'a>(
    requests: impl Iterator<Item = &'a DatabaseRequest>,
    namespace: &str,
    name: &str,
) -> Vec<DatabaseRequest> {
    let mut targets: Vec<_> = requests
        .filter(|r| r.targets(namespace, name))
        .cloned()
        .collect();
    targets.sort_by_key(|r| (r.namespace(), r.name_any()));
    targets
}

impl DatabaseRequests for Store<DatabaseRequest> {
    fn for_cluster(&self, namespace: &str, name: &str) -> Vec<DatabaseRequest> {
        let state = self.state();
        sorted_targets(state.iter().map(|r| &**r), namespace, name)
    }
}

impl DatabaseRequests for Vec<DatabaseRequest> {
    fn for_cluster(&self, namespace: &str, name: &str) -> Vec<DatabaseRequest> {
        sorted_targets(self.iter(), namespace, name)
    }
}

/// Notified once per genuine creation of a cluster's workload, after the
/// nodes have been created and before the cluster is established.
#[async_trait]
pub trait ClusterCreated: Send + Sync + 'static {
    async fn cluster_created(
        &self,
        cluster: &CitusCluster,
        admin: &AdminIdentity,
        replicas: i32,
    ) -> Result<(), Error>;
}

/// Replays every recorded database request against a new cluster.
pub struct DatabaseReplay<A> {
    shared: Shared<A>,
    requests: Arc<dyn DatabaseRequests>,
}

#[async_trait]
impl<A: ClusterApi> ClusterCreated for DatabaseReplay<A> {
    async fn cluster_created(
        &self,
        cluster: &CitusCluster,
        admin: &AdminIdentity,
        replicas: i32,
    ) -> Result<(), Error> {
        let requests = self
            .requests
            .for_cluster(&cluster.namespace_or_default(), &cluster.name_any());
        debug!(requests = requests.len(), "replaying database requests");
        let tenants = tenants(&*self.shared.api, &requests).await?;
        Coordinator::new(self.shared.clone())
            .initialize(cluster, admin, replicas, &tenants)
            .await
    }
}

/// What a reconcile pass does, decided from live state.
enum Plan {
    /// There is no workload.
    Provision,
    /// The workload exists but the cluster was never established on it.
    Replay { workload: StatefulSet },
    Maintain { workload: StatefulSet },
}

impl Plan {
    fn name(&self) -> &'static str {
        match self {
            Plan::Provision => "provision",
            Plan::Replay { .. } => "replay",
            Plan::Maintain { .. } => "maintain",
        }
    }
}

fn replica_count(workload: &StatefulSet) -> i32 {
    workload
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1)
}

/// Writes status changes as a pass progresses, skipping writes that would
/// change nothing.
struct StatusWriter<'a, A> {
    api: &'a A,
    cluster: &'a CitusCluster,
    current: CitusClusterStatus,
}

impl<'a, A: ClusterApi> StatusWriter<'a, A> {
    fn new(api: &'a A, cluster: &'a CitusCluster) -> Self {
        StatusWriter {
            api,
            cluster,
            current: cluster.status(),
        }
    }

    async fn update(&mut self, f: impl FnOnce(&mut CitusClusterStatus)) -> Result<(), Error> {
        let mut next = self.current.clone();
        f(&mut next);
        next.observed_generation = self.cluster.meta().generation;
        if next == self.current {
            return Ok(());
        }
        self.api
            .patch_status::<CitusCluster>(
                &self.cluster.namespace_or_default(),
                &self.cluster.name_any(),
                &json!({ "status": next }),
            )
            .await?;
        self.current = next;
        Ok(())
    }

    async fn set_state(&mut self, state: ClusterState) -> Result<(), Error> {
        self.update(|s| s.state = Some(state)).await
    }

    async fn set_ready(&mut self, ready: bool, reason: &str, message: String) -> Result<(), Error> {
        let generation = self.cluster.meta().generation;
        self.update(|s| {
            let ready = condition("Ready", ready, reason, message, generation);
            if !has_condition(&s.conditions, &ready) {
                s.conditions.retain(|c| c.type_ != "Ready");
                s.conditions.push(ready);
            }
        })
        .await
    }
}

pub struct ClusterContext<A> {
    shared: Shared<A>,
    args: ClusterArgs,
    requests: Arc<dyn DatabaseRequests>,
    on_created: Arc<dyn ClusterCreated>,
}

impl<A: ClusterApi> ClusterContext<A> {
    pub fn new(shared: Shared<A>, args: ClusterArgs, requests: Arc<dyn DatabaseRequests>) -> Self {
        let on_created = Arc::new(DatabaseReplay {
            shared: shared.clone(),
            requests: Arc::clone(&requests),
        });
        ClusterContext {
            shared,
            args,
            requests,
            on_created,
        }
    }

    async fn plan(&self, cluster: &CitusCluster) -> Result<Plan, Error> {
        let workload: Option<StatefulSet> = self
            .shared
            .api
            .get(&cluster.namespace_or_default(), &cluster.statefulset_name())
            .await?;
        let Some(workload) = workload else {
            return Ok(Plan::Provision);
        };
        let replayed = workload.metadata.uid.is_some()
            && cluster.status().replayed_workload_uid == workload.metadata.uid;
        Ok(match cluster.state() {
            None | Some(ClusterState::Provisioning) if !replayed => Plan::Replay { workload },
            _ => Plan::Maintain { workload },
        })
    }

    /// Establishes a cluster on a freshly created workload. A failed replay
    /// leaves the cluster `provisioning`, so the next pass replays again.
    async fn establish(
        &self,
        cluster: &CitusCluster,
        status: &mut StatusWriter<'_, A>,
        workload: &StatefulSet,
    ) -> Result<(), Error> {
        let api = &*self.shared.api;
        let admin = admin_identity(api, cluster).await?;
        let replicas = replica_count(workload);
        self.on_created
            .cluster_created(cluster, &admin, replicas)
            .await?;
        let workload_uid = workload.metadata.uid.clone();
        status
            .update(|s| {
                s.state = Some(ClusterState::Established);
                s.replicas = Some(replicas);
                s.admin_user = Some(admin.user.clone());
                s.replayed_workload_uid = workload_uid;
            })
            .await?;
        status
            .set_ready(true, "Established", format!("{replicas} nodes running"))
            .await?;
        info!(replicas, "cluster established");
        Ok(())
    }

    async fn maintain(
        &self,
        cluster: &CitusCluster,
        status: &mut StatusWriter<'_, A>,
        workload: StatefulSet,
    ) -> Result<(), Error> {
        let api = &*self.shared.api;
        let admin = admin_identity(api, cluster).await?;

        let rotator = Rotator::new(self.shared.clone());
        let rotation = match rotator.in_progress(cluster).await? {
            Some(rotation) => Some(rotation),
            None => {
                let check = must_update_admin_user(api, &workload, &admin).await?;
                check.required.then(|| Rotation::start(check.old))
            }
        };
        if let Some(rotation) = rotation {
            debug!(from = %rotation.from.user, to = %admin.user, "admin identity drifted");
            status.set_state(ClusterState::Rotating).await?;
            rotator.rotate(cluster, &rotation, &admin).await?;
        }

        // Workers are only known to be registered up to the last converged
        // count. The workload may already be larger if an earlier scale-up
        // failed partway, in which case registration is repeated.
        let live = replica_count(&workload);
        let converged = cluster
            .status()
            .replicas
            .filter(|r| *r <= live)
            .unwrap_or(live);
        let desired = cluster.spec.replicas;
        let current = if desired < live { live } else { converged };
        if current != desired {
            let tenants = if current < desired {
                status.set_state(ClusterState::Scaling).await?;
                let requests = self
                    .requests
                    .for_cluster(&cluster.namespace_or_default(), &cluster.name_any());
                tenants(api, &requests).await?
            } else {
                vec![]
            };
            let coordinator = Coordinator::new(self.shared.clone());
            match coordinator.scale(cluster, &admin, current, &tenants).await {
                Err(e @ Error::ScaleDownUnsupported { .. }) => {
                    warn!("{e}");
                    status
                        .update(|s| s.state = Some(ClusterState::Established))
                        .await?;
                    return status
                        .set_ready(false, "ScaleDownUnsupported", e.to_string())
                        .await;
                }
                res => res?,
            }
        }

        status
            .update(|s| {
                s.state = Some(ClusterState::Established);
                s.replicas = Some(desired);
                s.admin_user = Some(admin.user.clone());
            })
            .await?;
        status
            .set_ready(true, "Established", format!("{desired} nodes running"))
            .await
    }
}

impl<A: ClusterApi> ClusterContext<A> {
    /// Runs one reconcile pass against the cluster's live state.
    pub async fn reconcile(&self, cluster: &CitusCluster) -> Result<Option<Action>, Error> {
        let api = &*self.shared.api;
        let mut status = StatusWriter::new(api, cluster);
        if let Err(e) = cluster.validate() {
            warn!("invalid cluster definition: {e}");
            status.set_ready(false, "InvalidSpec", e.to_string()).await?;
            return Ok(None);
        }

        let plan = self.plan(cluster).await?;
        debug!(plan = plan.name(), "planned pass");
        match plan {
            Plan::Provision => {
                let provisioner = Provisioner::new(api, &self.args);
                let workload = provisioner.provision(cluster).await?;
                // The back-fill is conditional on the version this pass
                // read, so it has to precede every other write.
                let admin = admin_identity(api, cluster).await?;
                provisioner.backfill(cluster, &admin).await?;
                status.set_state(ClusterState::Provisioning).await?;
                self.establish(cluster, &mut status, &workload).await?;
            }
            Plan::Replay { workload } => {
                let admin = admin_identity(api, cluster).await?;
                Provisioner::new(api, &self.args)
                    .backfill(cluster, &admin)
                    .await?;
                self.establish(cluster, &mut status, &workload).await?;
            }
            Plan::Maintain { workload } => self.maintain(cluster, &mut status, workload).await?,
        }
        Ok(None)
    }

    pub async fn teardown(&self, cluster: &CitusCluster) -> Result<Option<Action>, Error> {
        Provisioner::new(&*self.shared.api, &self.args)
            .teardown(cluster)
            .await?;
        Ok(None)
    }
}

#[async_trait]
impl<A: ClusterApi> k8s_controller::Context for ClusterContext<A> {
    type Resource = CitusCluster;
    type Error = Error;

    const FINALIZER_NAME: &'static str = "orchestratord.citus.cloud/cluster";

    #[instrument(skip_all, fields(cluster = %display_name(cluster)))]
    async fn apply(
        &self,
        _client: Client,
        cluster: &Self::Resource,
    ) -> Result<Option<Action>, Self::Error> {
        let result = self
            .shared
            .metrics
            .observe_reconcile(CONTROLLER, self.reconcile(cluster))
            .await;
        requeue_conflicts(result)
    }

    #[instrument(skip_all, fields(cluster = %display_name(cluster)))]
    async fn cleanup(
        &self,
        _client: Client,
        cluster: &Self::Resource,
    ) -> Result<Option<Action>, Self::Error> {
        self.shared
            .metrics
            .observe_reconcile(CONTROLLER, self.teardown(cluster))
            .await
    }
}

#[cfg(test)]
mod tests {
    use citus_cloud_resources::naming::pod_name;
    use citus_postgres_util::memory::{MemoryCluster, NodeEvent};
    use prometheus::Registry;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::controller::Timings;
    use crate::metrics::Metrics;
    use crate::testing::MemoryApi;

    struct Harness {
        api: MemoryApi,
        nodes: MemoryCluster,
        context: ClusterContext<MemoryApi>,
    }

    fn database_request() -> DatabaseRequest {
        let mut request = DatabaseRequest::new(
            "orders",
            serde_json::from_value(json!({
                "cluster": {"name": "citus", "namespace": "db"},
                "user": "app",
                "databases": [
                    {"name": "orders", "distributed": true},
                    {"name": "audit"},
                ],
            }))
            .unwrap(),
        );
        request.metadata.namespace = Some("team-a".into());
        request
    }

    fn harness(replicas: i32, password: &str) -> Harness {
        let api = MemoryApi::new();
        let nodes = MemoryCluster::new();
        let mut cluster = CitusCluster::new(
            "citus",
            serde_json::from_value(json!({
                "replicas": replicas,
                "password": {"value": password},
            }))
            .unwrap(),
        );
        cluster.metadata.namespace = Some("db".into());
        cluster.metadata.generation = Some(1);
        api.insert(cluster);
        for ordinal in 0..4 {
            api.set_pod("db", &pod_name("citus", ordinal), true);
            nodes.add_node(
                &format!("citus-{ordinal}.citus-headless.db"),
                "postgres",
                password,
            );
        }
        let shared = Shared::new(
            api.clone(),
            Arc::new(nodes.clone()),
            Timings::fast(),
            Metrics::register_into(&Registry::new()).unwrap(),
            CancellationToken::new(),
        );
        let context = ClusterContext::new(
            shared,
            ClusterArgs::default(),
            Arc::new(vec![database_request()]),
        );
        Harness {
            api,
            nodes,
            context,
        }
    }

    impl Harness {
        fn cluster(&self) -> CitusCluster {
            self.api.object("db", "citus").unwrap()
        }

        fn workload(&self) -> StatefulSet {
            self.api.object("db", "citus").unwrap()
        }

        async fn reconcile(&self) -> Result<Option<Action>, Error> {
            self.context.reconcile(&self.cluster()).await
        }

        fn ready_condition(&self) -> (String, String) {
            let status = self.cluster().status();
            let ready = status.conditions.iter().find(|c| c.type_ == "Ready").unwrap();
            (ready.status.clone(), ready.reason.clone())
        }
    }

    #[tokio::test]
    async fn creation_provisions_backfills_and_replays_once() {
        let h = harness(2, "pw");
        h.reconcile().await.unwrap();

        let cluster = h.cluster();
        let status = cluster.status();
        assert_eq!(status.state, Some(ClusterState::Established));
        assert_eq!(status.replicas, Some(2));
        assert_eq!(status.admin_user.as_deref(), Some("postgres"));
        assert_eq!(status.replayed_workload_uid, h.workload().metadata.uid);
        assert_eq!(cluster.admin_user(), Some("postgres"));
        assert_eq!(h.ready_condition(), ("True".into(), "Established".into()));

        let coordinator = h.nodes.node("citus-0.citus-headless.db").unwrap();
        assert_eq!(coordinator.databases["team_a_orders"].workers.len(), 1);
        assert!(coordinator.databases.contains_key("team_a_audit"));
        let worker = h.nodes.node("citus-1.citus-headless.db").unwrap();
        assert!(worker.databases.contains_key("team_a_orders"));
        assert!(!worker.databases.contains_key("team_a_audit"));

        let events = h.nodes.events().len();
        h.reconcile().await.unwrap();
        assert_eq!(h.nodes.events().len(), events);
        assert_eq!(h.cluster().state(), Some(ClusterState::Established));
    }

    #[tokio::test]
    async fn failed_replay_stays_provisioning_and_retries() {
        let h = harness(2, "pw");
        h.nodes.set_up("citus-1.citus-headless.db", false);
        let err = h.reconcile().await.unwrap_err();
        assert!(matches!(err, Error::Node { ordinal: 1, .. }), "{err}");
        assert_eq!(h.cluster().state(), Some(ClusterState::Provisioning));
        assert!(h.cluster().status().replayed_workload_uid.is_none());

        h.nodes.set_up("citus-1.citus-headless.db", true);
        h.reconcile().await.unwrap();
        assert_eq!(h.cluster().state(), Some(ClusterState::Established));
        let coordinator = h.nodes.node("citus-0.citus-headless.db").unwrap();
        assert_eq!(coordinator.databases["team_a_orders"].workers.len(), 1);
    }

    #[tokio::test]
    async fn invalid_definitions_are_reported_not_reconciled() {
        let h = harness(1, "pw");
        h.api.modify::<CitusCluster>("db", "citus", |c| {
            c.spec.password.as_mut().unwrap().secret_ref = Some(Default::default());
        });
        assert!(h.reconcile().await.unwrap().is_none());
        assert_eq!(h.ready_condition(), ("False".into(), "InvalidSpec".into()));
        assert_eq!(h.api.count::<StatefulSet>("db"), 0);
    }

    #[tokio::test]
    async fn scale_down_is_refused() {
        let h = harness(2, "pw");
        h.reconcile().await.unwrap();
        h.api
            .modify::<CitusCluster>("db", "citus", |c| c.spec.replicas = 1);
        h.reconcile().await.unwrap();
        assert_eq!(
            h.ready_condition(),
            ("False".into(), "ScaleDownUnsupported".into())
        );
        assert_eq!(h.workload().spec.unwrap().replicas, Some(2));
        assert_eq!(h.cluster().status().replicas, Some(2));
    }

    #[tokio::test]
    async fn scale_up_registers_and_rebalances() {
        let h = harness(2, "pw");
        h.reconcile().await.unwrap();
        let before = h.nodes.events().len();
        h.api
            .modify::<CitusCluster>("db", "citus", |c| c.spec.replicas = 4);
        h.reconcile().await.unwrap();

        assert_eq!(h.workload().spec.unwrap().replicas, Some(4));
        let status = h.cluster().status();
        assert_eq!(status.replicas, Some(4));
        assert_eq!(status.state, Some(ClusterState::Established));
        let events = h.nodes.events().split_off(before);
        let rebalance = events
            .iter()
            .position(|e| matches!(e, NodeEvent::Rebalanced { .. }))
            .unwrap();
        let added: Vec<_> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| matches!(e, NodeEvent::WorkerAdded { .. }))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(added.len(), 2);
        assert!(added.iter().all(|i| *i < rebalance));
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, NodeEvent::Rebalanced { .. }))
                .count(),
            1
        );
    }

    fn count(events: &[NodeEvent], f: impl Fn(&NodeEvent) -> bool) -> usize {
        events.iter().filter(|e| f(e)).count()
    }

    #[tokio::test]
    async fn failed_scale_up_is_retried_until_every_worker_is_registered() {
        let h = harness(2, "pw");
        h.reconcile().await.unwrap();
        let before = h.nodes.events().len();
        h.api
            .modify::<CitusCluster>("db", "citus", |c| c.spec.replicas = 4);
        h.nodes.set_up("citus-3.citus-headless.db", false);
        let err = h.reconcile().await.unwrap_err();
        assert!(matches!(err, Error::Node { ordinal: 3, .. }), "{err}");
        // The workload already grew, but the cluster has not converged.
        assert_eq!(h.workload().spec.unwrap().replicas, Some(4));
        let status = h.cluster().status();
        assert_eq!(status.state, Some(ClusterState::Scaling));
        assert_eq!(status.replicas, Some(2));

        h.nodes.set_up("citus-3.citus-headless.db", true);
        h.reconcile().await.unwrap();
        let status = h.cluster().status();
        assert_eq!(status.state, Some(ClusterState::Established));
        assert_eq!(status.replicas, Some(4));
        let coordinator = h.nodes.node("citus-0.citus-headless.db").unwrap();
        assert_eq!(coordinator.databases["team_a_orders"].workers.len(), 3);
        let events = h.nodes.events().split_off(before);
        assert_eq!(
            count(&events, |e| matches!(e, NodeEvent::WorkerAdded { .. })),
            2
        );
        assert_eq!(
            count(&events, |e| matches!(
                e,
                NodeEvent::Rebalanced { database, .. } if database == "team_a_orders"
            )),
            1
        );
        assert_eq!(
            count(&events, |e| matches!(e, NodeEvent::Rebalanced { .. })),
            1
        );
    }

    #[tokio::test]
    async fn shutdown_while_scaling_is_not_reported_as_success() {
        let h = harness(2, "pw");
        h.reconcile().await.unwrap();
        h.api
            .modify::<CitusCluster>("db", "citus", |c| c.spec.replicas = 3);
        h.api.set_pod("db", &pod_name("citus", 2), false);
        let cancel = h.context.shared.cancel.clone();
        let _shutdown = citus_ore::task::spawn(|| "shutdown", async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let err = h.reconcile().await.unwrap_err();
        assert!(matches!(err, Error::Shutdown), "{err}");
        let status = h.cluster().status();
        assert_eq!(status.replicas, Some(2));
        assert_ne!(status.state, Some(ClusterState::Established));
        let coordinator = h.nodes.node("citus-0.citus-headless.db").unwrap();
        assert_eq!(coordinator.databases["team_a_orders"].workers.len(), 1);
    }

    #[tokio::test]
    async fn password_change_rotates_every_node() {
        let h = harness(3, "A");
        h.reconcile().await.unwrap();
        h.api.modify::<CitusCluster>("db", "citus", |c| {
            c.spec.password.as_mut().unwrap().value = Some("B".into());
        });
        h.reconcile().await.unwrap();
        for ordinal in 0..3 {
            let host = format!("citus-{ordinal}.citus-headless.db");
            assert!(h.nodes.accepts(&host, "postgres", "B"));
            assert!(!h.nodes.accepts(&host, "postgres", "A"));
        }
        assert_eq!(h.cluster().state(), Some(ClusterState::Established));
        assert_eq!(h.context.shared.metrics.credential_rotations.get(), 1);

        h.reconcile().await.unwrap();
        assert_eq!(h.context.shared.metrics.credential_rotations.get(), 1);
    }

    #[tokio::test]
    async fn cleanup_removes_the_workload() {
        let h = harness(1, "pw");
        h.reconcile().await.unwrap();
        assert_eq!(h.api.count::<StatefulSet>("db"), 1);
        h.context.teardown(&h.cluster()).await.unwrap();
        assert_eq!(h.api.count::<StatefulSet>("db"), 0);
    }

    #[test]
    fn requests_are_filtered_by_cluster() {
        let mut other = database_request();
        other.spec.cluster.name = "other".into();
        let requests = vec![other, database_request()];
        let found = requests.for_cluster("db", "citus");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].spec.cluster.name, "citus");
    }
}
