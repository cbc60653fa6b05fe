// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::{ManagedResource, SecretKeyRef, StorageVolume, MANAGED_BY, MANAGED_BY_LABEL};
use crate::naming;

pub mod v1alpha1 {
    use super::*;

    /// A coordinator/worker PostgreSQL cluster running the Citus extension.
    #[derive(CustomResource, Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
    #[serde(rename_all = "camelCase")]
    #[kube(
        namespaced,
        group = "citus.cloud",
        version = "v1alpha1",
        kind = "CitusCluster",
        singular = "cituscluster",
        plural = "citusclusters",
        shortname = "citus",
        status = "CitusClusterStatus",
        printcolumn = r#"{"name": "Replicas", "type": "integer", "jsonPath": ".spec.replicas"}"#,
        printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#
    )]
    pub struct CitusClusterSpec {
        /// The number of nodes. Ordinal 0 is the coordinator.
        ///
        /// Only scaling up is supported.
        #[serde(default = "default_replicas")]
        pub replicas: i32,
        /// The admin user. If unset, the user stored in the
        /// `citus-admin-credentials` secret is used. Filled in by the
        /// operator after provisioning.
        pub admin_user: Option<String>,
        /// The admin password. Filled in by the operator after provisioning.
        pub password: Option<PasswordSource>,
        /// Overrides the operator's default node image.
        pub image: Option<String>,
        /// The team or tenant owning this cluster, copied into labels.
        pub owner: Option<String>,
        /// Storage mounted at the backup directory of every node.
        pub backup_storage: Option<StorageVolume>,
    }

    fn default_replicas() -> i32 {
        1
    }

    /// Where the admin password comes from. Exactly one field may be set.
    #[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
    #[serde(rename_all = "camelCase")]
    pub struct PasswordSource {
        /// A literal password.
        pub value: Option<String>,
        /// A key of a secret in the cluster's namespace.
        pub secret_ref: Option<SecretKeyRef>,
    }

    #[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
    #[serde(rename_all = "camelCase")]
    pub struct CitusClusterStatus {
        pub state: Option<ClusterState>,
        pub replicas: Option<i32>,
        pub admin_user: Option<String>,
        #[serde(default)]
        pub conditions: Vec<Condition>,
        pub observed_generation: Option<i64>,
        /// The UID of the StatefulSet for which recorded database requests
        /// were last replayed.
        pub replayed_workload_uid: Option<String>,
    }

    /// The lifecycle of a cluster. A cluster without a state is absent.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
    #[serde(rename_all = "camelCase")]
    pub enum ClusterState {
        Provisioning,
        Established,
        Rotating,
        Scaling,
    }

    impl fmt::Display for ClusterState {
        fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
            let repr = match self {
                ClusterState::Provisioning => "provisioning",
                ClusterState::Established => "established",
                ClusterState::Rotating => "rotating",
                ClusterState::Scaling => "scaling",
            };
            f.write_str(repr)
        }
    }

    /// Reasons a cluster definition cannot be reconciled as written.
    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum InvalidCluster {
        #[error("password sets both value and secretRef")]
        ConflictingPasswordSource,
        #[error("replicas must be at least 1, got {0}")]
        InvalidReplicas(i32),
    }

    impl CitusCluster {
        /// Checks the invariants the API server cannot express.
        pub fn validate(&self) -> Result<(), InvalidCluster> {
            if self.spec.replicas < 1 {
                return Err(InvalidCluster::InvalidReplicas(self.spec.replicas));
            }
            if let Some(PasswordSource {
                value: Some(_),
                secret_ref: Some(_),
            }) = &self.spec.password
            {
                return Err(InvalidCluster::ConflictingPasswordSource);
            }
            Ok(())
        }

        pub fn statefulset_name(&self) -> String {
            self.name_unchecked()
        }

        pub fn headless_service_name(&self) -> String {
            naming::headless_service_name(&self.name_unchecked())
        }

        pub fn node_address(&self, ordinal: i32) -> String {
            naming::node_address(&self.name_unchecked(), ordinal, &self.namespace_or_default())
        }

        pub fn coordinator_address(&self) -> String {
            self.node_address(naming::COORDINATOR_ORDINAL)
        }

        /// The admin user named by the definition, ignoring empty strings.
        pub fn admin_user(&self) -> Option<&str> {
            self.spec.admin_user.as_deref().filter(|u| !u.is_empty())
        }

        pub fn state(&self) -> Option<ClusterState> {
            self.status.as_ref().and_then(|s| s.state)
        }

        pub fn status(&self) -> CitusClusterStatus {
            self.status.clone().unwrap_or_default()
        }
    }

    impl ManagedResource for CitusCluster {
        fn default_labels(&self) -> BTreeMap<String, String> {
            let mut labels = BTreeMap::from_iter([
                ("citus.cloud/cluster".to_owned(), self.name_unchecked()),
                ("app".to_owned(), "citus".to_owned()),
                (MANAGED_BY_LABEL.to_owned(), MANAGED_BY.to_owned()),
            ]);
            if let Some(owner) = &self.spec.owner {
                labels.insert("citus.cloud/owner".to_owned(), owner.clone());
            }
            labels
        }
    }
}
