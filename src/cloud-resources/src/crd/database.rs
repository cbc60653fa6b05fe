// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! DatabaseRequest custom resource. Admission of these objects belongs to a
//! separate subsystem; the operator only reads them and replays them against
//! freshly created clusters.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::SecretKeyRef;
use crate::naming;

pub mod v1alpha1 {
    use super::*;

    /// A tenant's request for databases inside a cluster.
    #[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
    #[serde(rename_all = "camelCase")]
    #[kube(
        namespaced,
        group = "citus.cloud",
        version = "v1alpha1",
        kind = "DatabaseRequest",
        singular = "databaserequest",
        plural = "databaserequests",
        shortname = "dbreq"
    )]
    pub struct DatabaseRequestSpec {
        /// The cluster hosting the databases.
        pub cluster: ClusterRef,
        /// The tenant's logical user name.
        pub user: String,
        /// The tenant's password, read from a secret in the request's
        /// namespace. Without it the role is created without a password.
        pub password_secret_ref: Option<SecretKeyRef>,
        #[serde(default)]
        pub databases: Vec<DatabaseSpec>,
    }

    #[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
    pub struct ClusterRef {
        pub name: String,
        pub namespace: String,
    }

    /// One logical database.
    #[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
    #[serde(rename_all = "camelCase")]
    pub struct DatabaseSpec {
        pub name: String,
        /// Whether the database is partitioned across the cluster's workers.
        #[serde(default)]
        pub distributed: bool,
        #[serde(default)]
        pub extensions: Vec<String>,
        /// SQL run once on the coordinator after the database is created.
        #[serde(default)]
        pub init_scripts: Vec<String>,
    }

    impl DatabaseRequest {
        /// The tenant namespace, which prefixes every physical name.
        pub fn tenant_namespace(&self) -> String {
            self.namespace().unwrap_or_else(|| "default".to_owned())
        }

        pub fn physical_user(&self) -> String {
            naming::physical_name(&self.tenant_namespace(), &self.spec.user)
        }

        pub fn physical_database(&self, database: &DatabaseSpec) -> String {
            naming::physical_name(&self.tenant_namespace(), &database.name)
        }

        /// Reports whether this request targets the named cluster.
        pub fn targets(&self, cluster_namespace: &str, cluster_name: &str) -> bool {
            self.spec.cluster.namespace == cluster_namespace && self.spec.cluster.name == cluster_name
        }
    }
}

#[cfg(test)]
mod tests {
    use kube::api::ObjectMeta;

    use super::v1alpha1::*;

    #[test]
    fn physical_names_use_the_tenant_namespace() {
        let req = DatabaseRequest {
            metadata: ObjectMeta {
                name: Some("orders".into()),
                namespace: Some("team-a".into()),
                ..Default::default()
            },
            spec: serde_json::from_value(serde_json::json!({
                "cluster": {"name": "citus", "namespace": "db"},
                "user": "app-user",
                "databases": [{"name": "my-db", "distributed": true}],
            }))
            .unwrap(),
        };
        assert_eq!(req.physical_user(), "team_a_app_user");
        assert_eq!(req.physical_database(&req.spec.databases[0]), "team_a_my_db");
        assert!(req.spec.databases[0].distributed);
        assert!(req.spec.databases[0].extensions.is_empty());
        assert!(req.targets("db", "citus"));
        assert!(!req.targets("team-a", "citus"));
    }
}
