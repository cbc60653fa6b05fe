// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! BackupRequest and RestoreRequest custom resources, each reconciled into a
//! single run-to-completion Job.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::{ManagedResource, StorageVolume, MANAGED_BY, MANAGED_BY_LABEL};

pub mod v1alpha1 {
    use super::*;

    /// Requests a dump of a cluster into storage.
    #[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
    #[serde(rename_all = "camelCase")]
    #[kube(
        namespaced,
        group = "citus.cloud",
        version = "v1alpha1",
        kind = "BackupRequest",
        singular = "backuprequest",
        plural = "backuprequests",
        shortname = "citusbackup",
        status = "JobStatus",
        printcolumn = r#"{"name": "Cluster", "type": "string", "jsonPath": ".spec.clusterName"}"#,
        printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
        printcolumn = r#"{"name": "Artifact", "type": "string", "jsonPath": ".status.artifactPath", "priority": 1}"#
    )]
    pub struct BackupRequestSpec {
        /// The cluster to back up, in the same namespace.
        pub cluster_name: String,
        /// Where to write the dump. Without a volume the dump stays in the
        /// job's ephemeral storage.
        pub volume: Option<StorageVolume>,
    }

    /// Requests loading a finished backup into a cluster.
    #[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
    #[serde(rename_all = "camelCase")]
    #[kube(
        namespaced,
        group = "citus.cloud",
        version = "v1alpha1",
        kind = "RestoreRequest",
        singular = "restorerequest",
        plural = "restorerequests",
        shortname = "citusrestore",
        status = "JobStatus",
        printcolumn = r#"{"name": "Cluster", "type": "string", "jsonPath": ".spec.clusterName"}"#,
        printcolumn = r#"{"name": "Backup", "type": "string", "jsonPath": ".spec.backupName"}"#,
        printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#
    )]
    pub struct RestoreRequestSpec {
        /// The cluster to restore into, in the same namespace.
        pub cluster_name: String,
        /// The BackupRequest whose artifact is restored.
        pub backup_name: String,
    }

    /// The progress of a backup or restore request.
    #[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
    #[serde(rename_all = "camelCase")]
    pub struct JobStatus {
        #[serde(default)]
        pub state: JobState,
        pub started_at: Option<Time>,
        pub completed_at: Option<Time>,
        pub error: Option<String>,
        /// The dump file, absolute within the job's filesystem. Backups only.
        pub artifact_path: Option<String>,
    }

    /// States of a request. `ready`, `error` and `rejected` are terminal.
    #[derive(
        Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize, JsonSchema,
    )]
    #[serde(rename_all = "lowercase")]
    pub enum JobState {
        #[default]
        New,
        Waiting,
        Requested,
        Running,
        Rejected,
        Error,
        Ready,
    }

    impl JobState {
        pub fn is_terminal(self) -> bool {
            matches!(self, JobState::Ready | JobState::Error | JobState::Rejected)
        }

        /// Reports whether a request in this state may move to `next`.
        ///
        /// States only move forward, so a request passes through each at most
        /// once. `rejected` is only reachable before the job starts running.
        pub fn may_advance_to(self, next: JobState) -> bool {
            use JobState::*;
            match (self, next) {
                (from, _) if from.is_terminal() => false,
                (New | Waiting | Requested, Rejected) => true,
                (_, Rejected) => false,
                (Running, Ready | Error) => true,
                (_, Ready) => false,
                (from, Error) => from != Error,
                (from, to) => from < to,
            }
        }
    }

    impl fmt::Display for JobState {
        fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
            let repr = match self {
                JobState::New => "new",
                JobState::Waiting => "waiting",
                JobState::Requested => "requested",
                JobState::Running => "running",
                JobState::Rejected => "rejected",
                JobState::Error => "error",
                JobState::Ready => "ready",
            };
            f.write_str(repr)
        }
    }

    impl BackupRequest {
        pub fn job_status(&self) -> JobStatus {
            self.status.clone().unwrap_or_default()
        }
    }

    impl RestoreRequest {
        pub fn job_status(&self) -> JobStatus {
            self.status.clone().unwrap_or_default()
        }
    }

    impl ManagedResource for BackupRequest {
        fn default_labels(&self) -> BTreeMap<String, String> {
            job_labels("backup", &self.spec.cluster_name, &self.name_unchecked())
        }
    }

    impl ManagedResource for RestoreRequest {
        fn default_labels(&self) -> BTreeMap<String, String> {
            job_labels("restore", &self.spec.cluster_name, &self.name_unchecked())
        }
    }

    fn job_labels(kind: &str, cluster: &str, request: &str) -> BTreeMap<String, String> {
        BTreeMap::from_iter([
            ("citus.cloud/cluster".to_owned(), cluster.to_owned()),
            (format!("citus.cloud/{kind}"), request.to_owned()),
            (MANAGED_BY_LABEL.to_owned(), MANAGED_BY.to_owned()),
        ])
    }
}
