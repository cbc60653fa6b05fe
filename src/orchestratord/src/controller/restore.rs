// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Loads a finished backup into a cluster.

use async_trait::async_trait;

use citus_cloud_resources::crd::backup::v1alpha1::{
    BackupRequest, JobState, JobStatus, RestoreRequest,
};
use citus_cloud_resources::crd::cluster::v1alpha1::CitusCluster;
use citus_cloud_resources::crd::ManagedResource;
use citus_cloud_resources::naming::RESTORE_JOB_NAME;

use crate::controller::cluster::resources::BACKUP_MOUNT_PATH;
use crate::controller::job::{JobKind, JobPlan, Refusal};
use crate::k8s::ClusterApi;
use crate::Error;

const RESTORE_SCRIPT: &str = r#"psql -h "$PG_HOST" -p "$PG_PORT" -d postgres -f "$BACKUP_FILENAME""#;

pub struct Restore;

#[async_trait]
impl JobKind for Restore {
    type Request = RestoreRequest;

    const KIND: &'static str = "restore";
    const JOB_NAME: &'static str = RESTORE_JOB_NAME;
    const FINALIZER_NAME: &'static str = "orchestratord.citus.cloud/restore";

    fn cluster_name(request: &RestoreRequest) -> &str {
        &request.spec.cluster_name
    }

    fn status(request: &RestoreRequest) -> JobStatus {
        request.job_status()
    }

    async fn plan<A: ClusterApi>(
        api: &A,
        request: &RestoreRequest,
        _cluster: &CitusCluster,
    ) -> Result<Result<JobPlan, Refusal>, Error> {
        let name = &request.spec.backup_name;
        let backup: Option<BackupRequest> = api.get(&request.namespace_or_default(), name).await?;
        let Some(backup) = backup else {
            return Ok(Err(Refusal::Invalid(format!("backup {name} not found"))));
        };
        let status = backup.job_status();
        if status.state != JobState::Ready {
            return Ok(Err(Refusal::Rejected(format!(
                "backup {name} is {}, not ready",
                status.state
            ))));
        }
        let Some(artifact) = status.artifact_path.filter(|p| !p.is_empty()) else {
            return Ok(Err(Refusal::Invalid(format!(
                "backup {name} has no artifact"
            ))));
        };
        let Some(volume) = backup.spec.volume.clone() else {
            return Ok(Err(Refusal::Invalid(format!(
                "backup {name} was not written to persistent storage"
            ))));
        };
        // The job runs from the mount, so the dump is named relative to it.
        let relative = artifact
            .strip_prefix(BACKUP_MOUNT_PATH)
            .map(|p| p.trim_start_matches('/'))
            .unwrap_or(&artifact)
            .to_owned();
        Ok(Ok(JobPlan {
            volume: Some(volume),
            backup_filename: relative,
            working_dir: Some(BACKUP_MOUNT_PATH.into()),
            artifact_path: None,
            script: RESTORE_SCRIPT.into(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::batch::v1::Job;
    use serde_json::json;

    use super::*;
    use crate::controller::job::tests::{complete_job, host_path, insert_cluster, shared};
    use crate::controller::job::{JobArgs, JobOrchestrator};
    use crate::testing::MemoryApi;

    fn insert_backup(api: &MemoryApi, state: JobState) {
        let mut backup = BackupRequest::new(
            "nightly",
            serde_json::from_value(json!({"clusterName": "citus"})).unwrap(),
        );
        backup.metadata.namespace = Some("db".into());
        backup.spec.volume = Some(host_path());
        backup.status = Some(JobStatus {
            state,
            artifact_path: Some("/backup/nightly-20240101T000000Z.sql".into()),
            ..Default::default()
        });
        api.insert(backup);
    }

    fn restore(api: &MemoryApi) -> RestoreRequest {
        let mut request = RestoreRequest::new(
            "from-nightly",
            serde_json::from_value(json!({"clusterName": "citus", "backupName": "nightly"}))
                .unwrap(),
        );
        request.metadata.namespace = Some("db".into());
        api.insert(request);
        api.object("db", "from-nightly").unwrap()
    }

    fn orchestrator(api: &MemoryApi) -> JobOrchestrator<MemoryApi, Restore> {
        JobOrchestrator::new(shared(api), JobArgs::default())
    }

    fn status(api: &MemoryApi) -> JobStatus {
        api.object::<RestoreRequest>("db", "from-nightly")
            .unwrap()
            .job_status()
    }

    #[tokio::test]
    async fn restoring_a_running_backup_is_rejected() {
        let api = MemoryApi::new();
        insert_cluster(&api);
        insert_backup(&api, JobState::Running);
        orchestrator(&api).reconcile(&restore(&api)).await.unwrap();
        let status = status(&api);
        assert_eq!(status.state, JobState::Rejected);
        assert_eq!(status.error.as_deref(), Some("backup nightly is running, not ready"));
        assert_eq!(api.count::<Job>("db"), 0);
    }

    #[tokio::test]
    async fn restoring_a_missing_backup_is_an_error() {
        let api = MemoryApi::new();
        insert_cluster(&api);
        orchestrator(&api).reconcile(&restore(&api)).await.unwrap();
        assert_eq!(status(&api).state, JobState::Error);
        assert_eq!(api.count::<Job>("db"), 0);
    }

    #[tokio::test]
    async fn restore_reads_the_dump_relative_to_the_mount() {
        let api = MemoryApi::new();
        insert_cluster(&api);
        insert_backup(&api, JobState::Ready);
        let done = complete_job(&api, RESTORE_JOB_NAME, true);
        orchestrator(&api).reconcile(&restore(&api)).await.unwrap();
        done.await.unwrap();

        let status = status(&api);
        assert_eq!(status.state, JobState::Ready);
        assert_eq!(status.artifact_path, None);
        let job: Job = api.object("db", RESTORE_JOB_NAME).unwrap();
        let pod = job.spec.unwrap().template.spec.unwrap();
        let container = &pod.containers[0];
        assert_eq!(container.working_dir.as_deref(), Some("/backup"));
        let filename = container
            .env
            .as_ref()
            .unwrap()
            .iter()
            .find(|v| v.name == "BACKUP_FILENAME")
            .and_then(|v| v.value.clone());
        assert_eq!(filename.as_deref(), Some("nightly-20240101T000000Z.sql"));
        assert_eq!(
            pod.volumes.unwrap()[0].host_path.as_ref().unwrap().path,
            "/var/backups"
        );
    }
}
