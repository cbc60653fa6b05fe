// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Logical backups of a whole cluster through its coordinator.

use async_trait::async_trait;
use kube::ResourceExt;

use citus_cloud_resources::crd::backup::v1alpha1::{BackupRequest, JobStatus};
use citus_cloud_resources::crd::cluster::v1alpha1::CitusCluster;
use citus_cloud_resources::crd::StorageVolume;
use citus_cloud_resources::naming::BACKUP_JOB_NAME;

use crate::controller::cluster::resources::BACKUP_MOUNT_PATH;
use crate::controller::job::{JobKind, JobPlan, Refusal};
use crate::k8s::ClusterApi;
use crate::Error;

const DUMP_SCRIPT: &str = r#"pg_dumpall -h "$PG_HOST" -p "$PG_PORT" -f "$BACKUP_FILENAME""#;

pub struct Backup;

/// Where a backup started now writes its dump.
fn artifact_path(request: &BackupRequest) -> String {
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ");
    format!("{BACKUP_MOUNT_PATH}/{}-{stamp}.sql", request.name_any())
}

#[async_trait]
impl JobKind for Backup {
    type Request = BackupRequest;

    const KIND: &'static str = "backup";
    const JOB_NAME: &'static str = BACKUP_JOB_NAME;
    const FINALIZER_NAME: &'static str = "orchestratord.citus.cloud/backup";

    fn cluster_name(request: &BackupRequest) -> &str {
        &request.spec.cluster_name
    }

    fn status(request: &BackupRequest) -> JobStatus {
        request.job_status()
    }

    async fn plan<A: ClusterApi>(
        _api: &A,
        request: &BackupRequest,
        _cluster: &CitusCluster,
    ) -> Result<Result<JobPlan, Refusal>, Error> {
        let path = artifact_path(request);
        Ok(Ok(JobPlan {
            volume: request.spec.volume.clone(),
            backup_filename: path.clone(),
            working_dir: None,
            artifact_path: Some(path),
            script: DUMP_SCRIPT.into(),
        }))
    }

    fn artifact(request: &BackupRequest) -> Option<(StorageVolume, String)> {
        let volume = request.spec.volume.clone()?;
        let path = request.job_status().artifact_path.filter(|p| !p.is_empty())?;
        Some((volume, path))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use k8s_openapi::api::batch::v1::Job;
    use serde_json::json;

    use citus_cloud_resources::crd::backup::v1alpha1::JobState;

    use super::*;
    use crate::controller::job::tests::{complete_job, insert_cluster, shared};
    use crate::controller::job::{JobArgs, JobOrchestrator};
    use crate::testing::MemoryApi;

    #[tokio::test]
    async fn backup_runs_to_ready_with_an_artifact_under_the_mount() {
        let api = MemoryApi::new();
        insert_cluster(&api);
        let mut request = BackupRequest::new(
            "nightly",
            serde_json::from_value(json!({
                "clusterName": "citus",
                "volume": {"hostPath": {"path": "/var/backups"}},
            }))
            .unwrap(),
        );
        request.metadata.namespace = Some("db".into());
        api.insert(request);
        let request: BackupRequest = api.object("db", "nightly").unwrap();

        // Finish the job only once the request reports it running.
        let observer = citus_ore::task::spawn(|| "backup observer", {
            let api = api.clone();
            async move {
                loop {
                    let request: BackupRequest = api.object("db", "nightly").unwrap();
                    if request.job_status().state == JobState::Running {
                        let job: Job = api.object("db", BACKUP_JOB_NAME).unwrap();
                        complete_job(&api, BACKUP_JOB_NAME, true).await.unwrap();
                        return job;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }
        });
        let orchestrator: JobOrchestrator<_, Backup> =
            JobOrchestrator::new(shared(&api), JobArgs::default());
        orchestrator.reconcile(&request).await.unwrap();
        let job = observer.await.unwrap();

        let status = api.object::<BackupRequest>("db", "nightly").unwrap().job_status();
        assert_eq!(status.state, JobState::Ready);
        assert!(status.started_at.is_some());
        assert!(status.completed_at.is_some());
        let artifact = status.artifact_path.unwrap();
        assert!(artifact.starts_with("/backup/nightly-"), "{artifact}");
        assert!(artifact.ends_with(".sql"));

        let pod = job.spec.unwrap().template.spec.unwrap();
        let container = &pod.containers[0];
        let filename = container
            .env
            .as_ref()
            .unwrap()
            .iter()
            .find(|v| v.name == "BACKUP_FILENAME")
            .and_then(|v| v.value.clone());
        assert_eq!(filename.as_deref(), Some(artifact.as_str()));
        assert_eq!(container.image.as_deref(), Some("postgres:16"));
        assert!(container.command.as_ref().unwrap()[2].starts_with("pg_dumpall"));
    }

    #[test]
    fn artifacts_need_storage_to_be_removed() {
        let mut request = BackupRequest::new("b", Default::default());
        request.status = Some(JobStatus {
            artifact_path: Some("/backup/b.sql".into()),
            ..Default::default()
        });
        assert_eq!(Backup::artifact(&request), None);
        request.spec.volume = Some(crate::controller::job::tests::host_path());
        assert_eq!(
            Backup::artifact(&request).map(|(_, path)| path).as_deref(),
            Some("/backup/b.sql")
        );
    }
}
