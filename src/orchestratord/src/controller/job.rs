// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Runs one Kubernetes Job per backup or restore request and mirrors its
//! progress into the request's status.
//!
//! A namespace has at most one job of each kind at a time, under a
//! well-known name. Requests move `new -> [waiting] -> requested -> running
//! -> {ready|error}`, or to `rejected` before they start running. Terminal
//! requests are never touched again.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, Pod, PodSpec, PodTemplateSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use maplit::btreemap;
use serde_json::json;
use tracing::{debug, info, instrument, trace, warn};

use citus_cloud_resources::crd::backup::v1alpha1::{JobState, JobStatus};
use citus_cloud_resources::crd::cluster::v1alpha1::CitusCluster;
use citus_cloud_resources::crd::{display_name, ManagedResource, StorageVolume};
use citus_cloud_resources::ClusterCredentials;
use citus_ore::display::ErrorExt;
use citus_ore::task::{self, AbortOnDropHandle, JoinHandleExt};
use citus_ore::wait::WaitError;

use crate::controller::cluster::cluster_credentials;
use crate::controller::cluster::resources::BACKUP_MOUNT_PATH;
use crate::controller::{requeue_conflicts, Shared};
use crate::k8s::{self, ClusterApi, Created, Kind};
use crate::Error;

/// Annotation on a job naming the UID of the request that created it.
pub const REQUEST_UID_ANNOTATION: &str = "citus.cloud/request-uid";
/// Label the Job controller puts on the pods it creates.
const JOB_CONTROLLER_UID_LABEL: &str = "batch.kubernetes.io/controller-uid";
const VOLUME_NAME: &str = "backup";
const MAX_DELETION_WATCHERS: usize = 1024;

#[derive(Debug, Clone, clap::Parser)]
pub struct JobArgs {
    /// The image backup and restore jobs run. It must provide a POSIX shell
    /// and the PostgreSQL client tools.
    #[clap(long, env = "CITUS_BACKUP_IMAGE", default_value = "postgres:16")]
    pub backup_image: String,
}

impl Default for JobArgs {
    fn default() -> Self {
        JobArgs {
            backup_image: "postgres:16".into(),
        }
    }
}

/// How to run the job for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct JobPlan {
    /// Mounted at the backup directory. Without one, the job gets ephemeral
    /// storage.
    pub volume: Option<StorageVolume>,
    /// Passed to the job as `BACKUP_FILENAME`.
    pub backup_filename: String,
    pub working_dir: Option<String>,
    /// Recorded in the request's status before the job is created.
    pub artifact_path: Option<String>,
    /// Run with `sh -c`.
    pub script: String,
}

/// Why a request cannot be started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Refusal {
    /// The request references something that does not exist.
    Invalid(String),
    /// The request is well formed but cannot be served now.
    Rejected(String),
}

/// One kind of job-backed request.
#[async_trait]
pub trait JobKind: Send + Sync + 'static {
    type Request: Kind + ManagedResource;

    /// The kind's name in logs and metrics.
    const KIND: &'static str;
    /// The name of the namespace's single job of this kind.
    const JOB_NAME: &'static str;
    const FINALIZER_NAME: &'static str;

    fn cluster_name(request: &Self::Request) -> &str;

    fn status(request: &Self::Request) -> JobStatus;

    async fn plan<A: ClusterApi>(
        api: &A,
        request: &Self::Request,
        cluster: &CitusCluster,
    ) -> Result<Result<JobPlan, Refusal>, Error>;

    /// The storage holding this request's artifact and the artifact's path,
    /// if deleting the request should remove it.
    fn artifact(_request: &Self::Request) -> Option<(StorageVolume, String)> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum JobOutcome {
    Succeeded,
    Failed(String),
    Vanished,
}

impl JobOutcome {
    /// The terminal state a request whose job ended this way moves to.
    fn into_state(self) -> (JobState, Option<String>) {
        match self {
            JobOutcome::Succeeded => (JobState::Ready, None),
            JobOutcome::Failed(reason) => (JobState::Error, Some(reason)),
            JobOutcome::Vanished => (
                JobState::Error,
                Some("job was deleted before it finished".into()),
            ),
        }
    }
}

fn job_outcome(job: &Job) -> Option<JobOutcome> {
    let status = job.status.as_ref()?;
    if status.succeeded.unwrap_or(0) > 0 {
        return Some(JobOutcome::Succeeded);
    }
    let failed = status
        .conditions
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|c| c.type_ == "Failed" && c.status == "True");
    if let Some(c) = failed {
        let reason = c
            .message
            .clone()
            .filter(|m| !m.is_empty())
            .or_else(|| c.reason.clone())
            .unwrap_or_else(|| "job failed".into());
        return Some(JobOutcome::Failed(reason));
    }
    if status.failed.unwrap_or(0) > 0 {
        return Some(JobOutcome::Failed("job pod failed".into()));
    }
    None
}

fn is_finished(job: &Job) -> bool {
    job_outcome(job).is_some()
}

fn owned_by(job: &Job, uid: Option<&str>) -> bool {
    uid.is_some()
        && job
            .annotations()
            .get(REQUEST_UID_ANNOTATION)
            .map(String::as_str)
            == uid
}

fn pods_of(job_uid: &str) -> String {
    format!("{JOB_CONTROLLER_UID_LABEL}={job_uid}")
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.into(),
        value: Some(value.into()),
        ..Default::default()
    }
}

pub struct JobOrchestrator<A, K> {
    shared: Shared<A>,
    args: JobArgs,
    /// Background tasks waiting for finished jobs to be deleted, by request
    /// UID.
    watchers: Mutex<BTreeMap<String, AbortOnDropHandle<()>>>,
    _kind: PhantomData<fn() -> K>,
}

impl<A: ClusterApi, K: JobKind> JobOrchestrator<A, K> {
    pub fn new(shared: Shared<A>, args: JobArgs) -> Self {
        JobOrchestrator {
            shared,
            args,
            watchers: Mutex::new(BTreeMap::new()),
            _kind: PhantomData,
        }
    }

    /// Moves the request to `next`, writing the full status. Moves the state
    /// machine forbids are logged and dropped.
    async fn advance(
        &self,
        request: &K::Request,
        status: &mut JobStatus,
        next: JobState,
        f: impl FnOnce(&mut JobStatus),
    ) -> Result<bool, Error> {
        if status.state != next && !status.state.may_advance_to(next) {
            warn!(from = %status.state, to = %next, "refusing state change");
            return Ok(false);
        }
        let mut updated = status.clone();
        updated.state = next;
        f(&mut updated);
        self.shared
            .api
            .patch_status::<K::Request>(
                &request.namespace_or_default(),
                &request.name_any(),
                &json!({ "status": updated }),
            )
            .await?;
        debug!(from = %status.state, to = %next, "request advanced");
        *status = updated;
        Ok(true)
    }

    /// Moves the request to a terminal state.
    async fn finish(
        &self,
        request: &K::Request,
        status: &mut JobStatus,
        state: JobState,
        error: Option<String>,
    ) -> Result<(), Error> {
        if let Some(error) = &error {
            info!(%state, "request finished: {error}");
        } else {
            info!(%state, "request finished");
        }
        let advanced = self
            .advance(request, status, state, |s| {
                s.error = error;
                s.completed_at = Some(Time(chrono::Utc::now()));
            })
            .await?;
        if advanced {
            self.shared
                .metrics
                .job_outcomes
                .with_label_values(&[K::KIND, &state.to_string()])
                .inc();
        }
        Ok(())
    }

    fn job(
        &self,
        request: &K::Request,
        name: &str,
        plan: &JobPlan,
        mut env_vars: Vec<EnvVar>,
    ) -> Job {
        let mut metadata = request.managed_resource_meta(name.to_owned());
        metadata.annotations = Some(btreemap! {
            REQUEST_UID_ANNOTATION.to_owned() => request.uid().unwrap_or_default(),
        });
        env_vars.push(env("BACKUP_FILENAME", plan.backup_filename.clone()));
        let volume = match &plan.volume {
            Some(storage) => storage.to_volume(VOLUME_NAME),
            None => Volume {
                name: VOLUME_NAME.into(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            },
        };
        let container = Container {
            name: K::KIND.into(),
            image: Some(self.args.backup_image.clone()),
            command: Some(vec!["sh".into(), "-c".into(), plan.script.clone()]),
            env: Some(env_vars),
            working_dir: plan.working_dir.clone(),
            volume_mounts: Some(vec![VolumeMount {
                name: VOLUME_NAME.into(),
                mount_path: BACKUP_MOUNT_PATH.into(),
                ..Default::default()
            }]),
            ..Default::default()
        };
        Job {
            metadata,
            spec: Some(JobSpec {
                backoff_limit: Some(0),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(request.default_labels()),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        volumes: Some(vec![volume]),
                        restart_policy: Some("Never".into()),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: None,
        }
    }

    fn credential_env(creds: &ClusterCredentials) -> Vec<EnvVar> {
        vec![
            env("PG_HOST", creds.host.clone()),
            env("PG_PORT", creds.port.to_string()),
            env("PGUSER", creds.admin_user.clone()),
            env("PGPASSWORD", creds.admin_password.clone()),
        ]
    }

    async fn start(
        &self,
        request: &K::Request,
        mut status: JobStatus,
        existing: Option<Job>,
    ) -> Result<(), Error> {
        let api = &*self.shared.api;
        let namespace = request.namespace_or_default();

        let cluster_name = K::cluster_name(request);
        let cluster: Option<CitusCluster> = api.get(&namespace, cluster_name).await?;
        let Some(cluster) = cluster else {
            let error = format!("cluster {cluster_name} not found");
            return self
                .finish(request, &mut status, JobState::Error, Some(error))
                .await;
        };
        let plan = match K::plan(api, request, &cluster).await? {
            Ok(plan) => plan,
            Err(Refusal::Invalid(error)) => {
                return self
                    .finish(request, &mut status, JobState::Error, Some(error))
                    .await
            }
            Err(Refusal::Rejected(reason)) => {
                return self
                    .finish(request, &mut status, JobState::Rejected, Some(reason))
                    .await
            }
        };
        let creds = cluster_credentials(api, &cluster).await?;

        if let Some(job) = existing {
            if !is_finished(&job) {
                let reason = format!("duplicate request: job {} is still active", K::JOB_NAME);
                return self
                    .finish(request, &mut status, JobState::Rejected, Some(reason))
                    .await;
            }
            self.settle_owner(&namespace, &job).await?;
            self.advance(request, &mut status, JobState::Waiting, |_| ())
                .await?;
            debug!("deleting previous job");
            api.delete::<Job>(&namespace, K::JOB_NAME).await?;
            if let Some(uid) = job.uid() {
                api.delete_all::<Pod>(&namespace, &pods_of(&uid)).await?;
            }
            k8s::wait_for_deletion::<A, Job>(
                api,
                &namespace,
                K::JOB_NAME,
                job.uid().as_deref(),
                self.shared.timings.job_deletion,
                &self.shared.cancel,
            )
            .await?;
        }

        let job = self.job(
            request,
            K::JOB_NAME,
            &plan,
            Self::credential_env(&creds),
        );
        let artifact_path = plan.artifact_path.clone();
        self.advance(request, &mut status, JobState::Requested, |s| {
            s.artifact_path = artifact_path;
        })
        .await?;
        if api.create(&namespace, &job).await? == Created::AlreadyExists {
            let reason = format!("duplicate request: job {} was created concurrently", K::JOB_NAME);
            return self
                .finish(request, &mut status, JobState::Rejected, Some(reason))
                .await;
        }
        let job: Job = api
            .get(&namespace, K::JOB_NAME)
            .await?
            .ok_or_else(|| Error::NotFound {
                what: format!("job {namespace}/{}", K::JOB_NAME),
            })?;
        info!(job = K::JOB_NAME, "job created");
        self.advance(request, &mut status, JobState::Running, |s| {
            s.started_at = Some(Time(chrono::Utc::now()));
        })
        .await?;
        self.track(request, status, job).await
    }

    /// Records a finished job's outcome on the request that created it, if
    /// that request has not recorded it yet. Once the job is replaced the
    /// outcome is gone.
    async fn settle_owner(&self, namespace: &str, job: &Job) -> Result<(), Error> {
        let (Some(outcome), Some(uid)) = (
            job_outcome(job),
            job.annotations().get(REQUEST_UID_ANNOTATION),
        ) else {
            return Ok(());
        };
        let requests: Vec<K::Request> = self.shared.api.list(namespace, "").await?;
        let Some(owner) = requests
            .into_iter()
            .find(|r| r.uid().as_deref() == Some(uid.as_str()))
        else {
            return Ok(());
        };
        let mut status = K::status(&owner);
        if status.state.is_terminal() {
            return Ok(());
        }
        debug!(owner = %owner.name_any(), "recording outcome of the job being replaced");
        if status.state != JobState::Running {
            self.advance(&owner, &mut status, JobState::Running, |_| ())
                .await?;
        }
        let (state, error) = outcome.into_state();
        self.finish(&owner, &mut status, state, error).await
    }

    /// Polls the job until it finishes and records the outcome.
    async fn track(
        &self,
        request: &K::Request,
        mut status: JobStatus,
        job: Job,
    ) -> Result<(), Error> {
        let api = &*self.shared.api;
        let namespace = request.namespace_or_default();
        let job_uid = job.uid();
        let outcome = self
            .shared
            .timings
            .job
            .until(&self.shared.cancel, || {
                let (namespace, job_uid) = (&namespace, &job_uid);
                async move {
                    let job: Option<Job> = api.get(namespace, K::JOB_NAME).await?;
                    trace!(found = job.is_some(), "polled job");
                    Ok::<_, Error>(match job {
                        Some(job) if job.uid() == *job_uid => job_outcome(&job),
                        _ => Some(JobOutcome::Vanished),
                    })
                }
            })
            .await;
        match outcome {
            Ok(JobOutcome::Vanished) => {
                // A request started after this job finished records this
                // request's outcome before replacing the job.
                let latest: Option<K::Request> = api.get(&namespace, &request.name_any()).await?;
                if latest.is_some_and(|r| K::status(&r).state.is_terminal()) {
                    debug!("job replaced after its outcome was recorded");
                } else {
                    let (state, error) = JobOutcome::Vanished.into_state();
                    self.finish(request, &mut status, state, error).await?
                }
            }
            Ok(outcome) => {
                let (state, error) = outcome.into_state();
                self.finish(request, &mut status, state, error).await?
            }
            Err(WaitError::TimedOut(after)) => {
                let error = format!(
                    "job did not finish within {}",
                    humantime::format_duration(after)
                );
                self.finish(request, &mut status, JobState::Error, Some(error))
                    .await?
            }
            Err(WaitError::Cancelled) => return Err(Error::Shutdown),
            Err(WaitError::Failed(e)) => return Err(e),
        }
        if let Some(job_uid) = job_uid {
            self.watch_deletion(request, job_uid);
        }
        Ok(())
    }

    /// Spawns a task that deletes the job's pods once the job itself is
    /// deleted. Deleting a Job does not always take its pods with it.
    fn watch_deletion(&self, request: &K::Request, job_uid: String) {
        let key = request.uid().unwrap_or_else(|| display_name(request));
        let mut watchers = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
        watchers.retain(|_, handle| !handle.is_finished());
        if watchers.contains_key(&key) {
            return;
        }
        if watchers.len() >= MAX_DELETION_WATCHERS {
            warn!("too many jobs awaiting deletion, leaving pods to the garbage collector");
            return;
        }
        let api = std::sync::Arc::clone(&self.shared.api);
        let cancel = self.shared.cancel.clone();
        let poll = self.shared.timings.cleanup_watch;
        let namespace = request.namespace_or_default();
        let handle = task::spawn(
            || format!("{} job deletion watcher for {key}", K::KIND),
            async move {
                let deleted = k8s::wait_for_deletion::<A, Job>(
                    &*api,
                    &namespace,
                    K::JOB_NAME,
                    Some(&job_uid),
                    poll,
                    &cancel,
                )
                .await;
                match deleted {
                    Ok(()) => match api.delete_all::<Pod>(&namespace, &pods_of(&job_uid)).await {
                        Ok(()) => debug!(%job_uid, "deleted pods of deleted job"),
                        Err(e) => warn!(%job_uid, "deleting pods of deleted job: {e}"),
                    },
                    Err(e) => debug!(%job_uid, "stopped watching job: {}", e.display_with_causes()),
                }
            },
        )
        .abort_on_drop();
        watchers.insert(key, handle);
    }

    /// Removes an artifact with a short-lived job that mounts its storage.
    async fn remove_artifact(
        &self,
        request: &K::Request,
        volume: StorageVolume,
        path: String,
    ) -> Result<(), Error> {
        let api = &*self.shared.api;
        let namespace = request.namespace_or_default();
        let uid = request.uid().unwrap_or_default();
        let name = format!(
            "{}-cleanup-{}",
            K::JOB_NAME,
            uid.get(..8).unwrap_or(&uid)
        );
        let plan = JobPlan {
            volume: Some(volume),
            backup_filename: path,
            working_dir: None,
            artifact_path: None,
            script: r#"rm -f "$BACKUP_FILENAME""#.into(),
        };
        api.create(&namespace, &self.job(request, &name, &plan, vec![]))
            .await?;
        let outcome = self
            .shared
            .timings
            .job_deletion
            .until(&self.shared.cancel, || {
                let (namespace, name) = (&namespace, &name);
                async move {
                    let job: Option<Job> = api.get(namespace, name).await?;
                    Ok::<_, Error>(match job {
                        Some(job) => job_outcome(&job),
                        None => Some(JobOutcome::Vanished),
                    })
                }
            })
            .await
            .map_err(|e| Error::from_wait(e, format!("job {namespace}/{name} to finish")));
        let job: Option<Job> = api.get(&namespace, &name).await?;
        api.delete::<Job>(&namespace, &name).await?;
        if let Some(uid) = job.and_then(|j| j.uid()) {
            api.delete_all::<Pod>(&namespace, &pods_of(&uid)).await?;
        }
        match outcome? {
            JobOutcome::Succeeded => Ok(()),
            JobOutcome::Failed(message) => Err(Error::Exec { pod: name, message }),
            JobOutcome::Vanished => Err(Error::NotFound {
                what: format!("job {namespace}/{name}"),
            }),
        }
    }
}

impl<A: ClusterApi, K: JobKind> JobOrchestrator<A, K> {
    /// Advances a request as far as it can go in one pass.
    pub async fn reconcile(&self, request: &K::Request) -> Result<Option<Action>, Error> {
        let status = K::status(request);
        if status.state.is_terminal() {
            trace!(state = %status.state, "request already finished");
            return Ok(None);
        }
        let api = &*self.shared.api;
        let existing: Option<Job> = api.get(&request.namespace_or_default(), K::JOB_NAME).await?;
        let uid = request.uid();
        let owned = existing
            .as_ref()
            .is_some_and(|job| owned_by(job, uid.as_deref()));

        match (status.state, existing) {
            // Also covers a job created just before the operator stopped,
            // whose request never got past `requested`.
            (_, Some(job)) if owned => {
                info!(state = %status.state, "resuming job tracking");
                let mut status = status;
                if status.state != JobState::Running {
                    self.advance(request, &mut status, JobState::Running, |s| {
                        s.started_at = Some(Time(chrono::Utc::now()));
                    })
                    .await?;
                }
                self.track(request, status, job).await?;
            }
            (JobState::Running, _) => {
                let mut status = status;
                let error = "job disappeared while running".to_owned();
                self.finish(request, &mut status, JobState::Error, Some(error))
                    .await?;
            }
            (_, existing) => self.start(request, status, existing).await?,
        }
        Ok(None)
    }

    /// Releases the job and artifact of a request that is being deleted.
    pub async fn finalize(&self, request: &K::Request) -> Result<Option<Action>, Error> {
        let api = &*self.shared.api;
        let namespace = request.namespace_or_default();
        if let Some(uid) = request.uid() {
            self.watchers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&uid);
        }
        let job: Option<Job> = api.get(&namespace, K::JOB_NAME).await?;
        if let Some(job) = job.filter(|j| owned_by(j, request.uid().as_deref())) {
            debug!("deleting job of deleted request");
            api.delete::<Job>(&namespace, K::JOB_NAME).await?;
            if let Some(uid) = job.uid() {
                api.delete_all::<Pod>(&namespace, &pods_of(&uid)).await?;
            }
        }
        if let Some((volume, path)) = K::artifact(request) {
            match self.remove_artifact(request, volume, path.clone()).await {
                Ok(()) => info!(artifact = %path, "removed artifact"),
                Err(e) => warn!(
                    artifact = %path,
                    "failed to remove artifact: {}",
                    e.display_with_causes()
                ),
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl<A: ClusterApi, K: JobKind> k8s_controller::Context for JobOrchestrator<A, K> {
    type Resource = K::Request;
    type Error = Error;

    const FINALIZER_NAME: &'static str = K::FINALIZER_NAME;

    #[instrument(skip_all, fields(request = %display_name(request), kind = K::KIND))]
    async fn apply(
        &self,
        _client: Client,
        request: &Self::Resource,
    ) -> Result<Option<Action>, Self::Error> {
        let result = self
            .shared
            .metrics
            .observe_reconcile(K::KIND, self.reconcile(request))
            .await;
        requeue_conflicts(result)
    }

    #[instrument(skip_all, fields(request = %display_name(request), kind = K::KIND))]
    async fn cleanup(
        &self,
        _client: Client,
        request: &Self::Resource,
    ) -> Result<Option<Action>, Self::Error> {
        self.shared
            .metrics
            .observe_reconcile(K::KIND, self.finalize(request))
            .await
    }
}
