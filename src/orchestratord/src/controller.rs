// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::sync::Arc;
use std::time::Duration;

use citus_ore::wait::Poll;
use citus_postgres_util::NodeConnector;
use kube::runtime::controller::Action;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::k8s::ClusterApi;
use crate::metrics::Metrics;
use crate::Error;

pub mod backup;
pub mod cluster;
pub mod job;
pub mod restore;

const CONFLICT_REQUEUE: Duration = Duration::from_secs(1);

/// Turns a pass that lost a write race into a prompt retry, which will see
/// the newer version of the object.
pub(crate) fn requeue_conflicts(
    result: Result<Option<Action>, Error>,
) -> Result<Option<Action>, Error> {
    match result {
        Err(e) if e.is_conflict() => {
            debug!("write conflict, requeueing: {e}");
            Ok(Some(Action::requeue(CONFLICT_REQUEUE)))
        }
        res => res,
    }
}

#[derive(Debug, Clone, clap::Parser)]
pub struct TimingArgs {
    /// How long to wait for a node's pod to become ready.
    #[clap(
        long,
        env = "CITUS_POD_READY_TIMEOUT",
        value_parser = humantime::parse_duration,
        default_value = "10m"
    )]
    pub pod_ready_timeout: Duration,
    /// Pause after a pod becomes ready before connecting to it, so that the
    /// server has finished starting up behind the readiness probe.
    #[clap(
        long,
        env = "CITUS_NODE_SETTLE_DELAY",
        value_parser = humantime::parse_duration,
        default_value = "5s"
    )]
    pub node_settle_delay: Duration,
    #[clap(
        long,
        env = "CITUS_JOB_POLL_INTERVAL",
        value_parser = humantime::parse_duration,
        default_value = "5s"
    )]
    pub job_poll_interval: Duration,
    #[clap(
        long,
        env = "CITUS_JOB_TIMEOUT",
        value_parser = humantime::parse_duration,
        default_value = "1h"
    )]
    pub job_timeout: Duration,
    /// How long to wait for a finished job to go away before starting the
    /// next one.
    #[clap(
        long,
        env = "CITUS_JOB_DELETION_TIMEOUT",
        value_parser = humantime::parse_duration,
        default_value = "1m"
    )]
    pub job_deletion_timeout: Duration,
    /// How long a finished job is watched for deletion before its pods are
    /// left to the garbage collector.
    #[clap(
        long,
        env = "CITUS_JOB_CLEANUP_WATCH_TIMEOUT",
        value_parser = humantime::parse_duration,
        default_value = "24h"
    )]
    pub job_cleanup_watch_timeout: Duration,
}

impl TimingArgs {
    pub fn timings(&self) -> Timings {
        Timings {
            pod_ready: Poll::new(Duration::from_secs(1), self.pod_ready_timeout),
            settle: self.node_settle_delay,
            job: Poll::new(self.job_poll_interval, self.job_timeout),
            job_deletion: Poll::new(Duration::from_secs(1), self.job_deletion_timeout),
            cleanup_watch: Poll::new(Duration::from_secs(10), self.job_cleanup_watch_timeout),
        }
    }
}

/// Polling schedules for every blocking wait the controllers perform.
#[derive(Debug, Clone, Copy)]
pub struct Timings {
    pub pod_ready: Poll,
    pub settle: Duration,
    pub job: Poll,
    pub job_deletion: Poll,
    pub cleanup_watch: Poll,
}

#[cfg(test)]
impl Timings {
    pub(crate) fn fast() -> Timings {
        let poll = Poll::new(Duration::from_millis(10), Duration::from_secs(5));
        Timings {
            pod_ready: poll,
            settle: Duration::ZERO,
            job: poll,
            job_deletion: poll,
            cleanup_watch: poll,
        }
    }
}

/// What every controller shares: the API server, the nodes, the metrics and
/// the shutdown signal.
pub struct Shared<A> {
    pub api: Arc<A>,
    pub nodes: Arc<dyn NodeConnector>,
    pub timings: Timings,
    pub metrics: Metrics,
    pub cancel: CancellationToken,
}

impl<A> Clone for Shared<A> {
    fn clone(&self) -> Self {
        Shared {
            api: Arc::clone(&self.api),
            nodes: Arc::clone(&self.nodes),
            timings: self.timings,
            metrics: self.metrics.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<A: ClusterApi> Shared<A> {
    pub fn new(
        api: A,
        nodes: Arc<dyn NodeConnector>,
        timings: Timings,
        metrics: Metrics,
        cancel: CancellationToken,
    ) -> Self {
        Shared {
            api: Arc::new(api),
            nodes,
            timings,
            metrics,
            cancel,
        }
    }
}
