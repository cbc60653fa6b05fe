// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use k8s_controller::Controller;
use kube::runtime::watcher;
use prometheus::Registry;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use citus_cloud_resources::crd::database::v1alpha1::DatabaseRequest;
use citus_ore::cli;
use citus_ore::display::ErrorExt;
use citus_ore::task;
use citus_ore::tracing::{LogFormat, TracingConfig};
use citus_orchestratord::controller::backup::Backup;
use citus_orchestratord::controller::cluster::resources::ClusterArgs;
use citus_orchestratord::controller::cluster::ClusterContext;
use citus_orchestratord::controller::job::{JobArgs, JobOrchestrator};
use citus_orchestratord::controller::restore::Restore;
use citus_orchestratord::controller::{Shared, TimingArgs};
use citus_orchestratord::k8s::{self, KubeApi};
use citus_orchestratord::metrics::{self, Metrics};
use citus_postgres_util::PostgresConnector;

#[derive(Debug, clap::Parser)]
#[clap(about = "Kubernetes operator for Citus clusters")]
struct Args {
    /// Which log messages to emit, as `tracing` filter directives.
    #[clap(long, env = "CITUS_LOG_FILTER", default_value = "info")]
    log_filter: String,
    #[clap(long, env = "CITUS_LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,
    #[clap(long, env = "CITUS_METRICS_LISTEN_ADDR", default_value = "0.0.0.0:3100")]
    metrics_listen_addr: SocketAddr,
    /// Only watch this namespace. Watches every namespace by default.
    #[clap(long, env = "CITUS_NAMESPACE")]
    namespace: Option<String>,
    /// How long to keep retrying a node connection that fails for reasons
    /// other than rejected credentials.
    #[clap(
        long,
        env = "CITUS_NODE_CONNECT_TIMEOUT",
        value_parser = humantime::parse_duration,
        default_value = "1m"
    )]
    node_connect_timeout: Duration,

    #[clap(flatten)]
    cluster: ClusterArgs,
    #[clap(flatten)]
    jobs: JobArgs,
    #[clap(flatten)]
    timings: TimingArgs,
}

#[tokio::main]
async fn main() {
    let args: Args = cli::parse_args();
    if let Err(err) = run(args).await {
        panic!("orchestratord: fatal: {}", err.display_with_causes());
    }
}

/// Cancels `cancel` on the first SIGINT or SIGTERM.
fn shutdown_on_signal(cancel: CancellationToken) -> Result<(), anyhow::Error> {
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    task::spawn(
        || "signal handler",
        async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                _ = sigterm.recv() => info!("received SIGTERM"),
            }
            cancel.cancel();
        },
    );
    Ok(())
}

async fn run(args: Args) -> Result<(), anyhow::Error> {
    citus_ore::tracing::configure(TracingConfig::new(
        "orchestratord",
        &args.log_filter,
        args.log_format,
    )?)?;

    let client = kube::Client::try_default()
        .await
        .context("connecting to the Kubernetes API")?;

    let cancel = CancellationToken::new();
    shutdown_on_signal(cancel.clone())?;

    let registry = Registry::new();
    let metrics = Metrics::register_into(&registry)?;
    let metrics_server = task::spawn(|| "metrics server", {
        let (addr, cancel) = (args.metrics_listen_addr, cancel.clone());
        async move {
            if let Err(e) = metrics::serve(addr, registry, cancel).await {
                warn!("metrics server failed: {e}");
            }
        }
    });

    let requests = k8s::make_reflector::<DatabaseRequest>(client.clone()).await;
    let shared = Shared::new(
        KubeApi::new(client.clone()),
        Arc::new(PostgresConnector::new(args.node_connect_timeout)),
        args.timings.timings(),
        metrics.clone(),
        cancel.clone(),
    );

    // Builds a controller scoped to `--namespace`, or to every namespace.
    macro_rules! controller {
        ($context:expr) => {
            match args.namespace.as_deref() {
                Some(ns) => {
                    Controller::namespaced(client.clone(), $context, ns, watcher::Config::default())
                }
                None => Controller::namespaced_all(client.clone(), $context, watcher::Config::default()),
            }
        };
    }
    let clusters = controller!(ClusterContext::new(
        shared.clone(),
        args.cluster.clone(),
        Arc::new(requests),
    ));
    let backups = controller!(JobOrchestrator::<_, Backup>::new(shared.clone(), args.jobs.clone()));
    let restores = controller!(JobOrchestrator::<_, Restore>::new(shared, args.jobs.clone()));

    info!(
        namespace = args.namespace.as_deref().unwrap_or("*"),
        "starting controllers"
    );
    tokio::select! {
        _ = futures::future::join3(clusters.run(), backups.run(), restores.run()) => {
            warn!("controllers stopped unexpectedly");
        }
        _ = cancel.cancelled() => info!("stopping controllers"),
    }

    cancel.cancel();
    metrics_server.await?;
    info!("shut down");
    Ok(())
}
