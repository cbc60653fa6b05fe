// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Operator metrics, served in the Prometheus text format.

use std::future::Future;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone)]
pub struct Metrics {
    pub reconciles: IntCounterVec,
    pub reconcile_duration: HistogramVec,
    pub credential_rotations: IntCounter,
    pub workers_registered: IntCounter,
    pub rebalances: IntCounter,
    pub job_outcomes: IntCounterVec,
}

impl Metrics {
    pub fn register_into(registry: &Registry) -> Result<Metrics, prometheus::Error> {
        let metrics = Metrics {
            reconciles: IntCounterVec::new(
                Opts::new(
                    "citus_operator_reconciles_total",
                    "Reconcile passes, by controller and result.",
                ),
                &["controller", "result"],
            )?,
            reconcile_duration: HistogramVec::new(
                HistogramOpts::new(
                    "citus_operator_reconcile_duration_seconds",
                    "Time spent in a reconcile pass.",
                )
                .buckets(vec![0.01, 0.1, 1.0, 10.0, 60.0, 600.0, 3600.0]),
                &["controller"],
            )?,
            credential_rotations: IntCounter::new(
                "citus_operator_credential_rotations_total",
                "Admin credential rotations completed on every node.",
            )?,
            workers_registered: IntCounter::new(
                "citus_operator_workers_registered_total",
                "Worker registrations issued during scale-up.",
            )?,
            rebalances: IntCounter::new(
                "citus_operator_rebalances_total",
                "Shard rebalances issued during scale-up.",
            )?,
            job_outcomes: IntCounterVec::new(
                Opts::new(
                    "citus_operator_job_outcomes_total",
                    "Backup and restore requests reaching a terminal state.",
                ),
                &["kind", "state"],
            )?,
        };
        registry.register(Box::new(metrics.reconciles.clone()))?;
        registry.register(Box::new(metrics.reconcile_duration.clone()))?;
        registry.register(Box::new(metrics.credential_rotations.clone()))?;
        registry.register(Box::new(metrics.workers_registered.clone()))?;
        registry.register(Box::new(metrics.rebalances.clone()))?;
        registry.register(Box::new(metrics.job_outcomes.clone()))?;
        Ok(metrics)
    }

    /// Runs one reconcile pass of `controller`, recording its result and
    /// how long it took.
    pub async fn observe_reconcile<T, E>(
        &self,
        controller: &str,
        pass: impl Future<Output = Result<T, E>>,
    ) -> Result<T, E> {
        let start = Instant::now();
        let result = pass.await;
        self.record_reconcile(controller, result.is_ok(), start.elapsed());
        result
    }

    pub fn record_reconcile(&self, controller: &str, ok: bool, elapsed: Duration) {
        let result = if ok { "success" } else { "error" };
        self.reconciles
            .with_label_values(&[controller, result])
            .inc();
        self.reconcile_duration
            .with_label_values(&[controller])
            .observe(elapsed.as_secs_f64());
    }
}

async fn handle_metrics(State(registry): State<Registry>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    match encoder.encode(&registry.gather(), &mut buf) {
        Ok(()) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, encoder.format_type().to_owned())],
            buf,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain".to_owned())],
            e.to_string().into_bytes(),
        ),
    }
}

pub fn router(registry: Registry) -> Router {
    Router::new()
        .route("/metrics", get(handle_metrics))
        .with_state(registry)
}

/// Serves `/metrics` on `addr` until `cancel` fires.
pub async fn serve(
    addr: SocketAddr,
    registry: Registry,
    cancel: CancellationToken,
) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "serving metrics");
    axum::serve(listener, router(registry))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
}
