// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The Citus operator: reconciles `CitusCluster` objects into running
//! coordinator/worker clusters and drives backup and restore jobs.

use std::time::Duration;

use citus_ore::wait::WaitError;
use citus_postgres_util::NodeError;

pub mod controller;
pub mod k8s;
pub mod metrics;

#[cfg(test)]
mod testing;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Kube(#[from] kube::Error),
    #[error("node {ordinal}: {source}")]
    Node {
        ordinal: i32,
        #[source]
        source: NodeError,
    },
    #[error("scaling down from {current} to {desired} replicas is not supported")]
    ScaleDownUnsupported { current: i32, desired: i32 },
    #[error("secret {name} has no key {key}")]
    MissingSecretKey { name: String, key: String },
    #[error("{what} not found")]
    NotFound { what: String },
    #[error("command in pod {pod} failed: {message}")]
    Exec { pod: String, message: String },
    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },
    #[error("operator is shutting down")]
    Shutdown,
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Converts the outcome of a wait on `what` into an operator error.
    pub fn from_wait(err: WaitError<Error>, what: impl Into<String>) -> Error {
        match err {
            WaitError::TimedOut(after) => Error::Timeout {
                what: what.into(),
                after,
            },
            WaitError::Cancelled => Error::Shutdown,
            WaitError::Failed(e) => e,
        }
    }

    /// Reports whether the error is a write conflict, which resolves itself
    /// once the controller sees the latest version of the object.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 409)
    }
}

/// Attaches the failing ordinal to node errors.
pub(crate) trait NodeResultExt<T> {
    fn on_node(self, ordinal: i32) -> Result<T, Error>;
}

impl<T> NodeResultExt<T> for Result<T, NodeError> {
    fn on_node(self, ordinal: i32) -> Result<T, Error> {
        self.map_err(|source| Error::Node { ordinal, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_errors_map_to_operator_errors() {
        let err = Error::from_wait(WaitError::Cancelled, "pod citus-0");
        assert!(matches!(err, Error::Shutdown));
        let err = Error::from_wait(WaitError::TimedOut(Duration::from_secs(600)), "pod citus-0");
        assert_eq!(err.to_string(), "timed out after 600s waiting for pod citus-0");
    }

    #[test]
    fn node_errors_carry_the_ordinal() {
        let res: Result<(), NodeError> = Err(NodeError::Unavailable {
            host: "citus-2.citus-headless.ns".into(),
            message: "connection refused".into(),
        });
        let err = res.on_node(2).unwrap_err();
        assert!(matches!(err, Error::Node { ordinal: 2, .. }));
        assert!(err.to_string().starts_with("node 2: "));
    }
}
