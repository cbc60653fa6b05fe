// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A SQL client for the nodes of a Citus cluster.
//!
//! The operator talks to every node as the cluster's admin user. All
//! statements issued through [`NodeClient`] are idempotent so that a
//! multi-node operation which failed halfway can be retried from the first
//! node.

use std::time::Duration;

use tokio_postgres::error::SqlState;

pub mod memory;
pub mod node;
pub mod sql;

pub use node::{NodeClient, NodeConnector, PostgresConnector};

/// The database every node has, used before switching to a tenant database.
pub const MAINTENANCE_DATABASE: &str = "postgres";

/// An error talking to a node.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// The node rejected the credentials.
    #[error("authentication failed for user {user:?} on {host}")]
    AuthenticationFailed { host: String, user: String },
    /// Any other error from the underlying connection.
    #[error(transparent)]
    Postgres(#[from] tokio_postgres::Error),
    /// The node could not be reached.
    #[error("node {host} unavailable: {message}")]
    Unavailable { host: String, message: String },
    /// A statement failed on a reachable node.
    #[error("statement failed on {host}: {message}")]
    Statement { host: String, message: String },
}

impl NodeError {
    /// Reports whether the node rejected the credentials, as opposed to
    /// being unreachable or failing a statement.
    pub fn is_auth_failure(&self) -> bool {
        match self {
            NodeError::AuthenticationFailed { .. } => true,
            NodeError::Postgres(e) => matches!(
                e.code(),
                Some(&SqlState::INVALID_PASSWORD)
                    | Some(&SqlState::INVALID_AUTHORIZATION_SPECIFICATION)
            ),
            NodeError::Unavailable { .. } | NodeError::Statement { .. } => false,
        }
    }
}

/// How to reach one node.
#[derive(Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub connect_timeout: Duration,
}

impl NodeConfig {
    /// A configuration for the maintenance database of `host`.
    pub fn new(host: String, port: u16, user: String, password: String) -> NodeConfig {
        NodeConfig {
            host,
            port,
            user,
            password,
            database: MAINTENANCE_DATABASE.to_owned(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// The same node and identity, another database.
    pub fn with_database(&self, database: &str) -> NodeConfig {
        NodeConfig {
            database: database.to_owned(),
            ..self.clone()
        }
    }

    /// The same node and database, another identity.
    pub fn with_credentials(&self, user: &str, password: &str) -> NodeConfig {
        NodeConfig {
            user: user.to_owned(),
            password: password.to_owned(),
            ..self.clone()
        }
    }

    pub(crate) fn to_postgres(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .user(&self.user)
            .password(&self.password)
            .dbname(&self.database)
            .application_name("citus-operator")
            .connect_timeout(self.connect_timeout);
        config
    }
}

impl std::fmt::Debug for NodeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("database", &self.database)
            .finish_non_exhaustive()
    }
}
