// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Connections to individual nodes.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, trace, warn};

use citus_ore::retry::Retry;
use citus_ore::task;

use crate::{sql, NodeConfig, NodeError};

/// Opens connections to nodes.
#[async_trait]
pub trait NodeConnector: Debug + Send + Sync + 'static {
    /// Connects to the node and database described by `config`.
    async fn connect(&self, config: &NodeConfig) -> Result<Box<dyn NodeClient>, NodeError>;
}

/// A connection to one node, bound to one database at a time.
///
/// Every operation is idempotent: repeating it against a node where it
/// already took effect succeeds without changing anything.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// The node, identity and database this client is connected with.
    fn config(&self) -> &NodeConfig;

    /// Reconnects to `database` on the same node with the same identity.
    async fn use_database(&mut self, database: &str) -> Result<(), NodeError>;

    /// Creates the login role `name`, or updates its password and superuser
    /// flag if it exists.
    async fn ensure_role(
        &mut self,
        name: &str,
        password: Option<&str>,
        superuser: bool,
    ) -> Result<(), NodeError>;

    /// Removes the superuser attribute from `name`, if the role exists.
    async fn revoke_superuser(&mut self, name: &str) -> Result<(), NodeError>;

    /// Creates database `name` owned by `owner` unless it exists.
    async fn ensure_database(&mut self, name: &str, owner: &str) -> Result<(), NodeError>;

    /// Terminates every other session on database `name`, then drops it.
    async fn drop_database(&mut self, name: &str) -> Result<(), NodeError>;

    /// Enables extension `name` in the current database.
    async fn create_extension(&mut self, name: &str) -> Result<(), NodeError>;

    /// Records the address under which workers reach this node, which acts
    /// as coordinator for the current database.
    async fn set_coordinator_host(&mut self, host: &str, port: u16) -> Result<(), NodeError>;

    /// Registers a worker for the current database. Registering an already
    /// registered worker is a no-op.
    async fn add_worker(&mut self, host: &str, port: u16) -> Result<(), NodeError>;

    /// Redistributes the current database's shards across its workers.
    async fn rebalance(&mut self) -> Result<(), NodeError>;

    /// Runs a tenant-supplied script in the current database.
    async fn run_script(&mut self, script: &str) -> Result<(), NodeError>;

    /// Asks the server to reread its configuration files.
    async fn reload_config(&mut self) -> Result<(), NodeError>;
}

/// Connects with `primary`, trying each of `fallbacks` in turn while the
/// node rejects the credentials offered.
///
/// Used while credentials rotate: a node that already accepted a newer
/// identity in an earlier attempt no longer accepts the old one.
pub async fn connect_with_fallback(
    connector: &dyn NodeConnector,
    primary: &NodeConfig,
    fallbacks: &[NodeConfig],
) -> Result<Box<dyn NodeClient>, NodeError> {
    let mut result = connector.connect(primary).await;
    let mut tried = vec![primary];
    for fallback in fallbacks {
        match &result {
            Err(e) if e.is_auth_failure() => {}
            _ => break,
        }
        if tried.contains(&fallback) {
            continue;
        }
        debug!(
            host = %primary.host,
            "credentials rejected, retrying as {}",
            fallback.user
        );
        result = connector.connect(fallback).await;
        tried.push(fallback);
    }
    result
}

/// Connects to real nodes over the network.
#[derive(Debug, Clone)]
pub struct PostgresConnector {
    max_connect_duration: Duration,
}

impl PostgresConnector {
    /// Connection attempts that fail for reasons other than rejected
    /// credentials are retried for up to `max_connect_duration`.
    pub fn new(max_connect_duration: Duration) -> Self {
        PostgresConnector {
            max_connect_duration,
        }
    }

    async fn connect_client(&self, config: &NodeConfig) -> Result<Client, NodeError> {
        let pg_config = config.to_postgres();
        // Rejected credentials end the loop early by succeeding with an error.
        let outcome = Retry::default()
            .max_duration(self.max_connect_duration)
            .retry_async(|state| {
                let pg_config = pg_config.clone();
                let host = config.host.clone();
                async move {
                    match pg_config.connect(NoTls).await {
                        Ok((client, connection)) => {
                            let name = host.clone();
                            task::spawn(
                                || format!("postgres-connection:{name}"),
                                async move {
                                    if let Err(e) = connection.await {
                                        warn!(host = %host, "postgres connection failed: {e}");
                                    }
                                },
                            );
                            Ok(Ok(client))
                        }
                        Err(e) => {
                            let e = NodeError::from(e);
                            if e.is_auth_failure() {
                                Ok(Err(e))
                            } else {
                                debug!(host = %host, attempt = state.i, "connect failed: {e}");
                                Err(e)
                            }
                        }
                    }
                }
            })
            .await;
        outcome.and_then(|res| res)
    }
}

#[async_trait]
impl NodeConnector for PostgresConnector {
    async fn connect(&self, config: &NodeConfig) -> Result<Box<dyn NodeClient>, NodeError> {
        let client = self.connect_client(config).await?;
        trace!(host = %config.host, database = %config.database, "connected");
        Ok(Box::new(PostgresNode {
            connector: self.clone(),
            config: config.clone(),
            client,
        }))
    }
}

/// A live connection to one node.
struct PostgresNode {
    connector: PostgresConnector,
    config: NodeConfig,
    client: Client,
}

impl PostgresNode {
    async fn exists(&self, query: &str, name: &str) -> Result<bool, NodeError> {
        Ok(self.client.query_opt(query, &[&name]).await?.is_some())
    }

    async fn execute(&self, stmt: &str) -> Result<(), NodeError> {
        trace!(host = %self.config.host, database = %self.config.database, "executing: {stmt}");
        self.client.batch_execute(stmt).await?;
        Ok(())
    }
}

#[async_trait]
impl NodeClient for PostgresNode {
    fn config(&self) -> &NodeConfig {
        &self.config
    }

    async fn use_database(&mut self, database: &str) -> Result<(), NodeError> {
        if self.config.database == database {
            return Ok(());
        }
        let config = self.config.with_database(database);
        self.client = self.connector.connect_client(&config).await?;
        self.config = config;
        Ok(())
    }

    async fn ensure_role(
        &mut self,
        name: &str,
        password: Option<&str>,
        superuser: bool,
    ) -> Result<(), NodeError> {
        let stmt = if self.exists(sql::ROLE_EXISTS, name).await? {
            sql::alter_role(name, password, superuser)
        } else {
            sql::create_role(name, password, superuser)
        };
        // Not traced: the statement carries the password.
        self.client.batch_execute(&stmt).await?;
        Ok(())
    }

    async fn revoke_superuser(&mut self, name: &str) -> Result<(), NodeError> {
        if self.exists(sql::ROLE_EXISTS, name).await? {
            self.execute(&sql::revoke_superuser(name)).await?;
        }
        Ok(())
    }

    async fn ensure_database(&mut self, name: &str, owner: &str) -> Result<(), NodeError> {
        if !self.exists(sql::DATABASE_EXISTS, name).await? {
            self.execute(&sql::create_database(name, owner)).await?;
        }
        Ok(())
    }

    async fn drop_database(&mut self, name: &str) -> Result<(), NodeError> {
        let terminated = self.client.execute(sql::TERMINATE_SESSIONS, &[&name]).await?;
        debug!(host = %self.config.host, database = name, terminated, "terminated sessions");
        self.execute(&sql::drop_database(name)).await
    }

    async fn create_extension(&mut self, name: &str) -> Result<(), NodeError> {
        self.execute(&sql::create_extension(name)).await
    }

    async fn set_coordinator_host(&mut self, host: &str, port: u16) -> Result<(), NodeError> {
        self.client
            .execute(sql::SET_COORDINATOR_HOST, &[&host, &i32::from(port)])
            .await?;
        Ok(())
    }

    async fn add_worker(&mut self, host: &str, port: u16) -> Result<(), NodeError> {
        trace!(coordinator = %self.config.host, worker = host, "registering worker");
        self.client
            .execute(sql::ADD_WORKER, &[&host, &i32::from(port)])
            .await?;
        Ok(())
    }

    async fn rebalance(&mut self) -> Result<(), NodeError> {
        self.client.execute(sql::REBALANCE, &[]).await?;
        Ok(())
    }

    async fn run_script(&mut self, script: &str) -> Result<(), NodeError> {
        self.execute(script).await
    }

    async fn reload_config(&mut self) -> Result<(), NodeError> {
        self.client.execute(sql::RELOAD_CONFIG, &[]).await?;
        Ok(())
    }
}
