// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! An in-memory stand-in for a set of nodes, for testing code that drives
//! multi-node protocols.
//!
//! Nodes authenticate against the roles they hold, so credential rotation
//! can be observed end to end, and every cluster-level operation is appended
//! to an event log so that tests can assert on ordering.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::node::{NodeClient, NodeConnector};
use crate::{NodeConfig, NodeError, MAINTENANCE_DATABASE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Role {
    pub password: Option<String>,
    pub superuser: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Database {
    pub owner: String,
    pub extensions: BTreeSet<String>,
    pub workers: BTreeSet<(String, u16)>,
    pub coordinator: Option<(String, u16)>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryNode {
    pub up: bool,
    pub roles: BTreeMap<String, Role>,
    pub databases: BTreeMap<String, Database>,
    pub reloads: usize,
}

/// A cluster-level operation, as observed by the node it ran on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    WorkerAdded {
        node: String,
        database: String,
        worker: String,
    },
    Rebalanced {
        node: String,
        database: String,
    },
    ScriptRun {
        node: String,
        database: String,
        script: String,
    },
    DatabaseDropped {
        node: String,
        database: String,
    },
}

#[derive(Debug, Default)]
struct State {
    nodes: BTreeMap<String, MemoryNode>,
    events: Vec<NodeEvent>,
}

/// A set of in-memory nodes keyed by host name.
#[derive(Debug, Clone, Default)]
pub struct MemoryCluster {
    state: Arc<Mutex<State>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Starts a node whose only role is the superuser `admin_user`.
    pub fn add_node(&self, host: &str, admin_user: &str, admin_password: &str) {
        let node = MemoryNode {
            up: true,
            roles: BTreeMap::from([(
                admin_user.to_owned(),
                Role {
                    password: Some(admin_password.to_owned()),
                    superuser: true,
                },
            )]),
            databases: BTreeMap::from([(
                MAINTENANCE_DATABASE.to_owned(),
                Database {
                    owner: admin_user.to_owned(),
                    ..Default::default()
                },
            )]),
            reloads: 0,
        };
        self.lock().nodes.insert(host.to_owned(), node);
    }

    pub fn set_up(&self, host: &str, up: bool) {
        if let Some(node) = self.lock().nodes.get_mut(host) {
            node.up = up;
        }
    }

    pub fn node(&self, host: &str) -> Option<MemoryNode> {
        self.lock().nodes.get(host).cloned()
    }

    pub fn events(&self) -> Vec<NodeEvent> {
        self.lock().events.clone()
    }

    /// Reports whether `host` would let `user` log in with `password`.
    pub fn accepts(&self, host: &str, user: &str, password: &str) -> bool {
        self.lock()
            .nodes
            .get(host)
            .and_then(|n| n.roles.get(user))
            .is_some_and(|r| r.password.as_deref() == Some(password))
    }
}

#[async_trait]
impl NodeConnector for MemoryCluster {
    async fn connect(&self, config: &NodeConfig) -> Result<Box<dyn NodeClient>, NodeError> {
        {
            let state = self.lock();
            let node = live_node(&state, &config.host)?;
            let authenticated = node
                .roles
                .get(&config.user)
                .is_some_and(|r| r.password.as_deref() == Some(config.password.as_str()));
            if !authenticated {
                return Err(NodeError::AuthenticationFailed {
                    host: config.host.clone(),
                    user: config.user.clone(),
                });
            }
            if !node.databases.contains_key(&config.database) {
                return Err(statement_error(
                    &config.host,
                    format!("database {:?} does not exist", config.database),
                ));
            }
        }
        Ok(Box::new(MemoryClient {
            cluster: self.clone(),
            config: config.clone(),
        }))
    }
}

fn live_node<'a>(state: &'a State, host: &str) -> Result<&'a MemoryNode, NodeError> {
    match state.nodes.get(host) {
        Some(node) if node.up => Ok(node),
        Some(_) => Err(NodeError::Unavailable {
            host: host.to_owned(),
            message: "connection refused".into(),
        }),
        None => Err(NodeError::Unavailable {
            host: host.to_owned(),
            message: "no such host".into(),
        }),
    }
}

fn statement_error(host: &str, message: String) -> NodeError {
    NodeError::Statement {
        host: host.to_owned(),
        message,
    }
}

struct MemoryClient {
    cluster: MemoryCluster,
    config: NodeConfig,
}

impl MemoryClient {
    /// Runs `f` against this client's node, failing if the node went down.
    fn with_node<T>(
        &self,
        f: impl FnOnce(&mut MemoryNode, &mut Vec<NodeEvent>) -> Result<T, String>,
    ) -> Result<T, NodeError> {
        let mut state = self.cluster.lock();
        live_node(&state, &self.config.host)?;
        let State { nodes, events } = &mut *state;
        let node = nodes
            .get_mut(&self.config.host)
            .ok_or_else(|| statement_error(&self.config.host, "node vanished".into()))?;
        f(node, events).map_err(|message| statement_error(&self.config.host, message))
    }

    fn with_database<T>(
        &self,
        f: impl FnOnce(&mut Database, &mut Vec<NodeEvent>) -> T,
    ) -> Result<T, NodeError> {
        let database = self.config.database.clone();
        self.with_node(|node, events| {
            let db = node
                .databases
                .get_mut(&database)
                .ok_or_else(|| format!("database {database:?} does not exist"))?;
            Ok(f(db, events))
        })
    }
}

#[async_trait]
impl NodeClient for MemoryClient {
    fn config(&self) -> &NodeConfig {
        &self.config
    }

    async fn use_database(&mut self, database: &str) -> Result<(), NodeError> {
        let config = self.config.with_database(database);
        self.cluster.connect(&config).await?;
        self.config = config;
        Ok(())
    }

    async fn ensure_role(
        &mut self,
        name: &str,
        password: Option<&str>,
        superuser: bool,
    ) -> Result<(), NodeError> {
        self.with_node(|node, _| {
            node.roles.insert(
                name.to_owned(),
                Role {
                    password: password.map(str::to_owned),
                    superuser,
                },
            );
            Ok(())
        })
    }

    async fn revoke_superuser(&mut self, name: &str) -> Result<(), NodeError> {
        self.with_node(|node, _| {
            if let Some(role) = node.roles.get_mut(name) {
                role.superuser = false;
            }
            Ok(())
        })
    }

    async fn ensure_database(&mut self, name: &str, owner: &str) -> Result<(), NodeError> {
        self.with_node(|node, _| {
            if !node.roles.contains_key(owner) {
                return Err(format!("role {owner:?} does not exist"));
            }
            node.databases.entry(name.to_owned()).or_insert_with(|| Database {
                owner: owner.to_owned(),
                ..Default::default()
            });
            Ok(())
        })
    }

    async fn drop_database(&mut self, name: &str) -> Result<(), NodeError> {
        if name == self.config.database {
            return Err(statement_error(
                &self.config.host,
                "cannot drop the currently open database".into(),
            ));
        }
        let host = self.config.host.clone();
        self.with_node(|node, events| {
            if node.databases.remove(name).is_some() {
                events.push(NodeEvent::DatabaseDropped {
                    node: host,
                    database: name.to_owned(),
                });
            }
            Ok(())
        })
    }

    async fn create_extension(&mut self, name: &str) -> Result<(), NodeError> {
        self.with_database(|db, _| {
            db.extensions.insert(name.to_owned());
        })
    }

    async fn set_coordinator_host(&mut self, host: &str, port: u16) -> Result<(), NodeError> {
        self.with_database(|db, _| db.coordinator = Some((host.to_owned(), port)))
    }

    async fn add_worker(&mut self, host: &str, port: u16) -> Result<(), NodeError> {
        let node = self.config.host.clone();
        let database = self.config.database.clone();
        self.with_database(|db, events| {
            if db.workers.insert((host.to_owned(), port)) {
                events.push(NodeEvent::WorkerAdded {
                    node,
                    database,
                    worker: host.to_owned(),
                });
            }
        })
    }

    async fn rebalance(&mut self) -> Result<(), NodeError> {
        let node = self.config.host.clone();
        let database = self.config.database.clone();
        self.with_database(|_, events| events.push(NodeEvent::Rebalanced { node, database }))
    }

    async fn run_script(&mut self, script: &str) -> Result<(), NodeError> {
        let node = self.config.host.clone();
        let database = self.config.database.clone();
        self.with_database(|_, events| {
            events.push(NodeEvent::ScriptRun {
                node,
                database,
                script: script.to_owned(),
            })
        })
    }

    async fn reload_config(&mut self) -> Result<(), NodeError> {
        self.with_node(|node, _| {
            node.reloads += 1;
            Ok(())
        })
    }
}
