// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Statement text for the DDL and DCL the operator issues.
//!
//! Utility statements such as `CREATE ROLE` and `CREATE DATABASE` cannot
//! take bind parameters, so names are quoted with
//! [`escape_identifier`] and passwords with [`escape_literal`]. Statements
//! that can take parameters do, and are plain constants here.

use postgres_protocol::escape::{escape_identifier, escape_literal};

pub const ROLE_EXISTS: &str = "SELECT 1 FROM pg_catalog.pg_roles WHERE rolname = $1";
pub const DATABASE_EXISTS: &str = "SELECT 1 FROM pg_catalog.pg_database WHERE datname = $1";
pub const TERMINATE_SESSIONS: &str = "SELECT pg_terminate_backend(pid) \
     FROM pg_catalog.pg_stat_activity \
     WHERE datname = $1 AND pid <> pg_backend_pid()";
/// Registers a worker. Citus returns the existing node id when the worker is
/// already registered.
pub const ADD_WORKER: &str = "SELECT citus_add_node($1::text, $2::int)";
pub const SET_COORDINATOR_HOST: &str = "SELECT citus_set_coordinator_host($1::text, $2::int)";
pub const REBALANCE: &str = "SELECT rebalance_table_shards()";
pub const RELOAD_CONFIG: &str = "SELECT pg_reload_conf()";

/// The extension that makes a database distributed.
pub const CITUS_EXTENSION: &str = "citus";

fn role_options(password: Option<&str>, superuser: bool) -> String {
    let mut options = String::from("LOGIN");
    options.push_str(if superuser { " SUPERUSER" } else { " NOSUPERUSER" });
    match password {
        Some(password) => {
            options.push_str(" PASSWORD ");
            options.push_str(&escape_literal(password));
        }
        None => options.push_str(" PASSWORD NULL"),
    }
    options
}

pub fn create_role(name: &str, password: Option<&str>, superuser: bool) -> String {
    format!(
        "CREATE ROLE {} WITH {}",
        escape_identifier(name),
        role_options(password, superuser)
    )
}

pub fn alter_role(name: &str, password: Option<&str>, superuser: bool) -> String {
    format!(
        "ALTER ROLE {} WITH {}",
        escape_identifier(name),
        role_options(password, superuser)
    )
}

pub fn revoke_superuser(name: &str) -> String {
    format!("ALTER ROLE {} WITH NOSUPERUSER", escape_identifier(name))
}

pub fn create_database(name: &str, owner: &str) -> String {
    format!(
        "CREATE DATABASE {} OWNER {}",
        escape_identifier(name),
        escape_identifier(owner)
    )
}

pub fn drop_database(name: &str) -> String {
    format!("DROP DATABASE IF EXISTS {}", escape_identifier(name))
}

pub fn create_extension(name: &str) -> String {
    format!("CREATE EXTENSION IF NOT EXISTS {}", escape_identifier(name))
}

/// The `pg_hba.conf` line that lets `host` connect to every database as any
/// user without a password. Used so the coordinator can reach its workers.
pub fn trust_host_rule(host: &str) -> String {
    format!("host all all {host} trust")
}
