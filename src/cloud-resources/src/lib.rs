// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Kubernetes resources managed by the Citus operator: the custom resource
//! definitions, the naming conventions shared by everything that addresses a
//! cluster, and the resolved credentials handed to jobs and node clients.

use std::fmt;

pub mod crd;
pub mod naming;

/// The effective admin identity of a cluster and the address of its
/// coordinator.
///
/// Produced by the cluster controller and consumed, read-only, by the
/// backup and restore orchestrators.
#[derive(Clone, PartialEq, Eq)]
pub struct ClusterCredentials {
    /// The coordinator's address, `<cluster>-0.<cluster>-headless.<namespace>`.
    pub host: String,
    /// The SQL port.
    pub port: u16,
    /// The admin user name.
    pub admin_user: String,
    /// The admin password.
    pub admin_password: String,
}

impl fmt::Debug for ClusterCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterCredentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("admin_user", &self.admin_user)
            .field("admin_password", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_password() {
        let creds = ClusterCredentials {
            host: "citus-0.citus-headless.default".into(),
            port: 5432,
            admin_user: "postgres".into(),
            admin_password: "hunter2".into(),
        };
        let debug = format!("{creds:?}");
        assert!(debug.contains("citus-0.citus-headless.default"));
        assert!(!debug.contains("hunter2"));
    }
}
