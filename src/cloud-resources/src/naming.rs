// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Names shared between the operator, the cluster's pods and the batch jobs.
//!
//! Everything here is part of the contract with objects that already exist
//! in running clusters. Changing any of these strings orphans them.

/// The ordinal of the node that acts as coordinator for distributed
/// databases. Every other ordinal is a worker.
pub const COORDINATOR_ORDINAL: i32 = 0;

/// The port every node listens on.
pub const POSTGRES_PORT: u16 = 5432;

/// The per-namespace secret holding the fallback admin identity.
pub const ADMIN_SECRET_NAME: &str = "citus-admin-credentials";
/// The key of the admin user name in [`ADMIN_SECRET_NAME`].
pub const ADMIN_SECRET_USERNAME_KEY: &str = "username";
/// The key of the admin password in [`ADMIN_SECRET_NAME`].
pub const ADMIN_SECRET_PASSWORD_KEY: &str = "password";
/// The admin user used when neither the cluster nor the secret names one.
pub const DEFAULT_ADMIN_USER: &str = "postgres";

/// The environment variable carrying the admin user in the pod template.
pub const ENV_ADMIN_USER: &str = "POSTGRES_USER";
/// The environment variable carrying the admin password in the pod template.
pub const ENV_ADMIN_PASSWORD: &str = "POSTGRES_PASSWORD";

/// The well-known name of the backup job. At most one exists per namespace.
pub const BACKUP_JOB_NAME: &str = "citus-backup";
/// The well-known name of the restore job. At most one exists per namespace.
pub const RESTORE_JOB_NAME: &str = "citus-restore";

/// The physical (in-database) name of a tenant's logical database or user.
///
/// Tenants in different namespaces share one cluster, so names are prefixed
/// with the namespace. Dashes are not valid in unquoted identifiers and are
/// replaced by underscores.
pub fn physical_name(namespace: &str, logical: &str) -> String {
    format!("{namespace}_{logical}").replace('-', "_")
}

/// The name of the headless service that gives each pod a stable address.
pub fn headless_service_name(cluster: &str) -> String {
    format!("{cluster}-headless")
}

/// The name of the pod with the given ordinal.
pub fn pod_name(cluster: &str, ordinal: i32) -> String {
    format!("{cluster}-{ordinal}")
}

/// The DNS address of the node with the given ordinal.
pub fn node_address(cluster: &str, ordinal: i32, namespace: &str) -> String {
    format!(
        "{}.{}.{namespace}",
        pod_name(cluster, ordinal),
        headless_service_name(cluster)
    )
}
