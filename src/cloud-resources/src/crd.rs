// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Custom resource definitions in the `citus.cloud` API group.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    HostPathVolumeSource, PersistentVolumeClaimVolumeSource, Volume,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod backup;
pub mod cluster;
pub mod database;

/// The label every object created by the operator carries.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
/// The value of [`MANAGED_BY_LABEL`].
pub const MANAGED_BY: &str = "citus-operator";

/// A custom resource that owns the Kubernetes objects created on its behalf.
pub trait ManagedResource: Resource<DynamicType = ()> + Sized {
    /// Labels attached to every object created for this resource.
    fn default_labels(&self) -> BTreeMap<String, String>;

    /// The namespace of this resource. Only namespaced resources are managed.
    fn namespace_or_default(&self) -> String {
        self.meta()
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_owned())
    }

    /// Metadata for an object named `name`, owned by this resource so that
    /// Kubernetes garbage collects it when this resource goes away.
    fn managed_resource_meta(&self, name: String) -> ObjectMeta {
        ObjectMeta {
            namespace: Some(self.namespace_or_default()),
            name: Some(name),
            labels: Some(self.default_labels()),
            owner_references: Some(self.controller_owner_ref(&()).into_iter().collect()),
            ..Default::default()
        }
    }
}

/// A reference to one key of a secret in the same namespace.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct SecretKeyRef {
    /// The name of the secret.
    pub name: String,
    /// The key within the secret.
    pub key: String,
}

/// Storage mounted into the cluster's pods and the backup/restore jobs.
///
/// Exactly one source should be set.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageVolume {
    /// A directory on the node.
    pub host_path: Option<HostPathVolumeSource>,
    /// A persistent volume claim.
    pub persistent_volume_claim: Option<PersistentVolumeClaimVolumeSource>,
}

impl StorageVolume {
    /// The pod volume named `name` backed by this storage.
    pub fn to_volume(&self, name: &str) -> Volume {
        Volume {
            name: name.to_owned(),
            host_path: self.host_path.clone(),
            persistent_volume_claim: self.persistent_volume_claim.clone(),
            ..Default::default()
        }
    }
}

/// Builds a condition stamped with the current time.
pub fn condition(
    type_: &str,
    status: bool,
    reason: &str,
    message: String,
    observed_generation: Option<i64>,
) -> Condition {
    Condition {
        type_: type_.into(),
        status: if status { "True" } else { "False" }.into(),
        last_transition_time: Time(chrono::offset::Utc::now()),
        message,
        observed_generation,
        reason: reason.into(),
    }
}

/// Reports whether `conditions` already carries an equivalent condition, so
/// status writes can be skipped when nothing changed.
pub fn has_condition(conditions: &[Condition], other: &Condition) -> bool {
    conditions.iter().any(|c| {
        c.type_ == other.type_
            && c.status == other.status
            && c.reason == other.reason
            && c.message == other.message
            && c.observed_generation == other.observed_generation
    })
}

/// The name of a resource, for log fields.
pub fn display_name<R: Resource>(r: &R) -> String {
    match r.meta().namespace.as_deref() {
        Some(ns) => format!("{ns}/{}", r.name_any()),
        None => r.name_any(),
    }
}

#[cfg(test)]
mod tests {
    use kube::CustomResourceExt;

    use super::backup::v1alpha1::{BackupRequest, RestoreRequest};
    use super::cluster::v1alpha1::CitusCluster;
    use super::database::v1alpha1::DatabaseRequest;
    use super::*;

    #[test]
    fn crd_names() {
        assert_eq!(
            CitusCluster::crd().metadata.name.as_deref(),
            Some("citusclusters.citus.cloud")
        );
        assert_eq!(
            DatabaseRequest::crd().metadata.name.as_deref(),
            Some("databaserequests.citus.cloud")
        );
        assert_eq!(
            BackupRequest::crd().metadata.name.as_deref(),
            Some("backuprequests.citus.cloud")
        );
        assert_eq!(
            RestoreRequest::crd().metadata.name.as_deref(),
            Some("restorerequests.citus.cloud")
        );
    }

    #[test]
    fn condition_equivalence_ignores_time() {
        let a = condition("Ready", true, "Established", "ok".into(), Some(1));
        let b = condition("Ready", true, "Established", "ok".into(), Some(1));
        assert!(has_condition(&[a.clone()], &b));
        let c = condition("Ready", false, "Established", "ok".into(), Some(1));
        assert!(!has_condition(&[a], &c));
    }

    #[test]
    fn storage_volume_keeps_source() {
        let storage = StorageVolume {
            host_path: Some(HostPathVolumeSource {
                path: "/data/backups".into(),
                type_: None,
            }),
            persistent_volume_claim: None,
        };
        let volume = storage.to_volume("backup");
        assert_eq!(volume.name, "backup");
        assert_eq!(volume.host_path.unwrap().path, "/data/backups");
    }
}
