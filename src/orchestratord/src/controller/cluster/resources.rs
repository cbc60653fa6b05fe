// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The Kubernetes objects that make up a cluster.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, ExecAction, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Probe, ResourceRequirements, Secret,
    SecretKeySelector, Service, ServicePort, ServiceSpec, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use maplit::btreemap;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use citus_cloud_resources::crd::cluster::v1alpha1::CitusCluster;
use citus_cloud_resources::crd::{ManagedResource, SecretKeyRef};
use citus_cloud_resources::naming::{
    ADMIN_SECRET_NAME, ADMIN_SECRET_PASSWORD_KEY, ADMIN_SECRET_USERNAME_KEY, DEFAULT_ADMIN_USER,
    ENV_ADMIN_PASSWORD, ENV_ADMIN_USER, POSTGRES_PORT,
};
use citus_ore::cli::{key_value_map, KeyValueArg};

/// The name of the database container in every node pod.
pub const CONTAINER_NAME: &str = "citus";
/// Where backup storage is mounted in node pods and jobs.
pub const BACKUP_MOUNT_PATH: &str = "/backup";
const DATA_MOUNT_PATH: &str = "/var/lib/postgresql/data";

#[derive(Debug, Clone, clap::Parser)]
pub struct ClusterArgs {
    /// The node image used when a cluster does not override it.
    #[clap(long, env = "CITUS_IMAGE", default_value = "citusdata/citus:12.1")]
    pub cluster_image: String,
    #[clap(long = "cluster-node-selector", value_name = "KEY=VALUE")]
    pub cluster_node_selector: Vec<KeyValueArg<String, String>>,
    #[clap(long, env = "CITUS_NODE_CPU_REQUEST")]
    pub cluster_cpu_request: Option<String>,
    #[clap(long, env = "CITUS_NODE_MEMORY_REQUEST")]
    pub cluster_memory_request: Option<String>,
    #[clap(long, env = "CITUS_NODE_MEMORY_LIMIT")]
    pub cluster_memory_limit: Option<String>,
    /// Size of each node's data volume. Without it, data lives in the pod's
    /// ephemeral storage.
    #[clap(long, env = "CITUS_NODE_STORAGE_SIZE")]
    pub cluster_storage_size: Option<String>,
    #[clap(long, env = "CITUS_NODE_STORAGE_CLASS")]
    pub cluster_storage_class: Option<String>,
}

impl Default for ClusterArgs {
    fn default() -> Self {
        ClusterArgs {
            cluster_image: "citusdata/citus:12.1".into(),
            cluster_node_selector: vec![],
            cluster_cpu_request: None,
            cluster_memory_request: None,
            cluster_memory_limit: None,
            cluster_storage_size: None,
            cluster_storage_class: None,
        }
    }
}

impl ClusterArgs {
    fn resources(&self) -> Option<ResourceRequirements> {
        let requests: BTreeMap<_, _> = [
            ("cpu", &self.cluster_cpu_request),
            ("memory", &self.cluster_memory_request),
        ]
        .into_iter()
        .filter_map(|(k, v)| Some((k.to_owned(), Quantity(v.clone()?))))
        .collect();
        let limits: BTreeMap<_, _> = self
            .cluster_memory_limit
            .iter()
            .map(|v| ("memory".to_owned(), Quantity(v.clone())))
            .collect();
        if requests.is_empty() && limits.is_empty() {
            return None;
        }
        Some(ResourceRequirements {
            requests: Some(requests).filter(|r| !r.is_empty()),
            limits: Some(limits).filter(|l| !l.is_empty()),
            ..Default::default()
        })
    }
}

/// Where one admin environment variable takes its value from.
#[derive(Clone, PartialEq, Eq)]
pub enum EnvSource {
    Literal(String),
    Secret(SecretKeyRef),
}

impl std::fmt::Debug for EnvSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvSource::Literal(_) => f.write_str("Literal(<redacted>)"),
            EnvSource::Secret(r) => f.debug_tuple("Secret").field(r).finish(),
        }
    }
}

impl EnvSource {
    fn default_secret(key: &str) -> EnvSource {
        EnvSource::Secret(SecretKeyRef {
            name: ADMIN_SECRET_NAME.into(),
            key: key.into(),
        })
    }

    pub fn to_env_var(&self, name: &str) -> EnvVar {
        match self {
            EnvSource::Literal(value) => EnvVar {
                name: name.into(),
                value: Some(value.clone()),
                value_from: None,
            },
            EnvSource::Secret(r) => EnvVar {
                name: name.into(),
                value: None,
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: r.name.clone().into(),
                        key: r.key.clone(),
                        optional: None,
                    }),
                    ..Default::default()
                }),
            },
        }
    }

    /// Reads the source back out of a pod template variable.
    pub fn from_env_var(var: &EnvVar) -> Option<EnvSource> {
        if let Some(value) = &var.value {
            return Some(EnvSource::Literal(value.clone()));
        }
        let selector = var.value_from.as_ref()?.secret_key_ref.as_ref()?;
        Some(EnvSource::Secret(SecretKeyRef {
            name: selector.name.clone(),
            key: selector.key.clone(),
        }))
    }
}

/// The admin identity as wired into the pod template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminEnv {
    pub user: EnvSource,
    pub password: EnvSource,
}

impl AdminEnv {
    /// The sources the definition asks for. Unset fields fall back to the
    /// namespace's default admin secret.
    pub fn desired(cluster: &CitusCluster) -> AdminEnv {
        let user = match cluster.admin_user() {
            Some(user) => EnvSource::Literal(user.to_owned()),
            None => EnvSource::default_secret(ADMIN_SECRET_USERNAME_KEY),
        };
        let password = match &cluster.spec.password {
            Some(p) => match (&p.value, &p.secret_ref) {
                (Some(value), _) => EnvSource::Literal(value.clone()),
                (None, Some(r)) => EnvSource::Secret(r.clone()),
                (None, None) => EnvSource::default_secret(ADMIN_SECRET_PASSWORD_KEY),
            },
            None => EnvSource::default_secret(ADMIN_SECRET_PASSWORD_KEY),
        };
        AdminEnv { user, password }
    }

    pub fn to_env_vars(&self) -> Vec<EnvVar> {
        vec![
            self.user.to_env_var(ENV_ADMIN_USER),
            self.password.to_env_var(ENV_ADMIN_PASSWORD),
        ]
    }

    /// Replaces the admin variables of `env`, keeping everything else.
    pub fn apply_to(&self, env: &mut Vec<EnvVar>) {
        env.retain(|v| v.name != ENV_ADMIN_USER && v.name != ENV_ADMIN_PASSWORD);
        env.extend(self.to_env_vars());
    }
}

/// The database container of a workload.
pub fn database_container(workload: &StatefulSet) -> Option<&Container> {
    workload
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == CONTAINER_NAME)
}

pub fn generate_password() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

/// The default admin secret. Existing secrets are never overwritten, so the
/// generated password only matters the first time.
pub fn admin_secret(cluster: &CitusCluster) -> Secret {
    let username = cluster.admin_user().unwrap_or(DEFAULT_ADMIN_USER).to_owned();
    let password = cluster
        .spec
        .password
        .as_ref()
        .and_then(|p| p.value.clone())
        .unwrap_or_else(generate_password);
    Secret {
        metadata: cluster.managed_resource_meta(ADMIN_SECRET_NAME.to_owned()),
        string_data: Some(btreemap! {
            ADMIN_SECRET_USERNAME_KEY.to_owned() => username,
            ADMIN_SECRET_PASSWORD_KEY.to_owned() => password,
        }),
        type_: Some("Opaque".into()),
        ..Default::default()
    }
}

fn pod_labels(cluster: &CitusCluster) -> BTreeMap<String, String> {
    btreemap! {
        "citus.cloud/cluster".to_owned() => cluster.name_unchecked(),
        "app".to_owned() => "citus".to_owned(),
    }
}

pub fn statefulset(cluster: &CitusCluster, args: &ClusterArgs) -> StatefulSet {
    let mut env = AdminEnv::desired(cluster).to_env_vars();
    env.push(EnvVar {
        name: "PGDATA".into(),
        value: Some(format!("{DATA_MOUNT_PATH}/pgdata")),
        value_from: None,
    });

    let mut volume_mounts = vec![];
    let mut volumes = vec![];
    if let Some(storage) = &cluster.spec.backup_storage {
        volumes.push(storage.to_volume("backup"));
        volume_mounts.push(VolumeMount {
            name: "backup".into(),
            mount_path: BACKUP_MOUNT_PATH.into(),
            ..Default::default()
        });
    }
    let volume_claim_templates = args.cluster_storage_size.as_ref().map(|size| {
        volume_mounts.push(VolumeMount {
            name: "data".into(),
            mount_path: DATA_MOUNT_PATH.into(),
            ..Default::default()
        });
        vec![PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("data".into()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".into()]),
                storage_class_name: args.cluster_storage_class.clone(),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(btreemap! {"storage".to_owned() => Quantity(size.clone())}),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]
    });

    let readiness_probe = Probe {
        exec: Some(ExecAction {
            command: Some(vec![
                "sh".into(),
                "-c".into(),
                format!("pg_isready -U \"${ENV_ADMIN_USER}\" -p {POSTGRES_PORT}"),
            ]),
        }),
        period_seconds: Some(5),
        failure_threshold: Some(3),
        ..Default::default()
    };

    let container = Container {
        name: CONTAINER_NAME.into(),
        image: Some(
            cluster
                .spec
                .image
                .clone()
                .unwrap_or_else(|| args.cluster_image.clone()),
        ),
        env: Some(env),
        ports: Some(vec![ContainerPort {
            container_port: POSTGRES_PORT.into(),
            name: Some("postgres".into()),
            protocol: Some("TCP".into()),
            ..Default::default()
        }]),
        readiness_probe: Some(readiness_probe),
        resources: args.resources(),
        volume_mounts: Some(volume_mounts),
        ..Default::default()
    };

    let labels = pod_labels(cluster);
    StatefulSet {
        metadata: cluster.managed_resource_meta(cluster.statefulset_name()),
        spec: Some(StatefulSetSpec {
            replicas: Some(cluster.spec.replicas),
            service_name: cluster.headless_service_name(),
            pod_management_policy: Some("OrderedReady".into()),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    node_selector: Some(key_value_map(&args.cluster_node_selector))
                        .filter(|s| !s.is_empty()),
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            volume_claim_templates,
            ..Default::default()
        }),
        status: None,
    }
}

pub fn headless_service(cluster: &CitusCluster) -> Service {
    Service {
        metadata: cluster.managed_resource_meta(cluster.headless_service_name()),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".into()),
            publish_not_ready_addresses: Some(true),
            selector: Some(pod_labels(cluster)),
            ports: Some(vec![ServicePort {
                name: Some("postgres".into()),
                protocol: Some("TCP".into()),
                port: POSTGRES_PORT.into(),
                target_port: Some(IntOrString::Int(POSTGRES_PORT.into())),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use citus_cloud_resources::crd::StorageVolume;
    use k8s_openapi::api::core::v1::HostPathVolumeSource;

    use super::*;

    fn cluster(spec: serde_json::Value) -> CitusCluster {
        let mut cluster = CitusCluster::new("citus", serde_json::from_value(spec).unwrap());
        cluster.metadata.namespace = Some("db".into());
        cluster.metadata.uid = Some("c-1".into());
        cluster
    }

    #[test]
    fn desired_env_falls_back_to_the_default_secret() {
        let env = AdminEnv::desired(&cluster(serde_json::json!({})));
        assert_eq!(env.user, EnvSource::default_secret("username"));
        assert_eq!(env.password, EnvSource::default_secret("password"));

        let env = AdminEnv::desired(&cluster(serde_json::json!({
            "adminUser": "alice",
            "password": {"secretRef": {"name": "pw", "key": "k"}},
        })));
        assert_eq!(env.user, EnvSource::Literal("alice".into()));
        assert_eq!(
            env.password,
            EnvSource::Secret(SecretKeyRef {
                name: "pw".into(),
                key: "k".into()
            })
        );
    }

    #[test]
    fn env_vars_round_trip_through_the_pod_template() {
        for source in [
            EnvSource::Literal("s3cret".into()),
            EnvSource::default_secret("password"),
        ] {
            let var = source.to_env_var(ENV_ADMIN_PASSWORD);
            assert_eq!(EnvSource::from_env_var(&var), Some(source));
        }
    }

    #[test]
    fn generated_passwords() {
        let a = generate_password();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, generate_password());
    }

    #[test]
    fn admin_secret_uses_definition_values() {
        let secret = admin_secret(&cluster(serde_json::json!({
            "adminUser": "alice",
            "password": {"value": "pw"},
        })));
        let data = secret.string_data.unwrap();
        assert_eq!(data["username"], "alice");
        assert_eq!(data["password"], "pw");
        assert_eq!(secret.metadata.name.as_deref(), Some(ADMIN_SECRET_NAME));

        let data = admin_secret(&cluster(serde_json::json!({})))
            .string_data
            .unwrap();
        assert_eq!(data["username"], DEFAULT_ADMIN_USER);
        assert_eq!(data["password"].len(), 32);
    }

    #[test]
    fn statefulset_wiring() {
        let mut c = cluster(serde_json::json!({"replicas": 3, "image": "citus:custom"}));
        c.spec.backup_storage = Some(StorageVolume {
            host_path: Some(HostPathVolumeSource {
                path: "/mnt/backups".into(),
                type_: None,
            }),
            persistent_volume_claim: None,
        });
        let args = ClusterArgs {
            cluster_node_selector: vec!["pool=db".parse().unwrap()],
            cluster_memory_request: Some("1Gi".into()),
            ..Default::default()
        };
        let sts = statefulset(&c, &args);
        let spec = sts.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(3));
        assert_eq!(spec.service_name, "citus-headless");
        let pod = spec.template.spec.as_ref().unwrap();
        assert_eq!(pod.node_selector.as_ref().unwrap()["pool"], "db");
        assert_eq!(pod.volumes.as_ref().unwrap()[0].name, "backup");
        let container = database_container(&sts).unwrap();
        assert_eq!(container.image.as_deref(), Some("citus:custom"));
        let env = container.env.as_ref().unwrap();
        assert!(env.iter().any(|v| v.name == ENV_ADMIN_USER));
        assert!(env.iter().any(|v| v.name == ENV_ADMIN_PASSWORD));
        assert_eq!(
            container.volume_mounts.as_ref().unwrap()[0].mount_path,
            BACKUP_MOUNT_PATH
        );
        assert_eq!(
            container.resources.as_ref().unwrap().requests.as_ref().unwrap()["memory"],
            Quantity("1Gi".into())
        );
        assert!(spec.volume_claim_templates.is_none());
    }

    #[test]
    fn admin_env_replacement_keeps_other_variables() {
        let mut env = vec![
            EnvVar {
                name: "PGDATA".into(),
                value: Some("/data".into()),
                value_from: None,
            },
            EnvSource::Literal("old".into()).to_env_var(ENV_ADMIN_PASSWORD),
        ];
        let desired = AdminEnv {
            user: EnvSource::Literal("postgres".into()),
            password: EnvSource::Literal("new".into()),
        };
        desired.apply_to(&mut env);
        assert_eq!(env.len(), 3);
        assert_eq!(env[0].name, "PGDATA");
        let password = env.iter().find(|v| v.name == ENV_ADMIN_PASSWORD).unwrap();
        assert_eq!(password.value.as_deref(), Some("new"));
    }

    #[test]
    fn headless_service_publishes_unready_pods() {
        let svc = headless_service(&cluster(serde_json::json!({})));
        let spec = svc.spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        assert_eq!(spec.publish_not_ready_addresses, Some(true));
        assert_eq!(svc.metadata.name.as_deref(), Some("citus-headless"));
    }
}
