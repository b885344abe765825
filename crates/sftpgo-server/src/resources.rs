//! Desired child objects for an SftpGoServer
//!
//! Builds the ConfigMap, optional PVC, Deployment and Service as plain
//! values. Each carries a controller owner reference to the server and a
//! desired-hash annotation computed over everything else the controller
//! sets, so the apply step can skip writes when nothing changed.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Affinity, ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource,
    EnvVar, EnvVarSource, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, Probe, ResourceRequirements,
    SecretKeySelector, Service, ServicePort, ServiceSpec, TCPSocketAction, Toleration, Volume,
    VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};
use serde::Serialize;

use sftpgo_common::crd::{SftpGoServer, SftpGoServerSpec};
use sftpgo_common::defaults::ServerSettings;
use sftpgo_common::kube_utils::{deterministic_hash, stamp_desired_hash};
use sftpgo_common::{Error, CONFIG_HASH_ANNOTATION};

use crate::config::{render_config, CONFIG_KEY};

/// Directory the ConfigMap is mounted at
pub const CONFIG_DIR: &str = "/etc/sftpgo";
/// Name of the SFTPGo container
pub const CONTAINER_NAME: &str = "sftpgo";
/// Admin secret key holding the username
pub const ADMIN_USERNAME_KEY: &str = "username";
/// Admin secret key holding the password
pub const ADMIN_PASSWORD_KEY: &str = "password";

/// Everything the server controller applies, recomputed every pass
#[derive(Clone, Debug)]
pub struct DesiredChildSet {
    /// `{name}` with `sftpgo.json`
    pub config_map: ConfigMap,
    /// `{name}-data`, only when a data volume is requested
    pub pvc: Option<PersistentVolumeClaim>,
    /// `{name}`
    pub deployment: Deployment,
    /// `{name}`
    pub service: Service,
    /// Hash of the rendered `sftpgo.json`
    pub config_hash: String,
}

/// Name of the data PVC for a server
pub fn pvc_name(server_name: &str) -> String {
    format!("{server_name}-data")
}

/// Pod and selector labels
pub fn selector_labels(server_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), "sftpgo".to_string()),
        ("controller".to_string(), server_name.to_string()),
    ])
}

/// Build the full child set for a server
pub fn build_children(
    server: &SftpGoServer,
    settings: &ServerSettings,
) -> Result<DesiredChildSet, Error> {
    let name = server.name_any();
    let namespace = server
        .namespace()
        .ok_or_else(|| Error::validation_for(&name, "SftpGoServer has no namespace"))?;
    let owner = server
        .controller_owner_ref(&())
        .ok_or_else(|| Error::internal_with_context("build_children", "SftpGoServer has no UID"))?;

    let config = render_config(&server.spec, settings)?;
    let config_hash = deterministic_hash(&config);

    let base = |object_name: String| ObjectMeta {
        name: Some(object_name),
        namespace: Some(namespace.clone()),
        labels: Some(selector_labels(&name)),
        owner_references: Some(vec![owner.clone()]),
        ..Default::default()
    };

    let config_map = ConfigMap {
        metadata: base(name.clone()),
        data: Some(BTreeMap::from([(CONFIG_KEY.to_string(), config)])),
        ..Default::default()
    };

    let pvc = settings.volume.as_ref().map(|v| PersistentVolumeClaim {
        metadata: base(pvc_name(&name)),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            // Unset lets the cluster default storage class apply
            storage_class_name: v.storage_class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(v.size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    });

    let deployment = build_deployment(
        &name,
        &server.spec,
        settings,
        &config_hash,
        base(name.clone()),
    )?;

    let service = Service {
        metadata: base(name.clone()),
        spec: Some(ServiceSpec {
            selector: Some(selector_labels(&name)),
            ports: Some(
                named_ports(settings)
                    .into_iter()
                    .map(|(port_name, port)| ServicePort {
                        name: Some(port_name.to_string()),
                        port,
                        target_port: Some(IntOrString::Int(port)),
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    };

    Ok(DesiredChildSet {
        config_map: stamped(config_map)?,
        pvc: pvc.map(stamped).transpose()?,
        deployment: stamped(deployment)?,
        service: stamped(service)?,
        config_hash,
    })
}

/// Ports exposed by container and Service, in a fixed order
pub fn named_ports(settings: &ServerSettings) -> Vec<(&'static str, i32)> {
    let mut ports = Vec::with_capacity(4);
    if settings.sftp_enabled {
        ports.push(("sftp", settings.sftp_port));
    }
    ports.push(("web", settings.web_port));
    if let Some(p) = settings.ftp_port {
        ports.push(("ftp", p));
    }
    if let Some(p) = settings.webdav_port {
        ports.push(("webdav", p));
    }
    ports
}

fn stamped<K>(mut obj: K) -> Result<K, Error>
where
    K: Resource + Serialize,
    <K as Resource>::DynamicType: Default,
{
    let content = serde_json::to_string(&obj)
        .map_err(|e| Error::serialization_for(K::kind(&Default::default()), e.to_string()))?;
    stamp_desired_hash(obj.meta_mut(), &content);
    Ok(obj)
}

fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn quantities(map: &BTreeMap<String, String>) -> Option<BTreeMap<String, Quantity>> {
    (!map.is_empty()).then(|| {
        map.iter()
            .map(|(k, v)| (k.clone(), Quantity(v.clone())))
            .collect()
    })
}

fn build_deployment(
    name: &str,
    spec: &SftpGoServerSpec,
    settings: &ServerSettings,
    config_hash: &str,
    metadata: ObjectMeta,
) -> Result<Deployment, Error> {
    let mut env = Vec::new();
    if let Some(secret) = &settings.admin_secret {
        env.push(secret_env("SFTPGO_DEFAULT_ADMIN_USERNAME", secret, ADMIN_USERNAME_KEY));
        env.push(secret_env("SFTPGO_DEFAULT_ADMIN_PASSWORD", secret, ADMIN_PASSWORD_KEY));
    }
    if settings.storage_backend.is_external() {
        if let Some(pw) = spec.database.as_ref().and_then(|d| d.password_secret.as_ref()) {
            env.push(secret_env("SFTPGO_DATA_PROVIDER__PASSWORD", &pw.name, &pw.key));
        }
    }

    let data_volume = match &settings.volume {
        Some(_) => Volume {
            name: "data".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: pvc_name(name),
                read_only: None,
            }),
            ..Default::default()
        },
        None => Volume {
            name: "data".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
    };
    let volumes = vec![
        Volume {
            name: "config".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: name.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        },
        data_volume,
    ];

    let resources = spec.resources.as_ref().and_then(|r| {
        let limits = quantities(&r.limits);
        let requests = quantities(&r.requests);
        (limits.is_some() || requests.is_some()).then_some(ResourceRequirements {
            limits,
            requests,
            ..Default::default()
        })
    });

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(settings.image.clone()),
        image_pull_policy: settings.image_pull_policy.clone(),
        args: Some(
            ["sftpgo", "serve", "--config-file", "/etc/sftpgo/sftpgo.json"]
                .map(String::from)
                .to_vec(),
        ),
        ports: Some(
            named_ports(settings)
                .into_iter()
                .map(|(port_name, port)| ContainerPort {
                    name: Some(port_name.to_string()),
                    container_port: port,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                })
                .collect(),
        ),
        env: (!env.is_empty()).then_some(env),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "config".to_string(),
                mount_path: CONFIG_DIR.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "data".to_string(),
                mount_path: settings.mount_path.clone(),
                ..Default::default()
            },
        ]),
        readiness_probe: Some(Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::Int(settings.web_port),
                ..Default::default()
            }),
            period_seconds: Some(10),
            ..Default::default()
        }),
        resources,
        ..Default::default()
    };

    let tolerations: Vec<Toleration> = spec
        .tolerations
        .iter()
        .map(|t| Toleration {
            key: t.key.clone(),
            operator: t.operator.clone(),
            value: t.value.clone(),
            effect: t.effect.clone(),
            toleration_seconds: t.toleration_seconds,
        })
        .collect();

    let affinity = spec
        .affinity
        .clone()
        .map(serde_json::from_value::<Affinity>)
        .transpose()
        .map_err(|e| Error::validation_for_field(name, "spec.affinity", e.to_string()))?;

    let labels = selector_labels(name);
    Ok(Deployment {
        metadata,
        spec: Some(DeploymentSpec {
            replicas: Some(settings.replicas),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(BTreeMap::from([(
                        CONFIG_HASH_ANNOTATION.to_string(),
                        config_hash.to_string(),
                    )])),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(volumes),
                    service_account_name: spec.service_account.clone().filter(|s| !s.is_empty()),
                    node_selector: (!spec.node_selector.is_empty())
                        .then(|| spec.node_selector.clone()),
                    tolerations: (!tolerations.is_empty()).then_some(tolerations),
                    affinity,
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sftpgo_common::crd::{
        DatabaseConfig, FtpConfig, LocalObjectRef, ResourceRequirements as SpecResources,
        SecretKeyRef, SftpGoConfig, StorageBackend, VolumeConfig,
    };
    use sftpgo_common::kube_utils::desired_hash;

    fn server(spec: SftpGoServerSpec) -> SftpGoServer {
        let mut s = SftpGoServer::new("sftp", spec);
        s.metadata.namespace = Some("files".to_string());
        s.metadata.uid = Some("uid-1".to_string());
        s
    }

    fn build(spec: SftpGoServerSpec) -> DesiredChildSet {
        let s = server(spec);
        build_children(&s, &ServerSettings::from_spec(&s.spec)).unwrap()
    }

    fn container(set: &DesiredChildSet) -> &Container {
        &set.deployment.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0]
    }

    #[test]
    fn minimal_server_gets_default_children() {
        let set = build(SftpGoServerSpec::default());

        assert!(set.pvc.is_none());
        assert_eq!(set.config_map.metadata.name.as_deref(), Some("sftp"));
        assert!(set.config_map.data.as_ref().unwrap().contains_key("sftpgo.json"));

        let c = container(&set);
        assert_eq!(c.image.as_deref(), Some("docker.io/drakkan/sftpgo:latest"));
        assert_eq!(
            c.args.as_ref().unwrap(),
            &vec!["sftpgo", "serve", "--config-file", "/etc/sftpgo/sftpgo.json"]
        );
        let ports: Vec<i32> = c.ports.as_ref().unwrap().iter().map(|p| p.container_port).collect();
        assert_eq!(ports, vec![2022, 8080]);
        assert!(c.env.is_none());

        let svc = set.service.spec.as_ref().unwrap();
        assert_eq!(svc.selector.as_ref(), Some(&selector_labels("sftp")));
        assert_eq!(svc.ports.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn every_child_is_owned_and_hashed() {
        let set = build(SftpGoServerSpec {
            data_volume: Some(VolumeConfig::default()),
            ..Default::default()
        });
        let metas = [
            &set.config_map.metadata,
            &set.pvc.as_ref().unwrap().metadata,
            &set.deployment.metadata,
            &set.service.metadata,
        ];
        for meta in metas {
            let owner = &meta.owner_references.as_ref().unwrap()[0];
            assert_eq!(owner.kind, "SftpGoServer");
            assert_eq!(owner.controller, Some(true));
            assert!(desired_hash(meta).is_some());
        }
    }

    #[test]
    fn hashes_are_deterministic_and_track_changes() {
        let a = build(SftpGoServerSpec::default());
        let b = build(SftpGoServerSpec::default());
        assert_eq!(a.config_hash, b.config_hash);
        assert_eq!(
            desired_hash(&a.deployment.metadata),
            desired_hash(&b.deployment.metadata)
        );

        let c = build(SftpGoServerSpec {
            sftp_port: Some(2200),
            ..Default::default()
        });
        assert_ne!(a.config_hash, c.config_hash);
        assert_ne!(
            desired_hash(&a.deployment.metadata),
            desired_hash(&c.deployment.metadata)
        );
    }

    #[test]
    fn pod_template_carries_config_hash() {
        let set = build(SftpGoServerSpec::default());
        let template = &set.deployment.spec.as_ref().unwrap().template;
        let annotations = template.metadata.as_ref().unwrap().annotations.as_ref().unwrap();
        assert_eq!(annotations.get(CONFIG_HASH_ANNOTATION), Some(&set.config_hash));
    }

    #[test]
    fn pvc_uses_defaults_and_omits_unset_storage_class() {
        let set = build(SftpGoServerSpec {
            data_volume: Some(VolumeConfig {
                mount_path: Some("/data".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        });
        let pvc = set.pvc.clone().unwrap();
        assert_eq!(pvc.metadata.name.as_deref(), Some("sftp-data"));
        let spec = pvc.spec.unwrap();
        assert_eq!(spec.storage_class_name, None);
        assert_eq!(
            spec.resources.unwrap().requests.unwrap().get("storage"),
            Some(&Quantity("10Gi".to_string()))
        );

        let c = container(&set);
        let data = &c.volume_mounts.as_ref().unwrap()[1];
        assert_eq!(data.mount_path, "/data");
    }

    #[test]
    fn secrets_are_injected_as_env_vars() {
        let set = build(SftpGoServerSpec {
            admin_secret_ref: Some(LocalObjectRef {
                name: "admin".to_string(),
            }),
            storage_backend: Some(StorageBackend::Mysql),
            database: Some(DatabaseConfig {
                host: "mysql".to_string(),
                password_secret: Some(SecretKeyRef {
                    name: "db".to_string(),
                    key: "pw".to_string(),
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
        let env = container(&set).env.clone().unwrap();
        let names: Vec<&str> = env.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "SFTPGO_DEFAULT_ADMIN_USERNAME",
                "SFTPGO_DEFAULT_ADMIN_PASSWORD",
                "SFTPGO_DATA_PROVIDER__PASSWORD"
            ]
        );
        let db = env[2].value_from.as_ref().unwrap().secret_key_ref.as_ref().unwrap();
        assert_eq!(db.name, "db");
        assert_eq!(db.key, "pw");
    }

    #[test]
    fn ftp_adds_container_and_service_ports() {
        let set = build(SftpGoServerSpec {
            config: SftpGoConfig {
                ftp: Some(FtpConfig {
                    enabled: true,
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        });
        let ports = set.service.spec.unwrap().ports.unwrap();
        let names: Vec<String> = ports.into_iter().filter_map(|p| p.name).collect();
        assert_eq!(names, vec!["sftp", "web", "ftp"]);
    }

    #[test]
    fn resources_and_scheduling_pass_through() {
        let set = build(SftpGoServerSpec {
            resources: Some(SpecResources {
                limits: BTreeMap::from([("memory".to_string(), "512Mi".to_string())]),
                ..Default::default()
            }),
            node_selector: BTreeMap::from([("disk".to_string(), "ssd".to_string())]),
            affinity: Some(serde_json::json!({"nodeAffinity": {}})),
            service_account: Some("sftpgo".to_string()),
            ..Default::default()
        });
        let pod = set.deployment.spec.as_ref().unwrap().template.spec.clone().unwrap();
        assert_eq!(pod.service_account_name.as_deref(), Some("sftpgo"));
        assert!(pod.affinity.unwrap().node_affinity.is_some());
        assert_eq!(pod.node_selector.unwrap().get("disk").map(String::as_str), Some("ssd"));
        let limits = pod.containers[0].resources.clone().unwrap().limits.unwrap();
        assert_eq!(limits.get("memory"), Some(&Quantity("512Mi".to_string())));
    }

    #[test]
    fn server_without_uid_is_an_internal_error() {
        let mut s = server(SftpGoServerSpec::default());
        s.metadata.uid = None;
        let err = build_children(&s, &ServerSettings::from_spec(&s.spec)).unwrap_err();
        assert!(matches!(err, Error::Internal { .. }));
    }
}
