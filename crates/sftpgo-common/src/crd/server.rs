//! SftpGoServer CRD types
//!
//! An `SftpGoServer` describes one SFTPGo deployment: image, ports, protocol
//! settings, the data provider backend and where its data lives. The server
//! controller turns it into a ConfigMap, an optional PVC, a Deployment and a
//! Service, all owned by the SftpGoServer.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    preserve_unknown_object, Condition, LocalObjectRef, Phase, ResourceRequirements, SecretKeyRef,
    Toleration,
};
use crate::Error;

/// Specification for an SFTPGo server deployment
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "sftpgo.sftpgo.io",
    version = "v1alpha1",
    kind = "SftpGoServer",
    plural = "sftpgoservers",
    shortname = "sgs",
    namespaced,
    status = "SftpGoServerStatus",
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".status.replicas"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SftpGoServerSpec {
    /// Container image (defaults to `docker.io/drakkan/sftpgo:latest`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Image pull policy (`Always`, `IfNotPresent`, `Never`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    /// Number of SFTPGo pods (defaults to 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(min = 1))]
    pub replicas: Option<i32>,

    /// Service account the pods run as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,

    /// Protocol and connection settings rendered into sftpgo.json
    #[serde(default)]
    pub config: SftpGoConfig,

    /// SFTP port (defaults to 2022, overridden by `config.sftp.port`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sftp_port: Option<i32>,

    /// Web admin / REST API port (defaults to 8080, overridden by `config.http.port`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_port: Option<i32>,

    /// Persistent volume for SFTPGo data; an emptyDir is used when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_volume: Option<VolumeConfig>,

    /// Data provider backend (defaults to sqlite)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_backend: Option<StorageBackend>,

    /// Connection settings for the mysql and postgres backends
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseConfig>,

    /// Compute resources for the SFTPGo container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Node selector for the pods
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Tolerations for the pods
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,

    /// Pod affinity, passed through as a Kubernetes `Affinity` object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_object")]
    pub affinity: Option<serde_json::Value>,

    /// Secret with `username` and `password` keys for the default admin.
    ///
    /// Required for the user controller to manage users through the REST API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_secret_ref: Option<LocalObjectRef>,
}

/// Protocol sections of the SFTPGo configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct SftpGoConfig {
    /// Settings shared by all protocols
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub common: Option<CommonConfig>,
    /// SFTP service settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sftp: Option<SftpConfig>,
    /// FTP service settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ftp: Option<FtpConfig>,
    /// WebDAV service settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webdav: Option<WebDavConfig>,
    /// HTTP (web admin, web client, REST API) settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpConfig>,
}

/// Settings shared by all protocols
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommonConfig {
    /// Idle timeout in minutes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout: Option<i32>,
    /// 0 standard, 1 atomic, 2 atomic with resume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_mode: Option<i32>,
    /// Maximum concurrent client connections (0 unlimited)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_total_connections: Option<i32>,
    /// Maximum concurrent connections per client host (0 unlimited)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_per_host_connections: Option<i32>,
}

/// SFTP service settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SftpConfig {
    /// Whether the SFTP service is enabled (it is unless set to false)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// SFTP port; takes precedence over `spec.sftpPort` when greater than zero
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    /// Host key file paths inside the container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub host_keys: Vec<String>,
    /// Maximum authentication attempts per connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_auth_tries: Option<i32>,
    /// SSH commands allowed over the SFTP service
    #[serde(
        default,
        rename = "allowedSSHCommands",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub allowed_ssh_commands: Vec<String>,
    /// Allow password authentication (defaults to true)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_authentication: Option<bool>,
    /// Allow keyboard-interactive authentication (defaults to true)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyboard_interactive_auth: Option<bool>,
}

/// FTP service settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FtpConfig {
    /// Enable the FTP service
    #[serde(default)]
    pub enabled: bool,
    /// FTP port (defaults to 2121)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    /// Passive mode data port range
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passive_port_range: Option<PortRange>,
    /// Active mode data port range
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_port_range: Option<PortRange>,
}

/// Inclusive port range
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct PortRange {
    /// First port of the range
    pub start: i32,
    /// Last port of the range
    pub end: i32,
}

/// WebDAV service settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WebDavConfig {
    /// Enable the WebDAV service
    #[serde(default)]
    pub enabled: bool,
    /// WebDAV port (defaults to 10080)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    /// Serve WebDAV over HTTPS
    #[serde(default, rename = "enableHTTPS")]
    pub enable_https: bool,
    /// Certificate path inside the container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_file: Option<String>,
    /// Certificate key path inside the container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_key_file: Option<String>,
}

/// HTTP service settings (web admin, web client, REST API)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpConfig {
    /// Kept for compatibility; the HTTP service is always enabled because the
    /// operator manages users through its REST API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// HTTP port; takes precedence over `spec.webPort` when greater than zero
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    /// Serve HTTP over TLS
    #[serde(default, rename = "enableHTTPS")]
    pub enable_https: bool,
    /// Certificate path inside the container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_file: Option<String>,
    /// Certificate key path inside the container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_key_file: Option<String>,
    /// URL the operator uses to reach the REST API instead of the in-cluster
    /// service address
    #[serde(default, rename = "baseURL", skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

/// Persistent data volume
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeConfig {
    /// Storage class; the cluster default is used when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    /// Requested size (defaults to 10Gi)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    /// Mount path in the container (defaults to /srv/sftpgo)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_path: Option<String>,
}

/// SFTPGo data provider backend
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// In-memory provider, lost on restart
    Memory,
    /// SQLite file on the data volume
    #[default]
    Sqlite,
    /// External MySQL database
    Mysql,
    /// External PostgreSQL database
    Postgres,
}

impl StorageBackend {
    /// Driver name expected by SFTPGo's `data_provider.driver`
    pub fn driver(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Sqlite => "sqlite",
            Self::Mysql => "mysql",
            Self::Postgres => "postgresql",
        }
    }

    /// Whether the backend needs `spec.database`
    pub fn is_external(&self) -> bool {
        matches!(self, Self::Mysql | Self::Postgres)
    }
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Sqlite => write!(f, "sqlite"),
            Self::Mysql => write!(f, "mysql"),
            Self::Postgres => write!(f, "postgres"),
        }
    }
}

/// External database connection
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    /// Database host
    #[serde(default)]
    pub host: String,
    /// Database port; SFTPGo's driver default is used when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    /// Database name
    #[serde(default)]
    pub database: String,
    /// Database user
    #[serde(default)]
    pub username: String,
    /// Secret key holding the database password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_secret: Option<SecretKeyRef>,
    /// SSL mode (0 disabled, 1 required, 2 verify-ca, 3 verify-full)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_mode: Option<String>,
}

/// Status of an SftpGoServer
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SftpGoServerStatus {
    /// Current phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,

    /// Desired pod count reported by the Deployment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Ready pod count reported by the Deployment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_replicas: Option<i32>,

    /// Conditions, at most one per type
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Ports the Service exposes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<ServicePorts>,

    /// Generation observed by the last successful pass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Resolved port assignments
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ServicePorts {
    /// SFTP port
    pub sftp: i32,
    /// Web admin port
    pub web: i32,
    /// REST API port
    pub http: i32,
    /// FTP port, when the FTP service is enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ftp: Option<i32>,
    /// WebDAV port, when the WebDAV service is enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webdav: Option<i32>,
}

impl SftpGoServerSpec {
    /// Validate the spec beyond what the OpenAPI schema enforces
    pub fn validate(&self, name: &str) -> Result<(), Error> {
        if let Some(replicas) = self.replicas {
            if replicas < 1 {
                return Err(Error::validation_for_field(
                    name,
                    "spec.replicas",
                    "must be at least 1",
                ));
            }
        }

        let ports = [
            ("spec.sftpPort", self.sftp_port),
            ("spec.webPort", self.web_port),
            ("spec.config.sftp.port", self.config.sftp.as_ref().and_then(|s| s.port)),
            ("spec.config.http.port", self.config.http.as_ref().and_then(|h| h.port)),
            ("spec.config.ftp.port", self.config.ftp.as_ref().and_then(|f| f.port)),
            ("spec.config.webdav.port", self.config.webdav.as_ref().and_then(|w| w.port)),
        ];
        for (field, port) in ports {
            if let Some(port) = port {
                // Zero means "not set" for the protocol overrides
                if !(0..=65535).contains(&port) {
                    return Err(Error::validation_for_field(
                        name,
                        field,
                        format!("port {port} is out of range"),
                    ));
                }
            }
        }

        if let Some(ftp) = &self.config.ftp {
            for (field, range) in [
                ("spec.config.ftp.passivePortRange", &ftp.passive_port_range),
                ("spec.config.ftp.activePortRange", &ftp.active_port_range),
            ] {
                if let Some(range) = range {
                    if range.start < 1 || range.end > 65535 || range.start > range.end {
                        return Err(Error::validation_for_field(
                            name,
                            field,
                            format!("invalid port range {}-{}", range.start, range.end),
                        ));
                    }
                }
            }
        }

        let backend = self.storage_backend.unwrap_or_default();
        if backend.is_external() {
            match &self.database {
                Some(db) if !db.host.is_empty() => {}
                _ => {
                    return Err(Error::validation_for_field(
                        name,
                        "spec.database.host",
                        format!("storage backend {backend} requires a database host"),
                    ))
                }
            }
        }

        if let Some(mode) = self.database.as_ref().and_then(|d| d.ssl_mode.as_deref()) {
            if !matches!(mode, "0" | "1" | "2" | "3") {
                return Err(Error::validation_for_field(
                    name,
                    "spec.database.sslMode",
                    format!("ssl mode {mode:?} must be one of 0, 1, 2, 3"),
                ));
            }
        }

        if let Some(affinity) = &self.affinity {
            if !affinity.is_object() {
                return Err(Error::validation_for_field(
                    name,
                    "spec.affinity",
                    "must be an object",
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn empty_spec_is_valid() {
        assert!(SftpGoServerSpec::default().validate("files").is_ok());
    }

    #[test]
    fn zero_replicas_rejected() {
        let spec = SftpGoServerSpec {
            replicas: Some(0),
            ..Default::default()
        };
        let err = spec.validate("files").unwrap_err();
        assert!(err.to_string().contains("at least 1"));
    }

    #[test]
    fn out_of_range_port_rejected() {
        let spec = SftpGoServerSpec {
            web_port: Some(70000),
            ..Default::default()
        };
        assert!(spec.validate("files").is_err());
    }

    #[test]
    fn inverted_passive_range_rejected() {
        let spec = SftpGoServerSpec {
            config: SftpGoConfig {
                ftp: Some(FtpConfig {
                    enabled: true,
                    passive_port_range: Some(PortRange {
                        start: 50100,
                        end: 50000,
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = spec.validate("files").unwrap_err();
        assert!(err.to_string().contains("50100-50000"));
    }

    #[test]
    fn external_backend_requires_database_host() {
        let mut spec = SftpGoServerSpec {
            storage_backend: Some(StorageBackend::Postgres),
            ..Default::default()
        };
        assert!(spec.validate("files").is_err());

        spec.database = Some(DatabaseConfig {
            host: "postgres.db".to_string(),
            database: "sftpgo".to_string(),
            ..Default::default()
        });
        assert!(spec.validate("files").is_ok());
    }

    #[test]
    fn postgres_uses_sftpgo_driver_name() {
        assert_eq!(StorageBackend::Postgres.driver(), "postgresql");
        assert_eq!(StorageBackend::default().driver(), "sqlite");
        assert_eq!(StorageBackend::Postgres.to_string(), "postgres");
    }

    #[test]
    fn spec_parses_camel_case_and_acronym_fields() {
        let spec: SftpGoServerSpec = serde_json::from_value(serde_json::json!({
            "sftpPort": 2200,
            "storageBackend": "memory",
            "adminSecretRef": {"name": "sftpgo-admin"},
            "config": {
                "sftp": {"allowedSSHCommands": ["md5sum"]},
                "http": {"baseURL": "http://localhost:8080", "enableHTTPS": false}
            },
            "affinity": {"nodeAffinity": {}}
        }))
        .unwrap();

        assert_eq!(spec.sftp_port, Some(2200));
        assert_eq!(spec.storage_backend, Some(StorageBackend::Memory));
        assert_eq!(spec.admin_secret_ref.unwrap().name, "sftpgo-admin");
        let sftp = spec.config.sftp.unwrap();
        assert_eq!(sftp.allowed_ssh_commands, vec!["md5sum"]);
        assert_eq!(
            spec.config.http.unwrap().base_url.as_deref(),
            Some("http://localhost:8080")
        );
    }

    #[test]
    fn crd_has_expected_names_and_columns() {
        let crd = SftpGoServer::crd();
        assert_eq!(crd.metadata.name.as_deref(), Some("sftpgoservers.sftpgo.sftpgo.io"));
        let yaml = serde_yaml::to_string(&crd).unwrap();
        assert!(yaml.contains("readyReplicas"));
        assert!(yaml.contains("x-kubernetes-preserve-unknown-fields"));
    }
}
