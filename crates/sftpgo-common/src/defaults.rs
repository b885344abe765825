//! Spec defaulting for SftpGoServer
//!
//! [`ServerSettings::from_spec`] is the only place defaults are applied. Both
//! controllers compute it once per pass and pass the result down, so the
//! server's children and the user controller's view of the REST endpoint
//! always agree on ports and paths.

use crate::crd::{SftpGoServerSpec, StorageBackend};

/// Default SFTPGo image
pub const DEFAULT_IMAGE: &str = "docker.io/drakkan/sftpgo:latest";
/// Default pod count
pub const DEFAULT_REPLICAS: i32 = 1;
/// Default SFTP port
pub const DEFAULT_SFTP_PORT: i32 = 2022;
/// Default web admin / REST API port
pub const DEFAULT_WEB_PORT: i32 = 8080;
/// Default FTP port when FTP is enabled
pub const DEFAULT_FTP_PORT: i32 = 2121;
/// Default WebDAV port when WebDAV is enabled
pub const DEFAULT_WEBDAV_PORT: i32 = 10080;
/// Default data volume size
pub const DEFAULT_VOLUME_SIZE: &str = "10Gi";
/// Default data mount path
pub const DEFAULT_MOUNT_PATH: &str = "/srv/sftpgo";

/// Effective server settings after defaults and port overrides
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerSettings {
    /// Container image
    pub image: String,
    /// Image pull policy, if set
    pub image_pull_policy: Option<String>,
    /// Pod count
    pub replicas: i32,
    /// Whether the SFTP service is enabled (unless disabled explicitly)
    pub sftp_enabled: bool,
    /// SFTP port
    pub sftp_port: i32,
    /// Web admin / REST API port
    pub web_port: i32,
    /// FTP port when the FTP service is enabled
    pub ftp_port: Option<i32>,
    /// WebDAV port when the WebDAV service is enabled
    pub webdav_port: Option<i32>,
    /// Data provider backend
    pub storage_backend: StorageBackend,
    /// Persistent volume claim settings, when a data volume is requested
    pub volume: Option<VolumeSettings>,
    /// Where the data volume (PVC or emptyDir) is mounted
    pub mount_path: String,
    /// Secret with the default admin credentials
    pub admin_secret: Option<String>,
}

/// Persistent volume claim settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeSettings {
    /// Storage class, cluster default when `None`
    pub storage_class: Option<String>,
    /// Requested size
    pub size: String,
}

/// Treat zero and negative ports as unset
fn positive(port: Option<i32>) -> Option<i32> {
    port.filter(|p| *p > 0)
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|v| !v.is_empty()).cloned()
}

impl ServerSettings {
    /// Apply defaults to a server spec.
    ///
    /// A protocol-specific port (`config.sftp.port`, `config.http.port`)
    /// wins over the top-level `sftpPort` / `webPort`.
    pub fn from_spec(spec: &SftpGoServerSpec) -> Self {
        let config = &spec.config;

        let sftp_port = positive(config.sftp.as_ref().and_then(|s| s.port))
            .or(positive(spec.sftp_port))
            .unwrap_or(DEFAULT_SFTP_PORT);
        let web_port = positive(config.http.as_ref().and_then(|h| h.port))
            .or(positive(spec.web_port))
            .unwrap_or(DEFAULT_WEB_PORT);
        let ftp_port = config
            .ftp
            .as_ref()
            .filter(|f| f.enabled)
            .map(|f| positive(f.port).unwrap_or(DEFAULT_FTP_PORT));
        let webdav_port = config
            .webdav
            .as_ref()
            .filter(|w| w.enabled)
            .map(|w| positive(w.port).unwrap_or(DEFAULT_WEBDAV_PORT));

        let volume = spec.data_volume.as_ref().map(|v| VolumeSettings {
            storage_class: non_empty(v.storage_class.as_ref()),
            size: non_empty(v.size.as_ref()).unwrap_or_else(|| DEFAULT_VOLUME_SIZE.to_string()),
        });
        let mount_path = spec
            .data_volume
            .as_ref()
            .and_then(|v| non_empty(v.mount_path.as_ref()))
            .unwrap_or_else(|| DEFAULT_MOUNT_PATH.to_string());

        Self {
            image: non_empty(spec.image.as_ref()).unwrap_or_else(|| DEFAULT_IMAGE.to_string()),
            image_pull_policy: non_empty(spec.image_pull_policy.as_ref()),
            replicas: spec.replicas.unwrap_or(DEFAULT_REPLICAS),
            sftp_enabled: config.sftp.as_ref().and_then(|s| s.enabled).unwrap_or(true),
            sftp_port,
            web_port,
            ftp_port,
            webdav_port,
            storage_backend: spec.storage_backend.unwrap_or_default(),
            volume,
            mount_path,
            admin_secret: spec
                .admin_secret_ref
                .as_ref()
                .map(|r| r.name.clone())
                .filter(|n| !n.is_empty()),
        }
    }
}
