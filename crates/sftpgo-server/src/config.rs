//! Rendering of `sftpgo.json`
//!
//! Typed sections serialized in declaration order, so a given spec always
//! yields the same bytes and the same config hash. Credentials never land
//! here; they reach the container as environment variables.

use serde::Serialize;
use sftpgo_common::crd::{PortRange, SftpGoServerSpec, StorageBackend};
use sftpgo_common::defaults::ServerSettings;
use sftpgo_common::Error;

/// ConfigMap key holding the rendered configuration
pub const CONFIG_KEY: &str = "sftpgo.json";

#[derive(Debug, Serialize)]
struct SftpGoJson {
    #[serde(skip_serializing_if = "Option::is_none")]
    common: Option<CommonSection>,
    sftpd: SftpdSection,
    #[serde(skip_serializing_if = "Option::is_none")]
    ftpd: Option<FtpdSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    webdavd: Option<WebdavdSection>,
    httpd: HttpdSection,
    data_provider: DataProviderSection,
}

#[derive(Debug, Serialize)]
struct CommonSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    idle_timeout: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    upload_mode: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_total_connections: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_per_host_connections: Option<i32>,
}

#[derive(Debug, Serialize)]
struct ProxyBinding {
    port: i32,
    address: &'static str,
    apply_proxy_config: bool,
}

impl ProxyBinding {
    fn on(port: i32) -> Self {
        Self {
            port,
            address: "",
            apply_proxy_config: true,
        }
    }
}

#[derive(Debug, Serialize)]
struct SftpdSection {
    /// Empty when SFTP is disabled
    bindings: Vec<ProxyBinding>,
    max_auth_tries: i32,
    host_keys: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    enabled_ssh_commands: Vec<String>,
    keyboard_interactive_authentication: bool,
    password_authentication: bool,
}

#[derive(Debug, Serialize)]
struct FtpdSection {
    bindings: Vec<ProxyBinding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    passive_port_range: Option<RangeSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    active_port_range: Option<RangeSection>,
}

#[derive(Debug, Serialize)]
struct RangeSection {
    start: i32,
    end: i32,
}

impl From<&PortRange> for RangeSection {
    fn from(r: &PortRange) -> Self {
        Self {
            start: r.start,
            end: r.end,
        }
    }
}

#[derive(Debug, Serialize)]
struct TlsBinding {
    port: i32,
    address: &'static str,
    enable_https: bool,
}

#[derive(Debug, Serialize)]
struct WebdavdSection {
    bindings: Vec<TlsBinding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    certificate_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    certificate_key_file: Option<String>,
}

#[derive(Debug, Serialize)]
struct HttpBinding {
    port: i32,
    address: &'static str,
    enable_web_admin: bool,
    enable_web_client: bool,
    enable_rest_api: bool,
    enable_https: bool,
}

#[derive(Debug, Serialize)]
struct HttpdSection {
    bindings: Vec<HttpBinding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    certificate_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    certificate_key_file: Option<String>,
}

#[derive(Debug, Serialize)]
struct DataProviderSection {
    driver: &'static str,
    name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    port: Option<i32>,
    #[serde(skip_serializing_if = "String::is_empty")]
    username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    sslmode: Option<i32>,
    create_default_admin: bool,
}

fn data_provider(spec: &SftpGoServerSpec, settings: &ServerSettings) -> DataProviderSection {
    let backend = settings.storage_backend;
    let mut section = DataProviderSection {
        driver: backend.driver(),
        name: String::new(),
        host: String::new(),
        port: None,
        username: String::new(),
        sslmode: None,
        create_default_admin: settings.admin_secret.is_some(),
    };
    match backend {
        StorageBackend::Sqlite => {
            section.name = format!("{}/sftpgo.db", settings.mount_path.trim_end_matches('/'));
        }
        StorageBackend::Memory => {}
        StorageBackend::Mysql | StorageBackend::Postgres => {
            if let Some(db) = &spec.database {
                section.name = db.database.clone();
                section.host = db.host.clone();
                section.port = db.port.filter(|p| *p > 0);
                section.username = db.username.clone();
                section.sslmode = db.ssl_mode.as_deref().and_then(|m| m.parse().ok());
            }
        }
    }
    section
}

/// Render `sftpgo.json` for a server
pub fn render_config(spec: &SftpGoServerSpec, settings: &ServerSettings) -> Result<String, Error> {
    let config = &spec.config;

    let common = config.common.as_ref().map(|c| CommonSection {
        idle_timeout: c.idle_timeout,
        upload_mode: c.upload_mode,
        max_total_connections: c.max_total_connections,
        max_per_host_connections: c.max_per_host_connections,
    });

    let sftp = config.sftp.clone().unwrap_or_default();
    let sftpd = SftpdSection {
        bindings: if settings.sftp_enabled {
            vec![ProxyBinding::on(settings.sftp_port)]
        } else {
            Vec::new()
        },
        max_auth_tries: sftp.max_auth_tries.unwrap_or(0),
        host_keys: sftp.host_keys,
        enabled_ssh_commands: sftp.allowed_ssh_commands,
        keyboard_interactive_authentication: sftp.keyboard_interactive_auth.unwrap_or(true),
        password_authentication: sftp.password_authentication.unwrap_or(true),
    };

    let ftpd = settings.ftp_port.map(|port| {
        let ftp = config.ftp.as_ref();
        FtpdSection {
            bindings: vec![ProxyBinding::on(port)],
            passive_port_range: ftp
                .and_then(|f| f.passive_port_range.as_ref())
                .map(RangeSection::from),
            active_port_range: ftp
                .and_then(|f| f.active_port_range.as_ref())
                .map(RangeSection::from),
        }
    });

    let webdavd = settings.webdav_port.map(|port| {
        let dav = config.webdav.clone().unwrap_or_default();
        WebdavdSection {
            bindings: vec![TlsBinding {
                port,
                address: "",
                enable_https: dav.enable_https,
            }],
            certificate_file: dav.certificate_file.filter(|_| dav.enable_https),
            certificate_key_file: dav.certificate_key_file.filter(|_| dav.enable_https),
        }
    });

    let http = config.http.clone().unwrap_or_default();
    let httpd = HttpdSection {
        bindings: vec![HttpBinding {
            port: settings.web_port,
            address: "",
            enable_web_admin: true,
            enable_web_client: true,
            enable_rest_api: true,
            enable_https: http.enable_https,
        }],
        certificate_file: http.certificate_file.filter(|_| http.enable_https),
        certificate_key_file: http.certificate_key_file.filter(|_| http.enable_https),
    };

    let doc = SftpGoJson {
        common,
        sftpd,
        ftpd,
        webdavd,
        httpd,
        data_provider: data_provider(spec, settings),
    };

    serde_json::to_string_pretty(&doc)
        .map_err(|e| Error::serialization_for("ConfigMap", format!("sftpgo.json: {e}")))
}
