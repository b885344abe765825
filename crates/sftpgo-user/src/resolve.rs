//! Credential and reference resolution
//!
//! Turns the indirections in an SftpGoUser (server reference, secret key
//! references, the server's admin secret) into concrete values for one pass.
//! Nothing here is cached between passes.

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use sftpgo_client::{service_url, AdminConnection};
use sftpgo_common::crd::{FilesystemProvider, SecretKeyRef, SftpGoServer, SftpGoUserSpec};
use sftpgo_common::defaults::ServerSettings;
use sftpgo_common::events::reasons;
use sftpgo_common::kube_utils::secret_value;
use sftpgo_common::Error;
use thiserror::Error as ThisError;
use zeroize::Zeroizing;

use crate::controller::UserKubeClient;

/// Admin secret key holding the username
pub const ADMIN_USERNAME_KEY: &str = "username";
/// Admin secret key holding the password
pub const ADMIN_PASSWORD_KEY: &str = "password";

/// Why a reference could not be resolved
#[derive(Debug, ThisError)]
pub enum ResolveError {
    /// The referenced SftpGoServer does not exist
    #[error("SftpGoServer {name} not found in namespace {namespace}")]
    ServerNotFound {
        /// Server name
        name: String,
        /// Namespace searched
        namespace: String,
    },

    /// The server has no admin secret, so its REST API cannot be used
    #[error("SftpGoServer {server} has no adminSecretRef; users cannot be managed through the API")]
    AuthNotConfigured {
        /// Server name
        server: String,
    },

    /// The admin secret or one of its keys is missing
    #[error("{0}")]
    AuthError(String),

    /// A secret referenced by the user is missing or lacks the key
    #[error("{0}")]
    SecretNotFound(String),

    /// Kubernetes API failure while reading a reference
    #[error(transparent)]
    Kube(#[from] Error),
}

impl ResolveError {
    /// Reason code recorded on the `Ready` condition
    pub fn reason(&self) -> &'static str {
        match self {
            Self::ServerNotFound { .. } => reasons::SERVER_NOT_FOUND,
            Self::AuthNotConfigured { .. } => reasons::AUTH_NOT_CONFIGURED,
            Self::AuthError(_) => reasons::AUTH_ERROR,
            Self::SecretNotFound(_) => reasons::SECRET_NOT_FOUND,
            Self::Kube(_) => reasons::API_ERROR,
        }
    }
}

/// Plain-text credential material for the user payload
#[derive(Default)]
pub struct ResolvedCredentials {
    /// Password, when one is configured and non-empty
    pub password: Option<Zeroizing<String>>,
    /// SSH public keys
    pub public_keys: Vec<String>,
    /// Secrets of the selected filesystem provider
    pub filesystem: FilesystemSecrets,
}

/// Secret values of the selected filesystem provider
#[derive(Default)]
pub struct FilesystemSecrets {
    /// S3 access secret
    pub s3_access_secret: Option<Zeroizing<String>>,
    /// Azure account key
    pub azure_account_key: Option<Zeroizing<String>>,
    /// Remote SFTP password
    pub sftp_password: Option<Zeroizing<String>>,
    /// Remote SFTP private key
    pub sftp_private_key: Option<Zeroizing<String>>,
    /// Encryption passphrase
    pub crypt_passphrase: Option<Zeroizing<String>>,
}

/// Fetch the server a user references.
///
/// The reference's namespace defaults to the user's own.
pub async fn resolve_server(
    kube: &dyn UserKubeClient,
    spec: &SftpGoUserSpec,
    user_namespace: &str,
) -> Result<SftpGoServer, ResolveError> {
    let namespace = spec.server_ref.namespace_or(user_namespace);
    kube.get_server(&spec.server_ref.name, namespace)
        .await?
        .ok_or_else(|| ResolveError::ServerNotFound {
            name: spec.server_ref.name.clone(),
            namespace: namespace.to_string(),
        })
}

/// REST API base URL: `config.http.baseURL` when set, else the in-cluster
/// Service address on the web port
pub fn admin_endpoint(server: &SftpGoServer, settings: &ServerSettings) -> String {
    let override_url = server
        .spec
        .config
        .http
        .as_ref()
        .and_then(|h| h.base_url.as_deref())
        .filter(|u| !u.is_empty());
    match override_url {
        Some(url) => url.to_string(),
        None => service_url(
            &server.name_any(),
            &server.namespace().unwrap_or_default(),
            settings.web_port,
        ),
    }
}

/// Build the admin connection for a server from its `adminSecretRef`
pub async fn resolve_admin(
    kube: &dyn UserKubeClient,
    server: &SftpGoServer,
    settings: &ServerSettings,
) -> Result<AdminConnection, ResolveError> {
    let namespace = server.namespace().unwrap_or_default();
    let Some(secret_name) = settings.admin_secret.as_deref() else {
        return Err(ResolveError::AuthNotConfigured {
            server: server.name_any(),
        });
    };

    let secret = kube.get_secret(secret_name, &namespace).await?.ok_or_else(|| {
        ResolveError::AuthError(format!(
            "admin secret {namespace}/{secret_name} not found"
        ))
    })?;
    // Blank values would send requests without basic auth
    let read = |key: &str| -> Result<Zeroizing<String>, ResolveError> {
        let value = secret_string(&secret, key).ok_or_else(|| {
            ResolveError::AuthError(format!(
                "admin secret {namespace}/{secret_name} has no {key} key"
            ))
        })?;
        if value.trim().is_empty() {
            return Err(ResolveError::AuthError(format!(
                "admin secret {namespace}/{secret_name} has an empty {key}"
            )));
        }
        Ok(value)
    };
    let username = read(ADMIN_USERNAME_KEY)?;
    let password = read(ADMIN_PASSWORD_KEY)?;

    Ok(AdminConnection {
        base_url: admin_endpoint(server, settings),
        username: username.as_str().to_string(),
        password,
    })
}

/// Resolve password, public keys and filesystem secrets of a user
pub async fn resolve_credentials(
    kube: &dyn UserKubeClient,
    spec: &SftpGoUserSpec,
    namespace: &str,
) -> Result<ResolvedCredentials, ResolveError> {
    // Inline password wins over the secret reference
    let password = match spec.password.as_deref().filter(|p| !p.is_empty()) {
        Some(inline) => Some(Zeroizing::new(inline.to_string())),
        None => match &spec.password_secret_ref {
            Some(r) => Some(secret_key(kube, namespace, r).await?),
            None => None,
        },
    }
    .filter(|p| !p.is_empty());

    let public_keys = if !spec.public_keys.is_empty() {
        spec.public_keys.clone()
    } else if let Some(r) = &spec.public_keys_secret_ref {
        parse_public_keys(&secret_key(kube, namespace, r).await?)
    } else {
        Vec::new()
    };

    let filesystem = resolve_filesystem_secrets(kube, spec, namespace).await?;

    Ok(ResolvedCredentials {
        password,
        public_keys,
        filesystem,
    })
}

/// Split newline-separated public keys, dropping blanks and `#` comments
pub fn parse_public_keys(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Resolve only the secrets the selected provider uses
async fn resolve_filesystem_secrets(
    kube: &dyn UserKubeClient,
    spec: &SftpGoUserSpec,
    namespace: &str,
) -> Result<FilesystemSecrets, ResolveError> {
    let mut secrets = FilesystemSecrets::default();
    let Some(fs) = &spec.filesystem else {
        return Ok(secrets);
    };

    async fn optional(
        kube: &dyn UserKubeClient,
        namespace: &str,
        r: Option<&SecretKeyRef>,
    ) -> Result<Option<Zeroizing<String>>, ResolveError> {
        match r {
            Some(r) => Ok(Some(secret_key(kube, namespace, r).await?)),
            None => Ok(None),
        }
    }

    match fs.provider.unwrap_or_default() {
        FilesystemProvider::Osfs => {}
        FilesystemProvider::S3fs => {
            let r = fs.s3.as_ref().and_then(|s3| s3.access_secret.as_ref());
            secrets.s3_access_secret = optional(kube, namespace, r).await?;
        }
        // Automatic credentials; nothing to resolve
        FilesystemProvider::Gcsfs => {}
        FilesystemProvider::Azureblob => {
            let r = fs.azure.as_ref().and_then(|a| a.account_key.as_ref());
            secrets.azure_account_key = optional(kube, namespace, r).await?;
        }
        FilesystemProvider::Crypt | FilesystemProvider::Encrypted => {
            let r = fs.crypt.as_ref().and_then(|c| c.passphrase.as_ref());
            secrets.crypt_passphrase = optional(kube, namespace, r).await?;
        }
        FilesystemProvider::Sftpfs => {
            let sftp = fs.sftp.as_ref();
            secrets.sftp_password =
                optional(kube, namespace, sftp.and_then(|s| s.password.as_ref())).await?;
            secrets.sftp_private_key =
                optional(kube, namespace, sftp.and_then(|s| s.private_key.as_ref())).await?;
        }
    }
    Ok(secrets)
}

/// Read one key of a secret in `namespace`
async fn secret_key(
    kube: &dyn UserKubeClient,
    namespace: &str,
    r: &SecretKeyRef,
) -> Result<Zeroizing<String>, ResolveError> {
    let secret = kube.get_secret(&r.name, namespace).await?.ok_or_else(|| {
        ResolveError::SecretNotFound(
            Error::reference_not_found("Secret", &r.name, namespace).to_string(),
        )
    })?;
    secret_string(&secret, &r.key).ok_or_else(|| {
        ResolveError::SecretNotFound(format!(
            "secret {namespace}/{} has no key {}",
            r.name, r.key
        ))
    })
}

fn secret_string(secret: &Secret, key: &str) -> Option<Zeroizing<String>> {
    let bytes = Zeroizing::new(secret_value(secret, key)?);
    Some(Zeroizing::new(String::from_utf8_lossy(&bytes).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::MockUserKubeClient;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;
    use sftpgo_common::crd::{
        FilesystemConfig, HttpConfig, LocalObjectRef, S3FilesystemConfig, ServerRef,
        SftpGoConfig, SftpGoServerSpec,
    };
    use std::collections::BTreeMap;

    fn secret(name: &str, data: &[(&str, &str)]) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Default::default()
        }
    }

    fn server(admin: Option<&str>) -> SftpGoServer {
        let mut server = SftpGoServer::new(
            "files",
            SftpGoServerSpec {
                admin_secret_ref: admin.map(|name| LocalObjectRef {
                    name: name.to_string(),
                }),
                ..Default::default()
            },
        );
        server.metadata.namespace = Some("storage".to_string());
        server
    }

    fn key_ref(name: &str, key: &str) -> SecretKeyRef {
        SecretKeyRef {
            name: name.to_string(),
            key: key.to_string(),
        }
    }

    #[test]
    fn public_keys_skip_blank_and_comment_lines() {
        let raw = "ssh-ed25519 AAAA alice@laptop\n\n  # old key\n  ssh-rsa BBBB alice@desktop  \n";
        assert_eq!(
            parse_public_keys(raw),
            vec!["ssh-ed25519 AAAA alice@laptop", "ssh-rsa BBBB alice@desktop"]
        );
    }

    #[test]
    fn endpoint_defaults_to_cluster_service_address() {
        let server = server(None);
        let settings = ServerSettings::from_spec(&server.spec);
        assert_eq!(
            admin_endpoint(&server, &settings),
            "http://files.storage.svc.cluster.local:8080"
        );
    }

    #[test]
    fn base_url_overrides_endpoint() {
        let mut server = server(None);
        server.spec.config = SftpGoConfig {
            http: Some(HttpConfig {
                base_url: Some("https://sftpgo.example.com".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let settings = ServerSettings::from_spec(&server.spec);
        assert_eq!(
            admin_endpoint(&server, &settings),
            "https://sftpgo.example.com"
        );
    }

    #[tokio::test]
    async fn server_ref_namespace_defaults_to_user_namespace() {
        let mut kube = MockUserKubeClient::new();
        kube.expect_get_server()
            .withf(|name, ns| name == "files" && ns == "team-a")
            .returning(|_, _| Ok(None));

        let spec = SftpGoUserSpec {
            server_ref: ServerRef {
                name: "files".to_string(),
                namespace: None,
            },
            ..Default::default()
        };
        let err = resolve_server(&kube, &spec, "team-a").await.unwrap_err();
        assert_eq!(err.reason(), reasons::SERVER_NOT_FOUND);
        assert_eq!(
            err.to_string(),
            "SftpGoServer files not found in namespace team-a"
        );
    }

    #[tokio::test]
    async fn missing_admin_ref_is_auth_not_configured() {
        let kube = MockUserKubeClient::new();
        let server = server(None);
        let settings = ServerSettings::from_spec(&server.spec);

        let err = resolve_admin(&kube, &server, &settings).await.unwrap_err();
        assert_eq!(err.reason(), reasons::AUTH_NOT_CONFIGURED);
    }

    #[tokio::test]
    async fn admin_secret_without_password_is_auth_error() {
        let mut kube = MockUserKubeClient::new();
        kube.expect_get_secret()
            .returning(|_, _| Ok(Some(secret("admin", &[("username", "admin")]))));
        let server = server(Some("admin"));
        let settings = ServerSettings::from_spec(&server.spec);

        let err = resolve_admin(&kube, &server, &settings).await.unwrap_err();
        assert_eq!(err.reason(), reasons::AUTH_ERROR);
        assert!(err.to_string().contains("password"));
    }

    #[tokio::test]
    async fn admin_secret_with_blank_values_is_auth_error() {
        for (username, password, field) in [("", "s3cret", "username"), ("admin", "  ", "password")] {
            let mut kube = MockUserKubeClient::new();
            kube.expect_get_secret().returning(move |_, _| {
                Ok(Some(secret(
                    "admin",
                    &[("username", username), ("password", password)],
                )))
            });
            let server = server(Some("admin"));
            let settings = ServerSettings::from_spec(&server.spec);

            let err = resolve_admin(&kube, &server, &settings).await.unwrap_err();
            assert_eq!(err.reason(), reasons::AUTH_ERROR);
            assert_eq!(
                err.to_string(),
                format!("admin secret storage/admin has an empty {field}")
            );
        }
    }

    #[tokio::test]
    async fn admin_connection_reads_server_namespace_secret() {
        let mut kube = MockUserKubeClient::new();
        kube.expect_get_secret()
            .withf(|name, ns| name == "admin" && ns == "storage")
            .returning(|_, _| {
                Ok(Some(secret(
                    "admin",
                    &[("username", "admin"), ("password", "s3cret")],
                )))
            });
        let server = server(Some("admin"));
        let settings = ServerSettings::from_spec(&server.spec);

        let conn = resolve_admin(&kube, &server, &settings).await.unwrap();
        assert_eq!(conn.username, "admin");
        assert_eq!(conn.password.as_str(), "s3cret");
        assert_eq!(conn.base_url, "http://files.storage.svc.cluster.local:8080");
    }

    #[tokio::test]
    async fn inline_password_wins_over_secret() {
        // No secret lookups expected
        let kube = MockUserKubeClient::new();
        let spec = SftpGoUserSpec {
            password: Some("inline".to_string()),
            password_secret_ref: Some(key_ref("alice", "password")),
            ..Default::default()
        };
        let creds = resolve_credentials(&kube, &spec, "team-a").await.unwrap();
        assert_eq!(creds.password.as_deref().map(String::as_str), Some("inline"));
    }

    #[tokio::test]
    async fn keys_come_from_secret_when_not_inline() {
        let mut kube = MockUserKubeClient::new();
        kube.expect_get_secret().returning(|_, _| {
            Ok(Some(secret("alice", &[("keys", "ssh-ed25519 AAAA\n# x\n")])))
        });
        let spec = SftpGoUserSpec {
            public_keys_secret_ref: Some(key_ref("alice", "keys")),
            ..Default::default()
        };
        let creds = resolve_credentials(&kube, &spec, "team-a").await.unwrap();
        assert_eq!(creds.public_keys, vec!["ssh-ed25519 AAAA"]);
        assert!(creds.password.is_none());
    }

    #[tokio::test]
    async fn missing_filesystem_secret_is_secret_not_found() {
        let mut kube = MockUserKubeClient::new();
        kube.expect_get_secret().returning(|_, _| Ok(None));
        let spec = SftpGoUserSpec {
            filesystem: Some(FilesystemConfig {
                provider: Some(FilesystemProvider::S3fs),
                s3: Some(S3FilesystemConfig {
                    bucket: "data".to_string(),
                    access_secret: Some(key_ref("s3-creds", "secret")),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let err = resolve_credentials(&kube, &spec, "team-a")
            .await
            .err()
            .expect("secret is missing");
        assert_eq!(err.reason(), reasons::SECRET_NOT_FOUND);
        assert_eq!(err.to_string(), "Secret s3-creds not found in namespace team-a");
    }

    #[tokio::test]
    async fn secrets_of_unselected_providers_are_ignored() {
        let kube = MockUserKubeClient::new();
        let spec = SftpGoUserSpec {
            filesystem: Some(FilesystemConfig {
                provider: Some(FilesystemProvider::Osfs),
                s3: Some(S3FilesystemConfig {
                    access_secret: Some(key_ref("s3-creds", "secret")),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let creds = resolve_credentials(&kube, &spec, "team-a").await.unwrap();
        assert!(creds.filesystem.s3_access_secret.is_none());
    }
}
