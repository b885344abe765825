//! SftpGoUser CRD types
//!
//! An `SftpGoUser` describes one account on an SFTPGo server. The user
//! controller resolves its credential references and keeps the matching user
//! in SFTPGo's data provider in sync through the REST API.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, Phase, SecretKeyRef};

/// Specification for an SFTPGo user
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "sftpgo.sftpgo.io",
    version = "v1alpha1",
    kind = "SftpGoUser",
    plural = "sftpgousers",
    shortname = "sgu",
    namespaced,
    status = "SftpGoUserStatus",
    printcolumn = r#"{"name":"Username","type":"string","jsonPath":".spec.username"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".spec.status"}"#,
    printcolumn = r#"{"name":"HomeDir","type":"string","jsonPath":".spec.homeDir"}"#,
    printcolumn = r#"{"name":"Server","type":"string","jsonPath":".spec.serverRef.name"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SftpGoUserSpec {
    /// SFTPGo username
    pub username: String,

    /// Inline password; takes precedence over `passwordSecretRef`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Secret key holding the password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_secret_ref: Option<SecretKeyRef>,

    /// Inline SSH public keys; take precedence over `publicKeysSecretRef`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub public_keys: Vec<String>,

    /// Secret key holding newline-separated public keys (`#` starts a comment)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_keys_secret_ref: Option<SecretKeyRef>,

    /// Email address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    /// Whether the account can log in (defaults to enabled)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<UserState>,

    /// Home directory
    pub home_dir: String,

    /// Extra folders mapped into the user's namespace
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub virtual_folders: Vec<VirtualFolder>,

    /// Permissions on `/` (defaults to `*`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,

    /// Storage quota
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota: Option<Quota>,

    /// Transfer bandwidth limits in bytes per second
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth_limits: Option<BandwidthLimits>,

    /// Rate limits (not enforced by SFTPGo per user; kept for reference)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limits: Option<RateLimits>,

    /// Maximum concurrent sessions (0 unlimited)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_sessions: Option<i32>,

    /// Maximum concurrent transfers (kept for reference)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_transfers: Option<i32>,

    /// Allowed client networks in CIDR notation
    #[serde(default, rename = "allowedIP", skip_serializing_if = "Vec::is_empty")]
    pub allowed_ip: Vec<String>,

    /// Denied client networks in CIDR notation
    #[serde(default, rename = "deniedIP", skip_serializing_if = "Vec::is_empty")]
    pub denied_ip: Vec<String>,

    /// Protocols the user may use (SSH, FTP, DAV, HTTP); all when empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub protocols: Vec<String>,

    /// Groups the user belongs to as primary member
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,

    /// Additional login restrictions
    #[serde(default)]
    pub filters: UserFilters,

    /// Storage backend for the user's files (local disk when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesystem: Option<FilesystemConfig>,

    /// The SftpGoServer this user belongs to
    pub server_ref: ServerRef,
}

/// Account state
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UserState {
    /// Login allowed
    #[default]
    Enabled,
    /// Login refused
    Disabled,
}

/// A folder mapped into the user's virtual filesystem
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualFolder {
    /// Path as seen by the user
    pub virtual_path: String,
    /// Path on the server
    pub physical_path: String,
    /// Quota for this folder in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota: Option<i64>,
}

/// Storage quota
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Quota {
    /// Total size in bytes (0 unlimited)
    #[serde(default)]
    pub size: i64,
    /// Maximum number of files (0 unlimited)
    #[serde(default)]
    pub files: i64,
}

/// Bandwidth limits in bytes per second (0 unlimited)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct BandwidthLimits {
    /// Upload limit
    #[serde(default)]
    pub upload: i64,
    /// Download limit
    #[serde(default)]
    pub download: i64,
}

/// Rate limits
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct RateLimits {
    /// Average rate in bytes per second
    #[serde(default)]
    pub average: i64,
    /// Burst size in bytes
    #[serde(default)]
    pub burst: i64,
}

/// Additional user restrictions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserFilters {
    /// Force a password change at next login
    #[serde(default)]
    pub require_password_change: bool,
    /// Require two-factor authentication (kept for reference)
    #[serde(default, rename = "requireTOTP")]
    pub require_totp: bool,
    /// External authentication hook (kept for reference)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_auth_hook: Option<String>,
    /// SSH commands the user may run
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_commands: Vec<String>,
    /// Time windows in which login is allowed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub time_intervals: Vec<TimeInterval>,
}

/// A daily access window
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct TimeInterval {
    /// Start hour (0-23)
    #[serde(default)]
    pub start: u8,
    /// End hour (0-23)
    #[serde(default)]
    pub end: u8,
    /// Days of week (0 Sunday ... 6 Saturday); every day when empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub days: Vec<u8>,
}

/// Filesystem backend for the user's files
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct FilesystemConfig {
    /// Provider kind (defaults to local disk)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<FilesystemProvider>,
    /// S3 settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3FilesystemConfig>,
    /// Google Cloud Storage settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcs: Option<GcsFilesystemConfig>,
    /// Azure Blob settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure: Option<AzureFilesystemConfig>,
    /// Remote SFTP settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sftp: Option<SftpFilesystemConfig>,
    /// Encrypted local filesystem settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crypt: Option<CryptFilesystemConfig>,
}

/// Filesystem provider kinds
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FilesystemProvider {
    /// Local disk
    #[default]
    Osfs,
    /// Amazon S3 or compatible
    S3fs,
    /// Google Cloud Storage
    Gcsfs,
    /// Azure Blob Storage
    Azureblob,
    /// Encrypted local disk
    Crypt,
    /// Alias of `crypt`
    Encrypted,
    /// Remote SFTP server
    Sftpfs,
}

impl FilesystemProvider {
    /// Numeric provider id used by SFTPGo
    pub fn sftpgo_id(&self) -> i32 {
        match self {
            Self::Osfs => 0,
            Self::S3fs => 1,
            Self::Gcsfs => 2,
            Self::Azureblob => 3,
            Self::Crypt | Self::Encrypted => 4,
            Self::Sftpfs => 5,
        }
    }
}

/// S3 settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct S3FilesystemConfig {
    /// Bucket name
    #[serde(default)]
    pub bucket: String,
    /// Region
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Access key id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,
    /// Secret key holding the access secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_secret: Option<SecretKeyRef>,
    /// Endpoint for S3-compatible services
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Storage class for uploaded objects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    /// Canned ACL for uploaded objects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acl: Option<String>,
    /// Multipart upload part size in MB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_part_size: Option<i64>,
    /// Restrict the user to this key prefix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_prefix: Option<String>,
}

/// Google Cloud Storage settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GcsFilesystemConfig {
    /// Bucket name
    #[serde(default)]
    pub bucket: String,
    /// Credentials file path on the server; automatic credentials when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_file: Option<String>,
    /// Storage class for uploaded objects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    /// Restrict the user to this key prefix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_prefix: Option<String>,
}

/// Azure Blob settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AzureFilesystemConfig {
    /// Container name
    #[serde(default)]
    pub container: String,
    /// Storage account name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_name: Option<String>,
    /// Secret key holding the account key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_key: Option<SecretKeyRef>,
    /// Shared access signature URL
    #[serde(default, rename = "sasURL", skip_serializing_if = "Option::is_none")]
    pub sas_url: Option<String>,
    /// Endpoint suffix (e.g. `core.windows.net`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_suffix: Option<String>,
    /// Upload block size in MB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_block_size: Option<i64>,
    /// Restrict the user to this key prefix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_prefix: Option<String>,
}

/// Remote SFTP settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SftpFilesystemConfig {
    /// Remote host
    #[serde(default)]
    pub host: String,
    /// Remote port (defaults to 22)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    /// Remote username
    #[serde(default)]
    pub username: String,
    /// Secret key holding the remote password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<SecretKeyRef>,
    /// Secret key holding the remote private key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<SecretKeyRef>,
    /// Restrict the user to this remote path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_path: Option<String>,
}

/// Encrypted local filesystem settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CryptFilesystemConfig {
    /// Secret key holding the encryption passphrase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<SecretKeyRef>,
    /// Directory to encrypt (kept for reference; the home dir is used)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_path: Option<String>,
}

/// Reference to the owning SftpGoServer
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ServerRef {
    /// SftpGoServer name
    pub name: String,
    /// SftpGoServer namespace (defaults to the user's namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl ServerRef {
    /// Namespace of the referenced server, defaulting to `own_namespace`
    pub fn namespace_or<'a>(&'a self, own_namespace: &'a str) -> &'a str {
        match self.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => ns,
            _ => own_namespace,
        }
    }
}

/// Status of an SftpGoUser
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SftpGoUserStatus {
    /// Current phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,

    /// SFTPGo's numeric id for the user
    #[serde(default, rename = "userID", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,

    /// Conditions, at most one per type
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Last time the remote user was written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced: Option<DateTime<Utc>>,

    /// Generation observed by the last successful pass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl SftpGoUserSpec {
    /// Names of every Secret this user reads directly
    pub fn referenced_secrets(&self) -> Vec<&str> {
        let fs = self.filesystem.as_ref();
        let mut names: Vec<&str> = [
            self.password_secret_ref.as_ref(),
            self.public_keys_secret_ref.as_ref(),
            fs.and_then(|f| f.s3.as_ref())
                .and_then(|s3| s3.access_secret.as_ref()),
            fs.and_then(|f| f.azure.as_ref())
                .and_then(|azure| azure.account_key.as_ref()),
            fs.and_then(|f| f.sftp.as_ref())
                .and_then(|sftp| sftp.password.as_ref()),
            fs.and_then(|f| f.sftp.as_ref())
                .and_then(|sftp| sftp.private_key.as_ref()),
            fs.and_then(|f| f.crypt.as_ref())
                .and_then(|crypt| crypt.passphrase.as_ref()),
        ]
        .into_iter()
        .flatten()
        .map(|r| r.name.as_str())
        .collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}
