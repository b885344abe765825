//! Wire types for SFTPGo's `/api/v2/users` resource
//!
//! Every field defaults on decode, since SFTPGo returns many fields this
//! operator does not manage and omits some it does when they are empty.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// `status` value for an account that can log in
pub const STATUS_ENABLED: i32 = 1;
/// `status` value for an account that is refused
pub const STATUS_DISABLED: i32 = 0;
/// Group membership type for a primary group
pub const GROUP_TYPE_PRIMARY: i32 = 1;

/// SFTPGo user record
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserPayload {
    /// Remote numeric id, assigned by SFTPGo on create
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// Login name
    pub username: String,
    /// 1 enabled, 0 disabled
    pub status: i32,
    /// Email address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Plain password; omitted to leave the stored credential untouched
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Authorized SSH public keys
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub public_keys: Vec<String>,
    /// Home directory
    pub home_dir: String,
    /// Mapped virtual folders
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub virtual_folders: Vec<VirtualFolder>,
    /// Permissions keyed by path
    pub permissions: BTreeMap<String, Vec<String>>,
    /// Quota in bytes (0 unlimited)
    pub quota_size: i64,
    /// Quota in files (0 unlimited)
    pub quota_files: i64,
    /// Upload limit in KB/s (0 unlimited)
    pub upload_bandwidth: i64,
    /// Download limit in KB/s (0 unlimited)
    pub download_bandwidth: i64,
    /// Concurrent sessions (0 unlimited)
    pub max_sessions: i32,
    /// Allowed client networks
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allowed_ip: Vec<String>,
    /// Denied client networks
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub denied_ip: Vec<String>,
    /// Group memberships
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<GroupMapping>,
    /// Storage backend
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filesystem: Option<Filesystem>,
    /// Login restrictions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<UserFilters>,
}

/// Virtual folder mapping
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualFolder {
    /// Path as seen by the user
    pub virtual_path: String,
    /// Path on the server
    pub mapped_path: String,
    /// Folder quota in bytes (0 unlimited, -1 included in the user quota)
    pub quota_size: i64,
    /// Folder quota in files
    pub quota_files: i64,
}

/// Group membership
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupMapping {
    /// Group name
    pub name: String,
    /// Membership type (1 primary)
    #[serde(rename = "type")]
    pub type_: i32,
}

/// Secret value in SFTPGo's envelope.
///
/// Sent as `{"status": "Plain", "payload": ...}`; SFTPGo returns it encrypted
/// (e.g. `Secretbox`) and never echoes the plain payload back.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SftpGoSecret {
    /// `Plain` on write
    pub status: String,
    /// The value
    pub payload: String,
}

impl SftpGoSecret {
    /// Wrap a plain value
    pub fn plain(payload: impl Into<String>) -> Self {
        Self {
            status: "Plain".to_string(),
            payload: payload.into(),
        }
    }
}

/// Storage backend for a user
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Filesystem {
    /// 0 local, 1 S3, 2 GCS, 3 Azure Blob, 4 encrypted local, 5 SFTP
    pub provider: i32,
    /// S3 settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3config: Option<S3Config>,
    /// GCS settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gcsconfig: Option<GcsConfig>,
    /// Azure Blob settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub azblobconfig: Option<AzBlobConfig>,
    /// Encrypted local settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cryptconfig: Option<CryptConfig>,
    /// Remote SFTP settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sftpconfig: Option<SftpConfig>,
}

impl Filesystem {
    /// Copy with every secret envelope cleared, for comparing a desired
    /// record against what SFTPGo returns
    pub fn without_secrets(&self) -> Self {
        let mut fs = self.clone();
        if let Some(c) = fs.s3config.as_mut() {
            c.access_secret = None;
        }
        if let Some(c) = fs.gcsconfig.as_mut() {
            c.credentials = None;
        }
        if let Some(c) = fs.azblobconfig.as_mut() {
            c.account_key = None;
            c.sas_url = None;
        }
        if let Some(c) = fs.cryptconfig.as_mut() {
            c.passphrase = None;
        }
        if let Some(c) = fs.sftpconfig.as_mut() {
            c.password = None;
            c.private_key = None;
        }
        // SFTPGo echoes empty configs for providers that are not selected
        if fs.provider != 1 {
            fs.s3config = None;
        }
        if fs.provider != 2 {
            fs.gcsconfig = None;
        }
        if fs.provider != 3 {
            fs.azblobconfig = None;
        }
        if fs.provider != 4 {
            fs.cryptconfig = None;
        }
        if fs.provider != 5 {
            fs.sftpconfig = None;
        }
        fs
    }

    /// Whether any secret envelope carries a value. SFTPGo only returns
    /// secrets encrypted, so these can never be compared.
    pub fn has_secrets(&self) -> bool {
        let set = |s: &Option<SftpGoSecret>| s.as_ref().is_some_and(|s| !s.payload.is_empty());
        self.s3config.as_ref().is_some_and(|c| set(&c.access_secret))
            || self.gcsconfig.as_ref().is_some_and(|c| set(&c.credentials))
            || self
                .azblobconfig
                .as_ref()
                .is_some_and(|c| set(&c.account_key) || set(&c.sas_url))
            || self.cryptconfig.as_ref().is_some_and(|c| set(&c.passphrase))
            || self
                .sftpconfig
                .as_ref()
                .is_some_and(|c| set(&c.password) || set(&c.private_key))
    }
}

/// S3 settings
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    /// Bucket
    pub bucket: String,
    /// Region
    #[serde(skip_serializing_if = "String::is_empty")]
    pub region: String,
    /// Access key id
    #[serde(skip_serializing_if = "String::is_empty")]
    pub access_key: String,
    /// Access secret
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_secret: Option<SftpGoSecret>,
    /// Endpoint for S3-compatible services
    #[serde(skip_serializing_if = "String::is_empty")]
    pub endpoint: String,
    /// Storage class
    #[serde(skip_serializing_if = "String::is_empty")]
    pub storage_class: String,
    /// Canned ACL
    #[serde(skip_serializing_if = "String::is_empty")]
    pub acl: String,
    /// Multipart part size in MB
    pub upload_part_size: i64,
    /// Key prefix
    #[serde(skip_serializing_if = "String::is_empty")]
    pub key_prefix: String,
}

/// GCS settings
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcsConfig {
    /// Bucket
    pub bucket: String,
    /// Service account credentials
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<SftpGoSecret>,
    /// 1 to use the environment's credentials
    pub automatic_credentials: i32,
    /// Storage class
    #[serde(skip_serializing_if = "String::is_empty")]
    pub storage_class: String,
    /// Key prefix
    #[serde(skip_serializing_if = "String::is_empty")]
    pub key_prefix: String,
}

/// Azure Blob settings
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AzBlobConfig {
    /// Container
    pub container: String,
    /// Storage account name
    #[serde(skip_serializing_if = "String::is_empty")]
    pub account_name: String,
    /// Storage account key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_key: Option<SftpGoSecret>,
    /// Shared access signature URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sas_url: Option<SftpGoSecret>,
    /// Endpoint suffix
    #[serde(skip_serializing_if = "String::is_empty")]
    pub endpoint: String,
    /// Upload block size in MB
    pub upload_part_size: i64,
    /// Key prefix
    #[serde(skip_serializing_if = "String::is_empty")]
    pub key_prefix: String,
}

/// Encrypted local settings
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptConfig {
    /// Encryption passphrase
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<SftpGoSecret>,
}

/// Remote SFTP settings
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SftpConfig {
    /// `host:port`
    pub endpoint: String,
    /// Remote username
    pub username: String,
    /// Remote password
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<SftpGoSecret>,
    /// Remote private key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<SftpGoSecret>,
    /// Remote path prefix
    #[serde(skip_serializing_if = "String::is_empty")]
    pub prefix: String,
}

/// Login restrictions
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserFilters {
    /// Protocols the user may not use (`SSH`, `FTP`, `DAV`, `HTTP`)
    #[serde(deserialize_with = "null_as_default")]
    pub denied_protocols: Vec<String>,
    /// Windows in which login is allowed
    #[serde(deserialize_with = "null_as_default")]
    pub access_time: Vec<AccessTime>,
    /// Force a password change at next login
    pub require_password_change: bool,
}

/// A login window on one day of the week
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessTime {
    /// 0 Sunday ... 6 Saturday
    pub day_of_week: u8,
    /// `HH:MM`
    pub from: String,
    /// `HH:MM`
    pub to: String,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl UserPayload {
    /// Whether this record carries write-only material (a password or
    /// filesystem secrets) that must be re-sent to take effect
    pub fn carries_credentials(&self) -> bool {
        self.password.as_deref().is_some_and(|p| !p.is_empty())
            || self.filesystem.as_ref().is_some_and(Filesystem::has_secrets)
    }

    /// Whether `remote` already matches every field this operator manages.
    ///
    /// Ignores `id`, the password (never returned) and secret payloads
    /// (returned encrypted).
    pub fn owned_fields_match(&self, remote: &UserPayload) -> bool {
        let email = |e: &Option<String>| e.clone().filter(|e| !e.is_empty());
        let fs = |f: &Option<Filesystem>| f.clone().unwrap_or_default().without_secrets();
        let filters = |f: &Option<UserFilters>| f.clone().unwrap_or_default();

        self.username == remote.username
            && self.status == remote.status
            && email(&self.email) == email(&remote.email)
            && self.public_keys == remote.public_keys
            && self.home_dir == remote.home_dir
            && self.virtual_folders == remote.virtual_folders
            && self.permissions == remote.permissions
            && self.quota_size == remote.quota_size
            && self.quota_files == remote.quota_files
            && self.upload_bandwidth == remote.upload_bandwidth
            && self.download_bandwidth == remote.download_bandwidth
            && self.max_sessions == remote.max_sessions
            && self.allowed_ip == remote.allowed_ip
            && self.denied_ip == remote.denied_ip
            && self.groups == remote.groups
            && fs(&self.filesystem) == fs(&remote.filesystem)
            && filters(&self.filters) == filters(&remote.filters)
    }
}
