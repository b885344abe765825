//! SftpGoUser spec to SFTPGo user record
//!
//! Pure mapping from a spec plus resolved credentials to the payload sent to
//! `/api/v2/users`. Unit conversions happen here: bandwidth in bytes/sec
//! becomes KB/s, the account state becomes SFTPGo's numeric status, and
//! filesystem secrets are inlined as plain SFTPGo secrets.

use std::collections::BTreeMap;

use sftpgo_client::types::{
    AccessTime, AzBlobConfig, CryptConfig, Filesystem, GcsConfig, GroupMapping, S3Config,
    SftpConfig, SftpGoSecret, UserFilters, VirtualFolder, GROUP_TYPE_PRIMARY, STATUS_DISABLED,
    STATUS_ENABLED,
};
use sftpgo_client::UserPayload;
use sftpgo_common::crd::{FilesystemConfig, FilesystemProvider, SftpGoUserSpec, UserState};
use sftpgo_common::Error;
use zeroize::Zeroizing;

use crate::resolve::{FilesystemSecrets, ResolvedCredentials};

/// Protocols SFTPGo can deny per user
pub const PROTOCOLS: [&str; 4] = ["SSH", "FTP", "DAV", "HTTP"];

/// Reject specs the API would refuse or misinterpret
pub fn validate_spec(name: &str, spec: &SftpGoUserSpec) -> Result<(), Error> {
    if spec.username.trim().is_empty() {
        return Err(Error::validation_for_field(
            name,
            "spec.username",
            "must not be empty",
        ));
    }
    if spec.home_dir.trim().is_empty() {
        return Err(Error::validation_for_field(
            name,
            "spec.homeDir",
            "must not be empty",
        ));
    }
    if spec.server_ref.name.is_empty() {
        return Err(Error::validation_for_field(
            name,
            "spec.serverRef.name",
            "must not be empty",
        ));
    }
    for protocol in &spec.protocols {
        if !PROTOCOLS.contains(&protocol.to_ascii_uppercase().as_str()) {
            return Err(Error::validation_for_field(
                name,
                "spec.protocols",
                format!("unknown protocol {protocol:?}, expected one of SSH, FTP, DAV, HTTP"),
            ));
        }
    }
    for interval in &spec.filters.time_intervals {
        if interval.start > 23 || interval.end > 23 || interval.days.iter().any(|d| *d > 6) {
            return Err(Error::validation_for_field(
                name,
                "spec.filters.timeIntervals",
                "hours must be 0-23 and days 0-6",
            ));
        }
    }
    Ok(())
}

/// Build the desired remote user
pub fn build_payload(spec: &SftpGoUserSpec, credentials: &ResolvedCredentials) -> UserPayload {
    let permissions = if spec.permissions.is_empty() {
        vec!["*".to_string()]
    } else {
        spec.permissions.clone()
    };
    let quota = spec.quota.clone().unwrap_or_default();
    let bandwidth = spec.bandwidth_limits.clone().unwrap_or_default();

    UserPayload {
        id: None,
        username: spec.username.clone(),
        status: match spec.status.unwrap_or_default() {
            UserState::Enabled => STATUS_ENABLED,
            UserState::Disabled => STATUS_DISABLED,
        },
        email: spec.email.clone().filter(|e| !e.is_empty()),
        password: credentials.password.as_deref().cloned(),
        public_keys: credentials.public_keys.clone(),
        home_dir: spec.home_dir.clone(),
        virtual_folders: spec
            .virtual_folders
            .iter()
            .map(|f| VirtualFolder {
                virtual_path: f.virtual_path.clone(),
                mapped_path: f.physical_path.clone(),
                quota_size: f.quota.unwrap_or(0),
                quota_files: 0,
            })
            .collect(),
        permissions: BTreeMap::from([("/".to_string(), permissions)]),
        quota_size: quota.size,
        quota_files: quota.files,
        upload_bandwidth: bandwidth.upload / 1024,
        download_bandwidth: bandwidth.download / 1024,
        max_sessions: spec.max_sessions.unwrap_or(0),
        allowed_ip: spec.allowed_ip.clone(),
        denied_ip: spec.denied_ip.clone(),
        groups: spec
            .groups
            .iter()
            .map(|name| GroupMapping {
                name: name.clone(),
                type_: GROUP_TYPE_PRIMARY,
            })
            .collect(),
        filesystem: spec
            .filesystem
            .as_ref()
            .map(|fs| build_filesystem(fs, &credentials.filesystem)),
        filters: Some(build_filters(spec)),
    }
}

fn build_filters(spec: &SftpGoUserSpec) -> UserFilters {
    UserFilters {
        denied_protocols: denied_protocols(&spec.protocols),
        access_time: spec
            .filters
            .time_intervals
            .iter()
            .flat_map(|interval| {
                let days: Vec<u8> = if interval.days.is_empty() {
                    (0..=6).collect()
                } else {
                    interval.days.clone()
                };
                days.into_iter().map(move |day| AccessTime {
                    day_of_week: day,
                    from: format!("{:02}:00", interval.start),
                    to: format!("{:02}:00", interval.end),
                })
            })
            .collect(),
        require_password_change: spec.filters.require_password_change,
    }
}

/// Protocols to deny: everything not in `allowed`, or nothing when
/// `allowed` is empty
pub fn denied_protocols(allowed: &[String]) -> Vec<String> {
    if allowed.is_empty() {
        return Vec::new();
    }
    let allowed: Vec<String> = allowed.iter().map(|p| p.to_ascii_uppercase()).collect();
    PROTOCOLS
        .iter()
        .filter(|p| !allowed.iter().any(|a| a == *p))
        .map(|p| p.to_string())
        .collect()
}

fn plain(secret: &Option<Zeroizing<String>>) -> Option<SftpGoSecret> {
    secret
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(|s| SftpGoSecret::plain(s.as_str()))
}

fn build_filesystem(fs: &FilesystemConfig, secrets: &FilesystemSecrets) -> Filesystem {
    let provider = fs.provider.unwrap_or_default();
    let mut out = Filesystem {
        provider: provider.sftpgo_id(),
        ..Default::default()
    };

    match provider {
        FilesystemProvider::Osfs => {}
        FilesystemProvider::S3fs => {
            let s3 = fs.s3.clone().unwrap_or_default();
            out.s3config = Some(S3Config {
                bucket: s3.bucket,
                region: s3.region.unwrap_or_default(),
                access_key: s3.access_key.unwrap_or_default(),
                access_secret: plain(&secrets.s3_access_secret),
                endpoint: s3.endpoint.unwrap_or_default(),
                storage_class: s3.storage_class.unwrap_or_default(),
                acl: s3.acl.unwrap_or_default(),
                upload_part_size: s3.upload_part_size.unwrap_or(0),
                key_prefix: s3.key_prefix.unwrap_or_default(),
            });
        }
        FilesystemProvider::Gcsfs => {
            let gcs = fs.gcs.clone().unwrap_or_default();
            out.gcsconfig = Some(GcsConfig {
                bucket: gcs.bucket,
                credentials: None,
                automatic_credentials: 1,
                storage_class: gcs.storage_class.unwrap_or_default(),
                key_prefix: gcs.key_prefix.unwrap_or_default(),
            });
        }
        FilesystemProvider::Azureblob => {
            let azure = fs.azure.clone().unwrap_or_default();
            out.azblobconfig = Some(AzBlobConfig {
                container: azure.container,
                account_name: azure.account_name.unwrap_or_default(),
                account_key: plain(&secrets.azure_account_key),
                sas_url: azure
                    .sas_url
                    .filter(|u| !u.is_empty())
                    .map(SftpGoSecret::plain),
                endpoint: azure.endpoint_suffix.unwrap_or_default(),
                upload_part_size: azure.upload_block_size.unwrap_or(0),
                key_prefix: azure.key_prefix.unwrap_or_default(),
            });
        }
        FilesystemProvider::Crypt | FilesystemProvider::Encrypted => {
            out.cryptconfig = Some(CryptConfig {
                passphrase: plain(&secrets.crypt_passphrase),
            });
        }
        FilesystemProvider::Sftpfs => {
            let sftp = fs.sftp.clone().unwrap_or_default();
            out.sftpconfig = Some(SftpConfig {
                endpoint: format!("{}:{}", sftp.host, sftp.port.unwrap_or(22)),
                username: sftp.username,
                password: plain(&secrets.sftp_password),
                private_key: plain(&secrets.sftp_private_key),
                prefix: sftp.remote_path.unwrap_or_default(),
            });
        }
    }
    out
}
