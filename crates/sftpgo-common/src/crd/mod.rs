//! Custom Resource Definitions for the SFTPGo operator

mod server;
mod types;
mod user;

pub use server::{
    CommonConfig, DatabaseConfig, FtpConfig, HttpConfig, PortRange, ServicePorts, SftpConfig,
    SftpGoConfig, SftpGoServer, SftpGoServerSpec, SftpGoServerStatus, StorageBackend,
    VolumeConfig, WebDavConfig,
};
pub use types::{
    preserve_unknown_object, Condition, ConditionStatus, LocalObjectRef, Phase,
    ResourceRequirements, SecretKeyRef, Toleration,
};
pub use user::{
    AzureFilesystemConfig, BandwidthLimits, CryptFilesystemConfig, FilesystemConfig,
    FilesystemProvider, GcsFilesystemConfig, Quota, RateLimits, S3FilesystemConfig, ServerRef,
    SftpFilesystemConfig, SftpGoUser, SftpGoUserSpec, SftpGoUserStatus, TimeInterval,
    UserFilters, UserState, VirtualFolder,
};
