//! Common types for the SFTPGo operator: CRDs, errors, and controller utilities

#![deny(missing_docs)]

pub mod crd;
pub mod defaults;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod retry;
pub mod status;
pub mod telemetry;

pub use error::Error;
pub use events::{EventPublisher, KubeEventPublisher, NoopEventPublisher};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group of the operator's custom resources
pub const API_GROUP: &str = "sftpgo.sftpgo.io";

/// API version of the operator's custom resources
pub const API_VERSION: &str = "v1alpha1";

/// Field manager used for every server-side apply and status patch
pub const FIELD_MANAGER: &str = "sftpgo-operator";

/// Finalizer guarding SftpGoServer removal
pub const SERVER_FINALIZER: &str = "sftpgo.sftpgo.io/finalizer";

/// Finalizer guarding SftpGoUser removal until the remote user is deleted
pub const USER_FINALIZER: &str = "sftpgo.sftpgo.io/user-finalizer";

/// Annotation holding the hash of the controller-owned fields of a child object
pub const DESIRED_HASH_ANNOTATION: &str = "sftpgo.sftpgo.io/desired-hash";

/// Pod template annotation holding the hash of the rendered sftpgo.json
pub const CONFIG_HASH_ANNOTATION: &str = "sftpgo.sftpgo.io/config-hash";
