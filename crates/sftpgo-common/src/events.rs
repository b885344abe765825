//! Kubernetes Event recording for the SFTPGo controllers.
//!
//! Wraps `kube::runtime::events::Recorder` behind a trait so controllers can
//! emit Events visible via `kubectl describe` and tests can swap in a no-op.
//!
//! Events are fire-and-forget: failures are logged as warnings and never
//! propagate. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on the given resource.
    ///
    /// * `resource_ref` - object the event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - one of [`reasons`]
    /// * `action` - one of [`actions`]
    /// * `note` - optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
    /// (e.g. "sftpgo-user-controller").
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Stable reason codes.
///
/// Used both as the `reason` of the `Ready` condition and as the Event
/// reason, so `kubectl get events` and `.status.conditions` line up.
pub mod reasons {
    /// Server children applied
    pub const RECONCILED: &str = "Reconciled";
    /// Remote user matches the spec
    pub const SYNCED: &str = "Synced";
    /// Referenced SftpGoServer does not exist
    pub const SERVER_NOT_FOUND: &str = "ServerNotFound";
    /// A referenced Secret or key is missing
    pub const SECRET_NOT_FOUND: &str = "SecretNotFound";
    /// Server has no admin credentials secret configured
    pub const AUTH_NOT_CONFIGURED: &str = "AuthNotConfigured";
    /// Admin credentials could not be read or were rejected
    pub const AUTH_ERROR: &str = "AuthError";
    /// Spec failed validation
    pub const VALIDATION_ERROR: &str = "ValidationError";
    /// Admin REST API call failed
    pub const API_ERROR: &str = "APIError";
    /// Configuration ConfigMap could not be applied
    pub const CONFIG_MAP_ERROR: &str = "ConfigMapError";
    /// Data PVC could not be applied
    pub const STORAGE_ERROR: &str = "StorageError";
    /// Deployment could not be applied
    pub const DEPLOYMENT_ERROR: &str = "DeploymentError";
    /// Service could not be applied
    pub const SERVICE_ERROR: &str = "ServiceError";
    /// Finalizer running
    pub const DELETING: &str = "Deleting";
}

/// Event action strings.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Pushing a user to the admin API
    pub const SYNC: &str = "Sync";
    /// Finalizer cleanup
    pub const DELETE: &str = "Delete";
}
