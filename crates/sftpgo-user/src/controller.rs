//! SftpGoUser controller implementation
//!
//! Keeps one SFTPGo account in sync with each SftpGoUser. A pass resolves
//! the owning server and its admin credentials, resolves the user's own
//! secrets, builds the desired record and upserts it through the REST API.
//! Deletion removes the remote account before the finalizer is released,
//! unless the server or its credentials are already gone.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use sftpgo_client::AdminClient;
use sftpgo_common::crd::{Condition, Phase, SftpGoServer, SftpGoUser, SftpGoUserStatus};
use sftpgo_common::defaults::ServerSettings;
use sftpgo_common::events::{actions, reasons, EventPublisher};
use sftpgo_common::kube_utils::{self, lifecycle_of, LifecycleState};
use sftpgo_common::status::{
    conditions_equivalent, merge_condition, project, Outcome, READY_CONDITION,
};
use sftpgo_common::{Error, KubeEventPublisher, FIELD_MANAGER, USER_FINALIZER};

#[cfg(test)]
use sftpgo_common::NoopEventPublisher;

use crate::payload::{build_payload, validate_spec};
use crate::resolve::{resolve_admin, resolve_credentials, resolve_server, ResolveError};
use crate::sync::{delete_remote_user, upsert_remote_user, AdminApi, SyncError, SyncResult};

/// Periodic resync to catch drift made directly in SFTPGo
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

// =============================================================================
// Kubernetes client abstraction
// =============================================================================

/// Trait abstracting the Kubernetes operations the user controller needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait UserKubeClient: Send + Sync {
    /// Get an SftpGoServer by name
    async fn get_server(&self, name: &str, namespace: &str)
        -> Result<Option<SftpGoServer>, Error>;

    /// Get a Secret by name
    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error>;

    /// Attach the user finalizer
    async fn add_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Release the user finalizer
    async fn remove_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Merge-patch the status sub-resource of an SftpGoUser
    async fn patch_user_status(
        &self,
        name: &str,
        namespace: &str,
        status: &SftpGoUserStatus,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct UserKubeClientImpl {
    client: Client,
}

impl UserKubeClientImpl {
    /// Create a new UserKubeClientImpl
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl UserKubeClient for UserKubeClientImpl {
    async fn get_server(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<SftpGoServer>, Error> {
        let api: Api<SftpGoServer> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error> {
        Ok(kube_utils::get_secret(&self.client, name, namespace).await?)
    }

    async fn add_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error> {
        kube_utils::add_finalizer::<SftpGoUser>(
            &self.client,
            name,
            namespace,
            USER_FINALIZER,
            FIELD_MANAGER,
        )
        .await?;
        Ok(())
    }

    async fn remove_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error> {
        kube_utils::remove_finalizer::<SftpGoUser>(
            &self.client,
            name,
            namespace,
            USER_FINALIZER,
            FIELD_MANAGER,
        )
        .await?;
        Ok(())
    }

    async fn patch_user_status(
        &self,
        name: &str,
        namespace: &str,
        status: &SftpGoUserStatus,
    ) -> Result<(), Error> {
        kube_utils::patch_resource_status::<SftpGoUser>(
            &self.client,
            name,
            namespace,
            status,
            FIELD_MANAGER,
        )
        .await?;
        Ok(())
    }
}

// =============================================================================
// Controller context
// =============================================================================

/// Controller context shared across all user reconciliations
pub struct UserContext {
    /// Kubernetes client for API operations
    pub kube: Arc<dyn UserKubeClient>,
    /// SFTPGo admin API
    pub admin: Arc<dyn AdminApi>,
    /// Event publisher for emitting Kubernetes Events
    pub events: Arc<dyn EventPublisher>,
}

impl UserContext {
    /// Create a new UserContext with the given dependencies
    pub fn new(
        kube: Arc<dyn UserKubeClient>,
        admin: Arc<dyn AdminApi>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            kube,
            admin,
            events,
        }
    }

    /// Create a UserContext backed by a real Kubernetes client and an admin
    /// client whose requests time out after `admin_timeout`
    pub fn from_client(client: Client, admin_timeout: Duration) -> Result<Self, Error> {
        let admin = AdminClient::new(admin_timeout)
            .map_err(|e| Error::internal_with_context("admin_client", e.to_string()))?;
        let events = Arc::new(KubeEventPublisher::new(
            client.clone(),
            "sftpgo-user-controller",
        ));
        Ok(Self {
            kube: Arc::new(UserKubeClientImpl::new(client)),
            admin: Arc::new(admin),
            events,
        })
    }

    /// Create a context for testing with mock clients
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn UserKubeClient>, admin: Arc<dyn AdminApi>) -> Self {
        Self {
            kube,
            admin,
            events: Arc::new(NoopEventPublisher),
        }
    }
}

// =============================================================================
// SftpGoUser reconciliation
// =============================================================================

/// Reconcile an SftpGoUser
#[instrument(skip(user, ctx), fields(user = %user.name_any()))]
pub async fn reconcile(user: Arc<SftpGoUser>, ctx: Arc<UserContext>) -> Result<Action, Error> {
    let name = user.name_any();
    let namespace = user
        .namespace()
        .ok_or_else(|| Error::validation_for(&name, "SftpGoUser has no namespace"))?;

    match lifecycle_of(&user.metadata, USER_FINALIZER) {
        LifecycleState::Initializing => {
            debug!("adding finalizer");
            ctx.kube.add_finalizer(&name, &namespace).await?;
            Ok(Action::await_change())
        }
        LifecycleState::Terminating => {
            cleanup_remote(&user, &namespace, &ctx).await?;
            ctx.kube.remove_finalizer(&name, &namespace).await?;
            Ok(Action::await_change())
        }
        LifecycleState::Gone => Ok(Action::await_change()),
        LifecycleState::Active => converge(&user, &name, &namespace, &ctx).await,
    }
}

/// Error policy for the user controller
///
/// Retryable errors (transport failures, 5xx, conflicts) requeue after 30
/// seconds; anything else waits for a change to the user, its server or
/// its secrets.
pub fn error_policy(user: Arc<SftpGoUser>, error: &Error, _ctx: Arc<UserContext>) -> Action {
    error!(
        ?error,
        user = %user.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(Duration::from_secs(30))
    } else {
        Action::await_change()
    }
}

async fn converge(
    user: &SftpGoUser,
    name: &str,
    namespace: &str,
    ctx: &UserContext,
) -> Result<Action, Error> {
    info!(username = %user.spec.username, "reconciling user");

    if let Err(e) = validate_spec(name, &user.spec) {
        warn!(error = %e, "user spec rejected");
        record(user, ctx, failure(user, reasons::VALIDATION_ERROR, &e.to_string())).await?;
        return Ok(Action::await_change());
    }

    let server = match resolve_server(ctx.kube.as_ref(), &user.spec, namespace).await {
        Ok(server) => server,
        Err(e) => return park(user, ctx, e).await,
    };
    let settings = ServerSettings::from_spec(&server.spec);

    let conn = match resolve_admin(ctx.kube.as_ref(), &server, &settings).await {
        Ok(conn) => conn,
        Err(e) => return park(user, ctx, e).await,
    };

    let credentials = match resolve_credentials(ctx.kube.as_ref(), &user.spec, namespace).await {
        Ok(credentials) => credentials,
        Err(e) => return park(user, ctx, e).await,
    };

    let desired = build_payload(&user.spec, &credentials);
    match upsert_remote_user(ctx.admin.as_ref(), &conn, &desired).await {
        Ok(result) => {
            debug!(outcome = ?result.outcome, user_id = ?result.user_id, "remote user synced");
            record(user, ctx, synced(user, result)).await?;
            Ok(Action::requeue(RESYNC_INTERVAL))
        }
        Err(SyncError::MissingCredentials) => {
            let message = SyncError::MissingCredentials.to_string();
            warn!(%message, "refusing to create user");
            record(user, ctx, failure(user, reasons::VALIDATION_ERROR, &message)).await?;
            Ok(Action::await_change())
        }
        Err(SyncError::Api(e)) if e.is_auth_failure() => {
            warn!(error = %e, "admin credentials rejected");
            record(user, ctx, failure(user, reasons::AUTH_ERROR, &e.to_string())).await?;
            Ok(Action::await_change())
        }
        Err(SyncError::Api(e)) => {
            let message = e.to_string();
            if let Err(status_err) =
                record(user, ctx, failure(user, reasons::API_ERROR, &message)).await
            {
                warn!(error = %status_err, "failed to record API error in status");
            }
            Err(Error::admin_api(message, e.is_retryable()))
        }
    }
}

/// Record an unresolved reference and wait for a watch to fire.
///
/// Kubernetes API failures are returned for the error policy instead.
async fn park(user: &SftpGoUser, ctx: &UserContext, e: ResolveError) -> Result<Action, Error> {
    let message = e.to_string();
    let next = match e {
        ResolveError::Kube(err) => return Err(err),
        ResolveError::AuthNotConfigured { .. } => {
            info!(%message, "waiting for admin credentials");
            transition(
                user,
                Outcome::Waiting {
                    reason: reasons::AUTH_NOT_CONFIGURED,
                    message: &message,
                },
            )
        }
        other => {
            warn!(reason = other.reason(), %message, "reference unresolved");
            failure(user, other.reason(), &message)
        }
    };
    record(user, ctx, next).await?;
    Ok(Action::await_change())
}

/// Delete the remote account if it can still be reached.
///
/// A missing server, missing credentials or rejected credentials release
/// the user without cleanup; other API failures keep the finalizer.
async fn cleanup_remote(user: &SftpGoUser, namespace: &str, ctx: &UserContext) -> Result<(), Error> {
    let username = &user.spec.username;
    info!(%username, "user deleted, removing remote account");

    let server = match resolve_server(ctx.kube.as_ref(), &user.spec, namespace).await {
        Ok(server) => server,
        Err(ResolveError::Kube(e)) => return Err(e),
        Err(e) => {
            info!(reason = e.reason(), "server gone, skipping remote cleanup");
            return Ok(());
        }
    };
    let settings = ServerSettings::from_spec(&server.spec);
    let conn = match resolve_admin(ctx.kube.as_ref(), &server, &settings).await {
        Ok(conn) => conn,
        Err(ResolveError::Kube(e)) => return Err(e),
        Err(e) => {
            warn!(reason = e.reason(), error = %e, "no admin credentials, skipping remote cleanup");
            return Ok(());
        }
    };

    match delete_remote_user(ctx.admin.as_ref(), &conn, username).await {
        Ok(()) => {
            ctx.events
                .publish(
                    &user.object_ref(&()),
                    EventType::Normal,
                    reasons::DELETING,
                    actions::DELETE,
                    Some(format!("deleted SFTPGo user {username}")),
                )
                .await;
            Ok(())
        }
        Err(e) if e.is_auth_failure() => {
            warn!(error = %e, "admin credentials rejected, releasing user without remote cleanup");
            Ok(())
        }
        Err(e) => {
            let message = e.to_string();
            if let Err(status_err) =
                record(user, ctx, failure(user, reasons::API_ERROR, &message)).await
            {
                warn!(error = %status_err, "failed to record cleanup error in status");
            }
            // Keep retrying while the finalizer holds the object
            Err(Error::admin_api(message, true))
        }
    }
}

// =============================================================================
// Status
// =============================================================================

/// Apply an outcome to the current status: phase and conditions only
fn transition(user: &SftpGoUser, outcome: Outcome<'_>) -> SftpGoUserStatus {
    let mut status = user.status.clone().unwrap_or_default();
    let projection = project(outcome);
    status.phase = Some(projection.phase);
    status.conditions = merge_condition(&status.conditions, projection.condition);
    status
}

fn failure(user: &SftpGoUser, reason: &str, message: &str) -> SftpGoUserStatus {
    transition(user, Outcome::Failed { reason, message })
}

/// Converged status. `lastSynced` moves only when the remote user's fields
/// changed or the status would change anyway.
fn synced(user: &SftpGoUser, result: SyncResult) -> SftpGoUserStatus {
    let mut status = transition(
        user,
        Outcome::Converged {
            phase: Phase::Synced,
            reason: reasons::SYNCED,
            message: "SftpGoUser synced",
        },
    );
    status.user_id = result.user_id.or(status.user_id);
    status.observed_generation = user.metadata.generation;

    if result.outcome.changed_fields() || !is_status_unchanged(user.status.as_ref(), &status) {
        status.last_synced = Some(Utc::now());
    }
    status
}

fn ready_condition(status: Option<&SftpGoUserStatus>) -> Option<&Condition> {
    status.and_then(|s| s.conditions.iter().find(|c| c.type_ == READY_CONDITION))
}

/// Check if the status already matches, ignoring condition timestamps
fn is_status_unchanged(current: Option<&SftpGoUserStatus>, next: &SftpGoUserStatus) -> bool {
    current.is_some_and(|c| {
        c.phase == next.phase
            && c.user_id == next.user_id
            && c.last_synced == next.last_synced
            && c.observed_generation == next.observed_generation
            && conditions_equivalent(&c.conditions, &next.conditions)
    })
}

/// Write `next` unless it matches the current status. Publishes an Event
/// when the `Ready` condition changes.
async fn record(user: &SftpGoUser, ctx: &UserContext, next: SftpGoUserStatus) -> Result<(), Error> {
    let current = user.status.as_ref();
    if is_status_unchanged(current, &next) {
        debug!("status unchanged, skipping update");
        return Ok(());
    }

    let name = user.name_any();
    let namespace = user.namespace().unwrap_or_default();
    ctx.kube.patch_user_status(&name, &namespace, &next).await?;

    if let Some(ready) = ready_condition(Some(&next)) {
        let changed = ready_condition(current).is_none_or(|prev| !prev.same_state(ready));
        if changed {
            let type_ = if next.phase == Some(Phase::Error) {
                EventType::Warning
            } else {
                EventType::Normal
            };
            ctx.events
                .publish(
                    &user.object_ref(&()),
                    type_,
                    &ready.reason,
                    actions::SYNC,
                    Some(ready.message.clone()),
                )
                .await;
        }
    }
    Ok(())
}
