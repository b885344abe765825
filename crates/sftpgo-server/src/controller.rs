//! SftpGoServer controller implementation
//!
//! Drives each SftpGoServer toward its desired child set: a ConfigMap with
//! `sftpgo.json`, an optional data PVC, a Deployment and a Service. Children
//! are applied in that fixed order and carry an owner reference, so deletion
//! only has to release the finalizer and let garbage collection cascade.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Service};
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use sftpgo_common::crd::{Condition, Phase, ServicePorts, SftpGoServer, SftpGoServerStatus};
use sftpgo_common::defaults::ServerSettings;
use sftpgo_common::events::{actions, reasons, EventPublisher};
use sftpgo_common::kube_utils::{self, lifecycle_of, ApplyOutcome, ApplyPolicy, LifecycleState};
use sftpgo_common::status::{
    conditions_equivalent, merge_condition, project, Outcome, READY_CONDITION,
};
use sftpgo_common::{Error, KubeEventPublisher, FIELD_MANAGER, SERVER_FINALIZER};

#[cfg(test)]
use sftpgo_common::NoopEventPublisher;

use crate::resources::{build_children, DesiredChildSet};

/// Periodic resync for converged servers
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

// =============================================================================
// Kubernetes client abstraction
// =============================================================================

/// Trait abstracting the Kubernetes operations the server controller needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ServerKubeClient: Send + Sync {
    /// Attach the server finalizer
    async fn add_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Release the server finalizer
    async fn remove_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Apply the configuration ConfigMap
    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<ApplyOutcome, Error>;

    /// Create the data PVC; an existing claim is left as is
    async fn apply_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<ApplyOutcome, Error>;

    /// Apply the Deployment
    async fn apply_deployment(&self, deployment: &Deployment) -> Result<ApplyOutcome, Error>;

    /// Apply the Service
    async fn apply_service(&self, service: &Service) -> Result<ApplyOutcome, Error>;

    /// Read back a Deployment to report replica counts
    async fn get_deployment(&self, name: &str, namespace: &str)
        -> Result<Option<Deployment>, Error>;

    /// Merge-patch the status sub-resource of an SftpGoServer
    async fn patch_server_status(
        &self,
        name: &str,
        namespace: &str,
        status: &SftpGoServerStatus,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct ServerKubeClientImpl {
    client: Client,
}

impl ServerKubeClientImpl {
    /// Create a new ServerKubeClientImpl
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ServerKubeClient for ServerKubeClientImpl {
    async fn add_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error> {
        kube_utils::add_finalizer::<SftpGoServer>(
            &self.client,
            name,
            namespace,
            SERVER_FINALIZER,
            FIELD_MANAGER,
        )
        .await?;
        Ok(())
    }

    async fn remove_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error> {
        kube_utils::remove_finalizer::<SftpGoServer>(
            &self.client,
            name,
            namespace,
            SERVER_FINALIZER,
            FIELD_MANAGER,
        )
        .await?;
        Ok(())
    }

    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<ApplyOutcome, Error> {
        kube_utils::apply_owned(&self.client, config_map, FIELD_MANAGER, ApplyPolicy::Reconcile)
            .await
    }

    async fn apply_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<ApplyOutcome, Error> {
        // PVC specs are immutable once bound
        kube_utils::apply_owned(&self.client, pvc, FIELD_MANAGER, ApplyPolicy::CreateOnly).await
    }

    async fn apply_deployment(&self, deployment: &Deployment) -> Result<ApplyOutcome, Error> {
        kube_utils::apply_owned(&self.client, deployment, FIELD_MANAGER, ApplyPolicy::Reconcile)
            .await
    }

    async fn apply_service(&self, service: &Service) -> Result<ApplyOutcome, Error> {
        kube_utils::apply_owned(&self.client, service, FIELD_MANAGER, ApplyPolicy::Reconcile)
            .await
    }

    async fn get_deployment(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<Deployment>, Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn patch_server_status(
        &self,
        name: &str,
        namespace: &str,
        status: &SftpGoServerStatus,
    ) -> Result<(), Error> {
        kube_utils::patch_resource_status::<SftpGoServer>(
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

/// Controller context shared across all server reconciliations
pub struct ServerContext {
    /// Kubernetes client for API operations
    pub kube: Arc<dyn ServerKubeClient>,
    /// Event publisher for emitting Kubernetes Events
    pub events: Arc<dyn EventPublisher>,
}

impl ServerContext {
    /// Create a new ServerContext with the given dependencies
    pub fn new(kube: Arc<dyn ServerKubeClient>, events: Arc<dyn EventPublisher>) -> Self {
        Self { kube, events }
    }

    /// Create a ServerContext backed by a real Kubernetes client
    pub fn from_client(client: Client) -> Self {
        let events = Arc::new(KubeEventPublisher::new(
            client.clone(),
            "sftpgo-server-controller",
        ));
        Self {
            kube: Arc::new(ServerKubeClientImpl::new(client)),
            events,
        }
    }

    /// Create a context for testing with mock clients
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn ServerKubeClient>) -> Self {
        Self {
            kube,
            events: Arc::new(NoopEventPublisher),
        }
    }
}

// =============================================================================
// SftpGoServer reconciliation
// =============================================================================

/// Reconcile an SftpGoServer
///
/// Attaches the finalizer on first sight, releases it on deletion, and
/// otherwise applies the desired children and reports their state.
#[instrument(skip(server, ctx), fields(server = %server.name_any()))]
pub async fn reconcile(server: Arc<SftpGoServer>, ctx: Arc<ServerContext>) -> Result<Action, Error> {
    let name = server.name_any();
    let namespace = server
        .namespace()
        .ok_or_else(|| Error::validation_for(&name, "SftpGoServer has no namespace"))?;

    match lifecycle_of(&server.metadata, SERVER_FINALIZER) {
        LifecycleState::Initializing => {
            debug!("adding finalizer");
            ctx.kube.add_finalizer(&name, &namespace).await?;
            // The finalizer patch triggers the next pass
            Ok(Action::await_change())
        }
        LifecycleState::Terminating => {
            info!("server deleted, releasing finalizer");
            ctx.events
                .publish(
                    &server.object_ref(&()),
                    EventType::Normal,
                    reasons::DELETING,
                    actions::DELETE,
                    Some("children are removed by owner reference".to_string()),
                )
                .await;
            ctx.kube.remove_finalizer(&name, &namespace).await?;
            Ok(Action::await_change())
        }
        LifecycleState::Gone => Ok(Action::await_change()),
        LifecycleState::Active => converge(&server, &name, &namespace, &ctx).await,
    }
}

/// Error policy for the server controller
///
/// Retryable errors requeue after 30 seconds; anything else waits for a
/// spec change.
pub fn error_policy(server: Arc<SftpGoServer>, error: &Error, _ctx: Arc<ServerContext>) -> Action {
    error!(
        ?error,
        server = %server.name_any(),
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
    server: &SftpGoServer,
    name: &str,
    namespace: &str,
    ctx: &ServerContext,
) -> Result<Action, Error> {
    info!("reconciling server");

    let settings = ServerSettings::from_spec(&server.spec);
    let children = match server
        .spec
        .validate(name)
        .and_then(|()| build_children(server, &settings))
    {
        Ok(children) => children,
        Err(e) if !e.is_retryable() => {
            warn!(error = %e, "server spec rejected");
            let message = e.to_string();
            let next = failed_status(
                server.status.as_ref(),
                reasons::VALIDATION_ERROR,
                &message,
            );
            update_status(server, ctx, next).await?;
            // Needs a spec change
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e),
    };

    if let Err((reason, e)) = apply_children(&children, ctx).await {
        warn!(reason, error = %e, "applying children failed");
        let message = e.to_string();
        let next = failed_status(server.status.as_ref(), reason, &message);
        if let Err(status_err) = update_status(server, ctx, next).await {
            warn!(error = %status_err, "failed to record apply failure in status");
        }
        return Err(e);
    }

    let deployment = ctx.kube.get_deployment(name, namespace).await?;
    let next = running_status(server, deployment.as_ref(), &settings);
    update_status(server, ctx, next).await?;

    Ok(Action::requeue(RESYNC_INTERVAL))
}

/// Apply children in order: ConfigMap, PVC, Deployment, Service.
///
/// Stops at the first failure and returns the reason code for it.
async fn apply_children(
    children: &DesiredChildSet,
    ctx: &ServerContext,
) -> Result<(), (&'static str, Error)> {
    let outcome = ctx
        .kube
        .apply_config_map(&children.config_map)
        .await
        .map_err(|e| (reasons::CONFIG_MAP_ERROR, e))?;
    debug!(?outcome, config_hash = %children.config_hash, "configmap");

    if let Some(pvc) = &children.pvc {
        let outcome = ctx
            .kube
            .apply_pvc(pvc)
            .await
            .map_err(|e| (reasons::STORAGE_ERROR, e))?;
        debug!(?outcome, "pvc");
    }

    let outcome = ctx
        .kube
        .apply_deployment(&children.deployment)
        .await
        .map_err(|e| (reasons::DEPLOYMENT_ERROR, e))?;
    debug!(?outcome, "deployment");

    let outcome = ctx
        .kube
        .apply_service(&children.service)
        .await
        .map_err(|e| (reasons::SERVICE_ERROR, e))?;
    debug!(?outcome, "service");

    Ok(())
}

// =============================================================================
// Status
// =============================================================================

/// Failure status: only phase and conditions change
fn failed_status(
    current: Option<&SftpGoServerStatus>,
    reason: &str,
    message: &str,
) -> SftpGoServerStatus {
    let mut status = current.cloned().unwrap_or_default();
    let projection = project(Outcome::Failed { reason, message });
    status.phase = Some(projection.phase);
    status.conditions = merge_condition(&status.conditions, projection.condition);
    status
}

fn running_status(
    server: &SftpGoServer,
    deployment: Option<&Deployment>,
    settings: &ServerSettings,
) -> SftpGoServerStatus {
    let mut status = server.status.clone().unwrap_or_default();
    let projection = project(Outcome::Converged {
        phase: Phase::Running,
        reason: reasons::RECONCILED,
        message: "SftpGoServer reconciled",
    });
    status.phase = Some(projection.phase);
    status.conditions = merge_condition(&status.conditions, projection.condition);

    let observed = deployment.and_then(|d| d.status.as_ref());
    status.replicas = Some(observed.and_then(|s| s.replicas).unwrap_or(0));
    status.ready_replicas = Some(observed.and_then(|s| s.ready_replicas).unwrap_or(0));
    status.ports = Some(ServicePorts {
        sftp: settings.sftp_port,
        web: settings.web_port,
        http: settings.web_port,
        ftp: settings.ftp_port,
        webdav: settings.webdav_port,
    });
    status.observed_generation = server.metadata.generation;
    status
}

fn ready_condition(status: Option<&SftpGoServerStatus>) -> Option<&Condition> {
    status.and_then(|s| s.conditions.iter().find(|c| c.type_ == READY_CONDITION))
}

/// Check if the status already matches, ignoring condition timestamps.
///
/// Each status patch produces a watch event, so writing an identical status
/// would trigger another reconcile.
fn is_status_unchanged(current: Option<&SftpGoServerStatus>, next: &SftpGoServerStatus) -> bool {
    current.is_some_and(|c| {
        c.phase == next.phase
            && c.replicas == next.replicas
            && c.ready_replicas == next.ready_replicas
            && c.ports == next.ports
            && c.observed_generation == next.observed_generation
            && conditions_equivalent(&c.conditions, &next.conditions)
    })
}

/// Write `next` unless it matches the current status. Publishes an Event
/// when the `Ready` condition changes.
async fn update_status(
    server: &SftpGoServer,
    ctx: &ServerContext,
    next: SftpGoServerStatus,
) -> Result<(), Error> {
    let current = server.status.as_ref();
    if is_status_unchanged(current, &next) {
        debug!("status unchanged, skipping update");
        return Ok(());
    }

    let name = server.name_any();
    let namespace = server.namespace().unwrap_or_default();
    ctx.kube
        .patch_server_status(&name, &namespace, &next)
        .await?;

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
                    &server.object_ref(&()),
                    type_,
                    &ready.reason,
                    actions::RECONCILE,
                    Some(ready.message.clone()),
                )
                .await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use k8s_openapi::api::apps::v1::DeploymentStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use sftpgo_common::crd::{ConditionStatus, SftpGoServerSpec, StorageBackend, VolumeConfig};
    use std::sync::Mutex;

    // =========================================================================
    // Test Fixtures
    // =========================================================================

    fn sample_server(name: &str) -> SftpGoServer {
        let mut server = SftpGoServer::new(name, SftpGoServerSpec::default());
        server.metadata = ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("files".to_string()),
            uid: Some("5f0c1e9a-1111-2222-3333-444455556666".to_string()),
            generation: Some(3),
            finalizers: Some(vec![SERVER_FINALIZER.to_string()]),
            ..Default::default()
        };
        server
    }

    fn server_with_volume(name: &str) -> SftpGoServer {
        let mut server = sample_server(name);
        server.spec.data_volume = Some(VolumeConfig {
            size: Some("5Gi".to_string()),
            ..Default::default()
        });
        server
    }

    fn ready_deployment(replicas: i32, ready: i32) -> Deployment {
        Deployment {
            status: Some(DeploymentStatus {
                replicas: Some(replicas),
                ready_replicas: Some(ready),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    // =========================================================================
    // Mock Setup
    // =========================================================================

    fn mock_kube_success() -> MockServerKubeClient {
        let mut mock = MockServerKubeClient::new();
        mock.expect_add_finalizer().returning(|_, _| Ok(()));
        mock.expect_remove_finalizer().returning(|_, _| Ok(()));
        mock.expect_apply_config_map()
            .returning(|_| Ok(ApplyOutcome::Created));
        mock.expect_apply_pvc().returning(|_| Ok(ApplyOutcome::Created));
        mock.expect_apply_deployment()
            .returning(|_| Ok(ApplyOutcome::Created));
        mock.expect_apply_service()
            .returning(|_| Ok(ApplyOutcome::Created));
        mock.expect_get_deployment()
            .returning(|_, _| Ok(Some(ready_deployment(1, 1))));
        mock.expect_patch_server_status()
            .returning(|_, _, _| Ok(()));
        mock
    }

    fn capture_status(mock: &mut MockServerKubeClient) -> Arc<Mutex<Vec<SftpGoServerStatus>>> {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let sink = captured.clone();
        mock.expect_patch_server_status()
            .returning(move |_, _, status| {
                sink.lock().unwrap().push(status.clone());
                Ok(())
            });
        captured
    }

    // =========================================================================
    // Reconciliation Story Tests
    // =========================================================================

    /// Story: a new server only gets its finalizer on the first pass
    #[tokio::test]
    async fn story_new_server_gets_finalizer_and_stops() {
        let mut server = sample_server("sftp");
        server.metadata.finalizers = None;

        let mut mock = MockServerKubeClient::new();
        mock.expect_add_finalizer()
            .withf(|name, ns| name == "sftp" && ns == "files")
            .times(1)
            .returning(|_, _| Ok(()));
        // No apply or status expectations: any such call would panic
        let ctx = Arc::new(ServerContext::for_testing(Arc::new(mock)));

        let action = reconcile(Arc::new(server), ctx)
            .await
            .expect("reconcile should succeed");
        assert_eq!(action, Action::await_change());
    }

    /// Story: a default server converges to Running with default ports
    #[tokio::test]
    async fn story_default_server_converges_to_running() {
        let server = Arc::new(sample_server("sftp"));

        let mut mock = MockServerKubeClient::new();
        mock.expect_apply_config_map()
            .times(1)
            .returning(|_| Ok(ApplyOutcome::Created));
        // No data volume requested
        mock.expect_apply_pvc().never();
        mock.expect_apply_deployment()
            .times(1)
            .returning(|_| Ok(ApplyOutcome::Created));
        mock.expect_apply_service()
            .times(1)
            .returning(|_| Ok(ApplyOutcome::Created));
        mock.expect_get_deployment()
            .returning(|_, _| Ok(Some(ready_deployment(1, 0))));
        let captured = capture_status(&mut mock);
        let ctx = Arc::new(ServerContext::for_testing(Arc::new(mock)));

        let action = reconcile(server, ctx).await.expect("reconcile should succeed");
        assert_eq!(action, Action::requeue(RESYNC_INTERVAL));

        let statuses = captured.lock().unwrap();
        assert_eq!(statuses.len(), 1);
        let status = &statuses[0];
        assert_eq!(status.phase, Some(Phase::Running));
        assert_eq!(status.replicas, Some(1));
        assert_eq!(status.ready_replicas, Some(0));
        assert_eq!(status.observed_generation, Some(3));
        let ports = status.ports.as_ref().expect("ports reported");
        assert_eq!((ports.sftp, ports.web, ports.http), (2022, 8080, 8080));
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].reason, reasons::RECONCILED);
        assert_eq!(status.conditions[0].status, ConditionStatus::True);
    }

    /// Story: children are applied in a fixed order, PVC included when requested
    #[tokio::test]
    async fn story_children_applied_in_fixed_order() {
        let server = Arc::new(server_with_volume("sftp"));
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut mock = MockServerKubeClient::new();
        let o = order.clone();
        mock.expect_apply_config_map().returning(move |_| {
            o.lock().unwrap().push("configmap");
            Ok(ApplyOutcome::Created)
        });
        let o = order.clone();
        mock.expect_apply_pvc().returning(move |pvc| {
            assert_eq!(pvc.metadata.name.as_deref(), Some("sftp-data"));
            o.lock().unwrap().push("pvc");
            Ok(ApplyOutcome::Created)
        });
        let o = order.clone();
        mock.expect_apply_deployment().returning(move |_| {
            o.lock().unwrap().push("deployment");
            Ok(ApplyOutcome::Created)
        });
        let o = order.clone();
        mock.expect_apply_service().returning(move |_| {
            o.lock().unwrap().push("service");
            Ok(ApplyOutcome::Created)
        });
        mock.expect_get_deployment().returning(|_, _| Ok(None));
        mock.expect_patch_server_status()
            .returning(|_, _, _| Ok(()));
        let ctx = Arc::new(ServerContext::for_testing(Arc::new(mock)));

        reconcile(server, ctx).await.expect("reconcile should succeed");
        assert_eq!(
            *order.lock().unwrap(),
            vec!["configmap", "pvc", "deployment", "service"]
        );
    }

    /// Story: a failed Deployment apply records DeploymentError and stops
    #[tokio::test]
    async fn story_deployment_failure_sets_error_and_skips_service() {
        let mut server = sample_server("sftp");
        server.status = Some(SftpGoServerStatus {
            phase: Some(Phase::Running),
            replicas: Some(2),
            ready_replicas: Some(2),
            ..Default::default()
        });
        let server = Arc::new(server);

        let mut mock = MockServerKubeClient::new();
        mock.expect_apply_config_map()
            .returning(|_| Ok(ApplyOutcome::Unchanged));
        mock.expect_apply_deployment()
            .returning(|_| Err(Error::internal("apiserver unavailable")));
        mock.expect_apply_service().never();
        mock.expect_get_deployment().never();
        let captured = capture_status(&mut mock);
        let ctx = Arc::new(ServerContext::for_testing(Arc::new(mock)));

        let result = reconcile(server, ctx).await;
        assert!(result.is_err());

        let statuses = captured.lock().unwrap();
        let status = &statuses[0];
        assert_eq!(status.phase, Some(Phase::Error));
        assert_eq!(status.conditions[0].reason, reasons::DEPLOYMENT_ERROR);
        assert!(status.conditions[0].message.contains("apiserver unavailable"));
        // Counts from the last good pass are left alone
        assert_eq!(status.replicas, Some(2));
        assert_eq!(status.ready_replicas, Some(2));
    }

    /// Story: a ConfigMap apply failure is reported as ConfigMapError
    #[tokio::test]
    async fn story_config_map_failure_reports_reason() {
        let server = Arc::new(sample_server("sftp"));

        let mut mock = MockServerKubeClient::new();
        mock.expect_apply_config_map()
            .returning(|_| Err(Error::internal("forbidden")));
        mock.expect_apply_deployment().never();
        let captured = capture_status(&mut mock);
        let ctx = Arc::new(ServerContext::for_testing(Arc::new(mock)));

        assert!(reconcile(server, ctx).await.is_err());
        let statuses = captured.lock().unwrap();
        assert_eq!(statuses[0].conditions[0].reason, reasons::CONFIG_MAP_ERROR);
    }

    /// Story: an invalid spec parks with ValidationError and applies nothing
    #[tokio::test]
    async fn story_invalid_spec_parks_without_applying() {
        let mut server = sample_server("sftp");
        server.spec.storage_backend = Some(StorageBackend::Postgres);
        let server = Arc::new(server);

        let mut mock = MockServerKubeClient::new();
        mock.expect_apply_config_map().never();
        let captured = capture_status(&mut mock);
        let ctx = Arc::new(ServerContext::for_testing(Arc::new(mock)));

        let action = reconcile(server, ctx).await.expect("validation parks");
        assert_eq!(action, Action::await_change());
        let statuses = captured.lock().unwrap();
        assert_eq!(statuses[0].phase, Some(Phase::Error));
        assert_eq!(statuses[0].conditions[0].reason, reasons::VALIDATION_ERROR);
    }

    /// Story: a second pass with nothing new does not rewrite status
    #[tokio::test]
    async fn story_converged_server_skips_status_write() {
        let mut server = sample_server("sftp");
        let settings = ServerSettings::from_spec(&server.spec);
        server.status = Some(running_status(
            &server,
            Some(&ready_deployment(1, 1)),
            &settings,
        ));
        let server = Arc::new(server);

        let mut mock = MockServerKubeClient::new();
        mock.expect_apply_config_map()
            .returning(|_| Ok(ApplyOutcome::Unchanged));
        mock.expect_apply_deployment()
            .returning(|_| Ok(ApplyOutcome::Unchanged));
        mock.expect_apply_service()
            .returning(|_| Ok(ApplyOutcome::Unchanged));
        mock.expect_get_deployment()
            .returning(|_, _| Ok(Some(ready_deployment(1, 1))));
        mock.expect_patch_server_status().never();
        let ctx = Arc::new(ServerContext::for_testing(Arc::new(mock)));

        let action = reconcile(server, ctx).await.expect("reconcile should succeed");
        assert_eq!(action, Action::requeue(RESYNC_INTERVAL));
    }

    /// Story: a converged server still re-applies every child each pass, so a
    /// hand-edited Deployment is put back even though nothing else changed
    #[tokio::test]
    async fn story_converged_server_reapplies_children_to_repair_drift() {
        let mut server = sample_server("sftp");
        let settings = ServerSettings::from_spec(&server.spec);
        server.status = Some(running_status(
            &server,
            Some(&ready_deployment(1, 1)),
            &settings,
        ));
        let server = Arc::new(server);

        let mut mock = MockServerKubeClient::new();
        mock.expect_apply_config_map()
            .times(1)
            .returning(|_| Ok(ApplyOutcome::Unchanged));
        mock.expect_apply_deployment()
            .times(1)
            .returning(|_| Ok(ApplyOutcome::Updated));
        mock.expect_apply_service()
            .times(1)
            .returning(|_| Ok(ApplyOutcome::Unchanged));
        mock.expect_get_deployment()
            .returning(|_, _| Ok(Some(ready_deployment(1, 1))));
        mock.expect_patch_server_status().never();
        let ctx = Arc::new(ServerContext::for_testing(Arc::new(mock)));

        let action = reconcile(server, ctx).await.expect("reconcile should succeed");
        assert_eq!(action, Action::requeue(RESYNC_INTERVAL));
    }

    /// Story: changing the storage class of an existing volume does not
    /// wedge the server; the claim is left alone and the rest converges
    #[tokio::test]
    async fn story_storage_class_change_on_existing_volume_keeps_running() {
        let mut server = server_with_volume("sftp");
        if let Some(volume) = server.spec.data_volume.as_mut() {
            volume.storage_class = Some("fast-ssd".to_string());
        }
        let server = Arc::new(server);

        let mut mock = MockServerKubeClient::new();
        mock.expect_apply_config_map()
            .returning(|_| Ok(ApplyOutcome::Unchanged));
        mock.expect_apply_pvc()
            .times(1)
            .withf(|pvc| {
                pvc.spec.as_ref().and_then(|s| s.storage_class_name.as_deref()) == Some("fast-ssd")
            })
            .returning(|_| Ok(ApplyOutcome::Unchanged));
        mock.expect_apply_deployment()
            .times(1)
            .returning(|_| Ok(ApplyOutcome::Unchanged));
        mock.expect_apply_service()
            .times(1)
            .returning(|_| Ok(ApplyOutcome::Unchanged));
        mock.expect_get_deployment()
            .returning(|_, _| Ok(Some(ready_deployment(1, 1))));
        let statuses = capture_status(&mut mock);
        let ctx = Arc::new(ServerContext::for_testing(Arc::new(mock)));

        let action = reconcile(server, ctx).await.expect("reconcile should succeed");
        assert_eq!(action, Action::requeue(RESYNC_INTERVAL));

        let statuses = statuses.lock().unwrap();
        assert_eq!(statuses.last().and_then(|s| s.phase), Some(Phase::Running));
    }

    /// Story: ports from the config block reach the Service and the status
    #[tokio::test]
    async fn story_configured_ports_reach_service_and_status() {
        let mut server = sample_server("sftp");
        server.spec.sftp_port = Some(2222);
        server.spec.web_port = Some(9090);
        let server = Arc::new(server);

        let mut mock = MockServerKubeClient::new();
        mock.expect_apply_config_map()
            .returning(|_| Ok(ApplyOutcome::Created));
        mock.expect_apply_deployment()
            .returning(|_| Ok(ApplyOutcome::Created));
        mock.expect_apply_service()
            .withf(|svc| {
                let ports: Vec<i32> = svc
                    .spec
                    .iter()
                    .flat_map(|s| s.ports.iter().flatten())
                    .map(|p| p.port)
                    .collect();
                ports.contains(&2222) && ports.contains(&9090)
            })
            .times(1)
            .returning(|_| Ok(ApplyOutcome::Created));
        mock.expect_get_deployment().returning(|_, _| Ok(None));
        let statuses = capture_status(&mut mock);
        let ctx = Arc::new(ServerContext::for_testing(Arc::new(mock)));

        reconcile(server, ctx).await.expect("reconcile should succeed");

        let statuses = statuses.lock().unwrap();
        let ports = statuses[0].ports.as_ref().expect("ports reported");
        assert_eq!(ports.sftp, 2222);
        assert_eq!(ports.web, 9090);
    }

    /// Story: deleting a server only releases the finalizer
    #[tokio::test]
    async fn story_deleted_server_releases_finalizer() {
        let mut server = sample_server("sftp");
        server.metadata.deletion_timestamp = Some(Time(Utc::now()));

        let mut mock = MockServerKubeClient::new();
        mock.expect_remove_finalizer()
            .times(1)
            .returning(|_, _| Ok(()));
        mock.expect_apply_config_map().never();
        let ctx = Arc::new(ServerContext::for_testing(Arc::new(mock)));

        let action = reconcile(Arc::new(server), ctx)
            .await
            .expect("reconcile should succeed");
        assert_eq!(action, Action::await_change());
    }

    /// Story: a deleting server without our finalizer is left alone
    #[tokio::test]
    async fn story_gone_server_is_noop() {
        let mut server = sample_server("sftp");
        server.metadata.deletion_timestamp = Some(Time(Utc::now()));
        server.metadata.finalizers = None;

        let ctx = Arc::new(ServerContext::for_testing(Arc::new(
            MockServerKubeClient::new(),
        )));
        let action = reconcile(Arc::new(server), ctx)
            .await
            .expect("reconcile should succeed");
        assert_eq!(action, Action::await_change());
    }

    // =========================================================================
    // Error policy and status helpers
    // =========================================================================

    #[test]
    fn error_policy_requeues_retryable_errors() {
        let server = Arc::new(sample_server("sftp"));
        let ctx = Arc::new(ServerContext::for_testing(Arc::new(mock_kube_success())));

        let action = error_policy(server.clone(), &Error::internal("boom"), ctx.clone());
        assert_eq!(action, Action::requeue(Duration::from_secs(30)));

        let action = error_policy(server, &Error::validation("bad spec"), ctx);
        assert_eq!(action, Action::await_change());
    }

    #[test]
    fn failed_status_keeps_ready_transition_time_when_still_false() {
        let first = failed_status(None, reasons::DEPLOYMENT_ERROR, "boom");
        let mut earlier = first.clone();
        earlier.conditions[0].last_transition_time =
            first.conditions[0].last_transition_time - chrono::Duration::minutes(5);

        let second = failed_status(Some(&earlier), reasons::SERVICE_ERROR, "other");
        assert_eq!(
            second.conditions[0].last_transition_time,
            earlier.conditions[0].last_transition_time
        );
        assert_eq!(second.conditions[0].reason, reasons::SERVICE_ERROR);
    }

    #[test]
    fn status_change_detection_ignores_timestamps_only() {
        let a = failed_status(None, reasons::DEPLOYMENT_ERROR, "boom");
        let mut b = a.clone();
        b.conditions[0].last_transition_time =
            a.conditions[0].last_transition_time + chrono::Duration::seconds(10);
        assert!(is_status_unchanged(Some(&a), &b));

        b.ready_replicas = Some(1);
        assert!(!is_status_unchanged(Some(&a), &b));
        assert!(!is_status_unchanged(None, &a));
    }
}
