//! Controller runner - builds controller futures for each custom resource
//!
//! Each `build_*` function returns a Vec of boxed futures that the caller
//! joins. Watch mappers are plain functions over cached objects so they can
//! be tested without a cluster.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Secret, Service};
use k8s_openapi::NamespaceResourceScope;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::reflector::{self, ObjectRef};
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::{Controller, WatchStreamExt};
use kube::{Api, Client, Resource, ResourceExt};

use sftpgo_common::crd::{SftpGoServer, SftpGoUser};
use sftpgo_server::controller::{
    error_policy as server_error_policy, reconcile as server_reconcile, ServerContext,
};
use sftpgo_user::controller::{
    error_policy as user_error_policy, reconcile as user_reconcile, UserContext,
};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Label carried by every child object the server controller creates
const CHILD_LABEL_SELECTOR: &str = "app=sftpgo";

/// Boxed controller future
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Settings shared by both controllers
#[derive(Clone, Debug)]
pub struct RunnerSettings {
    /// Namespace to watch; all namespaces when `None`
    pub namespace: Option<String>,
    /// Maximum concurrent reconciliations per controller
    pub concurrency: u16,
    /// Per-request timeout for the SFTPGo admin API
    pub admin_timeout: Duration,
}

impl RunnerSettings {
    fn api<K>(&self, client: &Client) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        match self.namespace.as_deref() {
            Some(ns) => Api::namespaced(client.clone(), ns),
            None => Api::all(client.clone()),
        }
    }

    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig::default().concurrency(self.concurrency)
    }
}

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Build the SftpGoServer controller future
///
/// Owned ConfigMaps, PVCs, Deployments and Services requeue their server so
/// manual edits and rollout progress are picked up.
pub fn build_server_controllers(client: Client, settings: &RunnerSettings) -> Vec<ControllerFuture> {
    let ctx = Arc::new(ServerContext::from_client(client.clone()));
    let children = || watcher_config().labels(CHILD_LABEL_SELECTOR);

    tracing::info!("- SftpGoServer controller");

    vec![Box::pin(
        Controller::new(settings.api::<SftpGoServer>(&client), watcher_config())
            .owns(settings.api::<ConfigMap>(&client), children())
            .owns(settings.api::<PersistentVolumeClaim>(&client), children())
            .owns(settings.api::<Deployment>(&client), children())
            .owns(settings.api::<Service>(&client), children())
            .with_config(settings.controller_config())
            .shutdown_on_signal()
            .run(server_reconcile, server_error_policy, ctx)
            .for_each(log_reconcile_result("SftpGoServer")),
    )]
}

/// Build the SftpGoUser controller future
///
/// Users are requeued when the server they reference changes, and when any
/// Secret they read changes, including their server's admin secret. A
/// reflector over servers backs the admin-secret lookup and runs for as
/// long as the controller does.
pub fn build_user_controllers(
    client: Client,
    settings: &RunnerSettings,
) -> anyhow::Result<Vec<ControllerFuture>> {
    let ctx = Arc::new(
        UserContext::from_client(client.clone(), settings.admin_timeout)
            .map_err(|e| anyhow::anyhow!("failed to build user controller context: {e}"))?,
    );

    let (servers, server_writer) = reflector::store::<SftpGoServer>();
    let server_cache = reflector::reflector(
        server_writer,
        watcher::watcher(settings.api::<SftpGoServer>(&client), watcher_config()),
    )
    .default_backoff()
    .touched_objects()
    .for_each(|_| std::future::ready(()));

    let controller = Controller::new(settings.api::<SftpGoUser>(&client), watcher_config())
        .with_config(settings.controller_config());
    let users_for_server_watch = controller.store();
    let users_for_secret_watch = controller.store();

    tracing::info!("- SftpGoUser controller");

    let user_ctrl = controller
        .watches(
            settings.api::<SftpGoServer>(&client),
            watcher_config(),
            move |server| users_for_server(&server, &users_for_server_watch.state()),
        )
        .watches(
            settings.api::<Secret>(&client),
            watcher_config(),
            move |secret| {
                users_for_secret(
                    &secret,
                    &users_for_secret_watch.state(),
                    &servers.state(),
                )
            },
        )
        .shutdown_on_signal()
        .run(user_reconcile, user_error_policy, ctx)
        .for_each(log_reconcile_result("SftpGoUser"));

    // The server cache never ends on its own; stop it with the controller
    let combined = async move {
        futures::future::select(Box::pin(server_cache), Box::pin(user_ctrl)).await;
    };
    Ok(vec![Box::pin(combined)])
}

// =============================================================================
// Watch mappers
// =============================================================================

fn references_server(user: &SftpGoUser, name: &str, namespace: &str) -> bool {
    let user_namespace = user.namespace().unwrap_or_default();
    user.spec.server_ref.name == name && user.spec.server_ref.namespace_or(&user_namespace) == namespace
}

/// Users whose `serverRef` resolves to `server`
fn users_for_server(server: &SftpGoServer, users: &[Arc<SftpGoUser>]) -> Vec<ObjectRef<SftpGoUser>> {
    let (Some(name), Some(namespace)) = (
        server.metadata.name.as_deref(),
        server.metadata.namespace.as_deref(),
    ) else {
        return vec![];
    };

    let affected: Vec<_> = users
        .iter()
        .filter(|u| references_server(u, name, namespace))
        .map(|u| ObjectRef::from_obj(u.as_ref()))
        .collect();

    tracing::debug!(
        server = %name,
        namespace = %namespace,
        affected_count = affected.len(),
        "server changed, requeueing users"
    );
    affected
}

/// Users that read `secret` directly, or whose server uses it as the admin
/// secret
fn users_for_secret(
    secret: &Secret,
    users: &[Arc<SftpGoUser>],
    servers: &[Arc<SftpGoServer>],
) -> Vec<ObjectRef<SftpGoUser>> {
    let (Some(name), Some(namespace)) = (
        secret.metadata.name.as_deref(),
        secret.metadata.namespace.as_deref(),
    ) else {
        return vec![];
    };

    let admin_of: Vec<String> = servers
        .iter()
        .filter(|s| s.namespace().as_deref() == Some(namespace))
        .filter(|s| {
            s.spec
                .admin_secret_ref
                .as_ref()
                .is_some_and(|r| r.name == name)
        })
        .map(|s| s.name_any())
        .collect();

    users
        .iter()
        .filter(|u| {
            let reads_directly = u.namespace().as_deref() == Some(namespace)
                && u.spec.referenced_secrets().contains(&name);
            reads_directly || admin_of.iter().any(|server| references_server(u, server, namespace))
        })
        .map(|u| ObjectRef::from_obj(u.as_ref()))
        .collect()
}

/// Log the outcome of each reconciliation
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
