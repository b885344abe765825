//! Shared Kubernetes utilities
//!
//! Lifecycle classification, finalizer patches, server-side apply of children,
//! status patches, secret access and client construction. Everything generic
//! over namespaced resources so both controllers share one implementation.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::retry::{retry_with_backoff_when, RetryConfig};
use crate::{Error, DESIRED_HASH_ANNOTATION};

// =============================================================================
// Lifecycle
// =============================================================================

/// Where an object is in its finalizer-guarded lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    /// Not being deleted and our finalizer is not attached yet
    Initializing,
    /// Not being deleted, finalizer attached
    Active,
    /// Deletion requested and our finalizer still holds the object
    Terminating,
    /// Deletion requested and our finalizer is already gone
    Gone,
}

/// Whether `finalizer` is present on the object
pub fn has_finalizer(meta: &ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == finalizer))
}

/// Classify an object by deletion timestamp and finalizer presence
pub fn lifecycle_of(meta: &ObjectMeta, finalizer: &str) -> LifecycleState {
    match (meta.deletion_timestamp.is_some(), has_finalizer(meta, finalizer)) {
        (false, false) => LifecycleState::Initializing,
        (false, true) => LifecycleState::Active,
        (true, true) => LifecycleState::Terminating,
        (true, false) => LifecycleState::Gone,
    }
}

// =============================================================================
// Finalizers
// =============================================================================

/// Add `finalizer` to a namespaced object. No-op when already present.
pub async fn add_finalizer<K>(
    client: &Client,
    name: &str,
    namespace: &str,
    finalizer: &str,
    field_manager: &str,
) -> Result<(), kube::Error>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
    <K as Resource>::DynamicType: Default,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);

    let obj = api.get(name).await?;
    let mut finalizers = obj.finalizers().to_vec();
    if finalizers.iter().any(|f| f == finalizer) {
        return Ok(());
    }
    finalizers.push(finalizer.to_string());

    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers
        }
    });
    api.patch(name, &PatchParams::apply(field_manager), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Remove `finalizer` from a namespaced object.
///
/// An object that no longer exists, or no longer carries the finalizer,
/// counts as success.
pub async fn remove_finalizer<K>(
    client: &Client,
    name: &str,
    namespace: &str,
    finalizer: &str,
    field_manager: &str,
) -> Result<(), kube::Error>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
    <K as Resource>::DynamicType: Default,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);

    let Some(obj) = api.get_opt(name).await? else {
        return Ok(());
    };
    if !obj.finalizers().iter().any(|f| f == finalizer) {
        return Ok(());
    }
    let finalizers: Vec<String> = obj
        .finalizers()
        .iter()
        .filter(|f| *f != finalizer)
        .cloned()
        .collect();

    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers
        }
    });
    match api
        .patch(name, &PatchParams::apply(field_manager), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e),
    }
}

// =============================================================================
// Status
// =============================================================================

/// Patch the status sub-resource of a namespaced resource with
/// `{ "status": <status> }` as a merge patch.
pub async fn patch_resource_status<K>(
    client: &Client,
    name: &str,
    namespace: &str,
    status: &impl Serialize,
    field_manager: &str,
) -> Result<(), kube::Error>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
    <K as Resource>::DynamicType: Default,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::apply(field_manager), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

// =============================================================================
// Server-side apply of owned children
// =============================================================================

/// What an apply did to the live object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Object did not exist and was created
    Created,
    /// Object existed and the apply changed it
    Updated,
    /// Nothing was written: the apply was a no-op on the API server, or the
    /// object is create-only and already exists
    Unchanged,
}

/// How a child is written once it exists
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyPolicy {
    /// Force-apply on every pass so drift in owned fields is repaired
    Reconcile,
    /// Apply on create only. Used for objects whose spec is immutable after
    /// creation, such as PersistentVolumeClaims.
    CreateOnly,
}

/// Desired-hash annotation value of an object, if any
pub fn desired_hash(meta: &ObjectMeta) -> Option<&str> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(DESIRED_HASH_ANNOTATION))
        .map(String::as_str)
}

/// Stamp the desired-hash annotation onto `meta`, computed over `content`
pub fn stamp_desired_hash(meta: &mut ObjectMeta, content: &str) {
    meta.annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(DESIRED_HASH_ANNOTATION.to_string(), deterministic_hash(content));
}

/// Read and apply access to one kind of child in one namespace
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChildApi<K: Send + Sync + 'static>: Send + Sync {
    /// Fetch the live object, `None` when absent
    async fn get(&self, name: &str) -> Result<Option<K>, kube::Error>;

    /// Force server-side apply `desired` and return the object as stored
    async fn apply(&self, name: &str, desired: &K) -> Result<K, kube::Error>;
}

/// [`ChildApi`] backed by a namespaced [`Api`]
pub struct SsaChildApi<K> {
    api: Api<K>,
    params: PatchParams,
}

impl<K> SsaChildApi<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    /// Create a ChildApi for `namespace` that applies as `field_manager`
    pub fn new(client: &Client, namespace: &str, field_manager: &str) -> Self {
        Self {
            api: Api::namespaced(client.clone(), namespace),
            params: PatchParams::apply(field_manager).force(),
        }
    }
}

#[async_trait]
impl<K> ChildApi<K> for SsaChildApi<K>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
    <K as Resource>::DynamicType: Default,
{
    async fn get(&self, name: &str) -> Result<Option<K>, kube::Error> {
        self.api.get_opt(name).await
    }

    async fn apply(&self, name: &str, desired: &K) -> Result<K, kube::Error> {
        self.api
            .patch(name, &self.params, &Patch::Apply(desired))
            .await
    }
}

/// Classify an apply by comparing resource versions before and after.
///
/// The API server leaves `resourceVersion` alone when an apply changes
/// nothing, so an equal version means the live object already matched.
pub fn classify_apply(before: Option<&ObjectMeta>, after: &ObjectMeta) -> ApplyOutcome {
    match before {
        None => ApplyOutcome::Created,
        Some(live)
            if live.resource_version.is_some()
                && live.resource_version == after.resource_version =>
        {
            ApplyOutcome::Unchanged
        }
        Some(_) => ApplyOutcome::Updated,
    }
}

/// Apply `desired` through `children` according to `policy`.
///
/// Under [`ApplyPolicy::Reconcile`] the apply is always sent, so manual
/// edits to owned fields are reverted even when the desired-hash annotation
/// was left intact. Conflicts are retried with a short backoff.
pub async fn apply_child<K>(
    children: &dyn ChildApi<K>,
    desired: &K,
    policy: ApplyPolicy,
) -> Result<ApplyOutcome, Error>
where
    K: Resource + Send + Sync + 'static,
    <K as Resource>::DynamicType: Default,
{
    let name = desired.name_any();
    let kind = K::kind(&Default::default()).to_string();

    let existing = children.get(&name).await?;
    if policy == ApplyPolicy::CreateOnly && existing.is_some() {
        debug!(kind = %kind, name = %name, "create-only child exists, leaving it alone");
        return Ok(ApplyOutcome::Unchanged);
    }

    let applied = retry_with_backoff_when(
        &RetryConfig::conflict(),
        &format!("apply {kind} {name}"),
        |e: &kube::Error| matches!(e, kube::Error::Api(ae) if ae.code == 409),
        || children.apply(&name, desired),
    )
    .await?;

    let outcome = classify_apply(existing.as_ref().map(|live| live.meta()), applied.meta());
    debug!(kind = %kind, name = %name, ?outcome, "child applied");
    Ok(outcome)
}

/// Apply `desired` into its own namespace as `field_manager`
pub async fn apply_owned<K>(
    client: &Client,
    desired: &K,
    field_manager: &str,
    policy: ApplyPolicy,
) -> Result<ApplyOutcome, Error>
where
    K: Resource<Scope = NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static,
    <K as Resource>::DynamicType: Default,
{
    let name = desired.name_any();
    let namespace = desired
        .namespace()
        .ok_or_else(|| Error::internal_with_context("apply", format!("{name} has no namespace")))?;
    let children = SsaChildApi::<K>::new(client, &namespace, field_manager);
    apply_child(&children, desired, policy).await
}

// =============================================================================
// Secrets
// =============================================================================

/// Value of `key` in a Secret, looking at `data` then `stringData`
pub fn secret_value(secret: &Secret, key: &str) -> Option<Vec<u8>> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|v| v.0.clone())
        .or_else(|| {
            secret
                .string_data
                .as_ref()
                .and_then(|d| d.get(key))
                .map(|v| v.clone().into_bytes())
        })
}

/// Fetch a Secret, returning `None` on 404
pub async fn get_secret(
    client: &Client,
    name: &str,
    namespace: &str,
) -> Result<Option<Secret>, kube::Error> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    secrets.get_opt(name).await
}

// =============================================================================
// Hashing
// =============================================================================

/// Compute a deterministic hash of the input string, returning a 16-char hex digest.
///
/// Truncated SHA-256, stable across toolchains, so it is safe to persist in
/// annotations and compare on later passes.
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

// =============================================================================
// Client
// =============================================================================

/// Default connect timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from an optional kubeconfig path; in-cluster or
/// `$KUBECONFIG` inference when `None`
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig: {}", e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}
