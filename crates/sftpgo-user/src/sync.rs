//! Remote user convergence
//!
//! Create-or-update and delete against SFTPGo's admin API, behind the
//! [`AdminApi`] trait so the reconciler can be tested without HTTP.

use async_trait::async_trait;
use sftpgo_client::{AdminClient, AdminConnection, ClientError, UserPayload};
use thiserror::Error as ThisError;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

/// Admin API operations used by the user controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AdminApi: Send + Sync {
    /// Fetch a user; `None` when it does not exist
    async fn get_user(
        &self,
        conn: &AdminConnection,
        username: &str,
    ) -> Result<Option<UserPayload>, ClientError>;

    /// Create a user
    async fn create_user(
        &self,
        conn: &AdminConnection,
        payload: &UserPayload,
    ) -> Result<UserPayload, ClientError>;

    /// Replace a user
    async fn update_user(
        &self,
        conn: &AdminConnection,
        username: &str,
        payload: &UserPayload,
    ) -> Result<UserPayload, ClientError>;

    /// Delete a user; absence counts as success
    async fn delete_user(&self, conn: &AdminConnection, username: &str)
        -> Result<(), ClientError>;
}

#[async_trait]
impl AdminApi for AdminClient {
    async fn get_user(
        &self,
        conn: &AdminConnection,
        username: &str,
    ) -> Result<Option<UserPayload>, ClientError> {
        AdminClient::get_user(self, conn, username).await
    }

    async fn create_user(
        &self,
        conn: &AdminConnection,
        payload: &UserPayload,
    ) -> Result<UserPayload, ClientError> {
        AdminClient::create_user(self, conn, payload).await
    }

    async fn update_user(
        &self,
        conn: &AdminConnection,
        username: &str,
        payload: &UserPayload,
    ) -> Result<UserPayload, ClientError> {
        AdminClient::update_user(self, conn, username, payload).await
    }

    async fn delete_user(
        &self,
        conn: &AdminConnection,
        username: &str,
    ) -> Result<(), ClientError> {
        AdminClient::delete_user(self, conn, username).await
    }
}

/// What an upsert did to the remote user
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// User did not exist and was created
    Created,
    /// Managed fields differed and were replaced
    Updated,
    /// Managed fields already matched; only write-only credentials (password,
    /// filesystem secrets) were sent again
    CredentialsRefreshed,
    /// Nothing written
    Unchanged,
}

impl SyncOutcome {
    /// Whether the remote user's managed fields changed
    pub fn changed_fields(&self) -> bool {
        matches!(self, Self::Created | Self::Updated)
    }
}

/// Result of a successful upsert
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncResult {
    /// What was done
    pub outcome: SyncOutcome,
    /// SFTPGo's id for the user, when known
    pub user_id: Option<i64>,
}

/// Upsert failures
#[derive(Debug, ThisError)]
pub enum SyncError {
    /// Creating a user without any way to log in
    #[error("new user requires either password or publicKeys")]
    MissingCredentials,

    /// Admin API call failed
    #[error(transparent)]
    Api(#[from] ClientError),
}

/// Create the user when absent, otherwise update it when it drifted.
///
/// An empty password is never sent on update, so the stored credential is
/// left as is. SFTPGo does not return passwords or secret payloads, so
/// configured ones are re-sent on every pass.
pub async fn upsert_remote_user(
    api: &dyn AdminApi,
    conn: &AdminConnection,
    desired: &UserPayload,
) -> Result<SyncResult, SyncError> {
    let mut payload = desired.clone();
    payload.password = payload.password.filter(|p| !p.is_empty());

    let Some(remote) = api.get_user(conn, &payload.username).await? else {
        if payload.password.is_none() && payload.public_keys.is_empty() {
            return Err(SyncError::MissingCredentials);
        }
        payload.id = None;
        let created = api.create_user(conn, &payload).await?;
        info!(username = %payload.username, id = ?created.id, "created remote user");
        return Ok(SyncResult {
            outcome: SyncOutcome::Created,
            user_id: created.id,
        });
    };

    payload.id = remote.id;
    let fields_match = payload.owned_fields_match(&remote);
    if fields_match && !payload.carries_credentials() {
        debug!(username = %payload.username, "remote user up to date");
        return Ok(SyncResult {
            outcome: SyncOutcome::Unchanged,
            user_id: remote.id,
        });
    }

    let updated = api.update_user(conn, &payload.username, &payload).await?;
    let outcome = if fields_match {
        SyncOutcome::CredentialsRefreshed
    } else {
        info!(username = %payload.username, "updated remote user");
        SyncOutcome::Updated
    };
    Ok(SyncResult {
        outcome,
        user_id: updated.id.or(remote.id),
    })
}

/// Delete the remote user; a missing user counts as success
pub async fn delete_remote_user(
    api: &dyn AdminApi,
    conn: &AdminConnection,
    username: &str,
) -> Result<(), ClientError> {
    api.delete_user(conn, username).await?;
    info!(username, "deleted remote user");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sftpgo_client::types::{Filesystem, S3Config, SftpGoSecret, STATUS_ENABLED};
    use std::collections::BTreeMap;
    use zeroize::Zeroizing;

    fn conn() -> AdminConnection {
        AdminConnection {
            base_url: "http://files.storage.svc.cluster.local:8080".to_string(),
            username: "admin".to_string(),
            password: Zeroizing::new("admin".to_string()),
        }
    }

    fn desired() -> UserPayload {
        UserPayload {
            username: "alice".to_string(),
            status: STATUS_ENABLED,
            home_dir: "/srv/sftpgo/data/alice".to_string(),
            public_keys: vec!["ssh-ed25519 AAAA".to_string()],
            permissions: BTreeMap::from([("/".to_string(), vec!["*".to_string()])]),
            ..Default::default()
        }
    }

    fn remote_copy(payload: &UserPayload, id: i64) -> UserPayload {
        UserPayload {
            id: Some(id),
            password: None,
            ..payload.clone()
        }
    }

    #[tokio::test]
    async fn absent_user_is_created() {
        let mut api = MockAdminApi::new();
        api.expect_get_user().returning(|_, _| Ok(None));
        api.expect_create_user()
            .times(1)
            .returning(|_, p| Ok(remote_copy(p, 42)));

        let result = upsert_remote_user(&api, &conn(), &desired()).await.unwrap();
        assert_eq!(result.outcome, SyncOutcome::Created);
        assert_eq!(result.user_id, Some(42));
    }

    #[tokio::test]
    async fn new_user_without_credentials_is_rejected_before_create() {
        let mut api = MockAdminApi::new();
        api.expect_get_user().returning(|_, _| Ok(None));
        api.expect_create_user().never();

        let mut payload = desired();
        payload.public_keys.clear();
        payload.password = Some(String::new());

        let err = upsert_remote_user(&api, &conn(), &payload).await.unwrap_err();
        assert!(matches!(err, SyncError::MissingCredentials));
    }

    #[tokio::test]
    async fn matching_user_is_left_alone() {
        let remote = remote_copy(&desired(), 7);
        let mut api = MockAdminApi::new();
        api.expect_get_user()
            .withf(|_, username| username == "alice")
            .times(1)
            .returning(move |_, _| Ok(Some(remote.clone())));
        api.expect_update_user().never();

        let result = upsert_remote_user(&api, &conn(), &desired()).await.unwrap();
        assert_eq!(result.outcome, SyncOutcome::Unchanged);
        assert_eq!(result.user_id, Some(7));
    }

    #[tokio::test]
    async fn drifted_user_is_updated_with_remote_id() {
        let mut remote = remote_copy(&desired(), 7);
        remote.home_dir = "/old".to_string();
        let mut api = MockAdminApi::new();
        api.expect_get_user()
            .returning(move |_, _| Ok(Some(remote.clone())));
        api.expect_update_user()
            .withf(|_, username, p| username == "alice" && p.id == Some(7) && p.password.is_none())
            .times(1)
            .returning(|_, _, p| Ok(p.clone()));

        let result = upsert_remote_user(&api, &conn(), &desired()).await.unwrap();
        assert_eq!(result.outcome, SyncOutcome::Updated);
        assert!(result.outcome.changed_fields());
    }

    #[tokio::test]
    async fn configured_password_is_resent_without_field_change() {
        let remote = remote_copy(&desired(), 7);
        let mut api = MockAdminApi::new();
        api.expect_get_user()
            .returning(move |_, _| Ok(Some(remote.clone())));
        api.expect_update_user()
            .withf(|_, _, p| p.password.as_deref() == Some("hunter2"))
            .times(1)
            .returning(|_, _, p| Ok(p.clone()));

        let mut payload = desired();
        payload.password = Some("hunter2".to_string());
        let result = upsert_remote_user(&api, &conn(), &payload).await.unwrap();
        assert_eq!(result.outcome, SyncOutcome::CredentialsRefreshed);
        assert!(!result.outcome.changed_fields());
    }

    #[tokio::test]
    async fn filesystem_secrets_are_resent_without_field_change() {
        let mut payload = desired();
        payload.filesystem = Some(Filesystem {
            provider: 1,
            s3config: Some(S3Config {
                bucket: "files".to_string(),
                access_secret: Some(SftpGoSecret::plain("s3cr3t")),
                ..Default::default()
            }),
            ..Default::default()
        });
        // SFTPGo echoes the secret back encrypted
        let mut remote = remote_copy(&payload, 7);
        if let Some(s3) = remote.filesystem.as_mut().and_then(|f| f.s3config.as_mut()) {
            s3.access_secret = Some(SftpGoSecret {
                status: "AES-256-GCM".to_string(),
                payload: "ciphertext".to_string(),
            });
        }

        let mut api = MockAdminApi::new();
        api.expect_get_user()
            .returning(move |_, _| Ok(Some(remote.clone())));
        api.expect_update_user()
            .times(1)
            .returning(|_, _, p| Ok(p.clone()));

        let result = upsert_remote_user(&api, &conn(), &payload).await.unwrap();
        assert_eq!(result.outcome, SyncOutcome::CredentialsRefreshed);
    }

    #[tokio::test]
    async fn client_errors_pass_through() {
        let mut api = MockAdminApi::new();
        api.expect_get_user()
            .returning(|_, _| Err(ClientError::Unauthorized));

        let err = upsert_remote_user(&api, &conn(), &desired()).await.unwrap_err();
        match err {
            SyncError::Api(e) => assert!(e.is_auth_failure()),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn delete_delegates_to_api() {
        let mut api = MockAdminApi::new();
        api.expect_delete_user()
            .withf(|_, username| username == "alice")
            .times(1)
            .returning(|_, _| Ok(()));
        delete_remote_user(&api, &conn(), "alice").await.unwrap();
    }
}
