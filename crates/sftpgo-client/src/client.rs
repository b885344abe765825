//! HTTP client for SFTPGo's admin REST API

use std::fmt;
use std::time::Duration;

use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::ClientError;
use crate::types::UserPayload;

/// Default per-request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest error body kept in [`ClientError::Status`]
const MAX_ERROR_BODY: usize = 512;

/// In-cluster URL of an SFTPGo server's web/REST port
pub fn service_url(name: &str, namespace: &str, port: i32) -> String {
    format!("http://{name}.{namespace}.svc.cluster.local:{port}")
}

/// Where and as whom to call the admin API
#[derive(Clone)]
pub struct AdminConnection {
    /// Base URL, e.g. `http://sftp.default.svc.cluster.local:8080`
    pub base_url: String,
    /// Admin username
    pub username: String,
    /// Admin password, wiped on drop
    pub password: Zeroizing<String>,
}

impl fmt::Debug for AdminConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminConnection")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl AdminConnection {
    fn users_url(&self, username: Option<&str>) -> Result<Url, ClientError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| ClientError::InvalidUrl(format!("{}: {e}", self.base_url)))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| ClientError::InvalidUrl(self.base_url.clone()))?;
            segments.pop_if_empty().extend(["api", "v2", "users"]);
            if let Some(u) = username {
                segments.push(u);
            }
        }
        Ok(url)
    }
}

/// Admin API client. Cheap to clone; one per operator process.
#[derive(Clone, Debug)]
pub struct AdminClient {
    http: reqwest::Client,
}

impl AdminClient {
    /// Create a client whose every request is bounded by `timeout`
    pub fn new(timeout: Duration) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .build()?;
        Ok(Self { http })
    }

    fn request(&self, conn: &AdminConnection, method: Method, url: Url) -> RequestBuilder {
        let req = self.http.request(method, url);
        if !conn.username.is_empty() && !conn.password.is_empty() {
            req.basic_auth(&conn.username, Some(conn.password.as_str()))
        } else {
            req
        }
    }

    /// Fetch a user; `None` when SFTPGo answers 404
    pub async fn get_user(
        &self,
        conn: &AdminConnection,
        username: &str,
    ) -> Result<Option<UserPayload>, ClientError> {
        let url = conn.users_url(Some(username))?;
        debug!(%url, "GET user");
        let resp = self.request(conn, Method::GET, url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = check(resp, username).await?;
        Ok(Some(resp.json().await?))
    }

    /// Create a user
    pub async fn create_user(
        &self,
        conn: &AdminConnection,
        payload: &UserPayload,
    ) -> Result<UserPayload, ClientError> {
        let url = conn.users_url(None)?;
        debug!(%url, username = %payload.username, "POST user");
        let resp = self
            .request(conn, Method::POST, url)
            .json(payload)
            .send()
            .await?;
        let resp = check(resp, &payload.username).await?;
        decode_or(resp, payload).await
    }

    /// Replace a user's managed fields
    pub async fn update_user(
        &self,
        conn: &AdminConnection,
        username: &str,
        payload: &UserPayload,
    ) -> Result<UserPayload, ClientError> {
        let url = conn.users_url(Some(username))?;
        debug!(%url, "PUT user");
        let resp = self
            .request(conn, Method::PUT, url)
            .json(payload)
            .send()
            .await?;
        let resp = check(resp, username).await?;
        decode_or(resp, payload).await
    }

    /// Delete a user; a user that is already gone counts as success
    pub async fn delete_user(
        &self,
        conn: &AdminConnection,
        username: &str,
    ) -> Result<(), ClientError> {
        let url = conn.users_url(Some(username))?;
        debug!(%url, "DELETE user");
        let resp = self.request(conn, Method::DELETE, url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(resp, username).await?;
        Ok(())
    }
}

/// Map non-success statuses onto the error taxonomy
async fn check(resp: Response, username: &str) -> Result<Response, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let mut body = resp.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    Err(match status {
        StatusCode::NOT_FOUND => ClientError::NotFound(username.to_string()),
        StatusCode::CONFLICT => ClientError::Conflict(body),
        StatusCode::UNAUTHORIZED => ClientError::Unauthorized,
        StatusCode::FORBIDDEN => ClientError::Forbidden,
        other => ClientError::Status {
            code: other.as_u16(),
            body,
        },
    })
}

/// SFTPGo versions differ on whether writes echo the record; fall back to
/// the sent payload when the body is empty or not a user
async fn decode_or(resp: Response, sent: &UserPayload) -> Result<UserPayload, ClientError> {
    let bytes = resp.bytes().await?;
    match serde_json::from_slice::<UserPayload>(&bytes) {
        Ok(user) if !user.username.is_empty() => Ok(user),
        _ => Ok(UserPayload {
            password: None,
            ..sent.clone()
        }),
    }
}
