//! Admin API error taxonomy

use thiserror::Error;

/// Errors returned by [`crate::AdminClient`]
#[derive(Debug, Error)]
pub enum ClientError {
    /// The user does not exist
    #[error("user {0} not found")]
    NotFound(String),

    /// SFTPGo reported a conflicting write
    #[error("conflict: {0}")]
    Conflict(String),

    /// Admin credentials were rejected (HTTP 401)
    #[error("admin credentials rejected (401)")]
    Unauthorized,

    /// Admin lacks permission for the call (HTTP 403)
    #[error("admin not permitted (403)")]
    Forbidden,

    /// Any other non-success status
    #[error("API returned {code}: {body}")]
    Status {
        /// HTTP status code
        code: u16,
        /// Response body, possibly truncated
        body: String,
    },

    /// Connection, timeout or body decode failure
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Base URL cannot carry a path
    #[error("invalid admin URL {0}")]
    InvalidUrl(String),
}

impl ClientError {
    /// Whether repeating the call later may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Conflict(_) | ClientError::Transport(_) => true,
            ClientError::Status { code, .. } => *code >= 500 || *code == 429,
            ClientError::NotFound(_)
            | ClientError::Unauthorized
            | ClientError::Forbidden
            | ClientError::InvalidUrl(_) => false,
        }
    }

    /// Whether the admin credentials are the problem
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ClientError::Unauthorized | ClientError::Forbidden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_retryable() {
        let e = ClientError::Status {
            code: 503,
            body: String::new(),
        };
        assert!(e.is_retryable());
        assert!(!e.is_auth_failure());
    }

    #[test]
    fn client_errors_wait_for_a_change() {
        let e = ClientError::Status {
            code: 400,
            body: "invalid home dir".to_string(),
        };
        assert!(!e.is_retryable());
        assert_eq!(e.to_string(), "API returned 400: invalid home dir");
    }

    #[test]
    fn auth_failures_are_classified() {
        assert!(ClientError::Unauthorized.is_auth_failure());
        assert!(ClientError::Forbidden.is_auth_failure());
        assert!(!ClientError::Forbidden.is_retryable());
        assert!(ClientError::Conflict("busy".to_string()).is_retryable());
    }
}
