//! Client for the SFTPGo administrative REST API
//!
//! Covers the user resource only: get, create, update, delete under
//! `/api/v2/users`, with basic auth and a bounded per-request timeout.

#![deny(missing_docs)]

mod client;
mod error;
pub mod types;

pub use client::{service_url, AdminClient, AdminConnection, DEFAULT_TIMEOUT};
pub use error::ClientError;
pub use types::UserPayload;
