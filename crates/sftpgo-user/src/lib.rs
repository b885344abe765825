//! SftpGoUser controller
//!
//! [`resolve`] turns references into a server, an admin connection and
//! plaintext credentials, [`payload`] maps a spec onto SFTPGo's user record,
//! [`sync`] converges the remote account, and [`controller`] drives it all
//! and reports status.

#![deny(missing_docs)]

pub mod controller;
pub mod payload;
pub mod resolve;
pub mod sync;

pub use controller::{error_policy, reconcile, UserContext};
pub use sync::AdminApi;
