//! SftpGoServer controller
//!
//! [`resources`] builds the desired child objects from a defaulted spec,
//! [`config`] renders `sftpgo.json`, and [`controller`] applies them and
//! reports status.

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod resources;

pub use controller::{error_policy, reconcile, ServerContext};
pub use resources::{build_children, DesiredChildSet};
