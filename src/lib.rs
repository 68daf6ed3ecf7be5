//! Taskhub: a multi-tenant background task scheduler.
//!
//! Producers enqueue tasks, workers pull them over HTTP and report back, and
//! completion processors apply the results to the owning resources.

pub mod config;
pub mod directory;
pub mod error;
pub mod hub;
pub mod processors;
pub mod quota;
pub mod store;
pub mod tasks;

pub use error::{Error, Result};
pub use hub::{HubDeps, TaskHub};
