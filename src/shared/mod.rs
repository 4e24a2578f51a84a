//! Shared utilities and common functionality
//!
//! Everything here is independent of the plugin kind: configuration, the connection
//! supervisor, the health watch, the generic stream pump and the message bus seam.

pub(crate) mod channel;
pub mod config;
pub mod envelope;
pub mod health;
pub mod logging;
pub(crate) mod metadata;
pub mod mq;
pub(crate) mod panic;
pub(crate) mod pump;
pub(crate) mod signal;
pub mod supervisor;
mod traits;
pub mod tracker;

pub(crate) use traits::ServiceError;
