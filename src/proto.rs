//! Generated protobuf modules
//!
//! This module contains the generated client and server code for the platform services.
//! The protobuf files are generated in src/generated/ for easy access and version control.

/// Driver service protobuf definitions
#[path = "generated/driver.v1.rs"]
#[rustfmt::skip]
pub mod driver;

/// Data relay service protobuf definitions
#[path = "generated/datarelay.v1.rs"]
#[rustfmt::skip]
pub mod data_relay;
