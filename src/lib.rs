//! A Rust SDK for platform plugins. It supports two plugin kinds: [Drivers], which bridge
//! devices and the platform, and [Data Relays], which forward data to external systems.
//!
//! A plugin implements one callback trait and hands it to its `App`. The SDK keeps the
//! gRPC connection to the platform alive, answers every request the platform streams to
//! the plugin, and publishes telemetry, warnings and logs to the message bus.
//!
//! [Drivers]: driver
//! [Data Relays]: data_relay

/// Errors returned by the SDK.
pub mod error;

/// Generated gRPC messages and clients.
pub mod proto;

/// Connection, health and stream machinery shared by every plugin kind.
pub mod shared;

/// driver is for writing device drivers.
pub mod driver;

/// data_relay is for writing data-relay plugins.
pub mod data_relay;

pub use error::{BoxError, Error, Result};

// Error handling in the SDK.
//
// Nothing the platform or a plugin callback does ends the process. Only the shutdown
// signal does.
//
// Task Ordering and error propagation.
//
//      level-1               level-2               level-3
//
//                    +---> (pump loop) ---+---> (respond) ---> (dispatch)
//                    |                    |
//                    |                    +---> (respond) ---> (dispatch)
//                    |
// (supervisor) ------+---> (pump loop) ---+---> (respond) ---> (dispatch)
//      ^     \       |
//      |      \      +---> (pump loop) ->
//      |       \
//  (shutdown)   +---> (health watch)
//      |
//   (user)
//
// A dispatch (level-3) that fails, panics or times out is answered with a failure
// response by its respond task and goes no further. A pump loop (level-2) whose stream
// breaks reopens it after wait_time. The health watch ends the connection attempt when
// the platform stops answering, reports the plugin unknown, or fewer streams are open
// than expected; the supervisor (level-1) then cancels the attempt token, joins every
// pump loop and dials again. In-flight dispatches outlive the attempt and try to
// deliver their answer anyway.
//
// The user stops everything by sending SIGINT/SIGTERM or firing the shutdown oneshot.
