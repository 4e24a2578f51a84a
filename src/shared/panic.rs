//! Panic handling utilities
//!
//! User callbacks run on their own task. When such a task dies the join error is
//! turned into a message that ends up in the failure response of the request.

use std::any::Any;

use tokio::task::JoinError;

/// Describe why a dispatch task did not produce a value.
pub(crate) fn describe(error: JoinError) -> String {
    if error.is_panic() {
        let payload = error.into_panic();
        format!("panic: {}", payload_message(&*payload))
    } else {
        "dispatch task was cancelled".to_string()
    }
}

fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}
