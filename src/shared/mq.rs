//! Message bus the App publishes telemetry, warnings and logs to.

use tonic::async_trait;

use crate::error::BoxError;

/// Publisher side of the platform message bus. The topic is given as its segments;
/// implementations join them with whatever separator their broker uses.
#[async_trait]
pub trait MessageQueue: Send + Sync + 'static {
    async fn publish(&self, topic: &[String], payload: Vec<u8>) -> Result<(), BoxError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records every publish.
    #[derive(Default)]
    pub(crate) struct RecordingQueue {
        pub(crate) published: Mutex<Vec<(Vec<String>, Vec<u8>)>>,
        pub(crate) fail: bool,
    }

    impl RecordingQueue {
        pub(crate) fn messages(&self) -> Vec<(String, serde_json::Value)> {
            self.published
                .lock()
                .unwrap()
                .iter()
                .map(|(topic, payload)| {
                    (topic.join("/"), serde_json::from_slice(payload).unwrap())
                })
                .collect()
        }
    }

    #[async_trait]
    impl MessageQueue for RecordingQueue {
        async fn publish(&self, topic: &[String], payload: Vec<u8>) -> Result<(), BoxError> {
            if self.fail {
                return Err("broker unavailable".into());
            }
            self.published
                .lock()
                .unwrap()
                .push((topic.to_vec(), payload));
            Ok(())
        }
    }
}
