//! Identity metadata attached to every outgoing stream.

use tonic::metadata::AsciiMetadataValue;
use tonic::{Request, Status};

/// Ordered set of metadata entries whose values travel hex encoded, so arbitrary
/// UTF-8 identities survive the ASCII-only metadata transport.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct StreamMetadata {
    entries: Vec<(&'static str, String)>,
}

impl StreamMetadata {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Adds an entry. `key` must be a lowercase metadata key.
    pub(crate) fn with(mut self, key: &'static str, value: &str) -> Self {
        self.entries.push((key, hex::encode(value)));
        self
    }

    /// Wraps `message` into a request carrying every entry.
    pub(crate) fn request<T>(&self, message: T) -> Result<Request<T>, Status> {
        let mut request = Request::new(message);
        for (key, value) in &self.entries {
            let value = AsciiMetadataValue::try_from(value.as_str())
                .map_err(|e| Status::internal(format!("invalid metadata {key}: {e}")))?;
            request.metadata_mut().insert(*key, value);
        }
        Ok(request)
    }

    /// Encoded value of `key`, if present.
    #[cfg(test)]
    pub(crate) fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_are_hex_encoded() {
        let metadata = StreamMetadata::new()
            .with("projectid", "default")
            .with("drivername", "温度驱动");

        assert_eq!(metadata.get("projectid"), Some("64656661756c74"));
        let name = hex::decode(metadata.get("drivername").unwrap()).unwrap();
        assert_eq!(String::from_utf8(name).unwrap(), "温度驱动");
    }

    #[test]
    fn test_request_carries_metadata() {
        let metadata = StreamMetadata::new()
            .with("serviceid", "svc")
            .with("sessionid", "abc");
        let request = metadata.request(()).unwrap();

        let value = request.metadata().get("serviceid").unwrap();
        assert_eq!(value.to_str().unwrap(), hex::encode("svc"));
        let value = request.metadata().get("sessionid").unwrap();
        assert_eq!(value.to_str().unwrap(), hex::encode("abc"));
        assert!(request.metadata().get("driverid").is_none());
    }
}
