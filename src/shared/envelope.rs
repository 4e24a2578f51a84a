//! Response envelope carried inside the payload of every driver stream response.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BoxError;

/// Code of a successful response.
pub const CODE_OK: u16 = 200;

/// Code of a failed response.
pub const CODE_FAILED: u16 = 400;

/// JSON object `{result?, error?, code}` the platform expects back for every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub code: u16,
}

impl Envelope {
    pub fn ok(result: Option<Value>) -> Self {
        Self {
            result,
            error: None,
            code: CODE_OK,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(error.into()),
            code: CODE_FAILED,
        }
    }

    /// Maps the outcome of a user callback.
    pub fn from_result(result: Result<Value, BoxError>) -> Self {
        match result {
            Ok(value) => Self::ok(Some(value)),
            Err(e) => Self::failure(e.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }

    /// JSON bytes of the envelope.
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_else(|e| {
            serde_json::json!({ "code": CODE_FAILED, "error": e.to_string() })
                .to_string()
                .into_bytes()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_envelope() {
        let envelope = Envelope::from_result(Ok(json!({"temperature": 21.5})));
        assert!(envelope.is_ok());

        let decoded: Value = serde_json::from_slice(&envelope.encode()).unwrap();
        assert_eq!(decoded, json!({"code": 200, "result": {"temperature": 21.5}}));
    }

    #[test]
    fn test_failure_envelope() {
        let envelope = Envelope::from_result(Err("device offline".into()));
        assert!(!envelope.is_ok());

        let decoded: Value = serde_json::from_slice(&envelope.encode()).unwrap();
        assert_eq!(decoded, json!({"code": 400, "error": "device offline"}));
    }

    #[test]
    fn test_empty_success_has_no_result_key() {
        let decoded: Value = serde_json::from_slice(&Envelope::ok(None).encode()).unwrap();
        assert_eq!(decoded, json!({"code": 200}));
    }
}
