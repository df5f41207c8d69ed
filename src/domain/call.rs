//! Outcome of a single tool invocation.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::{ErrorKind, OrchestratorError};

/// Result of one `RpcClient::invoke` call.
///
/// Every failure mode is encoded here; constructing one never fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResult {
    pub success: bool,

    /// Tool output (null on failure)
    pub result: Value,

    /// Why the call failed
    pub error: Option<OrchestratorError>,

    /// Present when the service ran the tool asynchronously
    pub execution_id: Option<String>,

    pub service: String,

    pub tool: String,

    /// Wall time of the whole call, polling included
    pub duration_ms: u64,
}

impl CallResult {
    pub fn success(
        service: impl Into<String>,
        tool: impl Into<String>,
        result: Value,
        execution_id: Option<String>,
        duration: Duration,
    ) -> Self {
        Self {
            success: true,
            result,
            error: None,
            execution_id,
            service: service.into(),
            tool: tool.into(),
            duration_ms: duration.as_millis() as u64,
        }
    }

    pub fn failure(
        service: impl Into<String>,
        tool: impl Into<String>,
        error: OrchestratorError,
        execution_id: Option<String>,
        duration: Duration,
    ) -> Self {
        Self {
            success: false,
            result: Value::Null,
            error: Some(error),
            execution_id,
            service: service.into(),
            tool: tool.into(),
            duration_ms: duration.as_millis() as u64,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind())
    }

    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(|e| e.to_string())
    }

    /// Convert into a plain Result, for handlers that need `?`
    pub fn into_result(self) -> Result<Value, OrchestratorError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_failure_carries_kind() {
        let result = CallResult::failure(
            "b",
            "fire_risk",
            OrchestratorError::unavailable("b", "circuit open"),
            None,
            Duration::from_millis(3),
        );

        assert!(!result.success);
        assert_eq!(result.error_kind(), Some(ErrorKind::ServiceUnavailable));
        assert!(result.error_message().unwrap().contains("circuit open"));
        assert!(result.into_result().is_err());
    }

    #[test]
    fn test_serialized_shape() {
        let result = CallResult::success(
            "a",
            "t",
            json!({"risk": 0.8}),
            Some("x".to_string()),
            Duration::from_millis(1500),
        );

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["success"], json!(true));
        assert_eq!(value["result"]["risk"], json!(0.8));
        assert_eq!(value["execution_id"], json!("x"));
        assert_eq!(value["duration_ms"], json!(1500));
        assert!(value["error"].is_null());
    }
}
