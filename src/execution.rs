//! Request and result types shared by the runner and every gateway.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix that separates runner failures from errors raised by the script itself.
pub const SYSTEM_ERROR_PREFIX: &str = "System Error: ";

/// A script submitted for execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub code: String,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self { code: code.into() }
    }
}

/// Outcome of one execution, as returned to callers.
///
/// `output` and `error` are always present, possibly empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    pub error: String,
}

impl ExecutionResult {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: error.into(),
        }
    }

    pub fn system_error(message: impl fmt::Display) -> Self {
        Self::failure(format!("{}{}", SYSTEM_ERROR_PREFIX, message))
    }
}

/// Terminal state of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The child exited on its own, with any status.
    Completed,
    /// The deadline passed and the child's process group was killed.
    TimedOut,
    /// The caller's cancellation token fired and the child was killed.
    Cancelled,
    /// The script could not be staged or the child could not be started.
    LaunchFailed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::TimedOut => "timed_out",
            Outcome::Cancelled => "cancelled",
            Outcome::LaunchFailed => "launch_failed",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An [`ExecutionResult`] together with the state the run ended in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub outcome: Outcome,
    pub result: ExecutionResult,
}

impl From<Execution> for ExecutionResult {
    fn from(execution: Execution) -> Self {
        execution.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_wire_shape() {
        let result = ExecutionResult {
            success: true,
            output: "hello\n".to_string(),
            error: String::new(),
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"success": true, "output": "hello\n", "error": ""})
        );
    }

    #[test]
    fn test_system_error_prefix() {
        let result = ExecutionResult::system_error("No such file or directory");
        assert!(!result.success);
        assert!(result.output.is_empty());
        assert_eq!(result.error, "System Error: No such file or directory");
    }

    #[test]
    fn test_request_requires_code() {
        assert!(serde_json::from_str::<ExecutionRequest>(r#"{"script": "x"}"#).is_err());
        assert!(serde_json::from_str::<ExecutionRequest>(r#"{"code": 42}"#).is_err());
        let req: ExecutionRequest =
            serde_json::from_str(r#"{"code": "print(1)", "extra": true}"#).unwrap();
        assert_eq!(req.code, "print(1)");
    }
}
