//! Centralized error types for psguard.
//!
//! Every failure surfaced to a caller maps to one `GuardError` variant with a
//! stable `(code, kind)` pair. The codes are small negative integers shared by
//! command and script mode, so a host integration can branch on them without
//! parsing messages.
//!
//! # Example
//!
//! ```
//! use psguard::error::{GuardError, GuardResult};
//! use psguard::validator::{Rule, ValidationOutcome};
//!
//! fn reject() -> GuardResult<()> {
//!     Err(GuardError::security_violation(ValidationOutcome::reject(
//!         Rule::AllowedCommands,
//!         "base command 'format' is not allowed",
//!     )))
//! }
//!
//! let err = reject().unwrap_err();
//! assert_eq!(err.code(), -32001);
//! assert_eq!(err.kind(), "SecurityViolation");
//! assert!(!err.spawned_process());
//! ```

use std::fmt;

use serde_json::{json, Value};

use crate::executor::ExecutionResult;
use crate::validator::ValidationOutcome;

/// Result type alias using `GuardError`.
pub type GuardResult<T> = Result<T, GuardError>;

/// Error code for a security-policy or guard rejection.
pub const SECURITY_VIOLATION_CODE: i32 = -32001;
/// Error code for an execution that exceeded its deadline.
pub const TIMEOUT_CODE: i32 = -32002;
/// Error code for an execution that failed to start or exited non-zero.
pub const EXECUTION_ERROR_CODE: i32 = -32003;
/// Error code for an unknown operation name.
pub const METHOD_NOT_FOUND_CODE: i32 = -32601;
/// Error code for a malformed request.
pub const INVALID_PARAMS_CODE: i32 = -32602;

/// Centralized error type for the guarded execution subsystem.
#[derive(Debug)]
pub enum GuardError {
    /// A validator or guard rejected the request. No process was spawned.
    SecurityViolation {
        /// The rejecting outcome, including the rule that fired.
        outcome: ValidationOutcome,
    },

    /// The process was started and forcibly terminated at its deadline.
    Timeout {
        /// Effective timeout in milliseconds.
        timeout_ms: u64,
        /// Partial output captured before termination.
        result: Box<ExecutionResult>,
    },

    /// The process failed to start, or ran and exited non-zero.
    ExecutionFailed {
        /// Description of the failure.
        message: String,
        /// Captured output, when the process ran.
        result: Option<Box<ExecutionResult>>,
    },

    /// The request parameters were malformed.
    InvalidParams {
        /// Description of the problem.
        message: String,
    },

    /// The operation name is not handled by this subsystem.
    UnknownOperation {
        /// The requested operation.
        name: String,
    },
}

// ============== Constructor Methods ==============

impl GuardError {
    /// Creates a security violation from a rejecting outcome.
    #[must_use]
    pub fn security_violation(outcome: ValidationOutcome) -> Self {
        Self::SecurityViolation { outcome }
    }

    /// Creates a timeout error carrying the partial result.
    #[must_use]
    pub fn timeout(timeout_ms: u64, result: ExecutionResult) -> Self {
        Self::Timeout {
            timeout_ms,
            result: Box::new(result),
        }
    }

    /// Creates an execution failure.
    #[must_use]
    pub fn execution_failed(message: impl Into<String>, result: Option<ExecutionResult>) -> Self {
        Self::ExecutionFailed {
            message: message.into(),
            result: result.map(Box::new),
        }
    }

    /// Creates an invalid parameters error.
    #[must_use]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams {
            message: message.into(),
        }
    }

    /// Creates an unknown operation error.
    #[must_use]
    pub fn unknown_operation(name: impl Into<String>) -> Self {
        Self::UnknownOperation { name: name.into() }
    }
}

// ============== Category Methods ==============

impl GuardError {
    /// Returns the stable numeric code for this error.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::SecurityViolation { .. } => SECURITY_VIOLATION_CODE,
            Self::Timeout { .. } => TIMEOUT_CODE,
            Self::ExecutionFailed { .. } => EXECUTION_ERROR_CODE,
            Self::InvalidParams { .. } => INVALID_PARAMS_CODE,
            Self::UnknownOperation { .. } => METHOD_NOT_FOUND_CODE,
        }
    }

    /// Returns the stable machine-checkable kind for this error.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SecurityViolation { .. } => "SecurityViolation",
            Self::Timeout { .. } => "Timeout",
            Self::ExecutionFailed { .. } => "ExecutionError",
            Self::InvalidParams { .. } => "InvalidParams",
            Self::UnknownOperation { .. } => "MethodNotFound",
        }
    }

    /// Returns `true` if this error is a policy or guard rejection.
    #[must_use]
    pub fn is_security_related(&self) -> bool {
        matches!(self, Self::SecurityViolation { .. })
    }

    /// Returns `true` if a process may have been spawned before this error.
    ///
    /// Rejections and request errors guarantee no process was started.
    #[must_use]
    pub fn spawned_process(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::ExecutionFailed { result, .. } => result.is_some(),
            _ => false,
        }
    }

    /// Returns the rejecting outcome for security violations.
    #[must_use]
    pub fn outcome(&self) -> Option<&ValidationOutcome> {
        match self {
            Self::SecurityViolation { outcome } => Some(outcome),
            _ => None,
        }
    }

    /// Returns the captured execution result, if the process ran.
    #[must_use]
    pub fn result(&self) -> Option<&ExecutionResult> {
        match self {
            Self::Timeout { result, .. } => Some(result),
            Self::ExecutionFailed {
                result: Some(result),
                ..
            } => Some(result),
            _ => None,
        }
    }

    /// Renders the error as the structured response returned to the caller.
    #[must_use]
    pub fn to_response(&self) -> Value {
        let mut body = json!({
            "code": self.code(),
            "kind": self.kind(),
            "message": self.to_string(),
        });
        if let Some(outcome) = self.outcome() {
            body["rule"] = json!(outcome.rule);
            body["pattern"] = json!(outcome.pattern);
            body["line"] = json!(outcome.line);
        }
        if let Some(result) = self.result() {
            body["result"] = serde_json::to_value(result).unwrap_or(Value::Null);
        }
        body
    }
}

// ============== Display Implementation ==============

impl fmt::Display for GuardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SecurityViolation { outcome } => {
                let rule = outcome.rule.map_or("unknown", |r| r.as_str());
                let reason = outcome.reason.as_deref().unwrap_or("rejected");
                match outcome.line {
                    Some(line) => write!(
                        f,
                        "security violation ({}) at line {}: {}",
                        rule, line, reason
                    ),
                    None => write!(f, "security violation ({}): {}", rule, reason),
                }
            }
            Self::Timeout { timeout_ms, .. } => {
                write!(f, "execution timed out after {} ms", timeout_ms)
            }
            Self::ExecutionFailed { message, .. } => {
                write!(f, "execution failed: {}", message)
            }
            Self::InvalidParams { message } => {
                write!(f, "invalid params: {}", message)
            }
            Self::UnknownOperation { name } => {
                write!(f, "unknown operation '{}'", name)
            }
        }
    }
}

impl std::error::Error for GuardError {}
