//! Request outcome types.

use rkyv::{Archive, Deserialize, Serialize};

/// Outcome classification of a request.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// The request failed.
    Failure,
    /// The request succeeded.
    Success,
    /// The request was cancelled before completing.
    Cancelled,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failure => write!(f, "failure"),
            Self::Success => write!(f, "success"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Status plus optional structured exception information.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StatusResult {
    /// Outcome classification.
    pub status: Status,

    /// Exception details for failed requests.
    pub exception: Option<RpcException>,
}

impl StatusResult {
    /// Creates a success result.
    #[must_use]
    pub const fn success() -> Self {
        Self {
            status: Status::Success,
            exception: None,
        }
    }

    /// Creates a failure result carrying the given exception.
    #[must_use]
    pub fn failure(exception: RpcException) -> Self {
        Self {
            status: Status::Failure,
            exception: Some(exception),
        }
    }

    /// Creates a cancelled result.
    #[must_use]
    pub fn cancelled(exception: Option<RpcException>) -> Self {
        Self {
            status: Status::Cancelled,
            exception,
        }
    }

    /// Checks if this result is a success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}

/// Structured exception information.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct RpcException {
    /// Human-readable message.
    pub message: String,

    /// Type name of the error, empty when withheld.
    pub type_name: String,

    /// Component that raised the error.
    pub source: String,

    /// Captured backtrace or error chain, if any.
    pub stack_trace: String,

    /// Whether the error originated in user code.
    pub is_user_exception: bool,
}

impl RpcException {
    /// Creates a system exception with the given type and message.
    #[must_use]
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            type_name: type_name.into(),
            source: String::new(),
            stack_trace: String::new(),
            is_user_exception: false,
        }
    }

    /// Sets the source component.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Sets the stack trace.
    #[must_use]
    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.stack_trace = stack_trace.into();
        self
    }

    /// Marks this exception as originating in user code.
    #[must_use]
    pub const fn user(mut self) -> Self {
        self.is_user_exception = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_carries_exception() {
        let result = StatusResult::failure(RpcException::new("function_not_found", "F1"));
        assert_eq!(result.status, Status::Failure);
        assert!(!result.is_success());
        assert_eq!(
            result.exception.map(|e| e.type_name).as_deref(),
            Some("function_not_found")
        );
    }

    #[test]
    fn user_exception_flag() {
        let e = RpcException::new("MyError", "boom").with_source("greet").user();
        assert!(e.is_user_exception);
        assert_eq!(e.source, "greet");
    }

    #[test]
    fn status_display() {
        assert_eq!(Status::Cancelled.to_string(), "cancelled");
        assert!(StatusResult::success().is_success());
    }
}
