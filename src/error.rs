use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Errors surfaced by query evaluation. Each variant maps onto one Prometheus `errorType`
/// and HTTP status, see [`EngineError::error_type`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// Malformed PromQL, wrong operand types, non-scalar aggregation parameters.
    #[error("{0}")]
    Parse(String),
    /// Vector matching cardinality violations and other evaluation failures.
    #[error("{0}")]
    Execution(String),
    /// The search backend was unreachable or returned malformed data.
    #[error("{0}")]
    Backend(String),
    /// A syntactically valid request the engine refuses in this shape.
    #[error("{0}")]
    RequestShape(String),
    #[error("query timed out in {0}")]
    Timeout(String),
    #[error("query was canceled")]
    Canceled,
    #[error("{0}")]
    Internal(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    BadData,
    Execution,
    Internal,
    Timeout,
    Canceled,
}

impl ErrorType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorType::BadData => "bad_data",
            ErrorType::Execution => "execution",
            ErrorType::Internal => "internal",
            ErrorType::Timeout => "timeout",
            ErrorType::Canceled => "canceled",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl EngineError {
    pub fn parse<S: Into<String>>(msg: S) -> Self {
        EngineError::Parse(msg.into())
    }

    pub fn execution<S: Into<String>>(msg: S) -> Self {
        EngineError::Execution(msg.into())
    }

    pub fn backend<S: Into<String>>(msg: S) -> Self {
        EngineError::Backend(msg.into())
    }

    pub fn error_type(&self) -> ErrorType {
        use EngineError::*;
        match self {
            Parse(_) | RequestShape(_) => ErrorType::BadData,
            Execution(_) => ErrorType::Execution,
            Backend(_) | Internal(_) => ErrorType::Internal,
            Timeout(_) => ErrorType::Timeout,
            Canceled => ErrorType::Canceled,
        }
    }

    pub fn status_code(&self) -> u16 {
        match self.error_type() {
            ErrorType::BadData => 400,
            ErrorType::Execution => 422,
            ErrorType::Internal => 500,
            ErrorType::Timeout => 503,
            ErrorType::Canceled => 499,
        }
    }

    pub fn to_envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            status: "error",
            error_type: self.error_type(),
            error: self.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Backend(format!("malformed backend response: {err}"))
    }
}

impl From<regex::Error> for EngineError {
    fn from(err: regex::Error) -> Self {
        EngineError::Parse(format!("invalid regular expression: {err}"))
    }
}

/// Prometheus API error body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorEnvelope {
    pub status: &'static str,
    #[serde(rename = "errorType")]
    pub error_type: ErrorType,
    pub error: String,
}
