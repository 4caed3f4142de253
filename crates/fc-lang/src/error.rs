//! Error taxonomy shared by every entry point.
//!
//! [`BridgeError`] is what services, the reverse channel and the foreign-call
//! bridge return. On the wire it travels as a [`WireError`] with a stable
//! [`ErrorCode`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::handle::{ObjectKind, Operation};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BridgeError {
    #[error("invalid handle {0}")]
    InvalidHandle(u64),

    #[error("{op} is not supported on {kind}")]
    UnsupportedOperation { kind: ObjectKind, op: Operation },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Line and column are 1-based; 0 means the position is unknown.
    #[error("parse error at line {line}, column {column}: {message}")]
    Parse {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no reverse channel configured")]
    NoReverseChannel,

    #[error("forwarded call timed out after {0:?}")]
    ForwardTimeout(Duration),

    #[error("transport closed: {0}")]
    TransportClosed(String),

    /// Failure reported by the model, passed through verbatim.
    #[error("{0}")]
    Adapter(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidHandle,
    UnsupportedOperation,
    InvalidArgument,
    ParseError,
    NotFound,
    NoReverseChannel,
    ForwardTimeout,
    TransportClosed,
    AdapterError,
}

/// Error as carried in a reply frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<usize>,
}

impl BridgeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            BridgeError::InvalidHandle(_) => ErrorCode::InvalidHandle,
            BridgeError::UnsupportedOperation { .. } => ErrorCode::UnsupportedOperation,
            BridgeError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            BridgeError::Parse { .. } => ErrorCode::ParseError,
            BridgeError::NotFound(_) => ErrorCode::NotFound,
            BridgeError::NoReverseChannel => ErrorCode::NoReverseChannel,
            BridgeError::ForwardTimeout(_) => ErrorCode::ForwardTimeout,
            BridgeError::TransportClosed(_) => ErrorCode::TransportClosed,
            BridgeError::Adapter(_) => ErrorCode::AdapterError,
        }
    }

    pub fn to_wire(&self) -> WireError {
        let (line, column) = match self {
            BridgeError::Parse { line, column, .. } => (Some(*line), Some(*column)),
            _ => (None, None),
        };
        WireError {
            code: self.code(),
            message: self.to_string(),
            line,
            column,
        }
    }

    /// Rebuild an error reported by the foreign endpoint.
    ///
    /// Codes that only make sense locally collapse into [`BridgeError::Adapter`]
    /// so the foreign message survives unchanged.
    pub fn from_wire(err: WireError) -> Self {
        match err.code {
            ErrorCode::InvalidArgument => BridgeError::InvalidArgument(err.message),
            ErrorCode::NotFound => BridgeError::NotFound(err.message),
            ErrorCode::ParseError => BridgeError::Parse {
                line: err.line.unwrap_or(0),
                column: err.column.unwrap_or(0),
                message: err.message,
            },
            ErrorCode::TransportClosed => BridgeError::TransportClosed(err.message),
            _ => BridgeError::Adapter(err.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_carries_position_on_the_wire() {
        let err = BridgeError::Parse {
            line: 3,
            column: 14,
            message: "expected `:`".into(),
        };
        insta::assert_json_snapshot!(err.to_wire(), @r#"
        {
          "code": "parse_error",
          "message": "parse error at line 3, column 14: expected `:`",
          "line": 3,
          "column": 14
        }
        "#);
    }

    #[test]
    fn unsupported_operation_names_kind_and_op() {
        let err = BridgeError::UnsupportedOperation {
            kind: ObjectKind::Subscription,
            op: Operation::Read,
        };
        assert_eq!(err.to_string(), "read is not supported on subscription");
        assert_eq!(err.code(), ErrorCode::UnsupportedOperation);
    }

    #[test]
    fn foreign_errors_keep_their_message() {
        let wire = WireError {
            code: ErrorCode::AdapterError,
            message: "disk on fire".into(),
            line: None,
            column: None,
        };
        assert_eq!(
            BridgeError::from_wire(wire),
            BridgeError::Adapter("disk on fire".into())
        );
    }
}
