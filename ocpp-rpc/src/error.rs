//! Error taxonomy of the RPC engine
//!
//! Protocol-level failures never escape as panics or tear down the connection:
//! they become a CALLERROR sent to the peer, or an [`RpcError`] value carried
//! inside the [`Reply`](crate::Reply) returned to the local caller.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::envelope::{ErrorCode, Payload};
use crate::ids::RequestId;

/// Error returned by business handlers and event subscribers
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// The received bytes do not follow the OCPP-J envelope grammar
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("charge box id must not be empty")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PendingError {
    #[error("request id already pending: {0}")]
    DuplicateRequestId(RequestId),

    #[error("pending-request table is closed")]
    Closed,
}

/// Outcome of waiting on a pending request, other than a CALLRESULT payload
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AwaitError {
    #[error("timeout waiting for response")]
    Timeout,

    #[error("CALLERROR from peer: {code} - {description}")]
    CallError {
        code: ErrorCode,
        description: String,
        details: Payload,
    },

    #[error("connection closed")]
    Disconnected,

    #[error("no pending request {0}")]
    NotPending(RequestId),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("action {action} is already registered with request type {existing}")]
    Conflict {
        action: &'static str,
        existing: &'static str,
    },
}

/// Failure of the WebSocket connection underneath an endpoint
#[derive(Debug, Error)]
pub enum WsError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("WebSocket writer task failed: {0}")]
    Writer(#[from] tokio::task::JoinError),
}

/// Machine-readable result of an outbound request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultCode {
    Ok,
    Timeout,
    FormatError,
    GenericError,
    Disconnected,
    Remote(ErrorCode),
}

impl ResultCode {
    pub fn is_ok(&self) -> bool {
        matches!(self, ResultCode::Ok)
    }
}

/// Failure of an outbound request, as seen by the local caller
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RpcError {
    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("peer answered with CALLERROR {code}: {description}")]
    CallError {
        code: ErrorCode,
        description: String,
        details: Payload,
    },

    #[error("response payload violates the message format: {0}")]
    FormationViolation(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request id already pending: {0}")]
    DuplicateRequestId(RequestId),

    #[error("connection closed")]
    Disconnected,
}

impl RpcError {
    /// Codes outside the dialect's list map to `GenericError`; the raw code
    /// stays in [`RpcError::CallError`].
    pub fn code(&self) -> ResultCode {
        match self {
            RpcError::Timeout(_) => ResultCode::Timeout,
            RpcError::CallError { code, .. } => ResultCode::Remote(code.effective()),
            RpcError::FormationViolation(_) | RpcError::InvalidRequest(_) => ResultCode::FormatError,
            RpcError::DuplicateRequestId(_) => ResultCode::GenericError,
            RpcError::Disconnected => ResultCode::Disconnected,
        }
    }

    pub(crate) fn from_await(error: AwaitError, timeout: Duration) -> Self {
        match error {
            AwaitError::Timeout => RpcError::Timeout(timeout),
            AwaitError::CallError {
                code,
                description,
                details,
            } => RpcError::CallError {
                code,
                description,
                details,
            },
            AwaitError::Disconnected | AwaitError::NotPending(_) => RpcError::Disconnected,
        }
    }
}

/// Short JSON type name used in diagnostics
pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_codes() {
        assert_eq!(RpcError::Timeout(Duration::from_secs(1)).code(), ResultCode::Timeout);
        assert_eq!(
            RpcError::FormationViolation("missing field".into()).code(),
            ResultCode::FormatError
        );
        assert_eq!(
            RpcError::DuplicateRequestId(RequestId::new("r1")).code(),
            ResultCode::GenericError
        );

        let remote = RpcError::CallError {
            code: ErrorCode::NotImplemented,
            description: "unknown".into(),
            details: Payload::new(),
        };
        assert_eq!(remote.code(), ResultCode::Remote(ErrorCode::NotImplemented));

        let vendor = RpcError::CallError {
            code: ErrorCode::Other("VendorFault".into()),
            description: "x".into(),
            details: Payload::new(),
        };
        assert_eq!(vendor.code(), ResultCode::Remote(ErrorCode::GenericError));
    }

    #[test]
    fn test_await_error_conversion_keeps_timeout() {
        let timeout = Duration::from_millis(100);
        assert_eq!(
            RpcError::from_await(AwaitError::Timeout, timeout),
            RpcError::Timeout(timeout)
        );
        assert_eq!(
            RpcError::from_await(AwaitError::NotPending(RequestId::new("x")), timeout),
            RpcError::Disconnected
        );
    }
}
