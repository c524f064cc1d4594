//! OCPP-J message framing
//!
//! Identical across OCPP 1.6, 2.0.1 and 2.1. Every frame is a JSON array in a
//! WebSocket text frame:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
//!
//! A bare `[]` is a liveness no-op and decodes to [`Frame::Empty`].

use std::fmt;

use serde_json::{json, Map, Value};

use crate::error::{json_kind, DecodeError};
use crate::ids::{ProtocolVersion, RequestId};

/// JSON object carried as CALL/CALLRESULT payload or CALLERROR details
pub type Payload = Map<String, Value>;

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

impl MessageType {
    pub fn from_id(id: i64) -> Option<Self> {
        match id {
            2 => Some(MessageType::Call),
            3 => Some(MessageType::CallResult),
            4 => Some(MessageType::CallError),
            _ => None,
        }
    }
}

/// OCPP RPC error codes, in both the 1.6 and the 2.x spelling.
///
/// Codes that appear in neither dialect are kept verbatim in `Other` so they
/// can be logged and forwarded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// 2.x spelling
    FormatViolation,
    /// 1.6 spelling
    FormationViolation,
    GenericError,
    InternalError,
    MessageTypeNotSupported,
    NotImplemented,
    NotSupported,
    /// 2.x spelling
    OccurrenceConstraintViolation,
    /// 1.6 spelling
    OccurenceConstraintViolation,
    PropertyConstraintViolation,
    ProtocolError,
    RpcFrameworkError,
    SecurityError,
    TypeConstraintViolation,
    Other(String),
}

impl ErrorCode {
    pub fn from_wire(code: &str) -> Self {
        match code {
            "FormatViolation" => ErrorCode::FormatViolation,
            "FormationViolation" => ErrorCode::FormationViolation,
            "GenericError" => ErrorCode::GenericError,
            "InternalError" => ErrorCode::InternalError,
            "MessageTypeNotSupported" => ErrorCode::MessageTypeNotSupported,
            "NotImplemented" => ErrorCode::NotImplemented,
            "NotSupported" => ErrorCode::NotSupported,
            "OccurrenceConstraintViolation" => ErrorCode::OccurrenceConstraintViolation,
            "OccurenceConstraintViolation" => ErrorCode::OccurenceConstraintViolation,
            "PropertyConstraintViolation" => ErrorCode::PropertyConstraintViolation,
            "ProtocolError" => ErrorCode::ProtocolError,
            "RpcFrameworkError" => ErrorCode::RpcFrameworkError,
            "SecurityError" => ErrorCode::SecurityError,
            "TypeConstraintViolation" => ErrorCode::TypeConstraintViolation,
            other => ErrorCode::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::FormatViolation => "FormatViolation",
            ErrorCode::FormationViolation => "FormationViolation",
            ErrorCode::GenericError => "GenericError",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::MessageTypeNotSupported => "MessageTypeNotSupported",
            ErrorCode::NotImplemented => "NotImplemented",
            ErrorCode::NotSupported => "NotSupported",
            ErrorCode::OccurrenceConstraintViolation => "OccurrenceConstraintViolation",
            ErrorCode::OccurenceConstraintViolation => "OccurenceConstraintViolation",
            ErrorCode::PropertyConstraintViolation => "PropertyConstraintViolation",
            ErrorCode::ProtocolError => "ProtocolError",
            ErrorCode::RpcFrameworkError => "RpcFrameworkError",
            ErrorCode::SecurityError => "SecurityError",
            ErrorCode::TypeConstraintViolation => "TypeConstraintViolation",
            ErrorCode::Other(raw) => raw,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, ErrorCode::Other(_))
    }

    /// The code the engine reasons with: unknown codes count as `GenericError`
    pub fn effective(&self) -> ErrorCode {
        match self {
            ErrorCode::Other(_) => ErrorCode::GenericError,
            known => known.clone(),
        }
    }

    /// Payload-format error in the spelling of `version`
    pub fn format_violation(version: ProtocolVersion) -> Self {
        if version.is_v2() {
            ErrorCode::FormatViolation
        } else {
            ErrorCode::FormationViolation
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OCPP CALL message (request)
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub request_id: RequestId,
    pub action: String,
    pub payload: Payload,
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub request_id: RequestId,
    pub payload: Payload,
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub request_id: RequestId,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Payload,
}

impl CallError {
    pub fn new(
        request_id: RequestId,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            error_code,
            error_description: error_description.into(),
            error_details: Payload::new(),
        }
    }

    pub fn with_details(mut self, details: Payload) -> Self {
        self.error_details = details;
        self
    }
}

/// Decoded OCPP message (any type)
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl Envelope {
    pub fn request_id(&self) -> &RequestId {
        match self {
            Envelope::Call(c) => &c.request_id,
            Envelope::CallResult(r) => &r.request_id,
            Envelope::CallError(e) => &e.request_id,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Envelope::Call(_) => MessageType::Call,
            Envelope::CallResult(_) => MessageType::CallResult,
            Envelope::CallError(_) => MessageType::CallError,
        }
    }

    /// Wire text for a WebSocket text frame
    pub fn to_text(&self) -> String {
        let array = match self {
            Envelope::Call(c) => json!([
                MessageType::Call as u8,
                c.request_id.as_str(),
                c.action,
                c.payload
            ]),
            Envelope::CallResult(r) => json!([
                MessageType::CallResult as u8,
                r.request_id.as_str(),
                r.payload
            ]),
            Envelope::CallError(e) => json!([
                MessageType::CallError as u8,
                e.request_id.as_str(),
                e.error_code.as_str(),
                e.error_description,
                e.error_details
            ]),
        };
        array.to_string()
    }

    pub fn encode(&self) -> Vec<u8> {
        self.to_text().into_bytes()
    }
}

/// A received frame: either an envelope or the `[]` no-op
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Empty,
    Envelope(Envelope),
}

/// Decode one OCPP-J frame
pub fn decode(bytes: &[u8]) -> Result<Frame, DecodeError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let array = match value {
        Value::Array(array) => array,
        other => {
            return Err(DecodeError::UnknownMessageType(format!(
                "expected array, got {}",
                json_kind(&other)
            )))
        }
    };

    let Some(first) = array.first() else {
        return Ok(Frame::Empty);
    };

    let msg_type = first
        .as_i64()
        .and_then(MessageType::from_id)
        .ok_or_else(|| DecodeError::UnknownMessageType(first.to_string()))?;

    let envelope = match msg_type {
        MessageType::Call => {
            let [_, id, action, payload]: [Value; 4] = fixed(array, "CALL")?;
            let action = match action {
                Value::String(action) if !action.is_empty() => action,
                _ => {
                    return Err(DecodeError::Malformed(
                        "action must be a non-empty string".into(),
                    ))
                }
            };
            Envelope::Call(Call {
                request_id: request_id(id)?,
                action,
                payload: object(payload, "payload")?,
            })
        }
        MessageType::CallResult => {
            let [_, id, payload]: [Value; 3] = fixed(array, "CALLRESULT")?;
            Envelope::CallResult(CallResult {
                request_id: request_id(id)?,
                payload: object(payload, "payload")?,
            })
        }
        MessageType::CallError => {
            let [_, id, code, description, details]: [Value; 5] = fixed(array, "CALLERROR")?;
            let error_code = code
                .as_str()
                .map(ErrorCode::from_wire)
                .ok_or_else(|| DecodeError::Malformed("errorCode must be a string".into()))?;
            let error_description = match description {
                Value::String(description) => description,
                other => {
                    return Err(DecodeError::Malformed(format!(
                        "errorDescription must be a string, got {}",
                        json_kind(&other)
                    )))
                }
            };
            Envelope::CallError(CallError {
                request_id: request_id(id)?,
                error_code,
                error_description,
                error_details: object(details, "errorDetails")?,
            })
        }
    };

    Ok(Frame::Envelope(envelope))
}

fn fixed<const N: usize>(array: Vec<Value>, kind: &str) -> Result<[Value; N], DecodeError> {
    array.try_into().map_err(|array: Vec<Value>| {
        DecodeError::Malformed(format!(
            "{} requires {} elements, got {}",
            kind,
            N,
            array.len()
        ))
    })
}

fn request_id(value: Value) -> Result<RequestId, DecodeError> {
    match value {
        Value::String(id) if !id.is_empty() => Ok(RequestId::new(id)),
        other => Err(DecodeError::Malformed(format!(
            "messageId must be a non-empty string, got {}",
            json_kind(&other)
        ))),
    }
}

fn object(value: Value, field: &str) -> Result<Payload, DecodeError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(DecodeError::Malformed(format!(
            "{} must be a JSON object, got {}",
            field,
            json_kind(&other)
        ))),
    }
}
