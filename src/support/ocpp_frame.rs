//! OCPP-J message framing
//!
//! The station side of the OCPP-J envelope. Framing is identical for
//! OCPP 1.6 and 2.0.1:
//!
//! - **Call**       `[2, "<uniqueId>", "<action>", {<payload>}]`
//! - **CallResult** `[3, "<uniqueId>", {<payload>}]`
//! - **CallError**  `[4, "<uniqueId>", "<errorCode>", "<errorDescription>", {<errorDetails>}]`
//!
//! Correlation between a Call and its answer is purely by `uniqueId`.

use serde_json::Value;
use thiserror::Error;

// ── Message-type constants ─────────────────────────────────────

const MSG_TYPE_CALL: u64 = 2;
const MSG_TYPE_CALL_RESULT: u64 = 3;
const MSG_TYPE_CALL_ERROR: u64 = 4;

// ── CallError codes used by the station ───────────────────────

pub const ERROR_NOT_IMPLEMENTED: &str = "NotImplemented";
pub const ERROR_NOT_SUPPORTED: &str = "NotSupported";
pub const ERROR_FORMATION_VIOLATION: &str = "FormationViolation";
pub const ERROR_INTERNAL: &str = "InternalError";

// ── OcppFrame ──────────────────────────────────────────────────

/// A parsed OCPP-J frame.
#[derive(Debug, Clone, PartialEq)]
pub enum OcppFrame {
    /// `[2, uniqueId, action, payload]`
    Call {
        unique_id: String,
        action: String,
        payload: Value,
    },
    /// `[3, uniqueId, payload]`
    CallResult { unique_id: String, payload: Value },
    /// `[4, uniqueId, errorCode, errorDescription, errorDetails]`
    CallError {
        unique_id: String,
        error_code: String,
        error_description: String,
        error_details: Value,
    },
}

impl OcppFrame {
    // ── Parsing ────────────────────────────────────────────

    /// Parse raw websocket text into an `OcppFrame`.
    pub fn parse(text: &str) -> Result<Self, OcppFrameError> {
        let arr: Vec<Value> = serde_json::from_str(text)?;

        let msg_type = arr
            .first()
            .ok_or(OcppFrameError::EmptyArray)?
            .as_u64()
            .ok_or(OcppFrameError::InvalidMessageType)?;

        match msg_type {
            MSG_TYPE_CALL => Self::parse_call(arr),
            MSG_TYPE_CALL_RESULT => Self::parse_call_result(arr),
            MSG_TYPE_CALL_ERROR => Self::parse_call_error(arr),
            _ => Err(OcppFrameError::UnknownMessageType(msg_type)),
        }
    }

    fn parse_call(arr: Vec<Value>) -> Result<Self, OcppFrameError> {
        expect_len(&arr, 4)?;
        let mut it = arr.into_iter().skip(1);
        let unique_id = take_string(it.next(), "uniqueId must be a string")?;
        let action = take_string(it.next(), "action must be a string")?;
        let payload = it.next().unwrap_or(Value::Null);

        Ok(Self::Call {
            unique_id,
            action,
            payload,
        })
    }

    fn parse_call_result(arr: Vec<Value>) -> Result<Self, OcppFrameError> {
        expect_len(&arr, 3)?;
        let mut it = arr.into_iter().skip(1);
        let unique_id = take_string(it.next(), "uniqueId must be a string")?;
        let payload = it.next().unwrap_or_else(empty_object);

        Ok(Self::CallResult { unique_id, payload })
    }

    fn parse_call_error(arr: Vec<Value>) -> Result<Self, OcppFrameError> {
        expect_len(&arr, 4)?;
        let mut it = arr.into_iter().skip(1);
        let unique_id = take_string(it.next(), "uniqueId must be a string")?;
        let error_code = it
            .next()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| ERROR_INTERNAL.to_string());
        let error_description = it
            .next()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let error_details = it.next().unwrap_or_else(empty_object);

        Ok(Self::CallError {
            unique_id,
            error_code,
            error_description,
            error_details,
        })
    }

    // ── Serialization ──────────────────────────────────────

    /// Serialize this frame to the JSON text sent on the wire.
    pub fn serialize(&self) -> Result<String, OcppFrameError> {
        Ok(serde_json::to_string(&self.to_value())?)
    }

    fn to_value(&self) -> Value {
        match self {
            Self::Call {
                unique_id,
                action,
                payload,
            } => Value::Array(vec![
                Value::from(MSG_TYPE_CALL),
                Value::from(unique_id.as_str()),
                Value::from(action.as_str()),
                payload.clone(),
            ]),
            Self::CallResult { unique_id, payload } => Value::Array(vec![
                Value::from(MSG_TYPE_CALL_RESULT),
                Value::from(unique_id.as_str()),
                payload.clone(),
            ]),
            Self::CallError {
                unique_id,
                error_code,
                error_description,
                error_details,
            } => Value::Array(vec![
                Value::from(MSG_TYPE_CALL_ERROR),
                Value::from(unique_id.as_str()),
                Value::from(error_code.as_str()),
                Value::from(error_description.as_str()),
                error_details.clone(),
            ]),
        }
    }

    // ── Helpers ────────────────────────────────────────────

    pub fn unique_id(&self) -> &str {
        match self {
            Self::Call { unique_id, .. }
            | Self::CallResult { unique_id, .. }
            | Self::CallError { unique_id, .. } => unique_id,
        }
    }

    /// Build a `CallError` answering the Call with `unique_id`.
    pub fn error_response(
        unique_id: impl Into<String>,
        error_code: impl Into<String>,
        error_description: impl Into<String>,
    ) -> Self {
        Self::CallError {
            unique_id: unique_id.into(),
            error_code: error_code.into(),
            error_description: error_description.into(),
            error_details: empty_object(),
        }
    }

    pub fn is_call(&self) -> bool {
        matches!(self, Self::Call { .. })
    }

    pub fn is_call_result(&self) -> bool {
        matches!(self, Self::CallResult { .. })
    }

    pub fn is_call_error(&self) -> bool {
        matches!(self, Self::CallError { .. })
    }
}

fn expect_len(arr: &[Value], expected: usize) -> Result<(), OcppFrameError> {
    if arr.len() < expected {
        return Err(OcppFrameError::MissingFields {
            expected,
            got: arr.len(),
        });
    }
    Ok(())
}

fn take_string(value: Option<Value>, what: &'static str) -> Result<String, OcppFrameError> {
    match value {
        Some(Value::String(s)) => Ok(s),
        _ => Err(OcppFrameError::FieldTypeMismatch(what)),
    }
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

// ── Errors ─────────────────────────────────────────────────────

/// Errors that can occur when parsing or serializing an OCPP-J frame.
#[derive(Debug, Error)]
pub enum OcppFrameError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Empty OCPP message array")]
    EmptyArray,

    #[error("Message type is not a number")]
    InvalidMessageType,

    #[error("Unknown message type: {0}")]
    UnknownMessageType(u64),

    #[error("Expected at least {expected} fields, got {got}")]
    MissingFields { expected: usize, got: usize },

    #[error("Field type mismatch: {0}")]
    FieldTypeMismatch(&'static str),
}
