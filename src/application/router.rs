//! Inbound Call routing
//!
//! Calls from the CSMS are looked up by action in a table of
//! [`CallHandler`]s. Every Call gets exactly one answer: the handler's
//! CallResult, or a CallError when no handler exists, the payload does not
//! decode or the handler fails. Follow-up Calls a handler asks for are
//! queued only after the answer went out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::application::queue::{InboundCall, MessageQueue};
use crate::domain::ocpp::MessageType;
use crate::support::ocpp_frame::{
    OcppFrame, ERROR_FORMATION_VIOLATION, ERROR_INTERNAL, ERROR_NOT_IMPLEMENTED,
    ERROR_NOT_SUPPORTED,
};

/// Why a Call could not be answered with a CallResult.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallFailure {
    #[error("Action '{0}' is not implemented")]
    NotImplemented(String),

    #[error("{0}")]
    NotSupported(String),

    #[error("Payload does not match the schema: {0}")]
    FormationViolation(String),

    #[error("{0}")]
    Internal(String),
}

impl CallFailure {
    /// OCPP-J CallError code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotImplemented(_) => ERROR_NOT_IMPLEMENTED,
            Self::NotSupported(_) => ERROR_NOT_SUPPORTED,
            Self::FormationViolation(_) => ERROR_FORMATION_VIOLATION,
            Self::Internal(_) => ERROR_INTERNAL,
        }
    }
}

/// CallResult payload plus Calls to send once it is on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct CallAnswer {
    pub payload: Value,
    pub follow_ups: Vec<(MessageType, Value)>,
}

impl CallAnswer {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            follow_ups: Vec::new(),
        }
    }

    pub fn then_send(mut self, message_type: MessageType, payload: Value) -> Self {
        self.follow_ups.push((message_type, payload));
        self
    }
}

#[async_trait]
pub trait CallHandler: Send + Sync {
    async fn handle(&self, payload: Value) -> Result<CallAnswer, CallFailure>;
}

/// Decode a request payload. Schema mismatches become `FormationViolation`.
pub fn decode_request<T: DeserializeOwned>(payload: Value) -> Result<T, CallFailure> {
    serde_json::from_value(payload).map_err(|e| CallFailure::FormationViolation(e.to_string()))
}

pub fn encode_response<T: Serialize>(response: &T) -> Result<CallAnswer, CallFailure> {
    serde_json::to_value(response)
        .map(CallAnswer::new)
        .map_err(|e| CallFailure::Internal(e.to_string()))
}

#[derive(Default)]
pub struct CallRouter {
    handlers: HashMap<MessageType, Arc<dyn CallHandler>>,
}

pub type SharedCallRouter = Arc<CallRouter>;

impl CallRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `action`, replacing any previous one.
    pub fn register(&mut self, action: MessageType, handler: Arc<dyn CallHandler>) {
        debug!(action = action.as_str(), "Registered Call handler");
        self.handlers.insert(action, handler);
    }

    /// Run the handler for `call`. Returns the answer frame and the
    /// follow-up Calls.
    pub async fn dispatch(&self, call: InboundCall) -> (OcppFrame, Vec<(MessageType, Value)>) {
        let started = Instant::now();
        let InboundCall {
            unique_id,
            action,
            payload,
        } = call;

        let handler = action
            .parse::<MessageType>()
            .ok()
            .and_then(|message_type| self.handlers.get(&message_type));

        let outcome = match handler {
            Some(handler) => handler.handle(payload).await,
            None => Err(CallFailure::NotImplemented(action.clone())),
        };

        metrics::histogram!("ocpp_inbound_call_duration_seconds", "action" => action.clone())
            .record(started.elapsed().as_secs_f64());

        match outcome {
            Ok(CallAnswer { payload, follow_ups }) => {
                info!(unique_id = unique_id.as_str(), action = action.as_str(), "Answered Call");
                (OcppFrame::CallResult { unique_id, payload }, follow_ups)
            }
            Err(failure) => {
                warn!(
                    unique_id = unique_id.as_str(),
                    action = action.as_str(),
                    error_code = failure.error_code(),
                    error = %failure,
                    "Answering Call with CallError"
                );
                let frame = OcppFrame::error_response(
                    &unique_id,
                    failure.error_code(),
                    &failure.to_string(),
                );
                (frame, Vec::new())
            }
        }
    }

    /// Dispatch `call`, send the answer through the queue's transport and
    /// queue the follow-ups.
    pub async fn route(&self, queue: &MessageQueue, call: InboundCall) {
        let (frame, follow_ups) = self.dispatch(call).await;
        if let Err(e) = queue.send_frame(frame) {
            warn!(error = %e, "Failed to send answer to inbound Call");
        }
        for (message_type, payload) in follow_ups {
            queue.enqueue(message_type, payload).detach();
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    struct Echo;

    #[async_trait]
    impl CallHandler for Echo {
        async fn handle(&self, payload: Value) -> Result<CallAnswer, CallFailure> {
            #[derive(serde::Deserialize, Serialize)]
            struct Request {
                value: i32,
            }
            let request: Request = decode_request(payload)?;
            encode_response(&request)
        }
    }

    fn call(action: &str, payload: Value) -> InboundCall {
        InboundCall {
            unique_id: "42".into(),
            action: action.into(),
            payload,
        }
    }

    fn router() -> CallRouter {
        let mut router = CallRouter::new();
        router.register(MessageType::DataTransfer, Arc::new(Echo));
        router
    }

    #[tokio::test]
    async fn registered_handler_answers_with_call_result() {
        let (frame, follow_ups) = router()
            .dispatch(call("DataTransfer", json!({"value": 7})))
            .await;
        assert!(follow_ups.is_empty());
        assert_eq!(
            frame,
            OcppFrame::CallResult {
                unique_id: "42".into(),
                payload: json!({"value": 7}),
            }
        );
    }

    #[tokio::test]
    async fn unknown_and_unregistered_actions_are_not_implemented() {
        for action in ["NoSuchAction", "Reset"] {
            match router().dispatch(call(action, json!({}))).await.0 {
                OcppFrame::CallError { error_code, .. } => assert_eq!(error_code, "NotImplemented"),
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn undecodable_payload_is_a_formation_violation() {
        match router().dispatch(call("DataTransfer", json!({"value": "x"}))).await.0 {
            OcppFrame::CallError {
                unique_id,
                error_code,
                ..
            } => {
                assert_eq!(unique_id, "42");
                assert_eq!(error_code, "FormationViolation");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }
}
