//! ControlMessage: one outbound Call owned by the message queue

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::ocpp::{MessageType, OcppVersion};
use crate::support::ocpp_frame::{OcppFrame, OcppFrameError};

#[derive(Debug, Clone, PartialEq)]
pub struct ControlMessage {
    /// Correlation id, a UUID v4. Kept across retries.
    pub unique_id: String,
    pub message_type: MessageType,
    /// Call payload (the 4th element of the frame).
    pub payload: Value,
    /// Serialized OCPP-J Call frame. Retries resend exactly these bytes.
    pub message: String,
    /// Number of transmissions so far.
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub is_transaction_related: bool,
    /// Held until the CSMS accepted the BootNotification.
    pub stall_until_accepted: bool,
}

impl ControlMessage {
    pub fn new(
        message_type: MessageType,
        payload: Value,
        version: OcppVersion,
    ) -> Result<Self, OcppFrameError> {
        let unique_id = Uuid::new_v4().to_string();
        let message = OcppFrame::Call {
            unique_id: unique_id.clone(),
            action: message_type.as_str().to_string(),
            payload: payload.clone(),
        }
        .serialize()?;

        Ok(Self {
            unique_id,
            message_type,
            payload,
            message,
            attempts: 0,
            enqueued_at: Utc::now(),
            is_transaction_related: message_type.is_transaction_message(version),
            stall_until_accepted: false,
        })
    }

    /// Rebuild a message from its stored Call frame.
    pub fn from_stored_frame(
        message: String,
        enqueued_at: DateTime<Utc>,
    ) -> Result<Self, StoredFrameError> {
        match OcppFrame::parse(&message)? {
            OcppFrame::Call {
                unique_id,
                action,
                payload,
            } => {
                let message_type = action
                    .parse::<MessageType>()
                    .map_err(|e| StoredFrameError::Action(e.0))?;
                Ok(Self {
                    unique_id,
                    message_type,
                    payload,
                    message,
                    attempts: 0,
                    enqueued_at,
                    is_transaction_related: true,
                    stall_until_accepted: true,
                })
            }
            _ => Err(StoredFrameError::NotACall),
        }
    }

    /// Transaction id carried by the payload: `transactionId` in 1.6,
    /// `transactionInfo.transactionId` in 2.0.1.
    pub fn transaction_id(&self) -> Option<String> {
        let raw = self
            .payload
            .get("transactionInfo")
            .and_then(|info| info.get("transactionId"))
            .or_else(|| self.payload.get("transactionId"))?;

        match raw {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Intermediate meter data that may be dropped when the queue grows too large.
    pub fn is_transaction_update_message(&self) -> bool {
        match self.message_type {
            MessageType::MeterValues => self.is_transaction_related,
            MessageType::TransactionEvent => self.event_type() == Some("Updated"),
            _ => false,
        }
    }

    pub fn is_stop_transaction_message(&self) -> bool {
        match self.message_type {
            MessageType::StopTransaction => true,
            MessageType::TransactionEvent => self.event_type() == Some("Ended"),
            _ => false,
        }
    }

    fn event_type(&self) -> Option<&str> {
        self.payload.get("eventType").and_then(Value::as_str)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoredFrameError {
    #[error(transparent)]
    Frame(#[from] OcppFrameError),
    #[error("stored frame is not a Call")]
    NotACall,
    #[error("unknown action '{0}'")]
    Action(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_message_frames_payload_with_fresh_id() {
        let a = ControlMessage::new(MessageType::Heartbeat, json!({}), OcppVersion::V201).unwrap();
        let b = ControlMessage::new(MessageType::Heartbeat, json!({}), OcppVersion::V201).unwrap();

        assert_ne!(a.unique_id, b.unique_id);
        assert_eq!(a.message, format!(r#"[2,"{}","Heartbeat",{{}}]"#, a.unique_id));
        assert_eq!(a.attempts, 0);
        assert!(!a.is_transaction_related);
    }

    #[test]
    fn classifies_transaction_events() {
        let updated = ControlMessage::new(
            MessageType::TransactionEvent,
            json!({"eventType": "Updated", "transactionInfo": {"transactionId": "tx-1"}}),
            OcppVersion::V201,
        )
        .unwrap();
        assert!(updated.is_transaction_related);
        assert!(updated.is_transaction_update_message());
        assert!(!updated.is_stop_transaction_message());
        assert_eq!(updated.transaction_id().as_deref(), Some("tx-1"));

        let ended = ControlMessage::new(
            MessageType::TransactionEvent,
            json!({"eventType": "Ended", "transactionInfo": {"transactionId": "tx-1"}}),
            OcppVersion::V201,
        )
        .unwrap();
        assert!(!ended.is_transaction_update_message());
        assert!(ended.is_stop_transaction_message());
    }

    #[test]
    fn v16_meter_values_carry_numeric_transaction_id() {
        let mv = ControlMessage::new(
            MessageType::MeterValues,
            json!({"connectorId": 1, "transactionId": 42, "meterValue": []}),
            OcppVersion::V16,
        )
        .unwrap();
        assert!(mv.is_transaction_update_message());
        assert_eq!(mv.transaction_id().as_deref(), Some("42"));
    }

    #[test]
    fn restores_from_stored_frame() {
        let original = ControlMessage::new(
            MessageType::StopTransaction,
            json!({"transactionId": 3, "meterStop": 100}),
            OcppVersion::V16,
        )
        .unwrap();

        let restored =
            ControlMessage::from_stored_frame(original.message.clone(), original.enqueued_at)
                .unwrap();
        assert_eq!(restored.unique_id, original.unique_id);
        assert_eq!(restored.message_type, MessageType::StopTransaction);
        assert_eq!(restored.payload, original.payload);
        assert!(restored.stall_until_accepted);

        assert!(matches!(
            ControlMessage::from_stored_frame(r#"[3,"x",{}]"#.into(), Utc::now()),
            Err(StoredFrameError::NotACall)
        ));
    }
}
