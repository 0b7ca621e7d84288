//! Application layer: queueing, routing and smart charging

pub mod evse_registry;
pub mod queue;
pub mod router;
pub mod smart_charging;
pub mod station;

pub use evse_registry::{EvseRegistry, SharedEvseRegistry};
pub use queue::{
    InboundCall, MessageQueue, MessageQueueConfig, MessageQueueError, PendingResponse,
    SharedMessageQueue,
};
pub use router::{CallAnswer, CallFailure, CallHandler, CallRouter, SharedCallRouter};
pub use smart_charging::{
    ProfileValidationResult, SharedSmartChargingHandler, SmartChargingConfig,
    SmartChargingHandler,
};
pub use station::Station;
