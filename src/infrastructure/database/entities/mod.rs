//! Database entities module

pub mod charging_profile;
pub mod transaction_message;

pub use charging_profile::Entity as ChargingProfile;
pub use transaction_message::Entity as TransactionMessage;
