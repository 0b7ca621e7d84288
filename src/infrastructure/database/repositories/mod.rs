//! Database repository implementations

pub mod charging_profile_repository;
pub mod transaction_message_repository;

pub use charging_profile_repository::SeaOrmChargingProfileRepository;
pub use transaction_message_repository::SeaOrmTransactionMessageRepository;
