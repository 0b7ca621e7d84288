pub mod messages;
pub mod model;
pub mod repository;

pub use messages::*;
pub use model::{
    far_future, ChargingLimitSource, ChargingProfile, ChargingProfileKind, ChargingProfilePurpose,
    ChargingRateUnit, ChargingSchedule, ChargingSchedulePeriod, CompositeSchedule,
    CompositeSchedulePeriod, EvseChargingProfile, RecurrencyKind,
};
pub use repository::ChargingProfileRepository;
