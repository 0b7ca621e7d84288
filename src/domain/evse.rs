//! What smart charging needs to know about the station's EVSEs

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveTransaction {
    pub transaction_id: String,
    pub started_at: DateTime<Utc>,
}

pub trait EvseManager: Send + Sync {
    /// EVSE 0 (the whole station) always exists.
    fn does_evse_exist(&self, evse_id: i32) -> bool;

    /// Number of physical EVSEs, numbered `1..=n`.
    fn number_of_evses(&self) -> i32;

    fn active_transaction(&self, evse_id: i32) -> Option<ActiveTransaction>;
}
