//! EVSE registry: tracks which EVSEs exist and their running transactions

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{info, warn};

use crate::domain::evse::{ActiveTransaction, EvseManager};

/// Thread-safe table of the station's EVSEs (`1..=n`).
pub struct EvseRegistry {
    evses: DashMap<i32, Option<ActiveTransaction>>,
}

pub type SharedEvseRegistry = Arc<EvseRegistry>;

impl EvseRegistry {
    pub fn new(number_of_evses: i32) -> Self {
        let evses = DashMap::new();
        for evse_id in 1..=number_of_evses {
            evses.insert(evse_id, None);
        }
        Self { evses }
    }

    pub fn shared(number_of_evses: i32) -> SharedEvseRegistry {
        Arc::new(Self::new(number_of_evses))
    }

    /// Record a transaction start. Returns `false` for an unknown EVSE.
    pub fn start_transaction(
        &self,
        evse_id: i32,
        transaction_id: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> bool {
        let transaction_id = transaction_id.into();
        match self.evses.get_mut(&evse_id) {
            Some(mut slot) => {
                info!(evse_id, transaction_id = %transaction_id, "Transaction started");
                *slot = Some(ActiveTransaction {
                    transaction_id,
                    started_at,
                });
                true
            }
            None => {
                warn!(evse_id, "Transaction start on unknown EVSE");
                false
            }
        }
    }

    /// Clear the EVSE's transaction, returning it.
    pub fn end_transaction(&self, evse_id: i32) -> Option<ActiveTransaction> {
        let ended = self.evses.get_mut(&evse_id).and_then(|mut slot| slot.take());
        if let Some(tx) = &ended {
            info!(evse_id, transaction_id = %tx.transaction_id, "Transaction ended");
        }
        ended
    }
}

impl EvseManager for EvseRegistry {
    fn does_evse_exist(&self, evse_id: i32) -> bool {
        evse_id == 0 || self.evses.contains_key(&evse_id)
    }

    fn number_of_evses(&self) -> i32 {
        self.evses.len() as i32
    }

    fn active_transaction(&self, evse_id: i32) -> Option<ActiveTransaction> {
        self.evses.get(&evse_id).and_then(|slot| slot.clone())
    }
}
