//! Station registration and heartbeat
//!
//! The station sends BootNotification until the CSMS accepts it, then
//! opens the registration gate of the message queue and keeps sending
//! Heartbeat at the interval the CSMS asked for.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::application::queue::SharedMessageQueue;
use crate::config::StationConfig;
use crate::domain::ocpp::{MessageType, OcppVersion};
use crate::support::retry::RetryConfig;
use crate::support::shutdown::ShutdownSignal;

/// Used when the CSMS answers with an interval of 0.
const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationStatus {
    Accepted,
    Pending,
    Rejected,
}

/// Fields shared by the 1.6 and 2.0.1 BootNotification responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationResponse {
    pub current_time: String,
    /// Seconds. Heartbeat interval when accepted, retry delay otherwise.
    pub interval: i64,
    pub status: RegistrationStatus,
}

impl BootNotificationResponse {
    pub fn interval(&self) -> Duration {
        match u64::try_from(self.interval) {
            Ok(secs) if secs > 0 => Duration::from_secs(secs),
            _ => DEFAULT_INTERVAL,
        }
    }
}

/// BootNotification request body in the station's protocol version.
pub fn boot_notification_payload(config: &StationConfig) -> Value {
    match config.ocpp_version {
        OcppVersion::V16 => {
            let mut payload = json!({
                "chargePointVendor": config.vendor,
                "chargePointModel": config.model,
            });
            if let Some(serial) = &config.serial_number {
                payload["chargePointSerialNumber"] = json!(serial);
            }
            if let Some(firmware) = &config.firmware_version {
                payload["firmwareVersion"] = json!(firmware);
            }
            payload
        }
        OcppVersion::V201 => {
            let mut station = json!({
                "vendorName": config.vendor,
                "model": config.model,
            });
            if let Some(serial) = &config.serial_number {
                station["serialNumber"] = json!(serial);
            }
            if let Some(firmware) = &config.firmware_version {
                station["firmwareVersion"] = json!(firmware);
            }
            json!({"reason": "PowerUp", "chargingStation": station})
        }
    }
}

pub struct Station {
    config: StationConfig,
    queue: SharedMessageQueue,
    /// Backoff when BootNotification gets no answer at all.
    boot_retry: RetryConfig,
}

impl Station {
    pub fn new(config: StationConfig, queue: SharedMessageQueue, boot_retry: RetryConfig) -> Self {
        Self {
            config,
            queue,
            boot_retry,
        }
    }

    pub fn start(self: &Arc<Self>, shutdown: ShutdownSignal) -> JoinHandle<()> {
        let station = Arc::clone(self);
        tokio::spawn(async move { station.run(shutdown).await })
    }

    /// Register, then send heartbeats until shutdown.
    pub async fn run(&self, shutdown: ShutdownSignal) {
        let shutdown_wait = shutdown.notified().wait();
        tokio::pin!(shutdown_wait);

        let heartbeat_interval = tokio::select! {
            _ = &mut shutdown_wait => return,
            interval = self.register() => interval,
        };

        let mut ticker = tokio::time::interval(heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = &mut shutdown_wait => break,
                _ = ticker.tick() => self.heartbeat().await,
            }
        }
        info!("Heartbeat stopped");
    }

    /// Send BootNotification until accepted. Returns the heartbeat interval.
    pub async fn register(&self) -> Duration {
        let payload = boot_notification_payload(&self.config);
        let mut failures: u32 = 0;

        loop {
            let response: Result<BootNotificationResponse, _> = self
                .queue
                .call(MessageType::BootNotification, &payload)
                .await;

            let wait = match response {
                Ok(response) if response.status == RegistrationStatus::Accepted => {
                    info!(
                        station_id = self.config.id.as_str(),
                        interval = response.interval,
                        "✅ BootNotification accepted"
                    );
                    self.queue.set_registration_accepted();
                    return response.interval();
                }
                Ok(response) => {
                    warn!(
                        status = ?response.status,
                        retry_in = response.interval().as_secs(),
                        "BootNotification not accepted"
                    );
                    failures = 0;
                    response.interval()
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = self.boot_retry.jittered_delay_for_attempt(failures);
                    warn!(
                        error = %e,
                        attempt = failures,
                        retry_in_ms = delay.as_millis() as u64,
                        "BootNotification failed"
                    );
                    delay
                }
            };
            tokio::time::sleep(wait).await;
        }
    }

    async fn heartbeat(&self) {
        match self.queue.enqueue(MessageType::Heartbeat, json!({})).await {
            Ok(response) => info!(
                current_time = response["currentTime"].as_str().unwrap_or_default(),
                "💓 Heartbeat acknowledged"
            ),
            Err(e) => warn!(error = %e, "Heartbeat failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::*;
    use crate::application::queue::{MessageQueue, MessageQueueConfig};
    use crate::infrastructure::storage::InMemoryTransactionMessageRepository;
    use crate::infrastructure::transport::ChannelTransport;
    use crate::support::ocpp_frame::OcppFrame;

    struct Harness {
        queue: SharedMessageQueue,
        frames: mpsc::UnboundedReceiver<String>,
        shutdown: ShutdownSignal,
    }

    fn harness(version: OcppVersion) -> (Arc<Station>, Harness) {
        let (transport, frames) = ChannelTransport::pair();
        let queue = Arc::new(MessageQueue::new(
            MessageQueueConfig::default(),
            version,
            Arc::new(transport),
            Arc::new(InMemoryTransactionMessageRepository::new()),
        ));
        let shutdown = ShutdownSignal::new();
        queue.start(shutdown.clone());

        let config = StationConfig {
            ocpp_version: version,
            serial_number: Some("SN-1".into()),
            ..StationConfig::default()
        };
        let station = Arc::new(Station::new(config, queue.clone(), RetryConfig::default()));
        (
            station,
            Harness {
                queue,
                frames,
                shutdown,
            },
        )
    }

    async fn next_call(frames: &mut mpsc::UnboundedReceiver<String>) -> (String, String, Value) {
        let raw = timeout(Duration::from_secs(3600), frames.recv())
            .await
            .expect("expected a frame")
            .expect("transport channel open");
        match OcppFrame::parse(&raw).unwrap() {
            OcppFrame::Call {
                unique_id,
                action,
                payload,
            } => (unique_id, action, payload),
            other => panic!("expected Call, got {other:?}"),
        }
    }

    fn answer(queue: &SharedMessageQueue, unique_id: &str, payload: Value) {
        let frame = OcppFrame::CallResult {
            unique_id: unique_id.to_string(),
            payload,
        };
        queue.receive(&frame.serialize().unwrap());
    }

    #[test]
    fn boot_payload_follows_protocol_version() {
        let config = StationConfig {
            ocpp_version: OcppVersion::V16,
            firmware_version: Some("1.2.3".into()),
            ..StationConfig::default()
        };
        let v16 = boot_notification_payload(&config);
        assert_eq!(v16["chargePointVendor"], "Texnouz");
        assert_eq!(v16["firmwareVersion"], "1.2.3");
        assert!(v16.get("chargePointSerialNumber").is_none());

        let v201 = boot_notification_payload(&StationConfig {
            ocpp_version: OcppVersion::V201,
            ..config
        });
        assert_eq!(v201["reason"], "PowerUp");
        assert_eq!(v201["chargingStation"]["model"], "AC-22");
    }

    #[tokio::test(start_paused = true)]
    async fn accepted_boot_opens_gate_and_starts_heartbeat() {
        let (station, mut h) = harness(OcppVersion::V201);
        station.start(h.shutdown.clone());

        let (id, action, payload) = next_call(&mut h.frames).await;
        assert_eq!(action, "BootNotification");
        assert_eq!(payload["chargingStation"]["serialNumber"], "SN-1");
        answer(
            &h.queue,
            &id,
            json!({"currentTime": "2024-01-01T00:00:00Z", "interval": 120, "status": "Accepted"}),
        );

        let started = tokio::time::Instant::now();
        let (id, action, _) = next_call(&mut h.frames).await;
        assert_eq!(action, "Heartbeat");
        assert!(h.queue.registration_accepted());
        assert!(started.elapsed() >= Duration::from_secs(120));
        answer(&h.queue, &id, json!({"currentTime": "2024-01-01T00:02:00Z"}));

        let (_, action, _) = next_call(&mut h.frames).await;
        assert_eq!(action, "Heartbeat");
        h.shutdown.trigger();
    }

    #[tokio::test(start_paused = true)]
    async fn pending_boot_is_retried_after_interval() {
        let (station, mut h) = harness(OcppVersion::V16);
        station.start(h.shutdown.clone());

        let (id, _, _) = next_call(&mut h.frames).await;
        answer(
            &h.queue,
            &id,
            json!({"currentTime": "2024-01-01T00:00:00Z", "interval": 30, "status": "Pending"}),
        );

        let started = tokio::time::Instant::now();
        let (_, action, payload) = next_call(&mut h.frames).await;
        assert_eq!(action, "BootNotification");
        assert_eq!(payload["chargePointModel"], "AC-22");
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert!(!h.queue.registration_accepted());
        h.shutdown.trigger();
    }
}
