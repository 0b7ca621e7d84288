//! Reliable outbound message queue
//!
//! ## Architecture
//!
//! ```text
//! enqueue() ──► [normal lane]      ──► Transport::send ──► CSMS
//!           └─► [transaction lane] ──┘        ▲
//!                    │                        │
//!          TransactionMessageRepository   receive() ◄── websocket reader
//! ```
//!
//! - Each lane has at most one message in flight. Transaction messages
//!   (meter values, transaction events) use their own lane so they are never
//!   blocked behind an unrelated request.
//! - Responses are matched purely by unique id.
//! - Before the CSMS accepted the BootNotification only boot, triggered and
//!   held (transaction / `queue_all_messages`) traffic is admitted; the rest
//!   is discarded.
//! - Transaction messages are retried verbatim on timeout and mirrored into
//!   the repository until delivered or abandoned. Persistence runs on a
//!   writer task, so storage failures never stall dispatch.
//! - Only response timeouts consume attempts. A frame the transport refuses
//!   pauses the queue; held messages go back to the head of their lane.

mod config;
mod pending;

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub use config::MessageQueueConfig;
pub use pending::PendingResponse;

use pending::Responder;

use crate::domain::message::{
    get_message_transmission_priority, ControlMessage, MessageTransmissionPriority,
    TransactionMessageRepository,
};
use crate::domain::ocpp::{MessageType, OcppVersion};
use crate::infrastructure::transport::{Transport, TransportError};
use crate::support::errors::StorageResult;
use crate::support::ocpp_frame::OcppFrame;
use crate::support::shutdown::ShutdownSignal;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MessageQueueError {
    #[error("{0} discarded: registration not accepted yet")]
    Discarded(MessageType),

    #[error("No response after {attempts} attempt(s)")]
    Timeout { attempts: u32 },

    #[error("Send failed after {attempts} attempt(s): {reason}")]
    SendFailed { attempts: u32, reason: String },

    #[error("CallError {code}: {description}")]
    CallError {
        code: String,
        description: String,
        details: Value,
    },

    #[error("Dropped to keep the queue below its size threshold")]
    Dropped,

    #[error("Message queue stopped")]
    Stopped,

    #[error("Invalid response payload: {0}")]
    InvalidResponse(String),

    #[error("Failed to frame message: {0}")]
    Framing(String),
}

/// A Call received from the CSMS, to be routed to a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundCall {
    pub unique_id: String,
    pub action: String,
    pub payload: Value,
}

pub type SharedMessageQueue = Arc<MessageQueue>;

pub struct MessageQueue {
    shared: Arc<Shared>,
}

// ── Internal state ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lane {
    Normal,
    Transaction,
}

const LANES: [Lane; 2] = [Lane::Normal, Lane::Transaction];

struct Entry {
    message: ControlMessage,
    responder: Option<Responder>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingResponse,
    RetryPending,
}

struct InFlight {
    entry: Entry,
    phase: Phase,
    /// Response timeout while awaiting, retransmission time while retry-pending.
    deadline: Instant,
    sent_at: Instant,
}

#[derive(Default)]
struct LaneState {
    queue: VecDeque<Entry>,
    in_flight: Option<InFlight>,
}

enum PersistOp {
    Insert(ControlMessage),
    Remove(String),
}

struct QueueState {
    normal: LaneState,
    transaction: LaneState,
    config: MessageQueueConfig,
    registration_accepted: bool,
    paused: bool,
    resume_at: Option<Instant>,
    stopped: bool,
    persist_tx: Option<mpsc::UnboundedSender<PersistOp>>,
}

impl QueueState {
    fn lane(&self, lane: Lane) -> &LaneState {
        match lane {
            Lane::Normal => &self.normal,
            Lane::Transaction => &self.transaction,
        }
    }

    fn lane_mut(&mut self, lane: Lane) -> &mut LaneState {
        match lane {
            Lane::Normal => &mut self.normal,
            Lane::Transaction => &mut self.transaction,
        }
    }

    fn total_queued(&self) -> usize {
        self.normal.queue.len() + self.transaction.queue.len()
    }

    fn transaction_messages(&self) -> impl Iterator<Item = &ControlMessage> {
        self.transaction
            .in_flight
            .iter()
            .map(|f| &f.entry.message)
            .chain(self.transaction.queue.iter().map(|e| &e.message))
    }

    /// Hold dispatch until `resume`. In-flight messages go back to the head
    /// of their lane; one still awaiting its answer gets its attempt back.
    fn pause_dispatch(&mut self) {
        self.paused = true;
        self.resume_at = None;

        for lane in LANES {
            let lane_state = self.lane_mut(lane);
            if let Some(in_flight) = lane_state.in_flight.take() {
                let mut entry = in_flight.entry;
                if in_flight.phase == Phase::AwaitingResponse {
                    entry.message.attempts = entry.message.attempts.saturating_sub(1);
                }
                lane_state.queue.push_front(entry);
            }
        }
    }

    fn persist(&self, op: PersistOp) {
        match &self.persist_tx {
            Some(tx) => {
                if tx.send(op).is_err() {
                    warn!("Persistence writer gone, transaction message not mirrored");
                }
            }
            None => warn!("Message queue stopped, transaction message not mirrored"),
        }
    }
}

pub(crate) struct Shared {
    state: Mutex<QueueState>,
    notify: Notify,
    transport: Arc<dyn Transport>,
    repository: Arc<dyn TransactionMessageRepository>,
    persist_rx: Mutex<Option<mpsc::UnboundedReceiver<PersistOp>>>,
    version: OcppVersion,
}

// ── Public API ─────────────────────────────────────────────────

impl MessageQueue {
    pub fn new(
        config: MessageQueueConfig,
        version: OcppVersion,
        transport: Arc<dyn Transport>,
        repository: Arc<dyn TransactionMessageRepository>,
    ) -> Self {
        let (persist_tx, persist_rx) = mpsc::unbounded_channel();
        let state = QueueState {
            normal: LaneState::default(),
            transaction: LaneState::default(),
            config,
            registration_accepted: false,
            paused: false,
            resume_at: None,
            stopped: false,
            persist_tx: Some(persist_tx),
        };

        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                notify: Notify::new(),
                transport,
                repository,
                persist_rx: Mutex::new(Some(persist_rx)),
                version,
            }),
        }
    }

    /// Spawn the dispatcher (and persistence writer) until `shutdown` fires.
    pub fn start(self: &Arc<Self>, shutdown: ShutdownSignal) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move { queue.run(shutdown).await })
    }

    /// Dispatch loop. Wakes on enqueue, response, registration, pause/resume
    /// and on the earliest timeout or retry deadline.
    pub async fn run(&self, shutdown: ShutdownSignal) {
        let writer = self
            .shared
            .take_persist_rx()
            .map(|rx| tokio::spawn(persistence_writer(Arc::clone(&self.shared.repository), rx)));

        let shutdown_wait = shutdown.notified().wait();
        tokio::pin!(shutdown_wait);
        info!(version = %self.shared.version, "Message queue dispatcher started");

        loop {
            let next_deadline = self.shared.process(Instant::now());
            let sleep = async move {
                match next_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = &mut shutdown_wait => break,
                _ = self.shared.notify.notified() => {}
                _ = sleep => {}
            }
        }

        self.shared.stop();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                error!(error = %e, "Persistence writer task failed");
            }
        }
        info!("Message queue dispatcher stopped");
    }

    /// Queue a Call. See [`get_message_transmission_priority`] for gating.
    pub fn enqueue(&self, message_type: MessageType, payload: Value) -> PendingResponse {
        Shared::push(&self.shared, message_type, payload, false)
    }

    /// Queue a Call requested through TriggerMessage; bypasses registration gating.
    pub fn enqueue_triggered(&self, message_type: MessageType, payload: Value) -> PendingResponse {
        Shared::push(&self.shared, message_type, payload, true)
    }

    /// Typed request/response helper on top of [`enqueue`](Self::enqueue).
    pub async fn call<Req, Resp>(
        &self,
        message_type: MessageType,
        request: &Req,
    ) -> Result<Resp, MessageQueueError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload =
            serde_json::to_value(request).map_err(|e| MessageQueueError::Framing(e.to_string()))?;
        let response = self.enqueue(message_type, payload).await?;
        serde_json::from_value(response)
            .map_err(|e| MessageQueueError::InvalidResponse(e.to_string()))
    }

    /// Feed one inbound websocket text frame. Returns inbound Calls for
    /// routing; CallResults and CallErrors are correlated internally.
    pub fn receive(&self, raw: &str) -> Option<InboundCall> {
        let frame = match OcppFrame::parse(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Discarding malformed frame");
                return None;
            }
        };

        match frame {
            OcppFrame::Call {
                unique_id,
                action,
                payload,
            } => Some(InboundCall {
                unique_id,
                action,
                payload,
            }),
            OcppFrame::CallResult { unique_id, payload } => {
                self.shared.complete(&unique_id, Ok(payload));
                None
            }
            OcppFrame::CallError {
                unique_id,
                error_code,
                error_description,
                error_details,
            } => {
                self.shared.complete(
                    &unique_id,
                    Err(MessageQueueError::CallError {
                        code: error_code,
                        description: error_description,
                        details: error_details,
                    }),
                );
                None
            }
        }
    }

    /// Answer an inbound Call. Bypasses the queue.
    pub fn send_call_result(&self, unique_id: &str, payload: Value) -> Result<(), TransportError> {
        self.send_frame(OcppFrame::CallResult {
            unique_id: unique_id.to_string(),
            payload,
        })
    }

    pub fn send_call_error(
        &self,
        unique_id: &str,
        error_code: &str,
        error_description: &str,
    ) -> Result<(), TransportError> {
        self.send_frame(OcppFrame::error_response(
            unique_id,
            error_code,
            error_description,
        ))
    }

    /// Send an already-built answer frame.
    pub fn send_frame(&self, frame: OcppFrame) -> Result<(), TransportError> {
        match frame.serialize() {
            Ok(text) => self.shared.transport.send(&text),
            Err(e) => {
                error!(unique_id = frame.unique_id(), error = %e, "Failed to serialize response");
                Ok(())
            }
        }
    }

    pub fn set_registration_accepted(&self) {
        {
            let mut state = self.shared.lock();
            if state.registration_accepted {
                return;
            }
            state.registration_accepted = true;
        }
        info!("Registration accepted, releasing held messages");
        self.shared.notify.notify_one();
    }

    pub fn registration_accepted(&self) -> bool {
        self.shared.lock().registration_accepted
    }

    /// Stop dispatching. In-flight messages return to the head of their lane
    /// without consuming an attempt.
    pub fn pause(&self) {
        {
            let mut state = self.shared.lock();
            if state.paused && state.resume_at.is_none() {
                return;
            }
            state.pause_dispatch();
        }
        info!("Message queue paused");
        self.shared.notify.notify_one();
    }

    /// Re-arm dispatch after `delay`.
    pub fn resume(&self, delay: Duration) {
        {
            let mut state = self.shared.lock();
            if delay.is_zero() {
                state.paused = false;
                state.resume_at = None;
            } else {
                state.paused = true;
                state.resume_at = Some(Instant::now() + delay);
            }
        }
        info!(delay_ms = delay.as_millis() as u64, "Message queue resuming");
        self.shared.notify.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.shared.lock().paused
    }

    /// Load transaction messages left over from a previous run. They are
    /// queued ahead of anything enqueued since start and held until
    /// registration is accepted.
    pub async fn restore_persisted_messages(&self) -> StorageResult<usize> {
        let stored = self.shared.repository.get_all().await?;

        let restored = {
            let mut state = self.shared.lock();
            let known: HashSet<String> = state
                .transaction_messages()
                .map(|m| m.unique_id.clone())
                .collect();

            let fresh: Vec<ControlMessage> = stored
                .into_iter()
                .filter(|m| !known.contains(&m.unique_id))
                .collect();
            let count = fresh.len();
            for mut message in fresh.into_iter().rev() {
                message.is_transaction_related = true;
                message.stall_until_accepted = true;
                message.attempts = 0;
                state.transaction.queue.push_front(Entry {
                    message,
                    responder: None,
                });
            }
            count
        };

        if restored > 0 {
            info!(restored, "Restored persisted transaction messages");
            self.shared.notify.notify_one();
        }
        Ok(restored)
    }

    // ── Runtime tuning ─────────────────────────────────────

    pub fn update_transaction_message_attempts(&self, attempts: u32) {
        self.shared.lock().config.transaction_message_attempts = attempts;
    }

    pub fn update_transaction_message_retry_interval(&self, interval: Duration) {
        self.shared.lock().config.transaction_message_retry_interval = interval;
    }

    /// Applies to messages sent from now on.
    pub fn update_message_timeout(&self, timeout: Duration) {
        self.shared.lock().config.message_timeout = timeout;
    }

    pub fn set_queue_all_messages(&self, queue_all: bool) {
        self.shared.lock().config.queue_all_messages = queue_all;
    }

    pub fn config(&self) -> MessageQueueConfig {
        self.shared.lock().config.clone()
    }

    // ── Introspection ──────────────────────────────────────

    /// Queued plus in-flight messages across both lanes.
    pub fn len(&self) -> usize {
        let state = self.shared.lock();
        state.total_queued()
            + LANES
                .iter()
                .filter(|l| state.lane(**l).in_flight.is_some())
                .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_transaction_message_queue_empty(&self) -> bool {
        self.shared.lock().transaction_messages().next().is_none()
    }

    pub fn contains_transaction_messages(&self, transaction_id: &str) -> bool {
        self.shared
            .lock()
            .transaction_messages()
            .any(|m| m.transaction_id().as_deref() == Some(transaction_id))
    }

    pub fn contains_stop_transaction_message(&self, transaction_id: &str) -> bool {
        self.shared.lock().transaction_messages().any(|m| {
            m.is_stop_transaction_message()
                && m.transaction_id().as_deref() == Some(transaction_id)
        })
    }
}

// ── Dispatch internals ─────────────────────────────────────────

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_persist_rx(&self) -> Option<mpsc::UnboundedReceiver<PersistOp>> {
        self.persist_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    fn push(
        this: &Arc<Shared>,
        message_type: MessageType,
        payload: Value,
        triggered: bool,
    ) -> PendingResponse {
        let mut message = match ControlMessage::new(message_type, payload, this.version) {
            Ok(message) => message,
            Err(e) => {
                error!(action = %message_type, error = %e, "Failed to frame message");
                return PendingResponse::resolved(
                    String::new(),
                    Err(MessageQueueError::Framing(e.to_string())),
                );
            }
        };
        let unique_id = message.unique_id.clone();

        let mut state = this.lock();
        if state.stopped {
            return PendingResponse::resolved(unique_id, Err(MessageQueueError::Stopped));
        }

        let priority = get_message_transmission_priority(
            message_type.is_boot_notification(),
            triggered,
            state.registration_accepted,
            message.is_transaction_related,
            state.config.queue_all_messages,
        );
        match priority {
            MessageTransmissionPriority::Discard => {
                debug!(
                    unique_id = %unique_id,
                    action = %message_type,
                    "Discarding message before registration"
                );
                metrics::counter!("ocpp_queue_dropped_total", "reason" => "discarded").increment(1);
                return PendingResponse::resolved(
                    unique_id,
                    Err(MessageQueueError::Discarded(message_type)),
                );
            }
            MessageTransmissionPriority::SendAfterRegistrationAccepted => {
                message.stall_until_accepted = true;
            }
            MessageTransmissionPriority::SendImmediately => {}
        }

        Self::enforce_size_threshold(&mut state);

        let (tx, rx) = oneshot::channel();
        let lane = if message.is_transaction_related {
            state.persist(PersistOp::Insert(message.clone()));
            Lane::Transaction
        } else {
            Lane::Normal
        };
        debug!(
            unique_id = %unique_id,
            action = %message_type,
            ?lane,
            ?priority,
            "Message enqueued"
        );
        state.lane_mut(lane).queue.push_back(Entry {
            message,
            responder: Some(tx),
        });
        drop(state);

        this.notify.notify_one();
        PendingResponse::new(unique_id, rx, Arc::downgrade(this))
    }

    /// Drop the oldest queued transaction update messages until there is
    /// room for one more message.
    fn enforce_size_threshold(state: &mut QueueState) {
        let threshold = state.config.queues_total_size_threshold;
        let queued = state.total_queued();
        if threshold == 0 || queued < threshold {
            return;
        }

        let mut excess = queued + 1 - threshold;
        let mut kept = VecDeque::with_capacity(state.transaction.queue.len());
        let mut dropped = Vec::new();
        for entry in state.transaction.queue.drain(..) {
            if excess > 0 && entry.message.is_transaction_update_message() {
                excess -= 1;
                dropped.push(entry);
            } else {
                kept.push_back(entry);
            }
        }
        state.transaction.queue = kept;

        if !dropped.is_empty() {
            warn!(
                dropped = dropped.len(),
                threshold, "Queue above size threshold, dropping transaction update messages"
            );
            metrics::counter!("ocpp_queue_dropped_total", "reason" => "threshold")
                .increment(dropped.len() as u64);
        }
        for entry in dropped {
            Self::resolve(state, entry, Err(MessageQueueError::Dropped));
        }
    }

    /// One pass over both lanes. Returns the earliest pending deadline.
    fn process(&self, now: Instant) -> Option<Instant> {
        let mut state = self.lock();
        if state.stopped {
            return None;
        }

        if state.paused {
            match state.resume_at {
                Some(at) if at > now => return Some(at),
                Some(_) => {
                    state.paused = false;
                    state.resume_at = None;
                    info!("Message queue resumed");
                }
                None => return None,
            }
        }

        let mut next: Option<Instant> = None;
        for lane in LANES {
            let deadline = self.process_lane(&mut state, lane, now);
            // A send failure paused dispatch; nothing runs until resume.
            if state.paused {
                return None;
            }
            if let Some(deadline) = deadline {
                next = Some(next.map_or(deadline, |n| n.min(deadline)));
            }
        }
        next
    }

    fn process_lane(&self, state: &mut QueueState, lane: Lane, now: Instant) -> Option<Instant> {
        loop {
            if state.paused {
                return None;
            }
            match state.lane_mut(lane).in_flight.take() {
                Some(in_flight) if in_flight.deadline > now => {
                    let deadline = in_flight.deadline;
                    state.lane_mut(lane).in_flight = Some(in_flight);
                    return Some(deadline);
                }
                Some(in_flight) => match in_flight.phase {
                    Phase::AwaitingResponse => {
                        warn!(
                            unique_id = %in_flight.entry.message.unique_id,
                            action = %in_flight.entry.message.message_type,
                            attempt = in_flight.entry.message.attempts,
                            "Response timeout"
                        );
                        self.handle_timeout(state, lane, in_flight.entry, now);
                    }
                    Phase::RetryPending => self.transmit(state, lane, in_flight.entry, now),
                },
                None => {
                    let accepted = state.registration_accepted;
                    let lane_state = state.lane_mut(lane);
                    let position = lane_state
                        .queue
                        .iter()
                        .position(|e| accepted || !e.message.stall_until_accepted)?;
                    let entry = lane_state.queue.remove(position)?;
                    self.transmit(state, lane, entry, now);
                }
            }
        }
    }

    fn transmit(&self, state: &mut QueueState, lane: Lane, mut entry: Entry, now: Instant) {
        entry.message.attempts += 1;

        match self.transport.send(&entry.message.message) {
            Ok(()) => {
                debug!(
                    unique_id = %entry.message.unique_id,
                    action = %entry.message.message_type,
                    attempt = entry.message.attempts,
                    "Message sent"
                );
                metrics::counter!(
                    "ocpp_queue_sent_total",
                    "action" => entry.message.message_type.as_str()
                )
                .increment(1);
                let deadline = now + state.config.message_timeout;
                state.lane_mut(lane).in_flight = Some(InFlight {
                    entry,
                    phase: Phase::AwaitingResponse,
                    deadline,
                    sent_at: now,
                });
            }
            Err(e) => Self::handle_send_failure(state, lane, entry, e),
        }
    }

    /// The transport refused the frame, so the connection is gone. Held
    /// messages keep their attempt budget and wait for `resume`; anything
    /// else is dropped.
    fn handle_send_failure(
        state: &mut QueueState,
        lane: Lane,
        mut entry: Entry,
        error: TransportError,
    ) {
        let held = entry.message.is_transaction_related || state.config.queue_all_messages;
        if !held {
            warn!(
                unique_id = %entry.message.unique_id,
                action = %entry.message.message_type,
                error = %error,
                "Failed to send message, dropping it"
            );
            metrics::counter!("ocpp_queue_dropped_total", "reason" => "send_failed").increment(1);
            let failure = MessageQueueError::SendFailed {
                attempts: entry.message.attempts,
                reason: error.to_string(),
            };
            Self::resolve(state, entry, Err(failure));
            return;
        }

        entry.message.attempts = entry.message.attempts.saturating_sub(1);
        warn!(
            unique_id = %entry.message.unique_id,
            action = %entry.message.message_type,
            error = %error,
            "Failed to send message, holding it until the connection is back"
        );
        state.lane_mut(lane).queue.push_front(entry);
        state.pause_dispatch();
        info!("Message queue paused");
    }

    fn handle_timeout(&self, state: &mut QueueState, lane: Lane, entry: Entry, now: Instant) {
        let attempts = entry.message.attempts;
        let max_attempts = state.config.max_attempts(entry.message.is_transaction_related);

        if attempts < max_attempts {
            let delay = state.config.retry_delay(attempts);
            info!(
                unique_id = %entry.message.unique_id,
                action = %entry.message.message_type,
                attempt = attempts,
                max_attempts,
                retry_in_s = delay.as_secs(),
                "Scheduling retransmission"
            );
            metrics::counter!(
                "ocpp_queue_retries_total",
                "action" => entry.message.message_type.as_str()
            )
            .increment(1);
            state.lane_mut(lane).in_flight = Some(InFlight {
                entry,
                phase: Phase::RetryPending,
                deadline: now + delay,
                sent_at: now,
            });
            return;
        }

        let error = MessageQueueError::Timeout { attempts };
        metrics::counter!(
            "ocpp_queue_timeouts_total",
            "action" => entry.message.message_type.as_str()
        )
        .increment(1);

        if entry.message.is_transaction_related {
            error!(
                unique_id = %entry.message.unique_id,
                action = %entry.message.message_type,
                attempts,
                error = %error,
                "Transaction message abandoned, potential data loss"
            );
        } else {
            warn!(
                unique_id = %entry.message.unique_id,
                action = %entry.message.message_type,
                error = %error,
                "Message abandoned"
            );
        }
        Self::resolve(state, entry, Err(error));
    }

    /// Match a CallResult/CallError to its message.
    fn complete(&self, unique_id: &str, result: Result<Value, MessageQueueError>) {
        let mut state = self.lock();

        let in_flight_lane = LANES.into_iter().find(|lane| {
            state
                .lane(*lane)
                .in_flight
                .as_ref()
                .is_some_and(|f| f.entry.message.unique_id == unique_id)
        });

        let entry = match in_flight_lane {
            Some(lane) => state.lane_mut(lane).in_flight.take().map(|in_flight| {
                let elapsed = in_flight.sent_at.elapsed().as_secs_f64();
                metrics::histogram!(
                    "ocpp_call_duration_seconds",
                    "action" => in_flight.entry.message.message_type.as_str()
                )
                .record(elapsed);
                in_flight.entry
            }),
            // A late answer to a message that went back to its lane on pause.
            None => LANES.into_iter().find_map(|lane| {
                let queue = &mut state.lane_mut(lane).queue;
                let position = queue.iter().position(|e| e.message.unique_id == unique_id)?;
                queue.remove(position)
            }),
        };

        let Some(entry) = entry else {
            warn!(unique_id, "Response for unknown or already resolved message, discarding");
            return;
        };

        match &result {
            Ok(_) => debug!(unique_id, action = %entry.message.message_type, "Response received"),
            Err(e) => warn!(
                unique_id,
                action = %entry.message.message_type,
                error = %e,
                "CallError received"
            ),
        }
        Self::resolve(&state, entry, result);
        drop(state);
        self.notify.notify_one();
    }

    /// Terminal transition: un-mirror and answer the caller.
    fn resolve(state: &QueueState, entry: Entry, result: Result<Value, MessageQueueError>) {
        if entry.message.is_transaction_related {
            state.persist(PersistOp::Remove(entry.message.unique_id.clone()));
        }
        if let Some(responder) = entry.responder {
            let _ = responder.send(result);
        }
    }

    /// Called when a [`PendingResponse`] is dropped unresolved.
    pub(crate) fn cancel(&self, unique_id: &str) {
        let mut state = self.lock();

        for lane in LANES {
            let lane_state = state.lane_mut(lane);
            if let Some(position) = lane_state
                .queue
                .iter()
                .position(|e| e.message.unique_id == unique_id)
            {
                if let Some(entry) = lane_state.queue.remove(position) {
                    debug!(
                        unique_id,
                        action = %entry.message.message_type,
                        "Withdrawn before sending"
                    );
                    if entry.message.is_transaction_related {
                        state.persist(PersistOp::Remove(entry.message.unique_id));
                    }
                }
                return;
            }

            if let Some(in_flight) = lane_state.in_flight.as_mut() {
                if in_flight.entry.message.unique_id == unique_id {
                    in_flight.entry.responder = None;
                    return;
                }
            }
        }
    }

    fn stop(&self) {
        let mut state = self.lock();
        state.stopped = true;
        // Closing the channel lets the writer drain and exit.
        state.persist_tx = None;

        let mut outstanding = Vec::new();
        for lane in LANES {
            let lane_state = state.lane_mut(lane);
            outstanding.extend(lane_state.in_flight.take().map(|f| f.entry));
            outstanding.extend(lane_state.queue.drain(..));
        }
        if !outstanding.is_empty() {
            info!(outstanding = outstanding.len(), "Message queue stopping with pending messages");
        }
        // Stored transaction messages stay in the repository for the next run.
        for entry in outstanding {
            if let Some(responder) = entry.responder {
                let _ = responder.send(Err(MessageQueueError::Stopped));
            }
        }
    }
}

async fn persistence_writer(
    repository: Arc<dyn TransactionMessageRepository>,
    mut rx: mpsc::UnboundedReceiver<PersistOp>,
) {
    while let Some(op) = rx.recv().await {
        let (unique_id, result) = match &op {
            PersistOp::Insert(message) => (&message.unique_id, repository.insert(message).await),
            PersistOp::Remove(unique_id) => (unique_id, repository.remove(unique_id).await),
        };
        if let Err(e) = result {
            error!(
                unique_id = %unique_id,
                error = %e,
                "Failed to persist transaction message, in-memory queue stays authoritative"
            );
        }
    }
    debug!("Persistence writer stopped");
}
