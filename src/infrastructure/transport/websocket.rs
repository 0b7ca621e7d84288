//! WebSocket connection to the CSMS
//!
//! One task owns the socket. Outbound frames arrive through the
//! [`SwitchableTransport`] channel, inbound text frames go to the message
//! queue and, when they are Calls, to the [`CallRouter`]. Losing the
//! connection pauses the queue and marks smart charging offline until the
//! next successful connect.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::{SwitchableTransport, TransportError};
use crate::application::queue::SharedMessageQueue;
use crate::application::router::SharedCallRouter;
use crate::application::smart_charging::SharedSmartChargingHandler;
use crate::config::AppConfig;
use crate::domain::ocpp::OcppVersion;
use crate::support::retry::RetryConfig;
use crate::support::shutdown::ShutdownSignal;

type CsmsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Where and how to reach the CSMS.
#[derive(Debug, Clone, PartialEq)]
pub struct CsmsConnectionConfig {
    /// Base URL without the station id.
    pub url: String,
    pub station_id: String,
    pub version: OcppVersion,
    pub basic_auth_password: Option<String>,
    pub reconnect: RetryConfig,
    pub queue_resume_delay: Duration,
}

impl CsmsConnectionConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            url: config.csms.url.clone(),
            station_id: config.station.id.clone(),
            version: config.station.ocpp_version,
            basic_auth_password: config.csms.basic_auth_password.clone(),
            reconnect: config.csms.reconnect.clone(),
            queue_resume_delay: config.csms.queue_resume_delay,
        }
    }

    /// Full endpoint: base URL with the station id as last path segment.
    pub fn endpoint(&self) -> String {
        format!("{}/{}", self.url.trim_end_matches('/'), self.station_id)
    }

    /// `Authorization` header value for security profile 1.
    pub fn basic_auth_header(&self) -> Option<String> {
        self.basic_auth_password.as_ref().map(|password| {
            let credentials = format!("{}:{}", self.station_id, password);
            format!("Basic {}", BASE64.encode(credentials))
        })
    }

    fn request(&self) -> Result<Request, TransportError> {
        let endpoint = self.endpoint();
        let mut request = endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::InvalidEndpoint(format!("{endpoint}: {e}")))?;

        let headers = request.headers_mut();
        headers.insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(self.version.subprotocol()),
        );
        if let Some(auth) = self.basic_auth_header() {
            let value = HeaderValue::from_str(&auth)
                .map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;
            headers.insert("Authorization", value);
        }
        Ok(request)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    /// Reconnect attempts used up; the manager stopped.
    GaveUp,
}

/// Keeps the station connected to the CSMS.
pub struct ConnectivityManager {
    config: CsmsConnectionConfig,
    transport: Arc<SwitchableTransport>,
    queue: SharedMessageQueue,
    router: SharedCallRouter,
    smart_charging: Option<SharedSmartChargingHandler>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectivityManager {
    pub fn new(
        config: CsmsConnectionConfig,
        transport: Arc<SwitchableTransport>,
        queue: SharedMessageQueue,
        router: SharedCallRouter,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            config,
            transport,
            queue,
            router,
            smart_charging: None,
            events,
        }
    }

    /// Mark smart charging online and offline with the connection.
    pub fn with_smart_charging(mut self, handler: SharedSmartChargingHandler) -> Self {
        self.smart_charging = Some(handler);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_attached()
    }

    pub fn start(self: &Arc<Self>, shutdown: ShutdownSignal) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.run(shutdown).await })
    }

    /// Connect, serve the session and reconnect until shutdown or until
    /// the reconnect budget is used up.
    pub async fn run(&self, shutdown: ShutdownSignal) {
        self.queue.pause();
        let mut failures: u32 = 0;

        loop {
            if shutdown.is_triggered() {
                break;
            }

            match self.connect().await {
                Ok(ws) => {
                    failures = 0;
                    self.on_connected(ws, &shutdown).await;
                    if shutdown.is_triggered() {
                        break;
                    }
                    failures = 1;
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    metrics::counter!("ocpp_connection_failures_total").increment(1);
                    if self.config.reconnect.exhausted(failures) {
                        error!(error = %e, attempts = failures, "Giving up connecting to the CSMS");
                        let _ = self.events.send(ConnectionEvent::GaveUp);
                        break;
                    }
                    warn!(error = %e, attempt = failures, "Connecting to the CSMS failed");
                }
            }

            let delay = self.config.reconnect.jittered_delay_for_attempt(failures);
            debug!(retry_in_ms = delay.as_millis() as u64, "Reconnecting");
            tokio::select! {
                _ = shutdown.notified().wait() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!("Connectivity manager stopped");
    }

    async fn connect(&self) -> Result<CsmsStream, TransportError> {
        let request = self.config.request()?;
        info!(endpoint = self.config.endpoint().as_str(), "Connecting to CSMS");

        let (ws, response) = tokio_tungstenite::connect_async(request).await?;

        let requested = self.config.version.subprotocol();
        let accepted = response
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if accepted.as_deref() != Some(requested) {
            return Err(TransportError::SubprotocolRejected {
                requested,
                accepted,
            });
        }
        Ok(ws)
    }

    async fn on_connected(&self, ws: CsmsStream, shutdown: &ShutdownSignal) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.transport.attach(tx);
        if let Some(smart_charging) = &self.smart_charging {
            smart_charging.set_online(true);
        }
        self.queue.resume(self.config.queue_resume_delay);
        metrics::gauge!("ocpp_csms_connected").set(1.0);
        info!(station_id = self.config.station_id.as_str(), "🔌 Connected to CSMS");
        let _ = self.events.send(ConnectionEvent::Connected);

        self.serve(ws, rx, shutdown).await;

        self.queue.pause();
        self.transport.detach();
        if let Some(smart_charging) = &self.smart_charging {
            smart_charging.set_online(false);
        }
        metrics::gauge!("ocpp_csms_connected").set(0.0);
        info!(station_id = self.config.station_id.as_str(), "Disconnected from CSMS");
        let _ = self.events.send(ConnectionEvent::Disconnected);
    }

    /// Pump frames both ways until the socket closes or shutdown fires.
    async fn serve(
        &self,
        ws: CsmsStream,
        mut outbound: mpsc::UnboundedReceiver<String>,
        shutdown: &ShutdownSignal,
    ) {
        let (mut sink, mut stream) = ws.split();
        let shutdown_wait = shutdown.notified().wait();
        tokio::pin!(shutdown_wait);

        loop {
            tokio::select! {
                _ = &mut shutdown_wait => {
                    info!("Closing CSMS connection for shutdown");
                    if let Err(e) = sink.send(Message::Close(None)).await {
                        debug!(error = %e, "Close frame not sent");
                    }
                    break;
                }
                frame = outbound.recv() => {
                    let Some(frame) = frame else { break };
                    debug!(frame = frame.as_str(), "-> CSMS");
                    if let Err(e) = sink.send(Message::Text(frame)).await {
                        error!(error = %e, "Send to CSMS failed");
                        break;
                    }
                }
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        debug!(frame = text.as_str(), "<- CSMS");
                        if let Some(call) = self.queue.receive(&text) {
                            let router = self.router.clone();
                            let queue = self.queue.clone();
                            tokio::spawn(async move { router.route(&queue, call).await });
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!(?frame, "CSMS closed the connection");
                        break;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        warn!(bytes = data.len(), "Ignoring binary frame from CSMS");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(error = %e, "WebSocket error");
                        break;
                    }
                    None => break,
                },
            }
        }
    }
}
