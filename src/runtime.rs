//! Station runtime
//!
//! [`StationHandle`] owns the whole lifecycle: database and migrations,
//! message queue, smart charging, the CSMS connection, registration and
//! heartbeat, and graceful shutdown.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use sea_orm::DatabaseConnection;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::application::evse_registry::{EvseRegistry, SharedEvseRegistry};
use crate::application::queue::{MessageQueue, SharedMessageQueue};
use crate::application::router::CallRouter;
use crate::application::smart_charging::{
    register_smart_charging_handlers, SharedSmartChargingHandler, SmartChargingHandler,
};
use crate::application::station::Station;
use crate::config::AppConfig;
use crate::infrastructure::database::{
    connect_and_migrate, SeaOrmChargingProfileRepository, SeaOrmTransactionMessageRepository,
};
use crate::infrastructure::transport::{
    ConnectivityManager, CsmsConnectionConfig, SwitchableTransport,
};
use crate::support::errors::{AppError, StorageError};
use crate::support::retry::{retry_with_backoff, RetryConfig};
use crate::support::shutdown::{listen_for_shutdown_signals, ShutdownSignal};

/// Install the global tracing subscriber. `RUST_LOG` wins over `logging.level`.
pub fn init_tracing(config: &AppConfig) {
    let logging = &config.logging;
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if logging.format.eq_ignore_ascii_case("json") {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if result.is_err() {
        // A subscriber is already installed (tests, embedding).
        warn!("Tracing subscriber already initialized");
    }
}

/// Start the Prometheus scrape endpoint. Only the first call per process
/// installs the recorder.
pub fn install_metrics_exporter(listen: &str) -> Result<(), AppError> {
    static INSTALLED: OnceLock<SocketAddr> = OnceLock::new();
    if let Some(addr) = INSTALLED.get() {
        info!(%addr, "📊 Prometheus exporter already running");
        return Ok(());
    }

    let addr: SocketAddr = listen
        .parse()
        .map_err(|e| AppError::Metrics(format!("invalid listen address '{listen}': {e}")))?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| AppError::Metrics(e.to_string()))?;
    let _ = INSTALLED.set(addr);
    info!(%addr, "📊 Prometheus exporter listening");
    Ok(())
}

/// Handle to a running station.
pub struct StationHandle {
    pub config: AppConfig,
    pub queue: SharedMessageQueue,
    pub smart_charging: SharedSmartChargingHandler,
    pub evses: SharedEvseRegistry,
    pub connectivity: Arc<ConnectivityManager>,
    db: DatabaseConnection,
    shutdown: ShutdownSignal,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl StationHandle {
    /// Bring the station up.
    ///
    /// 1. Connect to the database (with retry) and migrate
    /// 2. Build the queue and restore undelivered transaction messages
    /// 3. Load installed charging profiles and register the Call handlers
    /// 4. Start the queue, the CSMS connection and registration/heartbeat
    pub async fn start(config: AppConfig) -> Result<Self, AppError> {
        info!(
            station_id = config.station.id.as_str(),
            version = %config.station.ocpp_version,
            "Starting charging station"
        );

        if let Some(listen) = &config.metrics.prometheus_listen {
            install_metrics_exporter(listen)?;
        }

        // ── Database ───────────────────────────────────────────
        let db = retry_with_backoff(
            &RetryConfig::default(),
            || connect_and_migrate(&config.database),
            |_| true,
            "database connect",
        )
        .await
        .map_err(StorageError::from)?;

        // ── Queue ──────────────────────────────────────────────
        let shutdown = ShutdownSignal::new();
        let transport = Arc::new(SwitchableTransport::new());
        let queue = Arc::new(MessageQueue::new(
            config.message_queue.clone(),
            config.station.ocpp_version,
            transport.clone(),
            Arc::new(SeaOrmTransactionMessageRepository::new(db.clone())),
        ));
        let restored = queue.restore_persisted_messages().await?;
        if restored > 0 {
            info!(restored, "Restored undelivered transaction messages");
        }

        // ── Smart charging ─────────────────────────────────────
        let evses = EvseRegistry::shared(config.station.number_of_evses);
        let smart_charging = Arc::new(SmartChargingHandler::new(
            config.smart_charging.clone(),
            evses.clone(),
            Arc::new(SeaOrmChargingProfileRepository::new(db.clone())),
        ));
        let profiles = smart_charging.load_profiles().await?;
        info!(profiles, "Charging profiles loaded");

        let mut router = CallRouter::new();
        register_smart_charging_handlers(&mut router, smart_charging.clone());
        let router = Arc::new(router);

        // ── Background tasks ───────────────────────────────────
        let mut tasks = vec![("message queue", queue.start(shutdown.clone()))];

        let connectivity = Arc::new(
            ConnectivityManager::new(
                CsmsConnectionConfig::from_app_config(&config),
                transport,
                queue.clone(),
                router,
            )
            .with_smart_charging(smart_charging.clone()),
        );
        tasks.push(("CSMS connection", connectivity.start(shutdown.clone())));

        let station = Arc::new(Station::new(
            config.station.clone(),
            queue.clone(),
            config.csms.reconnect.clone(),
        ));
        tasks.push(("registration", station.start(shutdown.clone())));

        info!("🚀 Station started");
        Ok(Self {
            config,
            queue,
            smart_charging,
            evses,
            connectivity,
            db,
            shutdown,
            tasks,
        })
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Trigger shutdown on SIGINT/SIGTERM.
    pub fn install_signal_handler(&self) {
        tokio::spawn(listen_for_shutdown_signals(self.shutdown.clone()));
    }

    pub fn start_transaction(
        &self,
        evse_id: i32,
        transaction_id: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> bool {
        self.evses.start_transaction(evse_id, transaction_id, started_at)
    }

    /// End the EVSE's transaction and drop the TxProfiles bound to it.
    pub async fn end_transaction(&self, evse_id: i32) {
        if let Some(ended) = self.evses.end_transaction(evse_id) {
            self.smart_charging
                .delete_transaction_tx_profiles(&ended.transaction_id)
                .await;
        }
    }

    pub fn trigger_shutdown(&self) {
        self.shutdown.trigger();
    }

    /// Wait until every task stopped, then close the database.
    pub async fn wait(self) {
        info!("⏳ Waiting for station tasks to complete...");
        for (name, task) in self.tasks {
            match task.await {
                Ok(()) => info!(task = name, "Task stopped"),
                Err(e) => error!(task = name, error = %e, "Task panicked"),
            }
        }

        if let Err(e) = self.db.close().await {
            warn!(error = %e, "Error closing database connection");
        } else {
            info!("✅ Database connection closed");
        }
        info!("👋 Station shutdown complete");
    }

    pub async fn shutdown(self) {
        info!("🛑 Shutting down station...");
        self.trigger_shutdown();
        self.wait().await;
    }
}
