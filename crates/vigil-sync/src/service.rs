//! Service lifecycle and wiring.
//!
//! [`SyncService`] assembles the sync layer: the connection manager, the
//! inventory synchronizer, both metric caches, and the frame router, plus
//! the background tasks that pump events between them. Embedders construct
//! one service per credential scope and call [`SyncService::init`] once.
//!
//! Credential changes are observed continuously. A change that keeps the
//! session mode while the feed is healthy does nothing (pending retries
//! already re-read the credential); anything else tears the session and
//! caches down and reconnects in the implied mode.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vigil_core::{
    AuthToken, CheckResult, ConnectionState, EntityKey, FrameKind, InboundFrame, MetricPoint,
    ServerId,
};

use crate::cache::MetricCache;
use crate::config::SyncConfig;
use crate::connection::{ConnectionEvent, ConnectionManager, CredentialWatch, SessionMode};
use crate::history::HistoryFetcher;
use crate::inventory::InventorySync;
use crate::router::{FrameHandler, FrameRouter};
use crate::transport::Transport;

/// Cache of service-monitor results, keyed by server and by monitor.
pub type ServiceCheckCache = MetricCache<EntityKey, CheckResult>;
/// Cache of performance gauge readings, keyed by server.
pub type PerformanceCache = MetricCache<ServerId, MetricPoint>;

/// Session mode implied by the stored credential.
#[must_use]
pub fn mode_for(token: Option<&AuthToken>) -> SessionMode {
    match token {
        Some(_) => SessionMode::Authenticated,
        None => SessionMode::Anonymous,
    }
}

struct ServiceInner {
    connection: Arc<ConnectionManager>,
    inventory: Arc<InventorySync>,
    checks: Arc<ServiceCheckCache>,
    performance: Arc<PerformanceCache>,
    router: Arc<FrameRouter>,
    credentials: CredentialWatch,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

/// The assembled realtime sync layer.
pub struct SyncService {
    inner: Arc<ServiceInner>,
}

impl SyncService {
    /// Wire up the sync layer. Nothing runs until [`Self::init`].
    pub fn new(
        config: SyncConfig,
        transport: Arc<dyn Transport>,
        credentials: CredentialWatch,
        check_history: Arc<dyn HistoryFetcher<EntityKey, CheckResult>>,
        metric_history: Arc<dyn HistoryFetcher<ServerId, MetricPoint>>,
    ) -> Self {
        let connection = Arc::new(ConnectionManager::new(
            config.clone(),
            transport,
            credentials.clone(),
        ));
        let inventory = Arc::new(InventorySync::new());
        let checks = Arc::new(ServiceCheckCache::new(
            "checks",
            config.check_window_ms,
            config.subscriber_capacity,
            check_history,
        ));
        let performance = Arc::new(PerformanceCache::new(
            "performance",
            config.metric_window_ms,
            config.subscriber_capacity,
            metric_history,
        ));

        let router = Arc::new(FrameRouter::new());
        router.register(
            FrameKind::Inventory,
            Arc::new(InventoryHandler {
                inventory: Arc::clone(&inventory),
            }),
        );
        router.register(
            FrameKind::Check,
            Arc::new(CheckHandler {
                checks: Arc::clone(&checks),
            }),
        );
        router.register(
            FrameKind::MetricBatch,
            Arc::new(MetricBatchHandler {
                performance: Arc::clone(&performance),
            }),
        );

        Self {
            inner: Arc::new(ServiceInner {
                connection,
                inventory,
                checks,
                performance,
                router,
                credentials,
                started: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Start the background pumps and the first connection.
    ///
    /// Idempotent: only the first call does anything. The session mode
    /// follows the stored credential. A service that has been shut down
    /// stays down; build a new one to reconnect.
    pub fn init(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            debug!("sync service already initialized");
            return;
        }
        info!("initializing sync service");
        {
            let mut tasks = self.inner.tasks.lock();
            tasks.push(tokio::spawn(pump_events(Arc::clone(&self.inner))));
            tasks.push(tokio::spawn(mirror_state(Arc::clone(&self.inner))));
            tasks.push(tokio::spawn(watch_credentials(Arc::clone(&self.inner))));
        }
        let mode = mode_for(self.inner.credentials.borrow().as_ref());
        self.inner.connection.connect(mode);
    }

    /// Stop the pumps, disconnect, and wipe all published state.
    pub async fn shutdown(&self) {
        if !self.inner.started.load(Ordering::SeqCst) {
            return;
        }
        info!("shutting down sync service");
        self.inner.shutdown.cancel();
        self.inner.connection.disconnect();
        self.inner.checks.clear();
        self.inner.performance.clear();
        self.inner.inventory.reset();
        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
    }

    /// The inventory synchronizer.
    #[must_use]
    pub fn inventory(&self) -> &Arc<InventorySync> {
        &self.inner.inventory
    }

    /// The service-check cache.
    #[must_use]
    pub fn checks(&self) -> &Arc<ServiceCheckCache> {
        &self.inner.checks
    }

    /// The performance metric cache.
    #[must_use]
    pub fn performance(&self) -> &Arc<PerformanceCache> {
        &self.inner.performance
    }

    /// The connection manager.
    #[must_use]
    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.inner.connection
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Background tasks
// ─────────────────────────────────────────────────────────────────────────────

/// Route connection events into the router, inventory, and caches.
async fn pump_events(inner: Arc<ServiceInner>) {
    let mut events = inner.connection.events();
    loop {
        tokio::select! {
            () = inner.shutdown.cancelled() => break,
            event = events.recv() => match event {
                Ok(event) => handle_event(&inner, event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event pump lagged, events skipped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

async fn handle_event(inner: &ServiceInner, event: ConnectionEvent) {
    match event {
        ConnectionEvent::Frame(frame) => inner.router.dispatch(frame).await,
        ConnectionEvent::Error { message } => inner.inventory.set_error(message),
        ConnectionEvent::PermanentFailure => inner
            .inventory
            .set_error("realtime feed unavailable after repeated attempts".into()),
        ConnectionEvent::Open => debug!("feed session opened"),
        ConnectionEvent::Closed {
            intentional,
            reason,
        } => {
            debug!(intentional, reason = reason.as_deref().unwrap_or(""), "feed session closed");
        }
    }
}

/// Mirror connection state transitions into the inventory view.
async fn mirror_state(inner: Arc<ServiceInner>) {
    let mut state = inner.connection.state_watch();
    inner.inventory.set_connection(*state.borrow_and_update());
    loop {
        tokio::select! {
            () = inner.shutdown.cancelled() => break,
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                inner.inventory.set_connection(current);
            }
        }
    }
}

/// React to credential changes for the life of the service.
async fn watch_credentials(inner: Arc<ServiceInner>) {
    let mut credentials = inner.credentials.clone();
    // The startup value was already consumed by init.
    let _ = credentials.borrow_and_update();
    loop {
        tokio::select! {
            () = inner.shutdown.cancelled() => break,
            changed = credentials.changed() => {
                if changed.is_err() {
                    break;
                }
                let mode = mode_for(credentials.borrow_and_update().as_ref());
                apply_credential_change(&inner, mode);
            }
        }
    }
}

fn apply_credential_change(inner: &ServiceInner, mode: SessionMode) {
    let healthy = inner.connection.state().is_healthy();
    if inner.connection.session_mode() == Some(mode) && healthy {
        // Same mode on a healthy feed: keep the session; any pending retry
        // reads the new credential when it fires.
        debug!(?mode, "credential change keeps session mode");
        return;
    }
    info!(?mode, "credential change, rebuilding feed session");
    inner.connection.disconnect();
    inner.checks.clear();
    inner.performance.clear();
    inner.inventory.reset();
    inner.connection.connect(mode);
}

// ─────────────────────────────────────────────────────────────────────────────
// Frame handlers
// ─────────────────────────────────────────────────────────────────────────────

struct InventoryHandler {
    inventory: Arc<InventorySync>,
}

#[async_trait]
impl FrameHandler for InventoryHandler {
    async fn handle(&self, frame: InboundFrame) {
        if let InboundFrame::Inventory(records) = frame {
            self.inventory.on_snapshot(records);
        }
    }
}

struct CheckHandler {
    checks: Arc<ServiceCheckCache>,
}

#[async_trait]
impl FrameHandler for CheckHandler {
    async fn handle(&self, frame: InboundFrame) {
        if let InboundFrame::Check(check) = frame {
            // The same result is visible under the monitor key and the
            // owning server key.
            self.checks.on_live_sample(
                EntityKey::Monitor(check.monitor_id.clone()),
                check.clone(),
            );
            self.checks
                .on_live_sample(EntityKey::Server(check.server_id.clone()), check);
        }
    }
}

struct MetricBatchHandler {
    performance: Arc<PerformanceCache>,
}

#[async_trait]
impl FrameHandler for MetricBatchHandler {
    async fn handle(&self, frame: InboundFrame) {
        if let InboundFrame::MetricBatch(points) = frame {
            let mut grouped: HashMap<ServerId, Vec<MetricPoint>> = HashMap::new();
            for point in points {
                grouped
                    .entry(point.server_id.clone())
                    .or_default()
                    .push(point);
            }
            for (server, batch) in grouped {
                self.performance.on_live_batch(server, batch);
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
