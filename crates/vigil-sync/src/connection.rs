//! Feed connection lifecycle.
//!
//! [`ConnectionManager`] owns the single feed session and its state machine:
//! dialing, the connected read/write loop, exponential-backoff reconnects,
//! and intentional teardown. Interested parties observe it two ways:
//!
//! - a watch channel carrying the current [`ConnectionState`]
//! - a broadcast channel of [`ConnectionEvent`]s (frames, opens, closes)
//!
//! Sessions are generational. Every `connect` bumps an epoch; tasks spawned
//! for an older epoch compare before touching shared state and exit silently
//! when superseded, so a reconnect can never resurrect a stale session. All
//! state writes happen inside the same critical section that validates the
//! epoch and the intentional flag, which orders them against `disconnect`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use vigil_core::{AuthToken, ConnectionState, InboundFrame, OutboundFrame, parse_frame};

use crate::config::SyncConfig;
use crate::error::TransportError;
use crate::transport::{Transport, TransportEvent};

/// Read side of the shared credential slot.
///
/// The owner of the matching sender updates the credential; sessions read it
/// at dial time, so a retry always picks up the latest value.
pub type CredentialWatch = watch::Receiver<Option<AuthToken>>;

/// How a feed session authenticates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionMode {
    /// Present the stored credential as a `token` query parameter.
    Authenticated,
    /// Connect without a credential.
    Anonymous,
}

/// Events emitted by the connection manager.
#[derive(Clone, Debug)]
pub enum ConnectionEvent {
    /// A session reached the connected state.
    Open,
    /// An application frame arrived.
    Frame(InboundFrame),
    /// A session ended.
    Closed {
        /// True when the close came from [`ConnectionManager::disconnect`].
        intentional: bool,
        /// Close reason supplied by the peer, if any.
        reason: Option<String>,
    },
    /// A dial or live session failed.
    Error {
        /// Human-readable failure description.
        message: String,
    },
    /// Retries are exhausted; nothing further happens until `connect`.
    PermanentFailure,
}

/// Feed traffic counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Text payloads received, control frames included.
    pub frames_received: u64,
    /// Payloads dropped because they failed to parse.
    pub frames_dropped: u64,
}

/// Mutable per-session bookkeeping, guarded by one mutex.
#[derive(Default)]
struct SessionSlot {
    /// Monotonic session generation; stale tasks compare before mutating.
    epoch: u64,
    /// Mode requested by the most recent `connect`.
    mode: Option<SessionMode>,
    /// Consecutive failed attempts since the last successful session.
    attempt: u32,
    /// Set by `disconnect`; suppresses retries and stale-task side effects.
    intentional: bool,
    /// Outbound channel into the live session's write loop.
    outbound: Option<mpsc::Sender<String>>,
    /// Cancels the live session or the pending retry timer.
    cancel: Option<CancellationToken>,
}

struct Inner {
    config: SyncConfig,
    transport: Arc<dyn Transport>,
    credentials: CredentialWatch,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<ConnectionEvent>,
    session: Mutex<SessionSlot>,
    frames_received: AtomicU64,
    frames_dropped: AtomicU64,
}

/// Manages the feed connection.
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a manager; no connection is attempted until [`Self::connect`].
    #[must_use]
    pub fn new(
        config: SyncConfig,
        transport: Arc<dyn Transport>,
        credentials: CredentialWatch,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(config.event_capacity);
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                credentials,
                state_tx: watch::Sender::new(ConnectionState::Disconnected),
                events_tx,
                session: Mutex::new(SessionSlot::default()),
                frames_received: AtomicU64::new(0),
                frames_dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Start a session in the given mode.
    ///
    /// A no-op while a session is already connecting or connected. Otherwise
    /// any pending retry is cancelled, the attempt counter resets, and a
    /// fresh attempt starts. In [`SessionMode::Authenticated`] with no stored
    /// credential the manager moves to [`ConnectionState::Error`] and emits
    /// [`ConnectionEvent::Error`] before this call returns; no dial and no
    /// retry happen.
    pub fn connect(&self, mode: SessionMode) {
        let state = self.state();
        if matches!(
            state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            debug!(state = %state, "connect ignored, session already active");
            return;
        }
        let epoch = {
            let mut slot = self.inner.session.lock();
            slot.intentional = false;
            slot.mode = Some(mode);
            slot.attempt = 0;
            slot.outbound = None;
            if let Some(cancel) = slot.cancel.take() {
                cancel.cancel();
            }
            slot.epoch += 1;
            slot.epoch
        };
        start_attempt(&self.inner, epoch, mode);
    }

    /// Tear the session down and stop reconnecting.
    ///
    /// Cancels any pending retry, resets the attempt counter, and moves to
    /// [`ConnectionState::Disconnected`] before returning. Safe to call at
    /// any time, including while already disconnected.
    pub fn disconnect(&self) {
        let mut slot = self.inner.session.lock();
        slot.intentional = true;
        slot.mode = None;
        slot.attempt = 0;
        slot.outbound = None;
        if let Some(cancel) = slot.cancel.take() {
            cancel.cancel();
        }
        // The live session task, if any, emits the close event on its way
        // out; a pending retry dies silently. Writing the state under the
        // slot lock keeps a concurrent attempt from overwriting it.
        self.inner.set_state(ConnectionState::Disconnected);
    }

    /// Send a frame over the live session.
    ///
    /// Returns `false` and logs when no session is connected or the outbound
    /// channel is unavailable; the frame is dropped in both cases.
    pub fn send(&self, frame: &OutboundFrame) -> bool {
        if self.state() != ConnectionState::Connected {
            warn!(frame = ?frame, "dropping outbound frame, feed not connected");
            return false;
        }
        let text = match serde_json::to_string(frame) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "failed to serialize outbound frame");
                return false;
            }
        };
        let sender = self.inner.session.lock().outbound.clone();
        match sender {
            Some(tx) if tx.try_send(text).is_ok() => true,
            _ => {
                warn!(frame = ?frame, "dropping outbound frame, channel unavailable");
                false
            }
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Watch channel tracking state transitions.
    #[must_use]
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Subscribe to connection events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Mode requested by the most recent `connect`, until `disconnect`.
    #[must_use]
    pub fn session_mode(&self) -> Option<SessionMode> {
        self.inner.session.lock().mode
    }

    /// Traffic counters for the life of the manager.
    #[must_use]
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            frames_received: self.inner.frames_received.load(Ordering::Relaxed),
            frames_dropped: self.inner.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send_replace(state);
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Handle one inbound text payload. Returns a reply to send, if any.
    fn handle_text(&self, raw: &str) -> Option<String> {
        let _ = self.frames_received.fetch_add(1, Ordering::Relaxed);
        match parse_frame(raw) {
            Ok(InboundFrame::Ping) => match serde_json::to_string(&OutboundFrame::Pong) {
                Ok(reply) => Some(reply),
                Err(e) => {
                    warn!(error = %e, "failed to serialize pong");
                    None
                }
            },
            Ok(InboundFrame::Connected) => {
                debug!("feed acknowledged connection");
                None
            }
            Ok(frame) => {
                self.emit(ConnectionEvent::Frame(frame));
                None
            }
            Err(e) => {
                let _ = self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "dropping inbound frame");
                None
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session tasks
// ─────────────────────────────────────────────────────────────────────────────

/// Begin one connection attempt for the given epoch.
///
/// Resolves the credential and feed URL, then spawns the session task. The
/// credential is read here, at fire time, so a retry scheduled minutes ago
/// still dials with whatever the slot holds now.
fn start_attempt(inner: &Arc<Inner>, epoch: u64, mode: SessionMode) {
    {
        let slot = inner.session.lock();
        if slot.epoch != epoch || slot.intentional {
            return;
        }
    }
    let token = match mode {
        SessionMode::Authenticated => match inner.credentials.borrow().clone() {
            Some(token) => Some(token),
            None => {
                warn!("authenticated session requested without a credential");
                fail_attempt(
                    inner,
                    epoch,
                    "authentication required but no credential is stored",
                );
                return;
            }
        },
        SessionMode::Anonymous => None,
    };
    let url = match feed_url(&inner.config, token.as_ref()) {
        Ok(url) => url,
        Err(e) => {
            warn!(error = %e, "cannot build feed URL");
            fail_attempt(inner, epoch, &e.to_string());
            return;
        }
    };
    let cancel = CancellationToken::new();
    {
        let mut slot = inner.session.lock();
        if slot.epoch != epoch || slot.intentional {
            return;
        }
        slot.cancel = Some(cancel.clone());
        inner.set_state(ConnectionState::Connecting);
    }
    let task_inner = Arc::clone(inner);
    drop(tokio::spawn(run_session(task_inner, epoch, url, cancel)));
}

/// Publish a synchronous attempt failure, unless superseded meanwhile.
fn fail_attempt(inner: &Inner, epoch: u64, message: &str) {
    {
        let slot = inner.session.lock();
        if slot.epoch != epoch || slot.intentional {
            return;
        }
        inner.set_state(ConnectionState::Error);
    }
    inner.emit(ConnectionEvent::Error {
        message: message.to_string(),
    });
}

/// Dial and drive one session until it ends.
///
/// The URL is skipped from the span because it may carry the auth token.
#[instrument(skip(inner, url, cancel))]
async fn run_session(inner: Arc<Inner>, epoch: u64, url: String, cancel: CancellationToken) {
    let dialed = tokio::select! {
        result = inner.transport.connect(&url) => result,
        () = cancel.cancelled() => {
            debug!("session cancelled during dial");
            return;
        }
    };
    let (mut writer, mut reader) = match dialed {
        Ok(halves) => halves,
        Err(e) => {
            warn!(error = %e, "feed connection failed");
            inner.emit(ConnectionEvent::Error {
                message: e.to_string(),
            });
            schedule_retry(&inner, epoch);
            return;
        }
    };

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(inner.config.outbound_capacity);
    // The guard must leave scope before the close await; the spawned future
    // has to stay `Send`.
    let stale = {
        let mut slot = inner.session.lock();
        if slot.epoch != epoch || slot.intentional {
            true
        } else {
            slot.outbound = Some(outbound_tx);
            slot.attempt = 0;
            inner.set_state(ConnectionState::Connected);
            false
        }
    };
    if stale {
        writer.close().await;
        return;
    }
    inner.emit(ConnectionEvent::Open);
    info!("feed connected");

    let mut close_reason: Option<String> = None;
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                writer.close().await;
                break;
            }
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(text) => {
                        if let Err(e) = writer.send_text(text).await {
                            warn!(error = %e, "feed write failed");
                            close_reason = Some(e.to_string());
                            break;
                        }
                    }
                    None => {
                        writer.close().await;
                        break;
                    }
                }
            }
            event = reader.next_event() => {
                match event {
                    Some(Ok(TransportEvent::Text(text))) => {
                        if let Some(reply) = inner.handle_text(&text) {
                            if let Err(e) = writer.send_text(reply).await {
                                warn!(error = %e, "feed write failed");
                                close_reason = Some(e.to_string());
                                break;
                            }
                        }
                    }
                    Some(Ok(TransportEvent::Closed(reason))) => {
                        close_reason = reason;
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "feed read failed");
                        close_reason = Some(e.to_string());
                        break;
                    }
                    None => break,
                }
            }
        }
    }
    finish_session(&inner, epoch, close_reason);
}

/// Record the end of a session and decide what happens next.
fn finish_session(inner: &Arc<Inner>, epoch: u64, reason: Option<String>) {
    let intentional = {
        let mut slot = inner.session.lock();
        if slot.epoch != epoch {
            // Superseded by a newer connect; that session owns the state now.
            return;
        }
        slot.outbound = None;
        if slot.intentional {
            inner.set_state(ConnectionState::Disconnected);
        }
        slot.intentional
    };
    if intentional {
        inner.emit(ConnectionEvent::Closed {
            intentional: true,
            reason,
        });
        info!("feed disconnected");
    } else {
        inner.emit(ConnectionEvent::Closed {
            intentional: false,
            reason,
        });
        schedule_retry(inner, epoch);
    }
}

/// Count a failed attempt and either arm the retry timer or give up.
fn schedule_retry(inner: &Arc<Inner>, epoch: u64) {
    let policy = &inner.config.backoff;
    let cancel = CancellationToken::new();
    let armed = {
        let mut slot = inner.session.lock();
        if slot.epoch != epoch || slot.intentional {
            return;
        }
        slot.attempt += 1;
        let Some(mode) = slot.mode else { return };
        if policy.is_exhausted(slot.attempt) {
            inner.set_state(ConnectionState::PermanentlyFailed);
            Err(slot.attempt)
        } else {
            slot.cancel = Some(cancel.clone());
            inner.set_state(ConnectionState::Reconnecting);
            Ok((slot.attempt, mode))
        }
    };
    let (attempt, mode) = match armed {
        Ok(pair) => pair,
        Err(attempt) => {
            warn!(attempt, "reconnect attempts exhausted, giving up");
            inner.emit(ConnectionEvent::PermanentFailure);
            return;
        }
    };
    let delay = policy.delay_for(attempt);
    info!(attempt, ?delay, "reconnecting after delay");
    let task_inner = Arc::clone(inner);
    drop(tokio::spawn(async move {
        tokio::select! {
            () = tokio::time::sleep(delay) => start_attempt(&task_inner, epoch, mode),
            () = cancel.cancelled() => debug!("pending reconnect cancelled"),
        }
    }));
}

/// Build the feed URL from the configured base URL and optional credential.
///
/// `http`/`ws` bases become `ws`, `https`/`wss` become `wss`; anything else
/// is rejected.
fn feed_url(config: &SyncConfig, token: Option<&AuthToken>) -> Result<String, TransportError> {
    let mut url = reqwest::Url::parse(&config.base_url)
        .map_err(|e| TransportError::Connect(format!("invalid base URL: {e}")))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(TransportError::Connect(format!(
                "unsupported base URL scheme: {other}"
            )));
        }
    };
    if url.set_scheme(scheme).is_err() {
        return Err(TransportError::Connect(
            "base URL does not accept a websocket scheme".into(),
        ));
    }
    url.set_path(&config.feed_path);
    if let Some(token) = token {
        let _ = url.query_pairs_mut().append_pair("token", token.as_str());
    }
    Ok(url.to_string())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
