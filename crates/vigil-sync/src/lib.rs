//! # vigil-sync
//!
//! The realtime synchronization layer of the Vigil dashboard client.
//!
//! One live feed connection per session, demultiplexed into low-churn views
//! that many independent consumers subscribe to:
//!
//! - **Connection manager**: connect/retry/backoff/failure state machine over
//!   a pluggable transport (tokio-tungstenite in production)
//! - **Frame router**: typed dispatch of application frames to registered
//!   handlers; control frames never leave the connection layer
//! - **Inventory synchronizer**: reference-stable snapshot merging published
//!   through `tokio::sync::watch`
//! - **Windowed metric caches**: per-entity sliding windows with pub/sub
//!   fan-out and coalesced initial-window fetches
//! - **`SyncService`**: owns all of the above, reacts to credential changes,
//!   tears down and rebuilds idempotently

#![deny(unsafe_code)]

pub mod cache;
pub mod config;
pub mod connection;
pub mod error;
pub mod history;
pub mod inventory;
pub mod router;
pub mod service;
pub mod transport;

pub use cache::{MetricCache, MetricSubscription, Window};
pub use config::{SyncConfig, default_config_path, load_config, load_config_from_path};
pub use connection::{
    ConnectionEvent, ConnectionManager, ConnectionStats, CredentialWatch, SessionMode,
};
pub use error::{ConfigError, HistoryError, TransportError};
pub use history::{HistoryFetcher, RestHistory, TimeRange};
pub use inventory::InventorySync;
pub use router::{FrameHandler, FrameRouter};
pub use service::{PerformanceCache, ServiceCheckCache, SyncService, mode_for};
pub use transport::{Transport, TransportEvent, TransportReader, TransportWriter, WsTransport};
