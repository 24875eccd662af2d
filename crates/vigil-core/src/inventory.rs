//! Server inventory records and the published view.
//!
//! The backend pushes complete inventory snapshots; the synchronizer merges
//! them and publishes an [`InventoryView`]. Records are held behind `Arc` so
//! unchanged records keep their identity across snapshots and consumers can
//! memoize by pointer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::ids::ServerId;
use crate::metrics::MetricPoint;
use crate::state::ConnectionState;

/// Reported health of a monitored server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    /// Agent reporting, all monitors passing.
    Online,
    /// Agent reporting, at least one monitor failing.
    Degraded,
    /// Agent not reporting.
    Offline,
    /// Status string the client does not know; kept for protocol evolution.
    #[serde(other)]
    Unknown,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Online => "online",
            Self::Degraded => "degraded",
            Self::Offline => "offline",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// One server in an inventory snapshot.
///
/// Deep equality (`PartialEq`) is what the merge uses to decide whether a
/// record changed between snapshots.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    /// Stable identity across snapshots.
    pub id: ServerId,
    /// Display name.
    pub name: String,
    /// Reported health.
    pub status: ServerStatus,
    /// Seconds since the agent last started, when reporting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,
    /// Most recent gauge reading the backend had when snapshotting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest: Option<MetricPoint>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Published view
// ─────────────────────────────────────────────────────────────────────────────

/// Inventory plus feed status, as published to consumers.
///
/// Cheap to clone: the server sequence is shared, and within it unchanged
/// records are the same `Arc` across snapshots.
#[derive(Clone, Debug)]
pub struct InventoryView {
    /// Merged server sequence, backend order preserved.
    pub servers: Arc<[Arc<ServerRecord>]>,
    /// Connection state at publish time.
    pub connection: ConnectionState,
    /// Human-readable feed error, if any.
    pub error: Option<String>,
    /// True until the first snapshot after a (re)connect arrives.
    pub is_loading: bool,
}

impl InventoryView {
    /// Look up a server by id.
    #[must_use]
    pub fn server(&self, id: &ServerId) -> Option<&Arc<ServerRecord>> {
        self.servers.iter().find(|record| &record.id == id)
    }
}

impl Default for InventoryView {
    fn default() -> Self {
        Self {
            servers: Arc::from([]),
            connection: ConnectionState::Disconnected,
            error: None,
            is_loading: true,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
