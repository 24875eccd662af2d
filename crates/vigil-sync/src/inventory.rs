//! Inventory synchronization.
//!
//! [`InventorySync`] merges complete snapshots from the feed into the
//! published [`InventoryView`]. The merge preserves record identity: a
//! server whose fields did not change keeps its `Arc` from the previous
//! view, so consumers can skip work by pointer comparison. A snapshot that
//! changes nothing at all is not republished, except for the first one
//! after a (re)connect, which still has to flip the loading flag.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use vigil_core::{ConnectionState, InventoryView, ServerRecord};

/// Merges inventory snapshots and publishes the result.
pub struct InventorySync {
    view_tx: watch::Sender<InventoryView>,
}

impl InventorySync {
    /// Create a synchronizer publishing the default (loading) view.
    #[must_use]
    pub fn new() -> Self {
        Self {
            view_tx: watch::Sender::new(InventoryView::default()),
        }
    }

    /// Subscribe to view updates.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<InventoryView> {
        self.view_tx.subscribe()
    }

    /// Snapshot of the current view.
    #[must_use]
    pub fn view(&self) -> InventoryView {
        self.view_tx.borrow().clone()
    }

    /// Merge a complete inventory snapshot into the view.
    ///
    /// Records deep-equal to their predecessor keep the previous `Arc`;
    /// changed and new records get fresh ones; servers absent from the
    /// snapshot are dropped. Publishing marks the feed live: loading ends,
    /// any error clears, and the connection shows connected. If the merged
    /// sequence is identical to the published one and those flags are
    /// already settled, nothing is published.
    pub fn on_snapshot(&self, records: Vec<ServerRecord>) {
        let total = records.len();
        let mut reused = 0_usize;
        let changed = self.view_tx.send_if_modified(|view| {
            let prev = Arc::clone(&view.servers);
            let prev_by_id: HashMap<&str, &Arc<ServerRecord>> =
                prev.iter().map(|record| (record.id.as_str(), record)).collect();
            let merged: Vec<Arc<ServerRecord>> = records
                .into_iter()
                .map(|record| match prev_by_id.get(record.id.as_str()) {
                    Some(previous) if previous.as_ref() == &record => {
                        reused += 1;
                        Arc::clone(previous)
                    }
                    _ => Arc::new(record),
                })
                .collect();

            let same_sequence = merged.len() == prev.len()
                && merged.iter().zip(prev.iter()).all(|(a, b)| Arc::ptr_eq(a, b));
            let flags_settled = !view.is_loading
                && view.error.is_none()
                && view.connection == ConnectionState::Connected;
            if same_sequence && flags_settled {
                return false;
            }
            if !same_sequence {
                view.servers = Arc::from(merged);
            }
            view.is_loading = false;
            view.error = None;
            view.connection = ConnectionState::Connected;
            true
        });
        if changed {
            debug!(total, reused, "inventory snapshot merged");
        }
    }

    /// Reflect a connection state change in the view.
    ///
    /// Leaving the connected state puts the view back into loading, so the
    /// first snapshot after the next connect republishes even when nothing
    /// else changed. Terminal states end loading instead; a fresh connect
    /// clears any stale error.
    pub fn set_connection(&self, state: ConnectionState) {
        let changed = self.view_tx.send_if_modified(|view| {
            if view.connection == state {
                return false;
            }
            view.connection = state;
            match state {
                ConnectionState::Disconnected
                | ConnectionState::Connecting
                | ConnectionState::Reconnecting => {
                    view.is_loading = true;
                    if state == ConnectionState::Connecting {
                        view.error = None;
                    }
                }
                ConnectionState::Error | ConnectionState::PermanentlyFailed => {
                    view.is_loading = false;
                }
                ConnectionState::Connected => {}
            }
            true
        });
        if changed {
            debug!(state = %state, "inventory connection updated");
        }
    }

    /// Publish a feed error.
    pub fn set_error(&self, message: String) {
        let _ = self.view_tx.send_if_modified(|view| {
            if view.error.as_deref() == Some(message.as_str()) && !view.is_loading {
                return false;
            }
            view.error = Some(message);
            view.is_loading = false;
            true
        });
    }

    /// Return the view to its initial state.
    pub fn reset(&self) {
        let _ = self.view_tx.send_replace(InventoryView::default());
    }
}

impl Default for InventorySync {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::{ServerId, ServerStatus};

    fn record(id: &str, status: ServerStatus) -> ServerRecord {
        ServerRecord {
            id: ServerId::from(id),
            name: format!("host-{id}"),
            status,
            uptime_secs: Some(3600),
            latest: None,
        }
    }

    #[test]
    fn merge_reuses_unchanged_records() {
        let sync = InventorySync::new();
        sync.on_snapshot(vec![
            record("srv-1", ServerStatus::Online),
            record("srv-2", ServerStatus::Online),
        ]);
        let first = sync.view();

        sync.on_snapshot(vec![
            record("srv-1", ServerStatus::Online),
            record("srv-2", ServerStatus::Degraded),
            record("srv-3", ServerStatus::Online),
        ]);
        let second = sync.view();

        assert_eq!(second.servers.len(), 3);
        assert!(Arc::ptr_eq(&first.servers[0], &second.servers[0]));
        assert!(!Arc::ptr_eq(&first.servers[1], &second.servers[1]));
        assert_eq!(second.servers[1].status, ServerStatus::Degraded);
        assert_eq!(second.servers[2].id.as_str(), "srv-3");
    }

    #[test]
    fn removed_servers_dropped() {
        let sync = InventorySync::new();
        sync.on_snapshot(vec![
            record("srv-1", ServerStatus::Online),
            record("srv-2", ServerStatus::Online),
        ]);
        sync.on_snapshot(vec![record("srv-2", ServerStatus::Online)]);

        let view = sync.view();
        assert_eq!(view.servers.len(), 1);
        assert!(view.server(&ServerId::from("srv-1")).is_none());
        assert!(view.server(&ServerId::from("srv-2")).is_some());
    }

    #[test]
    fn identical_snapshot_not_republished() {
        let sync = InventorySync::new();
        let mut rx = sync.subscribe();

        sync.on_snapshot(vec![record("srv-1", ServerStatus::Online)]);
        assert!(rx.has_changed().unwrap());
        let _ = rx.borrow_and_update();

        sync.on_snapshot(vec![record("srv-1", ServerStatus::Online)]);
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn first_snapshot_after_reconnect_republishes() {
        let sync = InventorySync::new();
        sync.on_snapshot(vec![record("srv-1", ServerStatus::Online)]);
        let before = sync.view();

        sync.set_connection(ConnectionState::Reconnecting);
        assert!(sync.view().is_loading);
        sync.set_connection(ConnectionState::Connected);

        let mut rx = sync.subscribe();
        let _ = rx.borrow_and_update();
        sync.on_snapshot(vec![record("srv-1", ServerStatus::Online)]);

        // Same sequence, but the loading flag had to flip.
        assert!(rx.has_changed().unwrap());
        let after = sync.view();
        assert!(!after.is_loading);
        assert!(Arc::ptr_eq(&before.servers[0], &after.servers[0]));
    }

    #[test]
    fn snapshot_clears_error_and_marks_connected() {
        let sync = InventorySync::new();
        sync.set_error("feed unreachable".into());
        assert_eq!(sync.view().error.as_deref(), Some("feed unreachable"));

        sync.on_snapshot(vec![record("srv-1", ServerStatus::Online)]);
        let view = sync.view();
        assert!(view.error.is_none());
        assert!(!view.is_loading);
        assert_eq!(view.connection, ConnectionState::Connected);
    }

    #[test]
    fn connecting_clears_stale_error() {
        let sync = InventorySync::new();
        sync.set_error("boom".into());
        sync.set_connection(ConnectionState::Connecting);

        let view = sync.view();
        assert!(view.error.is_none());
        assert!(view.is_loading);
    }

    #[test]
    fn terminal_states_end_loading() {
        let sync = InventorySync::new();
        assert!(sync.view().is_loading);
        sync.set_connection(ConnectionState::PermanentlyFailed);

        let view = sync.view();
        assert!(!view.is_loading);
        assert_eq!(view.connection, ConnectionState::PermanentlyFailed);
    }

    #[test]
    fn duplicate_connection_state_not_republished() {
        let sync = InventorySync::new();
        sync.set_connection(ConnectionState::Connecting);

        let mut rx = sync.subscribe();
        let _ = rx.borrow_and_update();
        sync.set_connection(ConnectionState::Connecting);
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn reset_returns_default_view() {
        let sync = InventorySync::new();
        sync.on_snapshot(vec![record("srv-1", ServerStatus::Online)]);
        sync.reset();

        let view = sync.view();
        assert!(view.servers.is_empty());
        assert!(view.is_loading);
        assert_eq!(view.connection, ConnectionState::Disconnected);
    }
}
