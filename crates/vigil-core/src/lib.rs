//! # vigil-core
//!
//! Foundation types, wire frames, and backoff policy for the Vigil dashboard client.
//!
//! This crate provides the shared vocabulary that the sync layer and its
//! consumers depend on:
//!
//! - **Branded IDs**: `ServerId`, `MonitorId` as newtypes for type safety,
//!   plus `EntityKey` for cache/subscription keying
//! - **Connection state**: the `ConnectionState` machine vocabulary
//! - **Inventory**: `ServerRecord` snapshots and the published `InventoryView`
//! - **Metrics**: `MetricPoint` / `CheckResult` samples with their channels
//! - **Frames**: the JSON feed protocol (`InboundFrame`, `OutboundFrame`)
//! - **Backoff**: the reconnect delay policy

#![deny(unsafe_code)]

pub mod backoff;
pub mod frames;
pub mod ids;
pub mod inventory;
pub mod metrics;
pub mod state;

pub use backoff::BackoffPolicy;
pub use frames::{FrameError, FrameKind, InboundFrame, OutboundFrame, parse_frame};
pub use ids::{AuthToken, EntityKey, MonitorId, ServerId};
pub use inventory::{InventoryView, ServerRecord, ServerStatus};
pub use metrics::{CheckResult, CheckStatus, MetricChannel, MetricPoint, Timestamped};
pub use state::ConnectionState;
