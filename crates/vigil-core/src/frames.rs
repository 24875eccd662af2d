//! The JSON frame protocol spoken over the feed connection.
//!
//! Every frame is a JSON object. Inbound frames carry a `"type"`
//! discriminator, with one exception: the inventory snapshot is recognized
//! structurally by its `servers` field (the backend has always sent it
//! untagged). [`parse_frame`] normalizes both shapes into [`InboundFrame`].
//!
//! Control frames (`ping`, `connected`) are consumed by the connection
//! layer and never reach application routing; [`InboundFrame::kind`] returns
//! `None` for them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

use crate::inventory::ServerRecord;
use crate::metrics::{CheckResult, MetricPoint};

/// Failure to turn a raw frame into an [`InboundFrame`].
///
/// Every variant is log-and-drop at the call site; a bad frame never
/// affects connection state.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The frame was not valid JSON, or a recognized frame's payload did
    /// not match its schema.
    #[error("invalid JSON frame: {0}")]
    Json(#[from] serde_json::Error),
    /// A JSON object with neither a `type` field nor a `servers` field.
    #[error("frame missing type discriminator")]
    MissingDiscriminator,
    /// A well-formed frame with a `type` this client does not know.
    #[error("unrecognized frame type: {0}")]
    Unrecognized(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Inbound
// ─────────────────────────────────────────────────────────────────────────────

/// Routing key for application frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Full inventory snapshot.
    Inventory,
    /// One service-monitor result.
    Check,
    /// Batch of performance gauge readings.
    MetricBatch,
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Inventory => "inventory",
            Self::Check => "check",
            Self::MetricBatch => "metric_batch",
        };
        f.write_str(name)
    }
}

/// A parsed inbound frame.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundFrame {
    /// Keepalive probe; answered with [`OutboundFrame::Pong`].
    Ping,
    /// Handshake acknowledgement; logged only.
    Connected,
    /// Complete inventory snapshot, backend order preserved.
    Inventory(Vec<ServerRecord>),
    /// One service-monitor probe result.
    Check(CheckResult),
    /// Performance readings, possibly spanning several servers.
    MetricBatch(Vec<MetricPoint>),
}

impl InboundFrame {
    /// Routing key; `None` for control frames.
    #[must_use]
    pub fn kind(&self) -> Option<FrameKind> {
        match self {
            Self::Ping | Self::Connected => None,
            Self::Inventory(_) => Some(FrameKind::Inventory),
            Self::Check(_) => Some(FrameKind::Check),
            Self::MetricBatch(_) => Some(FrameKind::MetricBatch),
        }
    }

    /// True for frames the connection layer consumes itself.
    #[must_use]
    pub fn is_control(&self) -> bool {
        self.kind().is_none()
    }

    /// Frame name for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Connected => "connected",
            Self::Inventory(_) => "inventory",
            Self::Check(_) => "service_monitor_result",
            Self::MetricBatch(_) => "performance_metric_batch",
        }
    }
}

#[derive(Deserialize)]
struct InventoryFrame {
    servers: Vec<ServerRecord>,
}

#[derive(Deserialize)]
struct MetricBatchFrame {
    metrics: Vec<MetricPoint>,
}

/// Parse one raw frame into an [`InboundFrame`].
///
/// The `servers` probe runs before the discriminator so the untagged
/// inventory shape wins even if the backend ever adds a `type` to it.
pub fn parse_frame(raw: &str) -> Result<InboundFrame, FrameError> {
    let value: Value = serde_json::from_str(raw)?;

    if value.get("servers").is_some() {
        let frame: InventoryFrame = serde_json::from_value(value)?;
        return Ok(InboundFrame::Inventory(frame.servers));
    }

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or(FrameError::MissingDiscriminator)?;

    match kind.as_str() {
        "ping" => Ok(InboundFrame::Ping),
        "connected" => Ok(InboundFrame::Connected),
        "service_monitor_result" => Ok(InboundFrame::Check(serde_json::from_value(value)?)),
        "performance_metric_batch" => {
            let frame: MetricBatchFrame = serde_json::from_value(value)?;
            Ok(InboundFrame::MetricBatch(frame.metrics))
        }
        _ => Err(FrameError::Unrecognized(kind)),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbound
// ─────────────────────────────────────────────────────────────────────────────

/// Frames the client sends to the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    /// Keepalive reply.
    Pong,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
