//! Metric sample types for the two feed families.
//!
//! Two sample shapes flow through the windowed caches:
//!
//! - **[`MetricPoint`]**: one performance gauge reading (cpu, memory, ...)
//!   for one server, delivered in `performance_metric_batch` frames.
//! - **[`CheckResult`]**: one service-monitor probe outcome, delivered in
//!   `service_monitor_result` frames and fanned out under both the owning
//!   server and the owning monitor.
//!
//! Samples are immutable once created; the caches only append and evict.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ids::{MonitorId, ServerId};

/// Timestamp accessor shared by every cacheable sample type.
///
/// The windowed caches evict by this value, so it must be the time the
/// sample was taken, not the time it arrived.
pub trait Timestamped {
    /// When the sample was taken.
    fn timestamp(&self) -> DateTime<Utc>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Performance family
// ─────────────────────────────────────────────────────────────────────────────

/// Named performance gauge reported per server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricChannel {
    /// CPU utilization, percent.
    Cpu,
    /// Memory utilization, percent.
    Memory,
    /// Disk utilization, percent.
    Disk,
    /// Network receive rate, bytes per second.
    NetworkRx,
    /// Network transmit rate, bytes per second.
    NetworkTx,
}

impl fmt::Display for MetricChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
            Self::Disk => "disk",
            Self::NetworkRx => "network_rx",
            Self::NetworkTx => "network_tx",
        };
        f.write_str(name)
    }
}

/// One performance gauge reading for one server at one instant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricPoint {
    /// Server the reading belongs to.
    pub server_id: ServerId,
    /// Which gauge was read.
    pub channel: MetricChannel,
    /// Gauge value in the channel's unit.
    pub value: f64,
    /// When the reading was taken.
    pub recorded_at: DateTime<Utc>,
}

impl Timestamped for MetricPoint {
    fn timestamp(&self) -> DateTime<Utc> {
        self.recorded_at
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service-monitor family
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of a single service-monitor probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    /// Probe succeeded.
    Up,
    /// Probe failed.
    Down,
}

/// One service-monitor probe result.
///
/// Carries both owning ids so the dispatcher can fan it out under the
/// server key and the monitor key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    /// Monitor that ran the probe.
    pub monitor_id: MonitorId,
    /// Server the monitor belongs to.
    pub server_id: ServerId,
    /// Whether the probed service answered.
    pub status: CheckStatus,
    /// Probe round-trip time, when the probe reached the service.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<f64>,
    /// Human-readable detail (e.g. HTTP status line or socket error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When the probe ran.
    pub checked_at: DateTime<Utc>,
}

impl Timestamped for CheckResult {
    fn timestamp(&self) -> DateTime<Utc> {
        self.checked_at
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn metric_point_wire_format() {
        let point = MetricPoint {
            server_id: ServerId::from("srv-1"),
            channel: MetricChannel::Cpu,
            value: 41.5,
            recorded_at: at(1_700_000_000),
        };
        let json = serde_json::to_value(&point).unwrap();
        assert_eq!(json["serverId"], "srv-1");
        assert_eq!(json["channel"], "cpu");
        assert_eq!(json["value"], 41.5);
        assert!(json["recordedAt"].is_string());
    }

    #[test]
    fn metric_channel_rename() {
        let json = serde_json::to_string(&MetricChannel::NetworkRx).unwrap();
        assert_eq!(json, "\"network_rx\"");
        let back: MetricChannel = serde_json::from_str("\"network_tx\"").unwrap();
        assert_eq!(back, MetricChannel::NetworkTx);
    }

    #[test]
    fn check_result_wire_format() {
        let raw = r#"{
            "monitorId": "mon-9",
            "serverId": "srv-1",
            "status": "up",
            "responseTimeMs": 34.2,
            "checkedAt": "2024-11-14T22:13:20Z"
        }"#;
        let check: CheckResult = serde_json::from_str(raw).unwrap();
        assert_eq!(check.monitor_id.as_str(), "mon-9");
        assert_eq!(check.server_id.as_str(), "srv-1");
        assert_eq!(check.status, CheckStatus::Up);
        assert_eq!(check.response_time_ms, Some(34.2));
        assert_eq!(check.message, None);
    }

    #[test]
    fn check_result_omits_empty_options() {
        let check = CheckResult {
            monitor_id: MonitorId::from("mon-1"),
            server_id: ServerId::from("srv-1"),
            status: CheckStatus::Down,
            response_time_ms: None,
            message: None,
            checked_at: at(0),
        };
        let json = serde_json::to_value(&check).unwrap();
        assert!(json.get("responseTimeMs").is_none());
        assert!(json.get("message").is_none());
    }

    #[test]
    fn timestamped_returns_sample_time() {
        let point = MetricPoint {
            server_id: ServerId::from("srv-1"),
            channel: MetricChannel::Memory,
            value: 72.0,
            recorded_at: at(123),
        };
        assert_eq!(point.timestamp(), at(123));

        let check = CheckResult {
            monitor_id: MonitorId::from("mon-1"),
            server_id: ServerId::from("srv-1"),
            status: CheckStatus::Up,
            response_time_ms: None,
            message: None,
            checked_at: at(456),
        };
        assert_eq!(check.timestamp(), at(456));
    }
}
