//! Sync layer configuration.
//!
//! Three layers, in priority order:
//!
//! 1. Compiled defaults ([`SyncConfig::default()`])
//! 2. Config file (`~/.vigil/config.json`, when present)
//! 3. Environment variables (`VIGIL_*` overrides)
//!
//! Every field carries a serde default, so a partial file only overrides
//! what it names. Callers embedding the library usually build the config
//! themselves; the CLI goes through [`load_config_from_path`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use vigil_core::BackoffPolicy;

use crate::error::ConfigError;

/// Default dashboard base URL.
pub const DEFAULT_BASE_URL: &str = "http://localhost:4000";
/// Default feed path under the base URL.
pub const DEFAULT_FEED_PATH: &str = "/api/v1/realtime";
/// Default sliding window for both metric families, in milliseconds.
pub const DEFAULT_WINDOW_MS: u64 = 600_000;
/// Default capacity of the connection event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;
/// Default capacity of the outbound frame channel.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 32;
/// Default capacity of each subscriber's delivery channel.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 16;

/// Configuration for the realtime sync layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    /// Dashboard base URL; the feed scheme (`ws`/`wss`) is derived from it.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Path of the feed endpoint under the base URL.
    #[serde(default = "default_feed_path")]
    pub feed_path: String,
    /// Reconnect backoff policy.
    #[serde(default)]
    pub backoff: BackoffPolicy,
    /// Sliding window for the service-check cache, in ms.
    #[serde(default = "default_window_ms")]
    pub check_window_ms: u64,
    /// Sliding window for the performance cache, in ms.
    #[serde(default = "default_window_ms")]
    pub metric_window_ms: u64,
    /// Connection event fan-out channel capacity.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Outbound frame channel capacity.
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,
    /// Per-subscriber delivery channel capacity.
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_owned()
}
fn default_feed_path() -> String {
    DEFAULT_FEED_PATH.to_owned()
}
fn default_window_ms() -> u64 {
    DEFAULT_WINDOW_MS
}
fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}
fn default_outbound_capacity() -> usize {
    DEFAULT_OUTBOUND_CAPACITY
}
fn default_subscriber_capacity() -> usize {
    DEFAULT_SUBSCRIBER_CAPACITY
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            feed_path: default_feed_path(),
            backoff: BackoffPolicy::default(),
            check_window_ms: DEFAULT_WINDOW_MS,
            metric_window_ms: DEFAULT_WINDOW_MS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
        }
    }
}

impl SyncConfig {
    /// Defaults with `VIGIL_*` environment overrides applied.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        apply_env_overrides(&mut config);
        config
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File layer
// ─────────────────────────────────────────────────────────────────────────────

/// Resolve the default config file path (`~/.vigil/config.json`).
#[must_use]
pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".vigil").join("config.json")
}

/// Load configuration from the default path with env var overrides.
pub fn load_config() -> Result<SyncConfig, ConfigError> {
    load_config_from_path(&default_config_path())
}

/// Load configuration from a specific path with env var overrides.
///
/// If the file does not exist, defaults apply. If the file exists but is
/// unreadable or not valid JSON, that is an error.
pub fn load_config_from_path(path: &Path) -> Result<SyncConfig, ConfigError> {
    let mut config = if path.exists() {
        debug!(?path, "loading config from file");
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)?
    } else {
        debug!(?path, "config file not found, using defaults");
        SyncConfig::default()
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

// ─────────────────────────────────────────────────────────────────────────────
// Environment overrides
// ─────────────────────────────────────────────────────────────────────────────

/// Apply `VIGIL_*` environment variable overrides to a config.
pub fn apply_env_overrides(config: &mut SyncConfig) {
    if let Some(v) = read_env_string("VIGIL_BASE_URL") {
        config.base_url = v;
    }
    if let Some(v) = read_env_string("VIGIL_FEED_PATH") {
        config.feed_path = v;
    }
    if let Some(v) = read_env_u64("VIGIL_CHECK_WINDOW_MS", 1000, 86_400_000) {
        config.check_window_ms = v;
    }
    if let Some(v) = read_env_u64("VIGIL_METRIC_WINDOW_MS", 1000, 86_400_000) {
        config.metric_window_ms = v;
    }
    if let Some(v) = read_env_u64("VIGIL_BACKOFF_BASE_MS", 100, 600_000) {
        config.backoff.base_delay_ms = v;
    }
    if let Some(v) = read_env_u64("VIGIL_BACKOFF_MAX_MS", 100, 3_600_000) {
        config.backoff.max_delay_ms = v;
    }
}

/// Parse a string as a `u64` within a range.
#[must_use]
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
