//! Historical sample retrieval.
//!
//! The metric caches fill their window on first subscription by asking a
//! [`HistoryFetcher`] for everything inside the time range. [`RestHistory`]
//! implements it against the dashboard REST API; tests substitute fakes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use vigil_core::{CheckResult, EntityKey, MetricPoint, ServerId};

use crate::connection::CredentialWatch;
use crate::error::HistoryError;

/// Time range of a history request, inclusive on both ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeRange {
    /// Oldest instant of interest.
    pub since: DateTime<Utc>,
    /// Newest instant of interest.
    pub until: DateTime<Utc>,
}

/// Fetches the historical samples for one cache key.
#[async_trait]
pub trait HistoryFetcher<K, S>: Send + Sync {
    /// Fetch every sample for `key` inside `range`, in any order.
    async fn fetch_window(&self, key: &K, range: TimeRange) -> Result<Vec<S>, HistoryError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// REST implementation
// ─────────────────────────────────────────────────────────────────────────────

/// History fetcher backed by the dashboard REST API.
///
/// Reads the credential slot per request, so it always authenticates with
/// the current token (or not at all when the slot is empty).
pub struct RestHistory {
    http: reqwest::Client,
    base_url: String,
    credentials: CredentialWatch,
}

impl RestHistory {
    /// Create a fetcher for the given dashboard base URL.
    pub fn new(base_url: impl Into<String>, credentials: CredentialWatch) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            credentials,
        }
    }

    async fn get_json<D: DeserializeOwned>(
        &self,
        path: &str,
        range: TimeRange,
    ) -> Result<D, HistoryError> {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        let mut request = self.http.get(&url).query(&[
            ("since", range.since.to_rfc3339()),
            ("until", range.until.to_rfc3339()),
        ]);
        if let Some(token) = self.credentials.borrow().clone() {
            request = request.bearer_auth(token.as_str());
        }
        let response = request.send().await?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            return Err(HistoryError::Status(status));
        }
        Ok(response.json().await?)
    }
}

#[derive(Deserialize)]
struct MetricsPayload {
    metrics: Vec<MetricPoint>,
}

#[derive(Deserialize)]
struct ChecksPayload {
    checks: Vec<CheckResult>,
}

#[async_trait]
impl HistoryFetcher<ServerId, MetricPoint> for RestHistory {
    async fn fetch_window(
        &self,
        key: &ServerId,
        range: TimeRange,
    ) -> Result<Vec<MetricPoint>, HistoryError> {
        let path = format!("/api/v1/servers/{key}/metrics");
        let payload: MetricsPayload = self.get_json(&path, range).await?;
        debug!(server = %key, count = payload.metrics.len(), "fetched metric history");
        Ok(payload.metrics)
    }
}

#[async_trait]
impl HistoryFetcher<EntityKey, CheckResult> for RestHistory {
    async fn fetch_window(
        &self,
        key: &EntityKey,
        range: TimeRange,
    ) -> Result<Vec<CheckResult>, HistoryError> {
        let path = match key {
            EntityKey::Monitor(id) => format!("/api/v1/monitors/{id}/checks"),
            EntityKey::Server(id) => format!("/api/v1/servers/{id}/checks"),
        };
        let payload: ChecksPayload = self.get_json(&path, range).await?;
        debug!(key = %key, count = payload.checks.len(), "fetched check history");
        Ok(payload.checks)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;
    use chrono::TimeZone;
    use tokio::sync::watch;
    use vigil_core::{AuthToken, MonitorId};

    fn range() -> TimeRange {
        TimeRange {
            since: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            until: Utc.timestamp_opt(1_700_000_600, 0).unwrap(),
        }
    }

    fn credentials(token: Option<&str>) -> CredentialWatch {
        // The receiver can still read the value after the sender drops.
        let (_tx, rx) = watch::channel(token.map(AuthToken::from));
        rx
    }

    #[tokio::test]
    async fn fetches_server_metrics() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/api/v1/servers/srv-1/metrics"))
            .and(wiremock::matchers::query_param_contains("since", "2023"))
            .and(wiremock::matchers::query_param_contains("until", "2023"))
            .respond_with(
                wiremock::ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "metrics": [
                        {"serverId":"srv-1","channel":"cpu","value":12.5,"recordedAt":"2023-11-14T22:13:20Z"}
                    ]
                })),
            )
            .mount(&server)
            .await;

        let history = RestHistory::new(server.uri(), credentials(None));
        let samples = history
            .fetch_window(&ServerId::from("srv-1"), range())
            .await
            .unwrap();

        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].value, 12.5);
    }

    #[tokio::test]
    async fn fetches_monitor_checks_with_bearer_token() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/api/v1/monitors/mon-7/checks"))
            .and(wiremock::matchers::header(
                "authorization",
                "Bearer tok-secret",
            ))
            .respond_with(
                wiremock::ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "checks": [
                        {"monitorId":"mon-7","serverId":"srv-1","status":"up","checkedAt":"2023-11-14T22:13:20Z"}
                    ]
                })),
            )
            .mount(&server)
            .await;

        let history = RestHistory::new(server.uri(), credentials(Some("tok-secret")));
        let key = EntityKey::Monitor(MonitorId::from("mon-7"));
        let samples = history.fetch_window(&key, range()).await.unwrap();

        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].monitor_id.as_str(), "mon-7");
    }

    #[tokio::test]
    async fn server_key_uses_server_checks_route() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/api/v1/servers/srv-2/checks"))
            .respond_with(
                wiremock::ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"checks": []})),
            )
            .mount(&server)
            .await;

        let history = RestHistory::new(server.uri(), credentials(None));
        let key = EntityKey::Server(ServerId::from("srv-2"));
        let samples = history.fetch_window(&key, range()).await.unwrap();
        assert!(samples.is_empty());
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let history = RestHistory::new(server.uri(), credentials(None));
        let err = history
            .fetch_window(&ServerId::from("srv-1"), range())
            .await
            .unwrap_err();
        assert_matches!(err, HistoryError::Status(503));
    }

    #[tokio::test]
    async fn trailing_slash_in_base_url_tolerated() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/api/v1/servers/srv-1/metrics"))
            .respond_with(
                wiremock::ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"metrics": []})),
            )
            .mount(&server)
            .await;

        let history = RestHistory::new(format!("{}/", server.uri()), credentials(None));
        let samples = history
            .fetch_window(&ServerId::from("srv-1"), range())
            .await
            .unwrap();
        assert!(samples.is_empty());
    }
}
