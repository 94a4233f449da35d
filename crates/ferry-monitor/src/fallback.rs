//! Fallback sync requests.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use snafu::prelude::*;
use tracing::info;

use crate::error::{RejectedSnafu, RequestSnafu, TriggerError};

/// Body of a fallback request, accepted by the engine's trigger route.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FallbackRequest {
    pub source: &'static str,
    pub reason: String,
    pub timestamp: String,
}

impl FallbackRequest {
    pub fn new(reason: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            source: "fallback_monitor",
            reason: reason.into(),
            timestamp: now.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

/// POSTs fallback requests with a short timeout.
///
/// Only the request is bounded by the timeout; the engine answers `202` and
/// runs the sync in the background.
#[derive(Debug, Clone)]
pub struct FallbackClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl FallbackClient {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    pub async fn trigger(&self, url: &str, request: &FallbackRequest) -> Result<u16, TriggerError> {
        info!(url, reason = %request.reason, "Requesting fallback sync");
        let response = self
            .client
            .post(url)
            .timeout(self.timeout)
            .json(request)
            .send()
            .await
            .context(RequestSnafu { url })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return RejectedSnafu {
                url,
                status: status.as_u16(),
                body,
            }
            .fail();
        }
        Ok(status.as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_request_body() {
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap();
        let body = serde_json::to_value(FallbackRequest::new("stale", now)).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "source": "fallback_monitor",
                "reason": "stale",
                "timestamp": "2024-03-15T12:00:00Z",
            })
        );
    }
}
