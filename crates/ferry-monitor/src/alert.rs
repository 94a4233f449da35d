//! Alert sinks.
//!
//! An alert is a severity plus a message, optionally tied to a table. The log
//! sink writes it through `tracing`; the webhook sink POSTs it as JSON and
//! leaves formatting to the receiver.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use snafu::prelude::*;
use tracing::{error, info, warn};

use crate::error::{AlertError, WebhookSnafu, WebhookStatusSnafu};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            table: None,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn for_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, alert: &Alert) -> Result<(), AlertError>;
}

/// Writes alerts to the log at a level matching their severity.
#[derive(Debug, Clone, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn send(&self, alert: &Alert) -> Result<(), AlertError> {
        let table = alert.table.as_deref().unwrap_or("-");
        match alert.severity {
            Severity::Info => info!(table, message = %alert.message, "Alert"),
            Severity::Warning => warn!(table, message = %alert.message, "Alert"),
            Severity::Critical => error!(table, message = %alert.message, "Alert"),
        }
        Ok(())
    }
}

/// POSTs each alert as JSON to a webhook, and logs it as well.
#[derive(Debug, Clone)]
pub struct WebhookAlertSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlertSink {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn send(&self, alert: &Alert) -> Result<(), AlertError> {
        LogAlertSink.send(alert).await?;

        let response = self
            .client
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .context(WebhookSnafu { url: &self.url })?;

        let status = response.status();
        ensure!(
            status.is_success(),
            WebhookStatusSnafu {
                url: &self.url,
                status: status.as_u16(),
            }
        );
        Ok(())
    }
}
