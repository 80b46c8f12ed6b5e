use std::{collections::HashMap, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::Watcher;
use crate::{
    config::ResourceConfig,
    models::{Notification, Resource},
};

pub const RESOURCE_TYPE: &str = "prometheus_alert";
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrometheusAlert {
    #[serde(default)]
    labels: HashMap<String, String>,
    #[serde(default)]
    annotations: HashMap<String, String>,
    #[serde(default)]
    state: String,
    #[serde(default)]
    active_at: Option<DateTime<Utc>>,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct AlertsResponse {
    #[serde(default)]
    status: String,
    data: AlertsData,
}

#[derive(Debug, Deserialize)]
struct AlertsData {
    #[serde(default)]
    alerts: Vec<PrometheusAlert>,
}

pub struct PrometheusWatcher {
    name: String,
    alerts_url: String,
    poll_interval: Duration,
    resources: Vec<ResourceConfig>,
    http: reqwest::Client,
}

impl PrometheusWatcher {
    pub fn new(
        name: &str,
        endpoint: &str,
        poll_interval: Duration,
        resources: Vec<ResourceConfig>,
    ) -> Result<Self> {
        anyhow::ensure!(
            !poll_interval.is_zero(),
            "poll interval for watcher {name} must be positive"
        );
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("Failed to build Prometheus HTTP client")?;
        Ok(Self {
            name: name.to_string(),
            alerts_url: format!("{}/api/v1/alerts", endpoint.trim_end_matches('/')),
            poll_interval,
            resources,
            http,
        })
    }

    /// One fetch-filter-emit pass. Returns how many notifications were queued.
    async fn poll_once(&self, tx: &mpsc::Sender<Notification>) -> usize {
        let alerts = match self.fetch_alerts().await {
            Ok(alerts) => alerts,
            Err(err) => {
                error!(watcher = %self.name, url = %self.alerts_url, "Failed to poll Prometheus: {err:#}");
                return 0;
            }
        };

        let firing: Vec<&PrometheusAlert> =
            alerts.iter().filter(|alert| alert.state == "firing").collect();
        debug!(watcher = %self.name, firing = firing.len(), "Found firing alerts");

        let mut sent = 0;
        for alert in firing {
            let Some(resource) = self.resources.iter().find(|r| matches_resource(alert, r)) else {
                continue;
            };
            let notification = to_notification(alert, &resource.name);
            match tx.try_send(notification) {
                Ok(()) => {
                    sent += 1;
                    debug!(
                        watcher = %self.name,
                        alertname = alert.labels.get("alertname").map(String::as_str).unwrap_or("UnknownAlert"),
                        resource = %resource.name,
                        "Sent alert notification"
                    );
                }
                Err(TrySendError::Full(_)) => {
                    warn!(watcher = %self.name, resource = %resource.name, "Notification channel full, dropping alert");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(watcher = %self.name, "Notification channel closed");
                    break;
                }
            }
        }
        sent
    }

    async fn fetch_alerts(&self) -> Result<Vec<PrometheusAlert>> {
        let response = self
            .http
            .get(&self.alerts_url)
            .send()
            .await
            .context("request failed")?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Prometheus API returned status {status}");
        }
        let body: AlertsResponse = response
            .json()
            .await
            .context("failed to decode alerts response")?;
        if !body.status.is_empty() && body.status != "success" {
            warn!(watcher = %self.name, status = %body.status, "Prometheus reported non-success status");
        }
        Ok(body.data.alerts)
    }
}

#[async_trait]
impl Watcher for PrometheusWatcher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, tx: mpsc::Sender<Notification>, cancel: CancellationToken) {
        info!(
            watcher = %self.name,
            url = %self.alerts_url,
            poll_interval = ?self.poll_interval,
            resources = self.resources.len(),
            "Starting Prometheus watcher"
        );

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.poll_once(&tx) => {}
            }
        }

        info!(watcher = %self.name, "Prometheus watcher shutting down");
    }
}

/// Every filter key must be present in the alert labels with an accepted value.
fn matches_resource(alert: &PrometheusAlert, resource: &ResourceConfig) -> bool {
    resource.filters.iter().all(|(key, expected)| {
        alert
            .labels
            .get(key)
            .is_some_and(|actual| expected.accepts(actual))
    })
}

fn to_notification(alert: &PrometheusAlert, resource_name: &str) -> Notification {
    Notification {
        resource: Resource {
            r#type: RESOURCE_TYPE.to_string(),
            name: resource_name.to_string(),
            labels: alert.labels.clone(),
            annotations: alert.annotations.clone(),
            state: alert.state.clone(),
            value: alert.value.clone(),
            timestamp: alert
                .active_at
                .map(|at| at.to_rfc3339_opts(SecondsFormat::Secs, true))
                .unwrap_or_default(),
        },
    }
}
