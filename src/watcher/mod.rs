//! Alert sources. Each watcher polls one endpoint and pushes matching
//! alerts onto the shared notification channel.

mod prometheus;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use prometheus::PrometheusWatcher;

use crate::{
    config::{parse_duration, FileConfig},
    models::Notification,
};

#[async_trait]
pub trait Watcher: Send + Sync {
    fn name(&self) -> &str;

    /// Polls until `cancel` fires. Sends never block: a full channel drops
    /// the notification.
    async fn run(&self, tx: mpsc::Sender<Notification>, cancel: CancellationToken);
}

/// Builds one watcher per configured entry, with its resources resolved in
/// configured order.
pub fn build_watchers(file: &FileConfig) -> Result<Vec<Box<dyn Watcher>>> {
    let mut watchers: Vec<Box<dyn Watcher>> = Vec::with_capacity(file.watchers.len());
    for config in &file.watchers {
        let resources = config
            .resources
            .iter()
            .map(|name| {
                file.resource(name).cloned().with_context(|| {
                    format!("resource {name} not found for watcher {}", config.name)
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let poll_interval = parse_duration(&config.poll_interval)?;

        match config.r#type.as_str() {
            "prometheus" => watchers.push(Box::new(PrometheusWatcher::new(
                &config.name,
                &config.endpoint,
                poll_interval,
                resources,
            )?)),
            other => bail!("unknown watcher type `{other}` for watcher {}", config.name),
        }
    }
    Ok(watchers)
}
