mod agent;
mod api;
mod config;
mod dedup;
mod llm;
mod mcp;
mod models;
mod prompts;
mod sentinel;
mod sink;
mod watcher;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use config::Config;
use dedup::DedupCache;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::{
    agent::Investigator,
    llm::OpenAiBackend,
    mcp::McpServerManager,
    sentinel::{IncidentCounters, Sentinel, SentinelSettings},
    sink::{AllowAll, SinkDispatcher},
};

#[derive(Clone)]
pub struct AppState {
    pub servers: Arc<McpServerManager>,
    pub dedup: Arc<DedupCache>,
    pub counters: Arc<IncidentCounters>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env(std::env::args().nth(1))?;
    init_tracing(config.log_json);
    info!(
        config = ?config.config_path,
        resources = config.file.resources.len(),
        watchers = config.file.watchers.len(),
        mcp_servers = config.file.mcp_servers.len(),
        incident_cards = config.file.incident_cards.len(),
        model = %config.openai.model,
        "Configuration loaded"
    );

    let watchers = watcher::build_watchers(&config.file)?;
    if watchers.is_empty() {
        warn!("No watchers configured, nothing will be investigated");
    }
    let backend = Arc::new(OpenAiBackend::new(&config.openai)?);
    let sinks = SinkDispatcher::from_configs(&config.file.sinks);
    if sinks.is_empty() {
        info!("No sinks configured, incident outcomes are only logged");
    }
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind status API on {}", config.bind_addr))?;

    let mut manager = McpServerManager::new();
    if let Err(err) = manager.initialize(&config.file.mcp_servers).await {
        manager.stop_all().await;
        return Err(err).context("Failed to initialize MCP servers");
    }
    let manager = Arc::new(manager);

    let dedup = Arc::new(DedupCache::new(
        Duration::from_secs(config.dedupe_ttl_seconds),
        config.dedupe_max_entries,
    ));
    let counters = Arc::new(IncidentCounters::default());
    let investigator = Investigator::new(
        manager.clone(),
        backend,
        config.openai.model.clone(),
        config.openai.temperature,
    );
    info!(sinks = sinks.len(), "Sinks ready");
    let sentinel = Sentinel::new(
        SentinelSettings {
            queue_capacity: config.queue_capacity,
            worker_concurrency: config.worker_concurrency,
        },
        config.file.incident_cards(config.default_max_iterations),
        investigator,
        dedup.clone(),
        Arc::new(sinks),
        counters.clone(),
    )
    .with_watchers(watchers)
    .with_gate(Arc::new(AllowAll));

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            info!("Shutdown signal received");
            cancel.cancel();
        }
    });

    let state = AppState {
        servers: manager.clone(),
        dedup,
        counters,
    };
    let app = Router::new()
        .route("/healthz", get(api::healthz))
        .route("/v1/status", get(api::status))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("mcp-sentinel status API listening on {}", config.bind_addr);
    let server = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await
        }
    });

    sentinel.run(cancel.clone()).await;
    cancel.cancel();

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!("Status API failed: {err}"),
        Err(err) => error!("Status API task panicked: {err}"),
    }

    manager.stop_all().await;
    info!("mcp-sentinel stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "mcp_sentinel=info,tower_http=info".into());
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!("Failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
