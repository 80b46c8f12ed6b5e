use axum::{extract::State, response::IntoResponse, Json};
use chrono::Utc;
use serde_json::json;

use crate::AppState;

pub async fn healthz() -> impl IntoResponse {
    Json(json!({ "ok": true, "timestamp": Utc::now() }))
}

pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let servers: Vec<_> = state
        .servers
        .statuses()
        .into_iter()
        .map(|server| json!({ "name": server.name, "connected": server.connected }))
        .collect();

    Json(json!({
        "servers": servers,
        "dedupEntries": state.dedup.len().await,
        "incidents": state.counters.snapshot(),
    }))
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use axum::body::to_bytes;
    use serde_json::Value;

    use super::*;
    use crate::{
        config::McpServerConfig, dedup::DedupCache, mcp::McpServerManager,
        sentinel::IncidentCounters,
    };

    #[tokio::test]
    async fn status_reports_servers_and_counters() {
        let mut manager = McpServerManager::new();
        manager.register(McpServerConfig::stdio("juju", "uvx", &["mcp-juju"]), None);
        let dedup = Arc::new(DedupCache::new(Duration::from_secs(600), 10));
        dedup.check_and_insert("abc").await;

        let state = AppState {
            servers: Arc::new(manager),
            dedup,
            counters: Arc::new(IncidentCounters::default()),
        };

        let response = status(State(state)).await.into_response();
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let value: Value = serde_json::from_slice(&body).expect("json");

        assert_eq!(value["servers"][0]["name"], "juju");
        assert_eq!(value["servers"][0]["connected"], false);
        assert_eq!(value["dedupEntries"], 1);
        assert_eq!(value["incidents"]["started"], 0);
        assert_eq!(value["incidents"]["unrouted"], 0);
    }
}
