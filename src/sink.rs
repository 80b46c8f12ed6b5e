use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, trace, warn, Level};

use crate::{
    config::SinkConfig,
    models::{IncidentCard, IncidentReport, InvestigationOutcome},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SinkEventKind {
    #[serde(rename = "incident.started")]
    Started,
    #[serde(rename = "incident.completed")]
    Completed,
    #[serde(rename = "incident.aborted")]
    Aborted,
    #[serde(rename = "incident.failed")]
    Failed,
}

impl SinkEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "incident.started",
            Self::Completed => "incident.completed",
            Self::Aborted => "incident.aborted",
            Self::Failed => "incident.failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SinkEvent {
    pub kind: SinkEventKind,
    pub incident_id: String,
    pub card_name: String,
    pub resource_name: String,
    pub message: String,
    pub payload: Value,
}

impl SinkEvent {
    pub fn started(incident_id: &str, card: &IncidentCard) -> Self {
        Self {
            kind: SinkEventKind::Started,
            incident_id: incident_id.to_string(),
            card_name: card.name.clone(),
            resource_name: card.resource.name.clone(),
            message: format!("Investigation started for {}", card.resource.name),
            payload: json!({
                "resourceId": card.resource.id(),
                "resource": card.resource,
                "tools": card.tools,
                "maxIterations": card.max_iterations,
            }),
        }
    }

    pub fn finished(report: &IncidentReport) -> Self {
        let (kind, message) = match &report.outcome {
            InvestigationOutcome::Completed { answer } => (SinkEventKind::Completed, answer.clone()),
            InvestigationOutcome::Aborted { reason } => (
                SinkEventKind::Aborted,
                format!("Investigation aborted: {reason}"),
            ),
            InvestigationOutcome::Failed { error } => (
                SinkEventKind::Failed,
                format!("Investigation failed: {error}"),
            ),
        };
        Self {
            kind,
            incident_id: report.incident_id.clone(),
            card_name: report.card_name.clone(),
            resource_name: report.resource.name.clone(),
            message,
            payload: serde_json::to_value(report).unwrap_or(Value::Null),
        }
    }
}

#[async_trait]
pub trait Sink: Send + Sync {
    async fn emit(&self, event: &SinkEvent) -> Result<()>;
}

/// Writes events through `tracing` at the configured level.
pub struct LoggingSink {
    name: String,
    level: Level,
    channel: Option<String>,
}

impl LoggingSink {
    pub fn new(config: &SinkConfig) -> Self {
        Self {
            name: config.name.clone(),
            level: parse_level(&config.level),
            channel: config.channel.clone(),
        }
    }
}

#[async_trait]
impl Sink for LoggingSink {
    async fn emit(&self, event: &SinkEvent) -> Result<()> {
        let sink = self.name.as_str();
        let channel = self.channel.as_deref().unwrap_or_default();
        let payload = event.payload.to_string();
        macro_rules! emit_at {
            ($macro:ident) => {
                $macro!(
                    sink = %sink,
                    channel = %channel,
                    event_type = event.kind.as_str(),
                    incident_id = %event.incident_id,
                    card = %event.card_name,
                    resource = %event.resource_name,
                    payload = %payload,
                    "{}",
                    event.message
                )
            };
        }
        match self.level {
            Level::ERROR => emit_at!(error),
            Level::WARN => emit_at!(warn),
            Level::DEBUG => emit_at!(debug),
            Level::TRACE => emit_at!(trace),
            _ => emit_at!(info),
        }
        Ok(())
    }
}

fn parse_level(raw: &str) -> Level {
    match raw.trim().to_ascii_lowercase().as_str() {
        "error" => Level::ERROR,
        "warn" | "warning" => Level::WARN,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Routes events to sinks by name.
#[derive(Default, Clone)]
pub struct SinkDispatcher {
    sinks: HashMap<String, Arc<dyn Sink>>,
}

impl SinkDispatcher {
    /// Builds sinks from configuration. Duplicate names keep the first
    /// definition; unsupported types are skipped.
    pub fn from_configs(configs: &[SinkConfig]) -> Self {
        let mut dispatcher = Self::default();
        for config in configs {
            if dispatcher.sinks.contains_key(&config.name) {
                warn!(sink = %config.name, "Duplicate sink definition, keeping first");
                continue;
            }
            match config.r#type.as_str() {
                "log" | "logger" => {
                    dispatcher.register(&config.name, Arc::new(LoggingSink::new(config)));
                }
                other => {
                    error!(sink = %config.name, sink_type = %other, "Unsupported sink type, skipping");
                }
            }
        }
        dispatcher
    }

    pub fn register(&mut self, name: &str, sink: Arc<dyn Sink>) {
        self.sinks.insert(name.to_string(), sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub async fn dispatch(&self, names: &[String], event: &SinkEvent) {
        for name in names {
            let Some(sink) = self.sinks.get(name) else {
                warn!(sink = %name, event_type = event.kind.as_str(), "Unknown sink, skipping");
                continue;
            };
            if let Err(err) = sink.emit(event).await {
                warn!(sink = %name, event_type = event.kind.as_str(), "Sink failed to emit event: {err:#}");
            }
        }
    }
}

/// Consulted before a finished report reaches any sink.
#[async_trait]
pub trait ReportGate: Send + Sync {
    /// `Err(reason)` suppresses delivery.
    async fn review(&self, report: &IncidentReport) -> Result<(), String>;
}

pub struct AllowAll;

#[async_trait]
impl ReportGate for AllowAll {
    async fn review(&self, _report: &IncidentReport) -> Result<(), String> {
        Ok(())
    }
}
