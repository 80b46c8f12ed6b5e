use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub r#type: String,
    /// Configured resource name. This is the routing key, not the alert name.
    pub name: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub timestamp: String,
}

impl Resource {
    /// Stable identity of one alert occurrence, used for deduplication.
    ///
    /// Hashes type, name, labels sorted by key and the firing timestamp.
    /// Annotations, state and value do not participate.
    pub fn id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.r#type.as_bytes());
        hasher.update(b"|");
        hasher.update(self.name.as_bytes());

        if !self.labels.is_empty() {
            let mut pairs: Vec<String> = self
                .labels
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect();
            pairs.sort();
            hasher.update(b"|");
            hasher.update(pairs.join(",").as_bytes());
        }

        if !self.timestamp.is_empty() {
            hasher.update(b"|");
            hasher.update(self.timestamp.as_bytes());
        }

        format!("{:x}", hasher.finalize())
    }
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub resource: Resource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpTool {
    pub server_name: String,
    pub tool_name: String,
}

impl McpTool {
    /// Parses the `server.tool` form used in incident card configuration.
    pub fn parse(raw: &str) -> Option<Self> {
        let (server, tool) = raw.trim().split_once('.')?;
        if server.is_empty() || tool.is_empty() || tool.contains('.') {
            return None;
        }
        Some(Self {
            server_name: server.to_string(),
            tool_name: tool.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct IncidentCard {
    pub name: String,
    pub resource: Resource,
    pub prompt: String,
    pub tools: Vec<McpTool>,
    pub max_iterations: usize,
    pub model: Option<String>,
    pub sinks: Vec<String>,
}

impl IncidentCard {
    /// Copy of this card bound to the live resource that triggered it.
    pub fn bind(&self, resource: Resource) -> Self {
        Self {
            resource,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub server_name: String,
    pub tool_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallTrace {
    pub server_name: String,
    pub tool_name: String,
    pub arguments: Value,
    pub output: String,
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InvestigationOutcome {
    Completed { answer: String },
    Aborted { reason: String },
    Failed { error: String },
}

impl InvestigationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::Aborted { .. } => "aborted",
            Self::Failed { .. } => "failed",
        }
    }
}

/// What a sink receives once an investigation terminates.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentReport {
    pub incident_id: String,
    pub card_name: String,
    pub resource_id: String,
    pub resource: Resource,
    pub outcome: InvestigationOutcome,
    pub tool_calls: Vec<ToolCallTrace>,
    pub iterations: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}
