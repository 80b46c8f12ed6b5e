use std::{collections::BTreeMap, sync::Arc};

use chrono::Utc;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    llm::{ChatMessage, ChatRequest, FunctionSignature, ReasoningBackend, ToolCall},
    mcp::ToolProvider,
    models::{IncidentCard, IncidentReport, InvestigationOutcome, McpTool, ToolCallTrace, ToolDescriptor},
    prompts,
};

pub const ABORT_MAX_ITERATIONS: &str = "max-iterations";
pub const ABORT_CANCELLED: &str = "cancelled";

/// Bridges an MCP tool schema into a function the reasoning backend can call.
///
/// Only `type`, `properties` and `required` are carried over, verbatim. A
/// schema without a `type` yields no parameters at all.
pub fn tool_to_function(tool: &ToolDescriptor) -> FunctionSignature {
    let has_type = tool
        .input_schema
        .get("type")
        .is_some_and(|kind| !kind.is_null());
    let parameters = has_type.then(|| {
        let mut parameters = Map::new();
        for key in ["type", "properties", "required"] {
            match tool.input_schema.get(key) {
                Some(Value::Null) | None => {}
                Some(value) => {
                    parameters.insert(key.to_string(), value.clone());
                }
            }
        }
        Value::Object(parameters)
    });
    FunctionSignature {
        name: tool.tool_name.clone(),
        description: tool.description.clone(),
        parameters,
    }
}

/// Runs bounded tool-calling conversations, one per incident.
#[derive(Clone)]
pub struct Investigator {
    tools: Arc<dyn ToolProvider>,
    backend: Arc<dyn ReasoningBackend>,
    default_model: String,
    temperature: Option<f32>,
}

impl Investigator {
    pub fn new(
        tools: Arc<dyn ToolProvider>,
        backend: Arc<dyn ReasoningBackend>,
        default_model: impl Into<String>,
        temperature: Option<f32>,
    ) -> Self {
        Self {
            tools,
            backend,
            default_model: default_model.into(),
            temperature,
        }
    }

    /// Lists each distinct server once and keeps the requested tools.
    /// Servers that fail to answer are skipped.
    pub async fn discover_tools(&self, requested: &[McpTool]) -> Vec<ToolDescriptor> {
        let mut by_server: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for tool in requested {
            by_server
                .entry(tool.server_name.as_str())
                .or_default()
                .push(tool.tool_name.as_str());
        }

        let mut available = Vec::new();
        for (server, names) in by_server {
            debug!(server = %server, "Listing tools on MCP server");
            match self.tools.list_tools(server).await {
                Ok(tools) => available.extend(
                    tools
                        .into_iter()
                        .filter(|tool| names.contains(&tool.tool_name.as_str())),
                ),
                Err(err) => warn!(server = %server, "Skipping MCP server during tool discovery: {err}"),
            }
        }
        available
    }

    /// Drives one investigation to a terminal outcome. Never fails: backend
    /// errors and cancellation are folded into the returned report.
    pub async fn investigate(
        &self,
        incident_id: &str,
        card: &IncidentCard,
        cancel: &CancellationToken,
    ) -> IncidentReport {
        let started_at = Utc::now();
        let resource_id = card.resource.id();
        let mut tool_calls = Vec::new();
        let mut iterations = 0;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => InvestigationOutcome::Aborted { reason: ABORT_CANCELLED.to_string() },
            outcome = self.converse(incident_id, card, &mut tool_calls, &mut iterations) => outcome,
        };

        match &outcome {
            InvestigationOutcome::Completed { answer } => info!(
                incident_id = %incident_id,
                card = %card.name,
                iterations,
                "Investigation completed: {answer}"
            ),
            InvestigationOutcome::Aborted { reason } => warn!(
                incident_id = %incident_id,
                card = %card.name,
                iterations,
                reason = %reason,
                "Investigation aborted"
            ),
            InvestigationOutcome::Failed { error } => error!(
                incident_id = %incident_id,
                card = %card.name,
                iterations,
                "Investigation failed: {error}"
            ),
        }

        IncidentReport {
            incident_id: incident_id.to_string(),
            card_name: card.name.clone(),
            resource_id,
            resource: card.resource.clone(),
            outcome,
            tool_calls,
            iterations,
            started_at,
            finished_at: Utc::now(),
        }
    }

    async fn converse(
        &self,
        incident_id: &str,
        card: &IncidentCard,
        trace: &mut Vec<ToolCallTrace>,
        iterations: &mut usize,
    ) -> InvestigationOutcome {
        let available = self.discover_tools(&card.tools).await;
        let functions: Vec<FunctionSignature> = available.iter().map(tool_to_function).collect();
        info!(
            incident_id = %incident_id,
            card = %card.name,
            tools = functions.len(),
            "Starting investigation"
        );

        let model = card.model.as_deref().unwrap_or(self.default_model.as_str());
        let mut messages = vec![
            ChatMessage::System(prompts::incident_system_prompt(card)),
            ChatMessage::User(prompts::INITIAL_USER_PROMPT.to_string()),
        ];

        for iteration in 0..card.max_iterations {
            *iterations = iteration + 1;
            info!(incident_id = %incident_id, iteration = iteration + 1, "Sending request to reasoning backend");

            let request = ChatRequest {
                model,
                messages: &messages,
                functions: &functions,
                prefer_tools: iteration == 0,
                temperature: self.temperature,
            };
            let response = match self.backend.complete(&request).await {
                Ok(response) => response,
                Err(err) => {
                    return InvestigationOutcome::Failed {
                        error: err.to_string(),
                    }
                }
            };

            if response.tool_calls.is_empty() && response.skipped_tool_calls > 0 {
                warn!(
                    incident_id = %incident_id,
                    skipped = response.skipped_tool_calls,
                    "Backend requested only unsupported tool call kinds, continuing"
                );
                if !response.content.is_empty() {
                    messages.push(ChatMessage::Assistant {
                        content: response.content,
                        tool_calls: Vec::new(),
                    });
                }
                continue;
            }

            if response.tool_calls.is_empty() {
                messages.push(ChatMessage::Assistant {
                    content: response.content.clone(),
                    tool_calls: Vec::new(),
                });
                return InvestigationOutcome::Completed {
                    answer: response.content,
                };
            }

            messages.push(ChatMessage::Assistant {
                content: response.content,
                tool_calls: response.tool_calls.clone(),
            });
            for call in &response.tool_calls {
                let (output, record) = self.execute(incident_id, call, &available).await;
                trace.push(record);
                messages.push(ChatMessage::Tool {
                    tool_call_id: call.id.clone(),
                    content: output,
                });
            }
        }

        InvestigationOutcome::Aborted {
            reason: ABORT_MAX_ITERATIONS.to_string(),
        }
    }

    /// Runs one requested call. The returned text always goes back to the
    /// backend, including argument and tool failures.
    async fn execute(
        &self,
        incident_id: &str,
        call: &ToolCall,
        available: &[ToolDescriptor],
    ) -> (String, ToolCallTrace) {
        let server = available
            .iter()
            .find(|tool| tool.tool_name == call.name)
            .map(|tool| tool.server_name.clone());

        let failed = |server: String, arguments: Value, output: String| {
            let record = ToolCallTrace {
                server_name: server,
                tool_name: call.name.clone(),
                arguments,
                output: output.clone(),
                is_error: true,
            };
            (output, record)
        };

        let arguments = match parse_arguments(&call.arguments) {
            Ok(arguments) => arguments,
            Err(err) => {
                warn!(incident_id = %incident_id, tool = %call.name, "Rejecting malformed tool arguments: {err}");
                return failed(
                    server.unwrap_or_default(),
                    Value::String(call.arguments.clone()),
                    format!("Invalid arguments for tool {}: {err}", call.name),
                );
            }
        };

        let Some(server) = server else {
            warn!(incident_id = %incident_id, tool = %call.name, "Backend requested a tool outside this incident card");
            return failed(
                String::new(),
                Value::Object(arguments),
                format!("Tool call failed: tool {} is not available for this incident", call.name),
            );
        };

        info!(incident_id = %incident_id, server = %server, tool = %call.name, "Calling MCP tool");
        let recorded = Value::Object(arguments.clone());
        match self.tools.call_tool(&server, &call.name, arguments).await {
            Ok(output) => {
                let record = ToolCallTrace {
                    server_name: server,
                    tool_name: call.name.clone(),
                    arguments: recorded,
                    output: output.clone(),
                    is_error: false,
                };
                (output, record)
            }
            Err(err) => {
                error!(incident_id = %incident_id, server = %server, tool = %call.name, "MCP tool call failed: {err}");
                failed(server, recorded, format!("Tool call failed: {err}"))
            }
        }
    }
}

fn parse_arguments(raw: &str) -> Result<Map<String, Value>, serde_json::Error> {
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    serde_json::from_str(raw)
}
