use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{ChatMessage, ChatRequest, ChatResponse, LlmError, ReasoningBackend, ToolCall};
use crate::config::OpenAiConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Client for any OpenAI-compatible `/chat/completions` endpoint
/// (OpenAI, LiteLLM, vLLM, Ollama, ...).
#[derive(Debug, Clone)]
pub struct OpenAiBackend {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ResponseToolCall>,
}

#[derive(Debug, Deserialize)]
struct ResponseToolCall {
    #[serde(default)]
    id: String,
    #[serde(rename = "type", default = "function_kind")]
    kind: String,
    #[serde(default)]
    function: Option<ResponseFunction>,
}

#[derive(Debug, Deserialize)]
struct ResponseFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

fn function_kind() -> String {
    "function".to_string()
}

impl OpenAiBackend {
    pub fn new(config: &OpenAiConfig) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| LlmError::Transport {
                message: err.to_string(),
            })?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn build_request_body(request: &ChatRequest<'_>) -> Value {
        let messages: Vec<Value> = request.messages.iter().map(encode_message).collect();

        let mut body = json!({
            "model": request.model,
            "messages": messages,
        });

        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }

        if !request.functions.is_empty() {
            let tools: Vec<Value> = request
                .functions
                .iter()
                .map(|function| {
                    let mut encoded = json!({
                        "name": function.name,
                        "description": function.description,
                    });
                    if let Some(parameters) = &function.parameters {
                        encoded["parameters"] = parameters.clone();
                    }
                    json!({ "type": "function", "function": encoded })
                })
                .collect();
            body["tools"] = Value::Array(tools);
            if request.prefer_tools {
                body["tool_choice"] = json!("auto");
            }
        }

        body
    }

    fn parse_response(raw: &str) -> Result<ChatResponse, LlmError> {
        let completion: ChatCompletion =
            serde_json::from_str(raw).map_err(|err| LlmError::MalformedResponse {
                message: err.to_string(),
            })?;
        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::MalformedResponse {
                message: "response contained no choices".to_string(),
            })?;

        let requested = choice.message.tool_calls.len();
        let tool_calls: Vec<ToolCall> = choice
            .message
            .tool_calls
            .into_iter()
            .filter(|call| call.kind == "function")
            .filter_map(|call| {
                let function = call.function?;
                Some(ToolCall {
                    id: call.id,
                    name: function.name,
                    arguments: function.arguments,
                })
            })
            .collect();

        Ok(ChatResponse {
            content: choice.message.content.unwrap_or_default(),
            skipped_tool_calls: requested - tool_calls.len(),
            tool_calls,
        })
    }
}

fn encode_message(message: &ChatMessage) -> Value {
    match message {
        ChatMessage::System(content) => json!({ "role": "system", "content": content }),
        ChatMessage::User(content) => json!({ "role": "user", "content": content }),
        ChatMessage::Assistant {
            content,
            tool_calls,
        } => {
            let mut encoded = json!({
                "role": "assistant",
                "content": if content.is_empty() { Value::Null } else { Value::String(content.clone()) },
            });
            if !tool_calls.is_empty() {
                let calls: Vec<Value> = tool_calls
                    .iter()
                    .map(|call| {
                        json!({
                            "id": call.id,
                            "type": "function",
                            "function": { "name": call.name, "arguments": call.arguments }
                        })
                    })
                    .collect();
                encoded["tool_calls"] = Value::Array(calls);
            }
            encoded
        }
        ChatMessage::Tool {
            tool_call_id,
            content,
        } => json!({ "role": "tool", "tool_call_id": tool_call_id, "content": content }),
    }
}

#[async_trait]
impl ReasoningBackend for OpenAiBackend {
    async fn complete(&self, request: &ChatRequest<'_>) -> Result<ChatResponse, LlmError> {
        let body = Self::build_request_body(request);
        debug!(
            model = %request.model,
            messages = request.messages.len(),
            functions = request.functions.len(),
            "Sending chat completion request"
        );

        let mut builder = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }

        let response = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                LlmError::NetworkTimeout {
                    duration_ms: REQUEST_TIMEOUT.as_millis() as u64,
                }
            } else {
                LlmError::Transport {
                    message: err.to_string(),
                }
            }
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|err| LlmError::Transport {
            message: err.to_string(),
        })?;
        if !status.is_success() {
            return Err(LlmError::from_http_status(status.as_u16(), text));
        }

        Self::parse_response(&text)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        extract::State,
        http::{HeaderMap, StatusCode},
        routing::post,
        Json, Router,
    };
    use tokio::sync::Mutex;

    use super::*;
    use crate::llm::FunctionSignature;

    #[test]
    fn request_body_encodes_history_and_tools() {
        let messages = vec![
            ChatMessage::System("sys".to_string()),
            ChatMessage::User("go".to_string()),
            ChatMessage::Assistant {
                content: String::new(),
                tool_calls: vec![ToolCall {
                    id: "call_1".to_string(),
                    name: "get_status".to_string(),
                    arguments: "{}".to_string(),
                }],
            },
            ChatMessage::Tool {
                tool_call_id: "call_1".to_string(),
                content: "HEALTH_OK".to_string(),
            },
        ];
        let functions = vec![FunctionSignature {
            name: "get_status".to_string(),
            description: "Juju status".to_string(),
            parameters: Some(json!({ "type": "object" })),
        }];
        let request = ChatRequest {
            model: "gpt-4o",
            messages: &messages,
            functions: &functions,
            prefer_tools: true,
            temperature: Some(0.5),
        };

        let body = OpenAiBackend::build_request_body(&request);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["temperature"], 0.5);
        assert_eq!(body["tool_choice"], "auto");
        assert_eq!(body["tools"][0]["function"]["name"], "get_status");
        assert_eq!(body["tools"][0]["function"]["parameters"]["type"], "object");
        assert_eq!(body["messages"][2]["content"], Value::Null);
        assert_eq!(body["messages"][2]["tool_calls"][0]["id"], "call_1");
        assert_eq!(body["messages"][3]["role"], "tool");
        assert_eq!(body["messages"][3]["tool_call_id"], "call_1");
    }

    #[test]
    fn request_body_omits_missing_parameters() {
        let messages = vec![ChatMessage::User("go".to_string())];
        let functions = vec![FunctionSignature {
            name: "ping".to_string(),
            description: "Liveness".to_string(),
            parameters: None,
        }];
        let request = ChatRequest {
            model: "gpt-4o",
            messages: &messages,
            functions: &functions,
            prefer_tools: false,
            temperature: None,
        };
        let body = OpenAiBackend::build_request_body(&request);
        let function = body["tools"][0]["function"].as_object().expect("function");
        assert_eq!(function["name"], "ping");
        assert!(!function.contains_key("parameters"));
        assert!(body.get("tool_choice").is_none());
    }

    #[test]
    fn request_body_omits_tools_when_none_are_available() {
        let messages = vec![ChatMessage::User("go".to_string())];
        let request = ChatRequest {
            model: "gpt-4o",
            messages: &messages,
            functions: &[],
            prefer_tools: true,
            temperature: None,
        };
        let body = OpenAiBackend::build_request_body(&request);
        assert!(body.get("tools").is_none());
        assert!(body.get("tool_choice").is_none());
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn parse_response_extracts_function_calls() {
        let raw = json!({
            "choices": [{ "message": {
                "content": null,
                "tool_calls": [{
                    "id": "call_9",
                    "type": "function",
                    "function": { "name": "get_status", "arguments": "{\"model\":\"ceph\"}" }
                }]
            }}]
        })
        .to_string();
        let response = OpenAiBackend::parse_response(&raw).expect("parse");
        assert_eq!(response.content, "");
        assert_eq!(response.tool_calls[0].name, "get_status");
        assert_eq!(response.tool_calls[0].arguments, r#"{"model":"ceph"}"#);

        assert_eq!(response.skipped_tool_calls, 0);

        assert!(matches!(
            OpenAiBackend::parse_response(r#"{"choices":[]}"#),
            Err(LlmError::MalformedResponse { .. })
        ));
    }

    #[test]
    fn parse_response_counts_unsupported_tool_calls() {
        let raw = json!({
            "choices": [{ "message": {
                "content": null,
                "tool_calls": [{
                    "id": "call_1",
                    "type": "custom",
                    "custom": { "name": "shell", "input": "ls" }
                }]
            }}]
        })
        .to_string();
        let response = OpenAiBackend::parse_response(&raw).expect("parse");
        assert!(response.tool_calls.is_empty());
        assert_eq!(response.skipped_tool_calls, 1);
    }

    #[derive(Default)]
    struct Captured {
        authorization: Option<String>,
        body: Option<Value>,
    }

    async fn spawn_completion_server(status: StatusCode, reply: Value) -> (String, Arc<Mutex<Captured>>) {
        let captured = Arc::new(Mutex::new(Captured::default()));
        let app = Router::new()
            .route(
                "/v1/chat/completions",
                post(
                    move |State(captured): State<Arc<Mutex<Captured>>>,
                          headers: HeaderMap,
                          Json(body): Json<Value>| {
                        let reply = reply.clone();
                        async move {
                            let mut guard = captured.lock().await;
                            guard.authorization = headers
                                .get("authorization")
                                .and_then(|v| v.to_str().ok())
                                .map(str::to_string);
                            guard.body = Some(body);
                            (status, Json(reply))
                        }
                    },
                ),
            )
            .with_state(captured.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("http://{addr}/v1"), captured)
    }

    fn backend_for(base_url: String) -> OpenAiBackend {
        OpenAiBackend::new(&OpenAiConfig {
            api_key: "test-key".to_string(),
            base_url,
            model: "gpt-4o".to_string(),
            temperature: None,
        })
        .expect("client")
    }

    #[tokio::test]
    async fn complete_posts_to_chat_completions() {
        let (base_url, captured) = spawn_completion_server(
            StatusCode::OK,
            json!({ "choices": [{ "message": { "content": "All OSDs are up." } }] }),
        )
        .await;
        let backend = backend_for(base_url);

        let messages = vec![ChatMessage::User("status?".to_string())];
        let response = backend
            .complete(&ChatRequest {
                model: "gpt-4o",
                messages: &messages,
                functions: &[],
                prefer_tools: false,
                temperature: None,
            })
            .await
            .expect("completion");
        assert_eq!(response.content, "All OSDs are up.");
        assert!(response.tool_calls.is_empty());

        let captured = captured.lock().await;
        assert_eq!(captured.authorization.as_deref(), Some("Bearer test-key"));
        assert_eq!(
            captured.body.as_ref().expect("body")["messages"][0]["content"],
            "status?"
        );
    }

    #[tokio::test]
    async fn complete_maps_http_errors() {
        let (base_url, _) = spawn_completion_server(
            StatusCode::UNAUTHORIZED,
            json!({ "error": { "message": "bad key" } }),
        )
        .await;
        let backend = backend_for(base_url);
        let messages = vec![ChatMessage::User("status?".to_string())];
        let result = backend
            .complete(&ChatRequest {
                model: "gpt-4o",
                messages: &messages,
                functions: &[],
                prefer_tools: false,
                temperature: None,
            })
            .await;
        assert!(matches!(result, Err(LlmError::AuthenticationFailed { .. })));
    }
}
