//! OpenAI-compatible adapter.
//!
//! Works with OpenAI, OpenRouter, Ollama, vLLM, LM Studio, and any other
//! endpoint that follows the OpenAI chat completions contract. Unknown
//! vendors are routed here with a user-supplied base URL.

use std::collections::BTreeMap;

use serde_json::Value;

use valet_domain::error::{Error, Result};
use valet_domain::message::{Message, Role, ToolCall, ToolDefinition};
use valet_domain::stream::{BoxStream, ProviderChunk};

use crate::sse::sse_response_stream;
use crate::traits::{ChatRequest, LlmProvider};
use crate::util::{from_reqwest, status_error};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug)]
pub struct OpenAiCompatProvider {
    provider_id: String,
    base_url: String,
    api_key: Option<String>,
    model: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(
        provider_id: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(from_reqwest)?;

        Ok(Self {
            provider_id: provider_id.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            client,
        })
    }

    fn build_body(&self, req: &ChatRequest) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(msg_to_openai).collect();

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
        });
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_openai).collect();
            body["tools"] = Value::Array(tools);
        }
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        body
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message serialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn role_to_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn msg_to_openai(msg: &Message) -> Value {
    match msg.role {
        Role::Tool => serde_json::json!({
            "role": "tool",
            "tool_call_id": msg.tool_call_id.clone().unwrap_or_default(),
            "content": msg.content,
        }),
        Role::Assistant if !msg.tool_calls.is_empty() => {
            let tool_calls: Vec<Value> = msg
                .tool_calls
                .iter()
                .map(|tc| {
                    serde_json::json!({
                        "id": tc.id,
                        "type": "function",
                        "function": {
                            "name": tc.name,
                            "arguments": tc.arguments.to_string(),
                        }
                    })
                })
                .collect();
            serde_json::json!({
                "role": "assistant",
                "content": if msg.content.is_empty() { Value::Null } else { Value::String(msg.content.clone()) },
                "tool_calls": tool_calls,
            })
        }
        Role::User if !msg.images.is_empty() => {
            let mut parts = vec![serde_json::json!({"type": "text", "text": msg.content})];
            for url in &msg.images {
                parts.push(serde_json::json!({
                    "type": "image_url",
                    "image_url": { "url": url },
                }));
            }
            serde_json::json!({ "role": "user", "content": parts })
        }
        _ => serde_json::json!({
            "role": role_to_str(msg.role),
            "content": msg.content,
        }),
    }
}

fn tool_to_openai(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming parser
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Tool-call fragments assembled across SSE payloads, keyed by index.
#[derive(Default)]
struct StreamState {
    tool_calls: BTreeMap<u64, (String, String, String)>, // index -> (id, name, args json)
}

impl StreamState {
    fn flush_tool_calls(&mut self) -> Option<Vec<ToolCall>> {
        if self.tool_calls.is_empty() {
            return None;
        }
        let calls = std::mem::take(&mut self.tool_calls)
            .into_values()
            .map(|(id, name, args)| {
                let arguments = if args.trim().is_empty() {
                    Value::Object(Default::default())
                } else {
                    serde_json::from_str(&args).unwrap_or_else(|e| {
                        tracing::warn!(
                            call_id = %id,
                            error = %e,
                            "tool call arguments are not valid JSON; defaulting to empty object"
                        );
                        Value::Object(Default::default())
                    })
                };
                ToolCall {
                    id,
                    name,
                    arguments,
                }
            })
            .collect();
        Some(calls)
    }
}

fn parse_data(state: &mut StreamState, data: &str) -> Vec<Result<ProviderChunk>> {
    if data == "[DONE]" {
        let mut out = Vec::new();
        if let Some(calls) = state.flush_tool_calls() {
            out.push(Ok(ProviderChunk::ToolCall { calls }));
        }
        out.push(Ok(ProviderChunk::Done));
        return out;
    }

    let value: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };

    if let Some(err) = value.get("error") {
        let message = err
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown provider error")
            .to_owned();
        return vec![Ok(ProviderChunk::Error { message })];
    }

    let Some(choice) = value.get("choices").and_then(|c| c.get(0)) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    if let Some(delta) = choice.get("delta") {
        if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
            if !text.is_empty() {
                out.push(Ok(ProviderChunk::TextDelta {
                    text: text.to_owned(),
                }));
            }
        }
        if let Some(fragments) = delta.get("tool_calls").and_then(|t| t.as_array()) {
            for fragment in fragments {
                let index = fragment.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
                let entry = state.tool_calls.entry(index).or_default();
                if let Some(id) = fragment.get("id").and_then(|i| i.as_str()) {
                    entry.0 = id.to_owned();
                }
                if let Some(function) = fragment.get("function") {
                    if let Some(name) = function.get("name").and_then(|n| n.as_str()) {
                        entry.1.push_str(name);
                    }
                    if let Some(args) = function.get("arguments").and_then(|a| a.as_str()) {
                        entry.2.push_str(args);
                    }
                }
            }
        }
    }

    // Some servers close with a finish_reason instead of a [DONE] sentinel.
    if let Some(reason) = choice.get("finish_reason").and_then(|r| r.as_str()) {
        if !reason.is_empty() {
            if let Some(calls) = state.flush_tool_calls() {
                out.push(Ok(ProviderChunk::ToolCall { calls }));
            }
            out.push(Ok(ProviderChunk::Done));
        }
    }

    out
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LlmProvider impl
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn stream(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<ProviderChunk>>> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self
            .client
            .post(&url)
            .header("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }

        let response = builder
            .json(&self.build_body(req))
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(&self.provider_id, status, &body));
        }

        let mut state = StreamState::default();
        Ok(sse_response_stream(response, move |data| {
            parse_data(&mut state, data)
        }))
    }

    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn model(&self) -> &str {
        &self.model
    }
}
