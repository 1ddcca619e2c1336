//! Anthropic Messages API adapter.
//!
//! Translates between our internal types and the `/v1/messages` streaming
//! wire format. System messages move into the top-level `system` parameter;
//! tool results ride as `tool_result` content blocks on user messages.

use serde_json::Value;

use valet_domain::error::{Error, Result};
use valet_domain::message::{Role, ToolCall, ToolDefinition};
use valet_domain::stream::{BoxStream, ProviderChunk};

use crate::sse::sse_response_stream;
use crate::traits::{ChatRequest, LlmProvider};
use crate::util::{from_reqwest, status_error};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug)]
pub struct AnthropicProvider {
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(
        model: impl Into<String>,
        api_key: impl Into<String>,
        base_url: Option<String>,
    ) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.is_empty() {
            return Err(Error::Auth("anthropic: missing API key".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(from_reqwest)?;

        Ok(Self {
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.into())
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model: model.into(),
            client,
        })
    }

    fn build_body(&self, req: &ChatRequest) -> Value {
        let mut system_parts: Vec<String> = Vec::new();
        let mut messages: Vec<Value> = Vec::new();

        for msg in &req.messages {
            match msg.role {
                Role::System => system_parts.push(msg.content.clone()),
                Role::User => {
                    if msg.images.is_empty() {
                        messages.push(serde_json::json!({
                            "role": "user",
                            "content": msg.content,
                        }));
                    } else {
                        let mut blocks =
                            vec![serde_json::json!({"type": "text", "text": msg.content})];
                        for url in &msg.images {
                            blocks.push(serde_json::json!({
                                "type": "image",
                                "source": { "type": "url", "url": url },
                            }));
                        }
                        messages.push(serde_json::json!({"role": "user", "content": blocks}));
                    }
                }
                Role::Assistant => {
                    let mut blocks = Vec::new();
                    if !msg.content.is_empty() {
                        blocks.push(serde_json::json!({"type": "text", "text": msg.content}));
                    }
                    for tc in &msg.tool_calls {
                        blocks.push(serde_json::json!({
                            "type": "tool_use",
                            "id": tc.id,
                            "name": tc.name,
                            "input": tc.arguments,
                        }));
                    }
                    messages.push(serde_json::json!({"role": "assistant", "content": blocks}));
                }
                Role::Tool => {
                    messages.push(serde_json::json!({
                        "role": "user",
                        "content": [{
                            "type": "tool_result",
                            "tool_use_id": msg.tool_call_id.clone().unwrap_or_default(),
                            "content": msg.content,
                        }],
                    }));
                }
            }
        }

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "stream": true,
        });
        if !system_parts.is_empty() {
            body["system"] = Value::String(system_parts.join("\n\n"));
        }
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t: &ToolDefinition| {
                    serde_json::json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
            body["tools"] = Value::Array(tools);
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        body
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming parser
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Tool-use blocks being assembled across `content_block_*` events.
#[derive(Default)]
struct StreamState {
    /// block index -> (id, name, partial input json)
    blocks: Vec<(String, String, String)>,
}

impl StreamState {
    fn flush_tool_calls(&mut self) -> Option<Vec<ToolCall>> {
        if self.blocks.is_empty() {
            return None;
        }
        let calls = std::mem::take(&mut self.blocks)
            .into_iter()
            .map(|(id, name, input)| {
                let arguments = if input.trim().is_empty() {
                    Value::Object(Default::default())
                } else {
                    serde_json::from_str(&input).unwrap_or(Value::Object(Default::default()))
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
    let value: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };

    match value.get("type").and_then(|t| t.as_str()) {
        Some("content_block_start") => {
            if let Some(block) = value.get("content_block") {
                if block.get("type").and_then(|t| t.as_str()) == Some("tool_use") {
                    let id = block
                        .get("id")
                        .and_then(|i| i.as_str())
                        .unwrap_or_default()
                        .to_owned();
                    let name = block
                        .get("name")
                        .and_then(|n| n.as_str())
                        .unwrap_or_default()
                        .to_owned();
                    state.blocks.push((id, name, String::new()));
                }
            }
            Vec::new()
        }
        Some("content_block_delta") => {
            let Some(delta) = value.get("delta") else {
                return Vec::new();
            };
            match delta.get("type").and_then(|t| t.as_str()) {
                Some("text_delta") => delta
                    .get("text")
                    .and_then(|t| t.as_str())
                    .filter(|t| !t.is_empty())
                    .map(|text| {
                        vec![Ok(ProviderChunk::TextDelta {
                            text: text.to_owned(),
                        })]
                    })
                    .unwrap_or_default(),
                Some("input_json_delta") => {
                    if let (Some(last), Some(partial)) = (
                        state.blocks.last_mut(),
                        delta.get("partial_json").and_then(|p| p.as_str()),
                    ) {
                        last.2.push_str(partial);
                    }
                    Vec::new()
                }
                _ => Vec::new(),
            }
        }
        Some("message_stop") => {
            let mut out = Vec::new();
            if let Some(calls) = state.flush_tool_calls() {
                out.push(Ok(ProviderChunk::ToolCall { calls }));
            }
            out.push(Ok(ProviderChunk::Done));
            out
        }
        Some("error") => {
            let message = value
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("unknown provider error")
                .to_owned();
            vec![Ok(ProviderChunk::Error { message })]
        }
        // message_start, message_delta, ping, content_block_stop
        _ => Vec::new(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LlmProvider impl
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LlmProvider for AnthropicProvider {
    async fn stream(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<ProviderChunk>>> {
        let url = format!("{}/v1/messages", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("Content-Type", "application/json")
            .json(&self.build_body(req))
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("anthropic", status, &body));
        }

        let mut state = StreamState::default();
        Ok(sse_response_stream(response, move |data| {
            parse_data(&mut state, data)
        }))
    }

    fn provider_id(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use valet_domain::message::Message;

    #[test]
    fn text_deltas_parse() {
        let mut state = StreamState::default();
        let chunks = parse_data(
            &mut state,
            r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"Hi"}}"#,
        );
        assert!(matches!(
            chunks[0].as_ref().unwrap(),
            ProviderChunk::TextDelta { text } if text == "Hi"
        ));
    }

    #[test]
    fn tool_use_assembles_across_deltas() {
        let mut state = StreamState::default();
        parse_data(
            &mut state,
            r#"{"type":"content_block_start","content_block":{"type":"tool_use","id":"tu_1","name":"echo"}}"#,
        );
        parse_data(
            &mut state,
            r#"{"type":"content_block_delta","delta":{"type":"input_json_delta","partial_json":"{\"x\":"}}"#,
        );
        parse_data(
            &mut state,
            r#"{"type":"content_block_delta","delta":{"type":"input_json_delta","partial_json":"\"yo\"}"}}"#,
        );
        let chunks = parse_data(&mut state, r#"{"type":"message_stop"}"#);

        match chunks[0].as_ref().unwrap() {
            ProviderChunk::ToolCall { calls } => {
                assert_eq!(calls[0].id, "tu_1");
                assert_eq!(calls[0].arguments["x"], "yo");
            }
            other => panic!("expected ToolCall, got {other:?}"),
        }
        assert!(matches!(chunks[1].as_ref().unwrap(), ProviderChunk::Done));
    }

    #[test]
    fn system_messages_lift_into_system_param() {
        let provider =
            AnthropicProvider::new("claude-sonnet-4", "key", None).unwrap();
        let req = ChatRequest {
            messages: vec![Message::system("be brief"), Message::user("hi")],
            ..Default::default()
        };
        let body = provider.build_body(&req);
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn tool_results_ride_as_user_blocks() {
        let provider =
            AnthropicProvider::new("claude-sonnet-4", "key", None).unwrap();
        let req = ChatRequest {
            messages: vec![Message::tool_result("tu_1", "out", None)],
            ..Default::default()
        };
        let body = provider.build_body(&req);
        let block = &body["messages"][0]["content"][0];
        assert_eq!(block["type"], "tool_result");
        assert_eq!(block["tool_use_id"], "tu_1");
    }

    #[test]
    fn empty_key_is_rejected() {
        assert!(AnthropicProvider::new("m", "", None).is_err());
    }
}
