//! Google Gemini adapter (`streamGenerateContent` with SSE framing).

use serde_json::Value;

use valet_domain::error::{Error, Result};
use valet_domain::message::{Role, ToolCall};
use valet_domain::stream::{BoxStream, ProviderChunk};

use crate::sse::sse_response_stream;
use crate::traits::{ChatRequest, LlmProvider};
use crate::util::{from_reqwest, status_error};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

#[derive(Debug)]
pub struct GoogleProvider {
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl GoogleProvider {
    pub fn new(
        model: impl Into<String>,
        api_key: impl Into<String>,
        base_url: Option<String>,
    ) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.is_empty() {
            return Err(Error::Auth("google: missing API key".into()));
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
        let mut contents: Vec<Value> = Vec::new();

        for msg in &req.messages {
            match msg.role {
                Role::System => system_parts.push(msg.content.clone()),
                Role::User => contents.push(serde_json::json!({
                    "role": "user",
                    "parts": [{"text": msg.content}],
                })),
                Role::Assistant => {
                    let mut parts = Vec::new();
                    if !msg.content.is_empty() {
                        parts.push(serde_json::json!({"text": msg.content}));
                    }
                    for tc in &msg.tool_calls {
                        parts.push(serde_json::json!({
                            "functionCall": { "name": tc.name, "args": tc.arguments },
                        }));
                    }
                    contents.push(serde_json::json!({"role": "model", "parts": parts}));
                }
                Role::Tool => contents.push(serde_json::json!({
                    "role": "user",
                    "parts": [{
                        "functionResponse": {
                            "name": msg.name.clone().unwrap_or_default(),
                            "response": { "content": msg.content },
                        }
                    }],
                })),
            }
        }

        let mut body = serde_json::json!({ "contents": contents });
        if !system_parts.is_empty() {
            body["systemInstruction"] = serde_json::json!({
                "parts": [{"text": system_parts.join("\n\n")}],
            });
        }
        if !req.tools.is_empty() {
            let declarations: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    })
                })
                .collect();
            body["tools"] = serde_json::json!([{ "functionDeclarations": declarations }]);
        }
        if let Some(max) = req.max_tokens {
            body["generationConfig"] = serde_json::json!({ "maxOutputTokens": max });
        }
        body
    }
}

// ── Streaming parser ───────────────────────────────────────────────

/// Gemini does not assign tool-call ids; synthesize stable ones per stream.
#[derive(Default)]
struct StreamState {
    calls: Vec<ToolCall>,
    next_call: usize,
}

fn parse_data(state: &mut StreamState, data: &str) -> Vec<Result<ProviderChunk>> {
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

    let Some(parts) = value
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
    else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for part in parts {
        if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
            if !text.is_empty() {
                out.push(Ok(ProviderChunk::TextDelta {
                    text: text.to_owned(),
                }));
            }
        }
        if let Some(call) = part.get("functionCall") {
            state.next_call += 1;
            state.calls.push(ToolCall {
                id: format!("call_{}", state.next_call),
                name: call
                    .get("name")
                    .and_then(|n| n.as_str())
                    .unwrap_or_default()
                    .to_owned(),
                arguments: call.get("args").cloned().unwrap_or(Value::Object(Default::default())),
            });
        }
    }
    out
}

#[async_trait::async_trait]
impl LlmProvider for GoogleProvider {
    async fn stream(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<ProviderChunk>>> {
        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url, self.model, self.api_key
        );
        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&self.build_body(req))
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("google", status, &body));
        }

        // The shared SSE driver synthesizes the trailing Done; tool calls
        // collected during the stream are flushed just before it.
        let mut state = StreamState::default();
        let mut flushed = false;
        Ok(sse_response_stream(response, move |data| {
            let mut chunks = parse_data(&mut state, data);
            // Gemini signals completion via finishReason on the candidate.
            let finished = serde_json::from_str::<Value>(data)
                .ok()
                .and_then(|v| {
                    v.get("candidates")?
                        .get(0)?
                        .get("finishReason")
                        .and_then(|r| r.as_str())
                        .map(|r| !r.is_empty())
                })
                .unwrap_or(false);
            if finished && !flushed {
                flushed = true;
                if !state.calls.is_empty() {
                    chunks.push(Ok(ProviderChunk::ToolCall {
                        calls: std::mem::take(&mut state.calls),
                    }));
                }
                chunks.push(Ok(ProviderChunk::Done));
            }
            chunks
        }))
    }

    fn provider_id(&self) -> &str {
        "google"
    }

    fn model(&self) -> &str {
        &self.model
    }
}
