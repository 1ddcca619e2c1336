use valet_domain::error::Result;
use valet_domain::message::{Message, ToolDefinition};
use valet_domain::stream::{BoxStream, ProviderChunk};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request type
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A provider-agnostic streaming chat request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// The conversation messages to send.
    pub messages: Vec<Message>,
    /// Tool definitions the model may invoke. Empty disables tool use.
    pub tools: Vec<ToolDefinition>,
    /// Maximum tokens in the response. `None` lets the provider choose.
    pub max_tokens: Option<u32>,
    /// Sampling temperature. `None` lets the provider choose.
    pub temperature: Option<f32>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Core provider trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trait that every LLM adapter must implement.
///
/// The returned stream is finite and not restartable. Dropping it releases
/// the underlying transport, which is how turn cancellation aborts an
/// in-flight completion.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync + std::fmt::Debug {
    /// Open a streaming completion.
    async fn stream(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<ProviderChunk>>>;

    /// The vendor segment of the model identifier (e.g. "anthropic").
    fn provider_id(&self) -> &str;

    /// The model this instance targets.
    fn model(&self) -> &str;
}
