use serde::Serialize;
use std::pin::Pin;

use crate::message::ToolCall;

/// A boxed async stream, used for LLM streaming responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Chunks emitted by an LLM provider while streaming a completion.
///
/// The sequence is finite and not restartable; dropping the consumer must
/// release the underlying transport.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ProviderChunk {
    /// A piece of assistant text.
    #[serde(rename = "text_delta")]
    TextDelta { text: String },

    /// One or more complete tool invocations requested by the model.
    #[serde(rename = "tool_call")]
    ToolCall { calls: Vec<ToolCall> },

    /// The stream finished normally.
    #[serde(rename = "done")]
    Done,

    /// The provider reported an error mid-stream.
    #[serde(rename = "error")]
    Error { message: String },
}
