//! LLM provider adapters and the policies layered on top of them.
//!
//! Adapters translate between our internal types and each vendor's wire
//! format (OpenAI-compatible, Anthropic, Google Gemini). On top of the raw
//! adapters sit the error classifier, the auth-profile rotation pool, and
//! the model fallback chain consumed by the agent runtime.

pub mod auth;
pub mod classifier;
pub mod fallback;
pub mod registry;
pub mod traits;

mod anthropic;
mod google;
mod openai_compat;
mod sse;
mod util;

pub use anthropic::AnthropicProvider;
pub use google::GoogleProvider;
pub use openai_compat::OpenAiCompatProvider;
pub use traits::{ChatRequest, LlmProvider};
