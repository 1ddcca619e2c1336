//! Tool abstraction and registry.
//!
//! A tool exposes a name, description, JSON schema, and an async `execute`.
//! The agent runtime dispatches provider tool calls against the registry by
//! name; execution errors surface as failed results rather than propagating.

mod builtin;
mod registry;

pub use builtin::{CurrentTimeTool, EchoTool, ReadFileTool, WriteFileTool};
pub use registry::ToolRegistry;

use async_trait::async_trait;

use valet_domain::message::{ToolDefinition, ToolResult};

/// Trait implemented by every tool the agent can invoke.
#[async_trait]
pub trait AgentTool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for the tool's parameters.
    fn schema(&self) -> serde_json::Value;

    async fn execute(&self, args: serde_json::Value) -> ToolResult;

    /// The definition advertised to providers.
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_owned(),
            description: self.description().to_owned(),
            parameters: self.schema(),
        }
    }
}
