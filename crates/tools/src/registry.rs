use std::collections::HashMap;
use std::sync::Arc;

use valet_domain::message::{ToolDefinition, ToolResult};

use crate::AgentTool;

/// Registry of tools keyed by name.
///
/// Dispatch is a string match against the provider's tool-call output.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn AgentTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn AgentTool>) {
        let name = tool.name().to_owned();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "tool already registered, overwriting");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AgentTool>> {
        self.tools.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Definitions for every registered tool (sorted by name for stable
    /// provider payloads).
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Execute a tool by name. Unknown tools and execution failures are
    /// surfaced as failed results, never as errors.
    pub async fn execute(&self, name: &str, args: serde_json::Value) -> ToolResult {
        match self.get(name) {
            Some(tool) => tool.execute(args).await,
            None => ToolResult::fail(format!("unknown tool: {name}")),
        }
    }
}
