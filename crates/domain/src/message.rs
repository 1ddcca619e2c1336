use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Internal tool call format (provider-agnostic).
/// Every adapter converts provider-specific tool calls to/from this.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Tool definition exposed to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: serde_json::Value,
}

/// Result of executing a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            success: true,
            content: content.into(),
            metadata: None,
            error: None,
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            success: false,
            content: error.clone(),
            metadata: None,
            error: Some(error),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A message in a conversation.
///
/// Assistant messages may carry `tool_calls`; tool messages carry the
/// `tool_call_id` of the assistant tool call they answer. `metadata` holds
/// out-of-band tags (e.g. `compaction: true` on a synthetic summary).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

// ── Convenience constructors ───────────────────────────────────────

impl Message {
    fn base(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
            images: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::base(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::base(Role::User, content)
    }

    pub fn user_with_images(content: impl Into<String>, images: Vec<String>) -> Self {
        let mut msg = Self::base(Role::User, content);
        msg.images = images;
        msg
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::base(Role::Assistant, content)
    }

    pub fn assistant_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        let mut msg = Self::base(Role::Assistant, content);
        msg.tool_calls = tool_calls;
        msg
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
        name: Option<String>,
    ) -> Self {
        let mut msg = Self::base(Role::Tool, content);
        msg.tool_call_id = Some(tool_call_id.into());
        msg.name = name;
        msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_result_message_carries_call_id() {
        let msg = Message::tool_result("tc_1", "output", Some("echo".into()));
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("tc_1"));
        assert_eq!(msg.name.as_deref(), Some("echo"));
    }

    #[test]
    fn serde_skips_empty_optionals() {
        let msg = Message::user("hi");
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("tool_calls").is_none());
        assert!(json.get("tool_call_id").is_none());
        assert!(json.get("images").is_none());
        assert!(json.get("metadata").is_none());
    }

    #[test]
    fn metadata_tags_round_trip() {
        let mut msg = Message::system("summary");
        msg.metadata
            .insert("compaction".into(), serde_json::json!(true));

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["metadata"]["compaction"], true);

        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back.metadata.get("compaction"), Some(&serde_json::json!(true)));
    }

    #[test]
    fn roles_roundtrip_lowercase() {
        let json = serde_json::to_string(&Role::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
        let back: Role = serde_json::from_str("\"tool\"").unwrap();
        assert_eq!(back, Role::Tool);
    }
}
