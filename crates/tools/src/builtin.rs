//! Built-in tools.
//!
//! The interesting tools (shell, browser, image analysis) live outside the
//! core; these cover testing and basic workspace file access.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value};

use valet_domain::message::ToolResult;

use crate::AgentTool;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// echo
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Returns its input. Exists for wiring tests and provider smoke checks.
pub struct EchoTool;

#[async_trait]
impl AgentTool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the provided text back unchanged."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": { "type": "string", "description": "Text to echo" }
            },
            "required": ["text"]
        })
    }

    async fn execute(&self, args: Value) -> ToolResult {
        match args.get("text").and_then(|v| v.as_str()) {
            Some(text) => ToolResult::ok(text),
            None => ToolResult::fail("missing required argument: text"),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// current_time
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct CurrentTimeTool;

#[async_trait]
impl AgentTool for CurrentTimeTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Get the current UTC time as an RFC 3339 string."
    }

    fn schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _args: Value) -> ToolResult {
        ToolResult::ok(chrono::Utc::now().to_rfc3339())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Workspace file tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Resolve a relative path inside the workspace, rejecting escapes.
fn resolve_in_workspace(workspace: &Path, relative: &str) -> Result<PathBuf, String> {
    if Path::new(relative).is_absolute() {
        return Err("path must be relative to the workspace".into());
    }
    let joined = workspace.join(relative);
    // Normalize without requiring the file to exist yet.
    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            std::path::Component::ParentDir => {
                if !normalized.pop() {
                    return Err("path escapes the workspace".into());
                }
            }
            std::path::Component::CurDir => {}
            other => normalized.push(other),
        }
    }
    if !normalized.starts_with(workspace) {
        return Err("path escapes the workspace".into());
    }
    Ok(normalized)
}

/// Read a text file from the workspace.
pub struct ReadFileTool {
    workspace: PathBuf,
}

impl ReadFileTool {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
        }
    }
}

#[async_trait]
impl AgentTool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a UTF-8 text file from the agent workspace."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Workspace-relative path" }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let Some(rel) = args.get("path").and_then(|v| v.as_str()) else {
            return ToolResult::fail("missing required argument: path");
        };
        let path = match resolve_in_workspace(&self.workspace, rel) {
            Ok(p) => p,
            Err(e) => return ToolResult::fail(e),
        };
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => ToolResult::ok(content),
            Err(e) => ToolResult::fail(format!("cannot read {rel}: {e}")),
        }
    }
}

/// Write a text file into the workspace. Reports the written file as a
/// generated-file descriptor so channels can forward it to the user.
pub struct WriteFileTool {
    workspace: PathBuf,
}

impl WriteFileTool {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
        }
    }
}

#[async_trait]
impl AgentTool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write a UTF-8 text file into the agent workspace."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Workspace-relative path" },
                "content": { "type": "string", "description": "File content" }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let Some(rel) = args.get("path").and_then(|v| v.as_str()) else {
            return ToolResult::fail("missing required argument: path");
        };
        let Some(content) = args.get("content").and_then(|v| v.as_str()) else {
            return ToolResult::fail("missing required argument: content");
        };
        let path = match resolve_in_workspace(&self.workspace, rel) {
            Ok(p) => p,
            Err(e) => return ToolResult::fail(e),
        };
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return ToolResult::fail(format!("cannot create {}: {e}", parent.display()));
            }
        }
        match tokio::fs::write(&path, content).await {
            Ok(()) => {
                let file_type = path
                    .extension()
                    .map(|e| e.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "txt".into());
                ToolResult::ok(format!("wrote {} bytes to {rel}", content.len())).with_metadata(
                    json!({
                        "file_path": path.display().to_string(),
                        "file_type": file_type,
                    }),
                )
            }
            Err(e) => ToolResult::fail(format!("cannot write {rel}: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_round_trip() {
        let result = EchoTool.execute(json!({"text": "hello"})).await;
        assert!(result.success);
        assert_eq!(result.content, "hello");
    }

    #[tokio::test]
    async fn echo_requires_text() {
        let result = EchoTool.execute(json!({})).await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn write_then_read_file() {
        let dir = tempfile::tempdir().unwrap();
        let write = WriteFileTool::new(dir.path());
        let read = ReadFileTool::new(dir.path());

        let result = write
            .execute(json!({"path": "notes/a.txt", "content": "data"}))
            .await;
        assert!(result.success, "{:?}", result.error);
        // The written file surfaces as a generated-file descriptor.
        let meta = result.metadata.unwrap();
        assert!(meta["file_path"].as_str().unwrap().ends_with("a.txt"));
        assert_eq!(meta["file_type"], "txt");

        let result = read.execute(json!({"path": "notes/a.txt"})).await;
        assert!(result.success);
        assert_eq!(result.content, "data");
    }

    #[tokio::test]
    async fn path_escape_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let read = ReadFileTool::new(dir.path());

        let result = read.execute(json!({"path": "../../etc/passwd"})).await;
        assert!(!result.success);

        let result = read.execute(json!({"path": "/etc/passwd"})).await;
        assert!(!result.success);
    }
}
