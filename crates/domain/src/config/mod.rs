//! Configuration schema and loader.
//!
//! The config file is a single JSON5 document. Loading happens in three
//! passes: parse, `@include` resolution (deep merge), then `${VAR}` env
//! substitution. Any failure is fatal at startup.

mod env;
mod includes;
mod loader;

pub use env::resolve_env_vars;
pub use includes::resolve_includes;
pub use loader::{load_config, load_config_value};

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub agents: AgentsSection,
    /// Per-channel configuration, keyed by channel id ("telegram", ...).
    #[serde(default)]
    pub channels: HashMap<String, ChannelSection>,
    #[serde(default)]
    pub tools: ToolsSection,
    #[serde(default)]
    pub skills: TogglesSection,
    #[serde(default)]
    pub plugins: TogglesSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSection {
    /// Active model as "provider/model".
    #[serde(default = "d_model")]
    pub model: String,
    /// Thinking extraction mode: "off", "on", or "stream".
    #[serde(default = "d_thinking")]
    pub thinking: String,
    #[serde(default)]
    pub verbose: bool,
    /// Ordered fallback model ids tried on failover-eligible errors.
    #[serde(default)]
    pub fallback_models: Vec<String>,
    #[serde(default = "d_max_retries")]
    pub max_retries: u32,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            model: d_model(),
            thinking: d_thinking(),
            verbose: false,
            fallback_models: Vec::new(),
            max_retries: d_max_retries(),
        }
    }
}

fn d_model() -> String {
    "anthropic/claude-sonnet-4".into()
}

fn d_thinking() -> String {
    "off".into()
}

fn d_max_retries() -> u32 {
    3
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Gateway
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySection {
    #[serde(default = "d_port")]
    pub port: u16,
    /// "loopback", "lan", or "auto".
    #[serde(default = "d_bind")]
    pub bind: String,
    /// "local" or "remote".
    #[serde(default = "d_mode")]
    pub mode: String,
    #[serde(default)]
    pub auth: GatewayAuthSection,
    #[serde(default)]
    pub enable_web_ui: bool,
    #[serde(default = "d_web_ui_port")]
    pub web_ui_port: u16,
    #[serde(default = "d_web_ui_base_path")]
    pub web_ui_base_path: String,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            port: d_port(),
            bind: d_bind(),
            mode: d_mode(),
            auth: GatewayAuthSection::default(),
            enable_web_ui: false,
            web_ui_port: d_web_ui_port(),
            web_ui_base_path: d_web_ui_base_path(),
        }
    }
}

fn d_port() -> u16 {
    18789
}

fn d_bind() -> String {
    "loopback".into()
}

fn d_mode() -> String {
    "local".into()
}

fn d_web_ui_port() -> u16 {
    18790
}

fn d_web_ui_base_path() -> String {
    "/".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayAuthSection {
    /// "token", "password", or "none".
    #[serde(default = "d_auth_mode")]
    pub mode: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for GatewayAuthSection {
    fn default() -> Self {
        Self {
            mode: d_auth_mode(),
            token: None,
            password: None,
        }
    }
}

fn d_auth_mode() -> String {
    "none".into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agents
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AgentsSection {
    #[serde(default)]
    pub defaults: AgentDefaults,
    #[serde(default)]
    pub agents: Vec<AgentOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDefaults {
    #[serde(default = "d_workspace")]
    pub workspace: String,
    #[serde(default)]
    pub agent_dir: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            workspace: d_workspace(),
            agent_dir: None,
            model: None,
            tools: Vec::new(),
        }
    }
}

fn d_workspace() -> String {
    "./workspace".into()
}

/// Per-agent overrides layered on top of [`AgentDefaults`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AgentOverride {
    pub id: String,
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub tools: Option<Vec<String>>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Channels
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: Option<String>,
    /// "open", "pairing", or "allowlist".
    #[serde(default = "d_dm_policy")]
    pub dm_policy: String,
    #[serde(default)]
    pub allow_from: Vec<String>,
    /// Channel-specific extras passed through to the plugin verbatim.
    #[serde(default, flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl Default for ChannelSection {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token: None,
            dm_policy: d_dm_policy(),
            allow_from: Vec::new(),
            extra: HashMap::new(),
        }
    }
}

fn d_dm_policy() -> String {
    "pairing".into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsSection {
    /// "full", "coding", "messaging", or "minimal".
    #[serde(default = "d_tools_profile")]
    pub profile: String,
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
    #[serde(default)]
    pub exec: ExecSection,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            profile: d_tools_profile(),
            allow: Vec::new(),
            deny: Vec::new(),
            exec: ExecSection::default(),
        }
    }
}

fn d_tools_profile() -> String {
    "full".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecSection {
    #[serde(default)]
    pub host: Option<String>,
    /// "full", "allowlist", or "deny".
    #[serde(default = "d_exec_security")]
    pub security: String,
    #[serde(default)]
    pub ask: bool,
    #[serde(default)]
    pub safe_bins: Vec<String>,
    #[serde(default)]
    pub path_prepend: Option<String>,
    #[serde(default = "d_exec_timeout")]
    pub timeout_sec: u64,
}

impl Default for ExecSection {
    fn default() -> Self {
        Self {
            host: None,
            security: d_exec_security(),
            ask: false,
            safe_bins: Vec::new(),
            path_prepend: None,
            timeout_sec: d_exec_timeout(),
        }
    }
}

fn d_exec_security() -> String {
    "allowlist".into()
}

fn d_exec_timeout() -> u64 {
    60
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Enable/disable lists + logging
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TogglesSection {
    #[serde(default)]
    pub enable: Vec<String>,
    #[serde(default)]
    pub disable: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingSection {
    #[serde(default = "d_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<String>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: d_log_level(),
            file: None,
        }
    }
}

fn d_log_level() -> String {
    "info".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.gateway.port, 18789);
        assert_eq!(config.gateway.bind, "loopback");
        assert_eq!(config.gateway.auth.mode, "none");
        assert_eq!(config.agent.max_retries, 3);
        assert_eq!(config.agent.thinking, "off");
    }

    #[test]
    fn channel_section_accepts_extras() {
        let raw = r#"{ "enabled": true, "botToken": "t", "webhookUrl": "https://x" }"#;
        let section: ChannelSection = serde_json::from_str(raw).unwrap();
        assert!(section.enabled);
        assert_eq!(section.bot_token.as_deref(), Some("t"));
        assert!(section.extra.contains_key("webhookUrl"));
    }

    #[test]
    fn json5_document_parses() {
        let raw = r#"{
            // comments are allowed
            gateway: { port: 19000, bind: "lan" },
            agent: { model: "openai/gpt-4o" },
        }"#;
        let config: Config = json5::from_str(raw).unwrap();
        assert_eq!(config.gateway.port, 19000);
        assert_eq!(config.agent.model, "openai/gpt-4o");
    }
}
