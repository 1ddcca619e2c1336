use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of event types flowing over the bus.
///
/// Serialized as the dotted wire string (e.g. `"agent.text"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "agent.started")]
    AgentStarted,
    #[serde(rename = "agent.text")]
    AgentText,
    #[serde(rename = "agent.thinking")]
    AgentThinking,
    #[serde(rename = "agent.tool_use")]
    AgentToolUse,
    #[serde(rename = "agent.tool_result")]
    AgentToolResult,
    #[serde(rename = "agent.turn_complete")]
    AgentTurnComplete,
    #[serde(rename = "agent.error")]
    AgentError,
    #[serde(rename = "agent.retry")]
    AgentRetry,
    #[serde(rename = "agent.failover")]
    AgentFailover,
    #[serde(rename = "agent.compaction")]
    AgentCompaction,
    #[serde(rename = "agent.file_generated")]
    AgentFileGenerated,

    #[serde(rename = "channel.registered")]
    ChannelRegistered,
    #[serde(rename = "channel.unregistered")]
    ChannelUnregistered,
    #[serde(rename = "channel.starting")]
    ChannelStarting,
    #[serde(rename = "channel.started")]
    ChannelStarted,
    #[serde(rename = "channel.ready")]
    ChannelReady,
    #[serde(rename = "channel.stopping")]
    ChannelStopping,
    #[serde(rename = "channel.stopped")]
    ChannelStopped,
    #[serde(rename = "channel.error")]
    ChannelError,

    #[serde(rename = "session.created")]
    SessionCreated,

    #[serde(rename = "gateway.client_connected")]
    GatewayClientConnected,
}

impl EventKind {
    /// The dotted wire string for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::AgentStarted => "agent.started",
            EventKind::AgentText => "agent.text",
            EventKind::AgentThinking => "agent.thinking",
            EventKind::AgentToolUse => "agent.tool_use",
            EventKind::AgentToolResult => "agent.tool_result",
            EventKind::AgentTurnComplete => "agent.turn_complete",
            EventKind::AgentError => "agent.error",
            EventKind::AgentRetry => "agent.retry",
            EventKind::AgentFailover => "agent.failover",
            EventKind::AgentCompaction => "agent.compaction",
            EventKind::AgentFileGenerated => "agent.file_generated",
            EventKind::ChannelRegistered => "channel.registered",
            EventKind::ChannelUnregistered => "channel.unregistered",
            EventKind::ChannelStarting => "channel.starting",
            EventKind::ChannelStarted => "channel.started",
            EventKind::ChannelReady => "channel.ready",
            EventKind::ChannelStopping => "channel.stopping",
            EventKind::ChannelStopped => "channel.stopped",
            EventKind::ChannelError => "channel.error",
            EventKind::SessionCreated => "session.created",
            EventKind::GatewayClientConnected => "gateway.client_connected",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable event record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl Event {
    pub fn new(kind: EventKind, source: impl Into<String>) -> Self {
        Self {
            kind,
            source: source.into(),
            timestamp: Utc::now(),
            session_id: None,
            channel_id: None,
            data: Value::Object(Default::default()),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = Some(channel_id.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Serialize to a JSON object for wire transport.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
