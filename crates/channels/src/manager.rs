use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};

use valet_agent::{AgentRuntime, TurnRequest};
use valet_domain::error::{Error, Result};
use valet_events::{Event, EventBus, EventKind};

use crate::plugin::{
    chunk_text, message_handler, split_caption, ChannelPlugin, ChannelState, InboundMessage,
    MediaKind, MessageHandler, TEXT_CHUNK_LIMIT,
};

const SOURCE: &str = "channel-manager";

/// How much of an error message is relayed back to the user.
const ERROR_REPLY_LIMIT: usize = 100;

type PluginFactory = Arc<dyn Fn() -> Arc<dyn ChannelPlugin> + Send + Sync>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Channel entry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ChannelEntry {
    /// Lazy constructor; used when no instance exists yet.
    factory: Option<PluginFactory>,
    instance: Option<Arc<dyn ChannelPlugin>>,
    initialized: bool,
    config: Value,
    enabled: bool,
    state: ChannelState,
    runtime: Option<Arc<AgentRuntime>>,
    custom_handler: Option<MessageHandler>,
    started_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl ChannelEntry {
    fn new(factory: Option<PluginFactory>, instance: Option<Arc<dyn ChannelPlugin>>) -> Self {
        Self {
            factory,
            instance,
            initialized: false,
            config: Value::Object(Default::default()),
            enabled: true,
            state: ChannelState::Registered,
            runtime: None,
            custom_handler: None,
            started_at: None,
            last_error: None,
        }
    }
}

/// Operator-facing view of one channel.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub channel_id: String,
    pub label: Option<String>,
    pub enabled: bool,
    pub state: ChannelState,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub has_custom_runtime: bool,
    pub has_custom_handler: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Channel manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Owns channel plugin instances, drives their lifecycle, and routes
/// inbound messages into the bound agent runtime.
pub struct ChannelManager {
    bus: Arc<EventBus>,
    default_runtime: Option<Arc<AgentRuntime>>,
    channels: Mutex<HashMap<String, ChannelEntry>>,
}

impl ChannelManager {
    pub fn new(bus: Arc<EventBus>, default_runtime: Option<Arc<AgentRuntime>>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            default_runtime,
            channels: Mutex::new(HashMap::new()),
        })
    }

    async fn publish(&self, kind: EventKind, channel_id: &str, data: Value) {
        self.bus
            .publish(
                Event::new(kind, SOURCE)
                    .with_channel(channel_id)
                    .with_data(data),
            )
            .await;
    }

    // ── Registration ───────────────────────────────────────────────

    /// Register a plugin factory for lazy instantiation.
    pub async fn register<F>(
        &self,
        channel_id: &str,
        factory: F,
        config: Value,
        runtime: Option<Arc<AgentRuntime>>,
    ) where
        F: Fn() -> Arc<dyn ChannelPlugin> + Send + Sync + 'static,
    {
        {
            let mut channels = self.channels.lock();
            let mut entry = ChannelEntry::new(Some(Arc::new(factory)), None);
            entry.config = config;
            entry.runtime = runtime;
            if channels.insert(channel_id.to_owned(), entry).is_some() {
                tracing::warn!(channel_id, "channel already registered, replacing");
            }
        }
        tracing::info!(channel_id, "channel registered");
        self.publish(EventKind::ChannelRegistered, channel_id, json!({}))
            .await;
    }

    /// Register a prebuilt plugin instance.
    pub async fn register_instance(
        &self,
        plugin: Arc<dyn ChannelPlugin>,
        config: Value,
        runtime: Option<Arc<AgentRuntime>>,
    ) {
        let channel_id = plugin.id().to_owned();
        {
            let mut channels = self.channels.lock();
            let mut entry = ChannelEntry::new(None, Some(plugin));
            entry.config = config;
            entry.runtime = runtime;
            if channels.insert(channel_id.clone(), entry).is_some() {
                tracing::warn!(channel_id = %channel_id, "channel already registered, replacing");
            }
        }
        tracing::info!(channel_id = %channel_id, "channel instance registered");
        self.publish(EventKind::ChannelRegistered, &channel_id, json!({}))
            .await;
    }

    /// Stop (if running) and remove a channel. Returns whether it existed.
    pub async fn unregister(self: &Arc<Self>, channel_id: &str) -> bool {
        let state = {
            let channels = self.channels.lock();
            match channels.get(channel_id) {
                Some(entry) => entry.state,
                None => return false,
            }
        };
        if state == ChannelState::Running || state == ChannelState::Starting {
            let _ = self.stop_channel(channel_id).await;
        }

        let instance = {
            let mut channels = self.channels.lock();
            channels.remove(channel_id).and_then(|e| e.instance)
        };
        if let Some(instance) = instance {
            if let Err(e) = instance.on_destroy().await {
                tracing::warn!(channel_id, error = %e, "channel destroy hook failed");
            }
        }
        self.publish(EventKind::ChannelUnregistered, channel_id, json!({}))
            .await;
        true
    }

    // ── Configuration ──────────────────────────────────────────────

    /// Update a channel's config map. `merge` merges top-level keys;
    /// otherwise the map is replaced. An `enabled` key toggles the channel.
    pub fn configure(&self, channel_id: &str, config: Value, merge: bool) -> Result<()> {
        let mut channels = self.channels.lock();
        let entry = channels
            .get_mut(channel_id)
            .ok_or_else(|| Error::Channel(format!("channel not registered: {channel_id}")))?;

        if let Some(enabled) = config.get("enabled").and_then(|v| v.as_bool()) {
            entry.enabled = enabled;
        }

        if merge {
            if let (Value::Object(existing), Value::Object(incoming)) =
                (&mut entry.config, config)
            {
                for (key, value) in incoming {
                    existing.insert(key, value);
                }
            }
        } else {
            entry.config = config;
        }
        Ok(())
    }

    /// Bind a channel to its own agent runtime.
    pub fn set_runtime(&self, channel_id: &str, runtime: Arc<AgentRuntime>) -> Result<()> {
        let mut channels = self.channels.lock();
        let entry = channels
            .get_mut(channel_id)
            .ok_or_else(|| Error::Channel(format!("channel not registered: {channel_id}")))?;
        entry.runtime = Some(runtime);
        Ok(())
    }

    /// Override the default routing handler for a channel.
    pub fn set_message_handler(&self, channel_id: &str, handler: MessageHandler) -> Result<()> {
        let mut channels = self.channels.lock();
        let entry = channels
            .get_mut(channel_id)
            .ok_or_else(|| Error::Channel(format!("channel not registered: {channel_id}")))?;
        entry.custom_handler = Some(handler);
        Ok(())
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Start one channel. Running channels are a no-op; a channel in error
    /// passes through the stop path first.
    pub async fn start_channel(self: &Arc<Self>, channel_id: &str) -> bool {
        // Phase 0: inspect state, resolve the instance.
        let (instance, config, needs_init) = {
            let mut channels = self.channels.lock();
            let Some(entry) = channels.get_mut(channel_id) else {
                tracing::warn!(channel_id, "cannot start unknown channel");
                return false;
            };
            if !entry.enabled {
                tracing::debug!(channel_id, "channel disabled, skipping start");
                return false;
            }
            match entry.state {
                ChannelState::Running | ChannelState::Starting => return true,
                _ => {}
            }

            if entry.instance.is_none() {
                match &entry.factory {
                    Some(factory) => entry.instance = Some(factory()),
                    None => {
                        tracing::error!(channel_id, "no plugin instance or factory");
                        return false;
                    }
                }
            }
            (
                entry.instance.clone().expect("instance just ensured"),
                entry.config.clone(),
                !entry.initialized,
            )
        };

        // Error state implicitly transitions through the stop path.
        let was_error = {
            let channels = self.channels.lock();
            channels
                .get(channel_id)
                .is_some_and(|e| e.state == ChannelState::Error)
        };
        if was_error {
            self.set_state(channel_id, ChannelState::Stopping);
            self.publish(EventKind::ChannelStopping, channel_id, json!({})).await;
            if let Err(e) = instance.on_stop().await {
                tracing::debug!(channel_id, error = %e, "stop during error recovery failed");
            }
            self.set_state(channel_id, ChannelState::Stopped);
            self.publish(EventKind::ChannelStopped, channel_id, json!({})).await;
        }

        self.set_state(channel_id, ChannelState::Starting);
        self.publish(EventKind::ChannelStarting, channel_id, json!({}))
            .await;

        let result: Result<()> = async {
            if needs_init {
                instance.on_init().await?;
                if let Some(entry) = self.channels.lock().get_mut(channel_id) {
                    entry.initialized = true;
                }
            }
            instance.set_message_handler(self.routing_handler(channel_id));
            instance.on_start(&config).await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                {
                    let mut channels = self.channels.lock();
                    if let Some(entry) = channels.get_mut(channel_id) {
                        entry.state = ChannelState::Running;
                        entry.started_at = Some(Utc::now());
                        entry.last_error = None;
                    }
                }
                tracing::info!(channel_id, "channel started");
                self.publish(EventKind::ChannelStarted, channel_id, json!({}))
                    .await;

                if let Err(e) = instance.on_ready().await {
                    tracing::warn!(channel_id, error = %e, "channel ready hook failed");
                } else {
                    self.publish(EventKind::ChannelReady, channel_id, json!({}))
                        .await;
                }
                true
            }
            Err(e) => {
                let message = e.to_string();
                {
                    let mut channels = self.channels.lock();
                    if let Some(entry) = channels.get_mut(channel_id) {
                        entry.state = ChannelState::Error;
                        entry.last_error = Some(message.clone());
                    }
                }
                tracing::error!(channel_id, error = %message, "channel failed to start");
                self.publish(
                    EventKind::ChannelError,
                    channel_id,
                    json!({"error": message}),
                )
                .await;
                false
            }
        }
    }

    /// Stop one channel. Transitions out of RUNNING always pass STOPPING.
    pub async fn stop_channel(self: &Arc<Self>, channel_id: &str) -> bool {
        let instance = {
            let channels = self.channels.lock();
            match channels.get(channel_id) {
                Some(entry) => match entry.instance.clone() {
                    Some(instance) => instance,
                    None => return false,
                },
                None => return false,
            }
        };

        self.set_state(channel_id, ChannelState::Stopping);
        self.publish(EventKind::ChannelStopping, channel_id, json!({}))
            .await;

        match instance.on_stop().await {
            Ok(()) => {
                self.set_state(channel_id, ChannelState::Stopped);
                tracing::info!(channel_id, "channel stopped");
                self.publish(EventKind::ChannelStopped, channel_id, json!({}))
                    .await;
                true
            }
            Err(e) => {
                let message = e.to_string();
                {
                    let mut channels = self.channels.lock();
                    if let Some(entry) = channels.get_mut(channel_id) {
                        entry.state = ChannelState::Error;
                        entry.last_error = Some(message.clone());
                    }
                }
                tracing::error!(channel_id, error = %message, "channel failed to stop");
                self.publish(
                    EventKind::ChannelError,
                    channel_id,
                    json!({"error": message}),
                )
                .await;
                false
            }
        }
    }

    pub async fn restart_channel(self: &Arc<Self>, channel_id: &str) -> bool {
        self.stop_channel(channel_id).await;
        self.start_channel(channel_id).await
    }

    /// Start every enabled channel; one failure does not abort the rest.
    pub async fn start_all(self: &Arc<Self>) -> HashMap<String, bool> {
        let ids: Vec<String> = {
            let channels = self.channels.lock();
            channels
                .iter()
                .filter(|(_, e)| e.enabled)
                .map(|(id, _)| id.clone())
                .collect()
        };

        let mut results = HashMap::new();
        for id in ids {
            let ok = self.start_channel(&id).await;
            results.insert(id, ok);
        }
        results
    }

    /// Stop every running channel.
    pub async fn stop_all(self: &Arc<Self>) {
        let ids: Vec<String> = {
            let channels = self.channels.lock();
            channels
                .iter()
                .filter(|(_, e)| e.state == ChannelState::Running)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in ids {
            self.stop_channel(&id).await;
        }
    }

    fn set_state(&self, channel_id: &str, state: ChannelState) {
        let mut channels = self.channels.lock();
        if let Some(entry) = channels.get_mut(channel_id) {
            entry.state = state;
        }
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn list_channels(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.channels.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn list_running(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .channels
            .lock()
            .iter()
            .filter(|(_, e)| e.state == ChannelState::Running)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn list_enabled(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .channels
            .lock()
            .iter()
            .filter(|(_, e)| e.enabled)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn status(&self, channel_id: &str) -> Option<ChannelStatus> {
        let channels = self.channels.lock();
        let entry = channels.get(channel_id)?;
        Some(ChannelStatus {
            channel_id: channel_id.to_owned(),
            label: entry.instance.as_ref().map(|i| i.label().to_owned()),
            enabled: entry.enabled,
            state: entry.state,
            started_at: entry.started_at,
            last_error: entry.last_error.clone(),
            has_custom_runtime: entry.runtime.is_some(),
            has_custom_handler: entry.custom_handler.is_some(),
        })
    }

    pub fn all_status(&self) -> Vec<ChannelStatus> {
        self.list_channels()
            .into_iter()
            .filter_map(|id| self.status(&id))
            .collect()
    }

    pub fn state_of(&self, channel_id: &str) -> Option<ChannelState> {
        self.channels.lock().get(channel_id).map(|e| e.state)
    }

    // ── Routing ────────────────────────────────────────────────────

    /// The handler installed into a plugin at start. Captures the channel
    /// id, not the entry, so reconfiguration is visible immediately.
    fn routing_handler(self: &Arc<Self>, channel_id: &str) -> MessageHandler {
        let manager = Arc::downgrade(self);
        let channel_id = channel_id.to_owned();
        message_handler(move |msg: InboundMessage| {
            let manager = manager.clone();
            let channel_id = channel_id.clone();
            async move {
                if let Some(manager) = manager.upgrade() {
                    manager.route_inbound(&channel_id, msg).await;
                }
            }
        })
    }

    async fn route_inbound(self: &Arc<Self>, channel_id: &str, msg: InboundMessage) {
        let (custom_handler, runtime, instance) = {
            let channels = self.channels.lock();
            let Some(entry) = channels.get(channel_id) else {
                tracing::error!(channel_id, "inbound message for unknown channel");
                return;
            };
            (
                entry.custom_handler.clone(),
                entry
                    .runtime
                    .clone()
                    .or_else(|| self.default_runtime.clone()),
                entry.instance.clone(),
            )
        };

        if let Some(handler) = custom_handler {
            handler(msg).await;
            return;
        }

        let Some(runtime) = runtime else {
            tracing::error!(channel_id, "no agent runtime bound for channel");
            return;
        };
        let Some(instance) = instance else {
            tracing::error!(channel_id, "channel has no instance");
            return;
        };

        tracing::info!(
            channel_id,
            sender = %msg.sender_name,
            chat_id = %msg.chat_id,
            "inbound message"
        );

        let session_id = format!("{channel_id}-{}", msg.chat_id);
        let request = TurnRequest {
            session_id,
            message: msg.text.clone(),
            images: msg.media.clone(),
            ..Default::default()
        };

        match runtime.run_turn(request).await {
            Ok(outcome) if !outcome.text.is_empty() => {
                let mut reply_to = msg.reply_to_hint();
                for chunk in chunk_text(&outcome.text, TEXT_CHUNK_LIMIT) {
                    if let Err(e) = instance
                        .send_text(&msg.chat_id, &chunk, reply_to.as_deref())
                        .await
                    {
                        tracing::error!(channel_id, error = %e, "failed to send reply");
                        break;
                    }
                    reply_to = None;
                }
            }
            Ok(_) => {}
            Err(e) => {
                let mut message = e.to_string();
                message.truncate(
                    message
                        .char_indices()
                        .nth(ERROR_REPLY_LIMIT)
                        .map(|(i, _)| i)
                        .unwrap_or(message.len()),
                );
                let _ = instance
                    .send_text(
                        &msg.chat_id,
                        &format!("Sorry, I encountered an error: {message}"),
                        None,
                    )
                    .await;
            }
        }
    }

    // ── File auto-send ─────────────────────────────────────────────

    /// Subscribe to `agent.file_generated` and forward generated files to
    /// the originating chat, resolved from the session id convention
    /// `<channel_id>-<chat_id>`.
    pub fn subscribe_file_events(self: &Arc<Self>) {
        let manager = Arc::downgrade(self);
        self.bus.subscribe(
            Some(EventKind::AgentFileGenerated),
            move |event: Event| {
                let manager = manager.clone();
                async move {
                    let Some(manager) = manager.upgrade() else {
                        return Ok(());
                    };
                    let Some(session_id) = event.session_id.as_deref() else {
                        return Ok(());
                    };
                    let Some((channel_id, chat_id)) = session_id.split_once('-') else {
                        return Ok(());
                    };

                    let instance = {
                        let channels = manager.channels.lock();
                        channels.get(channel_id).and_then(|e| {
                            (e.state == ChannelState::Running)
                                .then(|| e.instance.clone())
                                .flatten()
                        })
                    };
                    let Some(instance) = instance else {
                        return Ok(());
                    };

                    let Some(file_path) = event.data.get("file_path").and_then(|v| v.as_str())
                    else {
                        return Ok(());
                    };
                    // Captions are capped at the vendor limit; overflow
                    // continues as a plain text message.
                    let (caption, overflow) = match event
                        .data
                        .get("caption")
                        .and_then(|v| v.as_str())
                    {
                        Some(text) => {
                            let (head, overflow) = split_caption(text);
                            (Some(head), overflow)
                        }
                        None => (None, None),
                    };
                    let kind = match event.data.get("file_type").and_then(|v| v.as_str()) {
                        Some("png" | "jpg" | "jpeg" | "gif" | "webp") => Some(MediaKind::Image),
                        Some("mp3" | "ogg" | "wav") => Some(MediaKind::Audio),
                        Some("mp4" | "webm") => Some(MediaKind::Video),
                        Some(_) => Some(MediaKind::Document),
                        None => None,
                    };

                    instance
                        .send_media(chat_id, file_path, caption.as_deref(), kind)
                        .await?;
                    if let Some(overflow) = overflow {
                        for chunk in chunk_text(&overflow, TEXT_CHUNK_LIMIT) {
                            instance.send_text(chat_id, &chunk, None).await?;
                        }
                    }
                    Ok(())
                }
            },
        );
    }
}

impl InboundMessage {
    fn reply_to_hint(&self) -> Option<String> {
        if self.message_id.is_empty() {
            None
        } else {
            Some(self.message_id.clone())
        }
    }
}
