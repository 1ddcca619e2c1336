use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use valet_domain::error::Result;

/// Telegram-style caption cap; overflow continues as a plain text message.
pub const CAPTION_CHUNK_LIMIT: usize = 1024;

/// Outbound text messages are chunked to this many characters.
pub const TEXT_CHUNK_LIMIT: usize = 4000;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lifecycle state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Channel lifecycle state machine.
///
/// `REGISTERED → STARTING → RUNNING → STOPPING → STOPPED`, with `ERROR`
/// reachable from any phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Registered,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A message received from a channel's transport, normalized.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub chat_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub text: String,
    pub message_id: String,
    pub reply_to: Option<String>,
    pub media: Vec<String>,
}

/// What outbound operations a channel supports.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ChannelCapabilities {
    pub text: bool,
    pub media: bool,
    pub payload: bool,
}

impl Default for ChannelCapabilities {
    fn default() -> Self {
        Self {
            text: true,
            media: false,
            payload: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Document,
    Audio,
    Video,
}

/// Handler installed by the channel manager; the plugin calls it for every
/// inbound message.
pub type MessageHandler = Arc<
    dyn Fn(InboundMessage) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync,
>;

/// Helper to build a [`MessageHandler`] from an async closure.
pub fn message_handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(InboundMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |msg| Box::pin(f(msg)))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Plugin trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A lifecycle-managed adapter for one chat transport.
///
/// Phase hooks are idempotent; the manager may call them again after an
/// error without harm. The plugin converts transport events into
/// [`InboundMessage`]s and hands them to the installed handler.
#[async_trait]
pub trait ChannelPlugin: Send + Sync {
    fn id(&self) -> &str;

    fn label(&self) -> &str;

    fn capabilities(&self) -> ChannelCapabilities {
        ChannelCapabilities::default()
    }

    /// One-time setup before the first start.
    async fn on_init(&self) -> Result<()> {
        Ok(())
    }

    /// Connect the transport using the channel's configuration map.
    async fn on_start(&self, config: &Value) -> Result<()>;

    /// Called once the transport is live.
    async fn on_ready(&self) -> Result<()> {
        Ok(())
    }

    /// Disconnect the transport.
    async fn on_stop(&self) -> Result<()>;

    /// Final teardown on unregistration.
    async fn on_destroy(&self) -> Result<()> {
        Ok(())
    }

    /// Install the inbound-message handler. Called by the manager before
    /// `on_start`.
    fn set_message_handler(&self, handler: MessageHandler);

    /// Send plain text. Returns the transport's message id.
    async fn send_text(
        &self,
        target: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<String>;

    /// Send media by URL with an optional caption.
    async fn send_media(
        &self,
        target: &str,
        url: &str,
        caption: Option<&str>,
        kind: Option<MediaKind>,
    ) -> Result<String>;

    /// Send a structured payload (buttons, multi-media). Channels without
    /// payload support may flatten to text.
    async fn send_payload(&self, target: &str, payload: &Value) -> Result<String>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Chunking
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Split a media caption at the vendor cap: the head rides as the caption,
/// overflow continues as a plain text message.
pub fn split_caption(text: &str) -> (String, Option<String>) {
    if text.chars().count() <= CAPTION_CHUNK_LIMIT {
        return (text.to_owned(), None);
    }
    let cut = text
        .char_indices()
        .nth(CAPTION_CHUNK_LIMIT)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    (text[..cut].to_owned(), Some(text[cut..].to_owned()))
}

/// Split text into chunks of at most `limit` characters, preferring line
/// breaks near the boundary.
pub fn chunk_text(text: &str, limit: usize) -> Vec<String> {
    if text.chars().count() <= limit {
        return vec![text.to_owned()];
    }

    let mut chunks = Vec::new();
    let mut remaining: &str = text;

    while remaining.chars().count() > limit {
        // Byte index of the character boundary at `limit` chars.
        let hard_cut = remaining
            .char_indices()
            .nth(limit)
            .map(|(i, _)| i)
            .unwrap_or(remaining.len());

        // Prefer the last newline in the window, if it is not too early.
        let cut = remaining[..hard_cut]
            .rfind('\n')
            .filter(|&i| i > hard_cut / 2)
            .map(|i| i + 1)
            .unwrap_or(hard_cut);

        chunks.push(remaining[..cut].to_owned());
        remaining = &remaining[cut..];
    }
    if !remaining.is_empty() {
        chunks.push(remaining.to_owned());
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(chunk_text("hello", 10), vec!["hello"]);
    }

    #[test]
    fn long_text_splits_under_limit() {
        let text = "a".repeat(9000);
        let chunks = chunk_text(&text, TEXT_CHUNK_LIMIT);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= TEXT_CHUNK_LIMIT));
        assert_eq!(chunks.join(""), text);
    }

    #[test]
    fn prefers_newline_boundaries() {
        let mut text = "x".repeat(3000);
        text.push('\n');
        text.push_str(&"y".repeat(2000));
        let chunks = chunk_text(&text, 4000);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].ends_with('\n'));
        assert!(chunks[1].starts_with('y'));
    }

    #[test]
    fn multibyte_text_splits_on_char_boundaries() {
        let text = "é".repeat(5000);
        let chunks = chunk_text(&text, 4000);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks.join(""), text);
    }

    #[test]
    fn short_caption_has_no_overflow() {
        let (caption, overflow) = split_caption("a deck for you");
        assert_eq!(caption, "a deck for you");
        assert!(overflow.is_none());
    }

    #[test]
    fn long_caption_overflows_into_text() {
        let text = "c".repeat(CAPTION_CHUNK_LIMIT + 500);
        let (caption, overflow) = split_caption(&text);
        assert_eq!(caption.chars().count(), CAPTION_CHUNK_LIMIT);
        assert_eq!(overflow.as_deref(), Some("c".repeat(500).as_str()));
    }

    #[test]
    fn multibyte_caption_splits_on_char_boundaries() {
        let text = "ü".repeat(CAPTION_CHUNK_LIMIT + 10);
        let (caption, overflow) = split_caption(&text);
        assert_eq!(caption.chars().count(), CAPTION_CHUNK_LIMIT);
        assert_eq!(overflow.unwrap().chars().count(), 10);
    }
}
