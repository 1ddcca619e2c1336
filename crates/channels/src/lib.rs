//! Channel plugins and their lifecycle manager.
//!
//! A channel plugin adapts one chat transport (Telegram, Discord, ...) to a
//! uniform lifecycle and messaging surface. The manager owns the plugin
//! instances, drives their state machine, routes inbound messages into an
//! agent runtime, and reports every transition on the event bus.

mod manager;
mod plugin;

pub use manager::{ChannelManager, ChannelStatus};
pub use plugin::{
    chunk_text, split_caption, ChannelCapabilities, ChannelPlugin, ChannelState, InboundMessage,
    MediaKind, MessageHandler, CAPTION_CHUNK_LIMIT, TEXT_CHUNK_LIMIT,
};
