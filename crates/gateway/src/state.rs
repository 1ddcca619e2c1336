use std::sync::Arc;
use std::time::Instant;

use valet_agent::AgentRuntime;
use valet_channels::ChannelManager;
use valet_domain::config::Config;
use valet_events::EventBus;
use valet_sessions::SessionStore;

use crate::methods::MethodRegistry;
use crate::wizard::WizardStore;

/// Shared application state handed to every method handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub bus: Arc<EventBus>,
    pub sessions: Arc<SessionStore>,
    /// The default agent runtime; channels may bind their own.
    pub runtime: Arc<AgentRuntime>,
    pub channels: Arc<ChannelManager>,
    pub methods: Arc<MethodRegistry>,
    pub wizards: Arc<WizardStore>,
    pub started_at: Instant,
}
