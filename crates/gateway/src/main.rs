use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use valet_agent::{AgentRuntime, QueueManager, RuntimeConfig, ThinkingMode};
use valet_channels::ChannelManager;
use valet_domain::config::{load_config, Config};
use valet_events::EventBus;
use valet_gateway::methods::core_registry;
use valet_gateway::server::GatewayServer;
use valet_gateway::state::AppState;
use valet_gateway::wizard::WizardStore;
use valet_providers::auth::RotationManager;
use valet_sessions::SessionStore;
use valet_tools::{CurrentTimeTool, EchoTool, ReadFileTool, ToolRegistry, WriteFileTool};

#[derive(Debug, Parser)]
#[command(name = "valet", version, about = "Personal-assistant gateway")]
struct Cli {
    /// Path to the JSON5 configuration file.
    #[arg(long, default_value = "./valet.json5")]
    config: PathBuf,

    /// Override the gateway port from the config.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    // Fatal config errors (missing env vars, bad JSON, include cycles)
    // refuse startup; an absent file runs on defaults.
    let mut config = if cli.config.exists() {
        load_config(&cli.config)?
    } else {
        tracing::info!(path = %cli.config.display(), "no config file, using defaults");
        Config::default()
    };
    if let Some(port) = cli.port {
        config.gateway.port = port;
    }

    run_server(Arc::new(config), &cli.config).await
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,valet_gateway=debug")),
        )
        .init();
}

fn parse_thinking_mode(raw: &str) -> ThinkingMode {
    match raw {
        "on" => ThinkingMode::On,
        "stream" => ThinkingMode::Stream,
        "off" => ThinkingMode::Off,
        other => {
            tracing::warn!(mode = other, "unknown thinking mode, defaulting to off");
            ThinkingMode::Off
        }
    }
}

async fn run_server(config: Arc<Config>, config_path: &std::path::Path) -> anyhow::Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "valet starting");

    // ── Core services ────────────────────────────────────────────────
    let bus = Arc::new(EventBus::new());

    let workspace = PathBuf::from(&config.agents.defaults.workspace);
    std::fs::create_dir_all(&workspace)?;
    let sessions = Arc::new(SessionStore::new(&workspace)?);

    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(EchoTool));
    tools.register(Arc::new(CurrentTimeTool));
    tools.register(Arc::new(ReadFileTool::new(&workspace)));
    tools.register(Arc::new(WriteFileTool::new(&workspace)));

    let rotation = {
        let config_dir = config_path.parent().unwrap_or(std::path::Path::new("."));
        Arc::new(RotationManager::load(config_dir)?)
    };

    // ── Default agent runtime ────────────────────────────────────────
    let runtime_config = RuntimeConfig {
        model: config.agent.model.clone(),
        fallback_models: config.agent.fallback_models.clone(),
        thinking_mode: parse_thinking_mode(&config.agent.thinking),
        max_retries: config.agent.max_retries,
        ..Default::default()
    };
    let runtime = Arc::new(
        AgentRuntime::new(
            runtime_config,
            bus.clone(),
            sessions.clone(),
            Arc::new(tools),
            Arc::new(QueueManager::default()),
        )
        .with_rotation(rotation),
    );

    // ── Channels ─────────────────────────────────────────────────────
    let channels = ChannelManager::new(bus.clone(), Some(runtime.clone()));
    channels.subscribe_file_events();

    // Transport plugins (Telegram, Discord, ...) are registered by their
    // integration crates; the core only reports what the config enables.
    for (name, section) in &config.channels {
        if section.enabled {
            tracing::info!(
                channel = %name,
                dm_policy = %section.dm_policy,
                "channel enabled in config, waiting for plugin registration"
            );
        }
    }

    // ── Gateway ──────────────────────────────────────────────────────
    let state = AppState {
        config: config.clone(),
        bus,
        sessions,
        runtime,
        channels: channels.clone(),
        methods: Arc::new(core_registry()),
        wizards: Arc::new(WizardStore::new()),
        started_at: Instant::now(),
    };

    let server = GatewayServer::new(state);

    let start_results = channels.start_all().await;
    let started = start_results.values().filter(|ok| **ok).count();
    tracing::info!(
        started,
        registered = start_results.len(),
        "channel startup complete"
    );

    let result = server.serve().await;

    channels.stop_all().await;
    result
}
