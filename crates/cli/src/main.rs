use std::{path::PathBuf, sync::Arc};

use {
    clap::{Parser, Subcommand},
    tokio_util::sync::CancellationToken,
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use {
    reverb_config::ReverbConfig,
    reverb_pubsub::{PubSubProvider, memory::{MemoryHub, MemoryProvider}},
};

#[derive(Parser)]
#[command(name = "reverb", about = "Reverb — realtime WebSocket message broker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Address to bind to (overrides config value).
    #[arg(long, global = true)]
    host: Option<String>,

    /// Port to listen on (overrides config value).
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Config file to load (overrides discovery).
    #[arg(long, global = true, env = "REVERB_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the broker (default when no subcommand is provided).
    Start,
    /// Configuration helpers.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the resolved configuration.
    Show,
    /// Print the config file path in use.
    Path,
}

fn init_tracing(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

/// Resolve config: file (explicit or discovered), then `REVERB_*`
/// environment overrides, then CLI flags.
fn load_config(cli: &Cli) -> anyhow::Result<ReverbConfig> {
    let mut config = match &cli.config {
        Some(path) => reverb_config::load_config(path)?,
        None => reverb_config::discover_and_load(),
    };
    reverb_config::apply_env_overrides(&mut config);
    if let Some(host) = &cli.host {
        config.server.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    Ok(config)
}

async fn start(cli: &Cli) -> anyhow::Result<()> {
    let config = load_config(cli)?;
    if config.apps.apps.is_empty() {
        anyhow::bail!(
            "no applications configured; add an [[apps.apps]] record or set REVERB_APP_ID/KEY/SECRET"
        );
    }

    let bus: Option<Arc<dyn PubSubProvider>> = if config.server.scaling.enabled {
        // The in-process hub spans one process only; a networked transport
        // slots in behind the same trait.
        info!(channel = %config.server.scaling.channel, "scaling enabled");
        Some(MemoryProvider::new(&MemoryHub::new()))
    } else {
        None
    };

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal.cancel();
        }
    });

    reverb_gateway::server::serve(config, bus, shutdown).await
}

fn config_command(cli: &Cli, action: &ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let config = load_config(cli)?;
            println!("{}", toml::to_string_pretty(&config)?);
        },
        ConfigAction::Path => match &cli.config {
            Some(path) => println!("{}", path.display()),
            None => match reverb_config::loader::find_config_file() {
                Some(path) => println!("{}", path.display()),
                None => println!("(no config file found; using defaults)"),
            },
        },
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    match &cli.command {
        None | Some(Commands::Start) => start(&cli).await,
        Some(Commands::Config { action }) => config_command(&cli, action),
    }
}
