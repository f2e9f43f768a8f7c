use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tern::channels::{forward_to, BlueskyChannel, ChannelRegistry, TelegramChannel};
use tern::config::Config;

#[derive(Parser)]
#[command(name = "tern")]
#[command(about = "Tern CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Show which channels have credentials configured (no network access).
    Status {
        /// Config file path (default: TERN_CONFIG_PATH or ~/.tern/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Start every configured channel and print inbound messages as JSON lines until Ctrl-C.
    Listen {
        /// Config file path (default: TERN_CONFIG_PATH or ~/.tern/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Send one message to a conversation, e.g. `--group bsky:3kabc... --text hi`.
    Send {
        /// Config file path (default: TERN_CONFIG_PATH or ~/.tern/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Channel-qualified conversation id (`bsky:<convo>` or `tg:<chat>`).
        #[arg(long, value_name = "GROUP_ID")]
        group: String,

        /// Message text.
        #[arg(long)]
        text: String,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("tern {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Status { config }) => {
            if let Err(e) = run_status(config).await {
                log::error!("status failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Listen { config }) => {
            if let Err(e) = run_listen(config).await {
                log::error!("listen failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Send {
            config,
            group,
            text,
        }) => {
            if let Err(e) = run_send(config, &group, &text).await {
                log::error!("send failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

/// Build every channel from config and register them. Unconfigured channels are registered too
/// so `status` can report them.
async fn build_registry(config: &Config) -> anyhow::Result<ChannelRegistry> {
    let registry = ChannelRegistry::new();
    registry
        .register(Arc::new(BlueskyChannel::from_config(config)?))
        .await;
    registry
        .register(Arc::new(TelegramChannel::from_config(config)?))
        .await;
    Ok(registry)
}

async fn run_status(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (config, path) = tern::config::load_config(config_path)?;
    println!("config: {}", path.display());
    let registry = build_registry(&config).await?;
    for id in registry.ids().await {
        if let Some(channel) = registry.get(&id).await {
            let state = if channel.is_configured() {
                "configured"
            } else {
                "not configured"
            };
            println!("{:<10} {}", id, state);
        }
    }
    Ok(())
}

async fn run_listen(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (config, _path) = tern::config::load_config(config_path)?;
    let registry = build_registry(&config).await?;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let mut started = 0;
    for id in registry.ids().await {
        let Some(channel) = registry.get(&id).await else {
            continue;
        };
        if !channel.is_configured() {
            log::debug!("{}: not configured, skipping", id);
            continue;
        }
        channel.on_message(forward_to(tx.clone()));
        channel.start().await;
        started += 1;
    }
    drop(tx);
    if started == 0 {
        anyhow::bail!("no channels configured; set credentials in the config file or environment");
    }
    log::info!("listening on {} channel(s)", started);

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(msg) => println!("{}", serde_json::to_string(&msg)?),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                log::info!("shutting down");
                break;
            }
        }
    }
    registry.stop_all().await;
    Ok(())
}

async fn run_send(config_path: Option<PathBuf>, group: &str, text: &str) -> anyhow::Result<()> {
    let (config, _path) = tern::config::load_config(config_path)?;
    let registry = build_registry(&config).await?;
    let Some(channel) = registry.route(group).await else {
        anyhow::bail!("no channel handles group id {:?}", group);
    };
    if !channel.is_configured() {
        anyhow::bail!("channel {} is not configured", channel.id());
    }
    // A stopped channel's `send` silently does nothing, so a failed connect must fail here.
    channel.connect().await;
    if !channel.is_running() {
        anyhow::bail!("channel {} failed to connect", channel.id());
    }
    let result = channel.send(group, text).await;
    channel.stop();
    result?;
    Ok(())
}
