//! HUDDLE CLI
//!
//! Peer-to-peer voice and file sharing for private lobbies

mod config;
mod progress;

use anyhow::Context;
use clap::{Parser, Subcommand};
use console::style;
use huddle_core::{
    FileDescriptor, Lobby, LobbyConfig, LobbyEvent, MemoryNetwork, ShareAccess, TransferStatus,
};
use huddle_files::{FileChunker, LocalFileStore, plan_ranges};
use huddle_signaling::{RelayConfig, RelayServer, ShareInfo};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use config::Config;
use progress::{TransferBar, format_bytes, parse_size};

/// HUDDLE - voice and file sharing between lobby members
#[derive(Parser)]
#[command(name = "huddle")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a lobby relay server
    Relay {
        /// Listen address
        #[arg(short, long)]
        bind: Option<String>,

        /// Lobby name
        #[arg(short, long)]
        lobby: Option<String>,

        /// Lobby password
        #[arg(long)]
        password: Option<String>,

        /// Oldest client version admitted
        #[arg(long)]
        min_version: Option<String>,
    },

    /// Join a lobby and print roster, chat and session events
    Monitor {
        /// Post a chat message after joining
        #[arg(long)]
        chat: Option<String>,
    },

    /// Show how a file would be split into transfer threads
    Plan {
        /// File to plan
        #[arg(required_unless_present = "size")]
        file: Option<PathBuf>,

        /// Plan for a size instead of a file (`12582912`, `5M`, ...)
        #[arg(long, conflicts_with = "file")]
        size: Option<String>,
    },

    /// Transfer a file between two in-process members over a local relay
    Loopback {
        /// File to send
        #[arg(required = true)]
        file: PathBuf,

        /// Where the received copy is written
        #[arg(short, long)]
        output: PathBuf,

        /// Protect the share with a password the requester must present
        #[arg(long)]
        share_password: Option<String>,
    },

    /// Write a default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load_or_default(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    config.validate()?;

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    match cli.command {
        Commands::Relay {
            bind,
            lobby,
            password,
            min_version,
        } => {
            run_relay(bind, lobby, password, min_version, &config).await?;
        }
        Commands::Monitor { chat } => {
            run_monitor(chat, &config).await?;
        }
        Commands::Plan { file, size } => {
            show_plan(file, size)?;
        }
        Commands::Loopback {
            file,
            output,
            share_password,
        } => {
            run_loopback(&file, &output, share_password.as_deref(), &config).await?;
        }
        Commands::InitConfig { force } => {
            init_config(&config_path, force)?;
        }
    }

    Ok(())
}

/// Run a relay until Ctrl+C
async fn run_relay(
    bind: Option<String>,
    lobby: Option<String>,
    password: Option<String>,
    min_version: Option<String>,
    config: &Config,
) -> anyhow::Result<()> {
    let bind = bind.unwrap_or_else(|| config.relay.bind_addr.clone());
    let lobby = lobby.unwrap_or_else(|| config.lobby.lobby_name.clone());

    let mut relay_config = RelayConfig::new(&lobby)
        .with_minimum_version(min_version.unwrap_or_else(|| config.relay.min_version.clone()));
    if let Some(password) = password.or_else(|| config.lobby.password.clone()) {
        relay_config = relay_config.with_password(password);
    }
    relay_config.download_url = config.relay.download_url.clone();

    let relay = RelayServer::bind(&bind, relay_config).await?;

    println!("{}", style("HUDDLE Relay").bold());
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Lobby: {lobby}");
    println!("Listen: ws://{}", relay.local_addr());
    println!("\nPress Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down ({} members connected)...", relay.client_count());
    relay.shutdown();

    Ok(())
}

/// Join the configured lobby and print events until Ctrl+C
async fn run_monitor(chat: Option<String>, config: &Config) -> anyhow::Result<()> {
    let lobby_config = config.to_lobby_config();
    println!(
        "Joining lobby {} at {} as {}",
        style(&lobby_config.lobby_name).bold(),
        lobby_config.server_url,
        lobby_config.player_id
    );

    // No native peer-connection backend in the CLI; sessions run on the
    // in-process network, so only signaling-level events reach other hosts.
    let lobby = Lobby::join(
        lobby_config,
        Arc::new(MemoryNetwork::new()),
        Arc::new(LocalFileStore::new()),
        None,
    )
    .await?;
    let mut events = lobby.subscribe();

    if let Some(message) = chat {
        lobby.send_chat(message)?;
    }

    println!("Press Ctrl+C to leave\n");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Missed {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    lobby.leave().await;
    println!("\nLeft the lobby");
    Ok(())
}

fn print_event(event: &LobbyEvent) {
    match event {
        LobbyEvent::PeerJoined(peer) => {
            println!("{} {} ({})", style("+").green(), peer.name, peer.id);
        }
        LobbyEvent::PeerLeft { peer_id } => println!("{} {}", style("-").red(), peer_id),
        LobbyEvent::PeerStatus {
            peer_id,
            mic_enabled,
        } => {
            let mic = if *mic_enabled { "on" } else { "off" };
            println!("  {peer_id} mic {mic}");
        }
        LobbyEvent::SessionState { peer_id, state } => {
            println!("  {} session {}", peer_id, style(state).dim());
        }
        LobbyEvent::Chat(chat) => {
            println!("{} {}", style(format!("<{}>", chat.player_name)).cyan(), chat.content);
        }
        LobbyEvent::Share { change, share } => {
            println!(
                "  share {:?}: {} ({} files) by {}",
                change, share.name, share.file_count, share.owner_id
            );
        }
        LobbyEvent::RegistrationFailed { message } => {
            println!("{} {}", style("registration refused:").red(), message);
        }
        LobbyEvent::VersionError {
            current,
            minimum,
            download_url,
        } => {
            println!(
                "{} version {} is older than required {}",
                style("error:").red().bold(),
                current,
                minimum
            );
            if let Some(url) = download_url {
                println!("  download: {url}");
            }
        }
        LobbyEvent::SignalingReconnecting { attempt } => {
            println!("{}", style(format!("reconnecting (attempt {attempt})")).yellow());
        }
        LobbyEvent::SignalingRestored => println!("{}", style("reconnected").green()),
        LobbyEvent::SignalingLost => println!("{}", style("signaling lost").red()),
        LobbyEvent::ReconnectExhausted { peer_id, attempts } => {
            println!("  gave up on {peer_id} after {attempts} attempts");
        }
        LobbyEvent::PeerStale { peer_id } => println!("  {peer_id} is not responding"),
        LobbyEvent::RemoteStream { peer_id, .. } => println!("  audio from {peer_id}"),
    }
}

/// Print the thread plan for a file or size
fn show_plan(file: Option<PathBuf>, size: Option<String>) -> anyhow::Result<()> {
    let size = match (&file, size) {
        (Some(path), _) => {
            let size = std::fs::metadata(path)
                .with_context(|| format!("reading {}", path.display()))?
                .len();
            println!("File: {}", path.display());
            println!("BLAKE3: {}", hash_file(path)?);
            size
        }
        (None, Some(size)) => parse_size(&size)?,
        (None, None) => anyhow::bail!("either a file or --size is required"),
    };

    println!("Size: {} ({} bytes)", format_bytes(size), size);
    if size == 0 {
        println!("Empty files are written directly, no threads");
        return Ok(());
    }

    let ranges = plan_ranges(size);
    let chunker = FileChunker::new();
    println!("Threads: {}", ranges.len());
    for (index, range) in ranges.iter().enumerate() {
        println!(
            "  thread {:>2}  {:<28} {:>10}  {} frame(s)",
            index,
            range.to_string(),
            format_bytes(range.len()),
            chunker.chunk_count(range.len())
        );
    }
    Ok(())
}

/// Two members in one process: the owner shares `file`, the requester
/// downloads it to `output`
async fn run_loopback(
    file: &Path,
    output: &Path,
    share_password: Option<&str>,
    config: &Config,
) -> anyhow::Result<()> {
    let file = file
        .canonicalize()
        .with_context(|| format!("reading {}", file.display()))?;
    let size = std::fs::metadata(&file)?.len();
    let name = file
        .file_name()
        .and_then(|n| n.to_str())
        .context("file name is not valid UTF-8")?
        .to_string();
    let root = file.parent().context("file has no parent directory")?;

    let relay = RelayServer::bind("127.0.0.1:0", RelayConfig::new("loopback")).await?;
    let network = MemoryNetwork::new();
    let store = Arc::new(LocalFileStore::new());

    let base = LobbyConfig {
        server_url: format!("ws://{}", relay.local_addr()),
        lobby_name: "loopback".to_string(),
        lobby_password: None,
        ..config.to_lobby_config()
    };
    let owner = Lobby::join(
        LobbyConfig {
            player_id: "loopback-owner".to_string(),
            player_name: "Owner".to_string(),
            ..base.clone()
        },
        Arc::new(network.clone()),
        store.clone(),
        None,
    )
    .await?;
    let mut access = ShareAccess::new(root);
    if let Some(password) = share_password {
        access = access.with_password(password);
    }
    owner.publish_share_with(
        ShareInfo {
            id: "loopback-share".to_string(),
            owner_id: String::new(),
            name: name.clone(),
            file_count: 1,
            protected: false,
        },
        access,
    )?;

    let requester = Lobby::join(
        LobbyConfig {
            player_id: "loopback-requester".to_string(),
            player_name: "Requester".to_string(),
            ..base
        },
        Arc::new(network.clone()),
        store,
        None,
    )
    .await?;

    tokio::time::timeout(Duration::from_secs(10), async {
        while requester.sessions().transport("loopback-owner").is_none() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .context("session between loopback members did not connect")?;

    let mut progress_rx = requester.subscribe_progress();
    let request_id = requester.download(
        FileDescriptor {
            share_id: "loopback-share".to_string(),
            owner_id: "loopback-owner".to_string(),
            path: name.clone(),
            name: name.clone(),
            size,
            password: share_password.map(str::to_string),
        },
        output,
    )?;

    let bar = TransferBar::new(size, &name);
    let final_progress = loop {
        match progress_rx.recv().await {
            Ok(progress) if progress.request_id == request_id => {
                bar.update(progress.transferred);
                if progress.status.is_terminal() {
                    break progress;
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => anyhow::bail!("transfer engine stopped"),
        }
    };

    requester.leave().await;
    owner.leave().await;
    relay.shutdown();

    if final_progress.status != TransferStatus::Completed {
        let reason = final_progress
            .error
            .unwrap_or_else(|| final_progress.status.to_string());
        bar.fail(&reason);
        anyhow::bail!("transfer {request_id} failed: {reason}");
    }
    bar.finish();

    let sent = hash_file(&file)?;
    let received = hash_file(output)?;
    println!("Sent:     {sent}");
    println!("Received: {received}");
    if sent != received {
        anyhow::bail!("received file differs from the original");
    }
    println!("{}", style("Verified").green().bold());
    Ok(())
}

fn hash_file(path: &Path) -> anyhow::Result<blake3::Hash> {
    let mut hasher = blake3::Hasher::new();
    let mut file = std::fs::File::open(path)?;
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize())
}

/// Write the default configuration
fn init_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    Config::default().save(path)?;
    println!("Wrote {}", path.display());
    Ok(())
}
