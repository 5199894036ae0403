use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

use fileshare_core::{
    format_file_size, Downloader, Identity, LocalBus, PersistentStore, Registry, ShareConfig,
    ShareEvent, SharedFile, TransferEngine,
};
use mdns_core::{browse_peers, list_interface_ips, pick_ip, Announcer};
use peer_transport::TcpTransport;
use storage::LocalStorage;

#[derive(Parser, Debug)]
#[command(name = "fileshare", version, about = "Share files with peers on the local network")]
struct Cli {
    /// Set log level: error,warn,info,debug,trace
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Data directory for identity, config and downloads
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create an identity and config
    Init {
        /// Name shown to other participants
        #[arg(long)]
        name: String,
    },

    /// Show participant information
    Info,

    /// Share files until interrupted
    Share {
        /// File to share (repeatable)
        #[arg(long, required = true)]
        file: Vec<PathBuf>,

        /// Port to listen on for transfer channels
        #[arg(long)]
        port: Option<u16>,

        /// Network interface whose address is announced
        #[arg(long)]
        interface: Option<String>,

        /// Descriptor store directory shared with the other participants
        #[arg(long)]
        store: Option<PathBuf>,
    },

    /// List the files visible to this participant
    List {
        /// Network interface to use
        #[arg(long)]
        interface: Option<String>,

        /// Discovery timeout in seconds
        #[arg(long, default_value_t = 3)]
        timeout: u64,

        #[arg(long)]
        store: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Download a shared file
    Fetch {
        /// File id as printed by `list`
        #[arg(long)]
        id: String,

        /// Directory to save into (defaults to <data dir>/downloads)
        #[arg(long)]
        output: Option<PathBuf>,

        #[arg(long)]
        interface: Option<String>,

        /// Discovery timeout in seconds
        #[arg(long, default_value_t = 3)]
        timeout: u64,

        #[arg(long)]
        store: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    fmt()
        .with_env_filter(EnvFilter::new(&cli.log_level))
        .with_target(false)
        .init();

    // Determine data directory
    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".fileshare")
    });

    let identity_path = data_dir.join("identity.key");

    match cli.cmd {
        Commands::Init { name } => {
            let cfg = ShareConfig {
                data_dir: data_dir.clone(),
                ..ShareConfig::default()
            }
            .with_display_name(name);
            cfg.ensure_data_dir()?;

            let identity = Identity::load_or_generate(&identity_path)?;

            let cfg_path = data_dir.join("config.json");
            let cfg_json = serde_json::to_string_pretty(&cfg)?;
            std::fs::write(cfg_path, cfg_json)?;

            println!("✓ Participant initialized");
            println!("  Name: {}", cfg.display_name);
            println!("  Participant ID: {}", identity.participant_id());
            println!("  Fingerprint: {}", identity.fingerprint());
            println!("  Data directory: {}", data_dir.display());
        }

        Commands::Info => {
            let identity = load_identity(&identity_path)?;
            let cfg = load_config(&data_dir)?;

            println!("Participant Information:");
            println!("  Name: {}", cfg.display_name);
            println!("  Participant ID: {}", identity.participant_id());
            println!("  Fingerprint: {}", identity.fingerprint());
            println!("  Data directory: {}", data_dir.display());
            println!("  Listen port: {}", cfg.listen_port);
        }

        Commands::Share { file, port, interface, store } => {
            let identity = load_identity(&identity_path)?;
            let mut cfg = load_config(&data_dir)?;
            if let Some(port) = port {
                cfg.listen_port = port;
            }

            let session = Session::open(&cfg, &identity, store)?;
            share_files(&session, &cfg, &file, interface.as_deref()).await?;
        }

        Commands::List { interface, timeout, store, json } => {
            let identity = load_identity(&identity_path)?;
            let cfg = load_config(&data_dir)?;

            let session = Session::open(&cfg, &identity, store)?;
            session.discover(&cfg, interface.as_deref(), timeout).await?;
            list_files(&session, json).await?;
        }

        Commands::Fetch { id, output, interface, timeout, store } => {
            let identity = load_identity(&identity_path)?;
            let cfg = load_config(&data_dir)?;

            let session = Session::open(&cfg, &identity, store)?;
            session.discover(&cfg, interface.as_deref(), timeout).await?;
            fetch_file(&session, &cfg, &id, output).await?;
        }
    }

    Ok(())
}

fn load_identity(identity_path: &Path) -> Result<Identity> {
    Identity::load(identity_path).context("Participant not initialized. Run 'fileshare init' first.")
}

fn load_config(data_dir: &Path) -> Result<ShareConfig> {
    let cfg_path = data_dir.join("config.json");
    if !cfg_path.exists() {
        anyhow::bail!("Participant not initialized. Run 'fileshare init' first.");
    }

    let cfg_json = std::fs::read_to_string(cfg_path)?;
    let mut cfg: ShareConfig = serde_json::from_str(&cfg_json)?;
    cfg.data_dir = data_dir.to_path_buf();
    Ok(cfg)
}

/// Everything a command needs to take part in the session.
struct Session {
    participant_id: String,
    transport: TcpTransport,
    engine: Arc<TransferEngine>,
}

impl Session {
    fn open(cfg: &ShareConfig, identity: &Identity, store: Option<PathBuf>) -> Result<Self> {
        cfg.ensure_data_dir()?;
        let participant = identity.participant(&cfg.display_name);
        let store_dir = store.unwrap_or_else(|| cfg.data_dir.join("store"));
        let records = LocalStorage::with_dirs(cfg.data_dir.join("downloads"), store_dir)?;

        let transport = TcpTransport::new(participant.id.clone());
        let registry = Arc::new(Registry::new(
            participant.clone(),
            cfg.namespace.clone(),
            Arc::new(PersistentStore::new(participant.id.clone(), records)),
            Arc::new(LocalBus::default()),
        ));
        let engine = TransferEngine::new(registry, Arc::new(transport.clone()), cfg);
        engine.start();

        Ok(Self {
            participant_id: participant.id,
            transport,
            engine,
        })
    }

    /// Fill the transport's address book from mDNS.
    async fn discover(&self, cfg: &ShareConfig, interface: Option<&str>, timeout: u64) -> Result<()> {
        if let Some(interface) = interface {
            let interface_ips = list_interface_ips()?;
            interface_ips
                .iter()
                .find(|item| item.name == interface)
                .ok_or_else(|| anyhow::anyhow!("No matching interface found: {}", interface))?;
        }

        let service_type = cfg.service_type.clone();
        let own_id = self.participant_id.clone();
        let peers = tokio::task::spawn_blocking(move || {
            browse_peers(&service_type, Duration::from_secs(timeout), &own_id)
        })
        .await??;

        tracing::info!("Discovered {} peer(s)", peers.len());
        for peer in peers {
            tracing::debug!("Peer {} ({}) at {}", peer.display_name, peer.participant_id, peer.addr);
            self.transport.add_peer(&peer.participant_id, peer.addr);
        }
        Ok(())
    }
}

async fn share_files(
    session: &Session,
    cfg: &ShareConfig,
    files: &[PathBuf],
    interface: Option<&str>,
) -> Result<()> {
    let registry = session.engine.registry();

    for path in files {
        let file = SharedFile::from_path(path)?;
        match registry.share(file).await? {
            Some(descriptor) => {
                println!("✓ Sharing {}", descriptor.summary());
                println!("  ID: {}", descriptor.id);
            }
            None => println!("  Already shared: {}", path.display()),
        }
    }

    let bound = session
        .transport
        .listen(&format!("0.0.0.0:{}", cfg.listen_port))
        .await?;

    let interface_ips = list_interface_ips()?;
    let ip = pick_ip(&interface_ips, interface).ok_or_else(|| match interface {
        Some(name) => anyhow::anyhow!("No matching interface found: {}", name),
        None => anyhow::anyhow!("No usable network interface found"),
    })?;

    let announcer = Announcer::for_participant(
        &cfg.service_type,
        &session.participant_id,
        &cfg.display_name,
        ip,
        bound.port(),
    )?;
    tracing::info!("Announcing: {}", announcer.fullname());
    println!("✓ Listening on {}:{}", ip, bound.port());
    println!("  Press Ctrl+C to stop");

    let mut events = session.engine.subscribe();
    let engine = session.engine.clone();
    let reporter = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let ShareEvent::StateChanged = event {
                for transfer in engine.transfers() {
                    tracing::info!(
                        "Transfer {} {:?} {:?}: {} of {}",
                        transfer.id,
                        transfer.direction,
                        transfer.state,
                        format_file_size(transfer.transferred_bytes),
                        format_file_size(transfer.total_bytes)
                    );
                }
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    reporter.abort();

    let retracted = registry.stop_sharing_all().await?;
    drop(announcer);
    println!("\n✓ Stopped sharing {} file(s)", retracted);
    Ok(())
}

async fn list_files(session: &Session, json: bool) -> Result<()> {
    let files = session.engine.visible_files().await;

    if json {
        let values: Vec<_> = files.iter().map(|f| f.to_value()).collect();
        println!("{}", serde_json::to_string_pretty(&values)?);
    } else {
        println!("{} file(s) available:", files.len());
        for file in files {
            println!("\n  {}", file.summary());
            println!("    ID: {}", file.id);
            println!("    Type: {}", file.mime_type);
        }
    }

    Ok(())
}

async fn fetch_file(
    session: &Session,
    cfg: &ShareConfig,
    file_id: &str,
    output: Option<PathBuf>,
) -> Result<()> {
    let files_dir = output.unwrap_or_else(|| cfg.data_dir.join("downloads"));
    let storage = LocalStorage::with_dirs(files_dir, cfg.data_dir.join("store"))?;
    let downloader = Downloader::new(session.engine.clone(), Arc::new(storage), cfg.progress_interval());

    let mut events = session.engine.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ShareEvent::DownloadProgress { text, .. } => println!("  {}", text),
                ShareEvent::DownloadFailed { message, .. } => println!("✗ {}", message),
                _ => {}
            }
        }
    });

    let result = downloader.download_and_save(file_id).await;
    printer.abort();

    let Some(path) = result? else {
        anyhow::bail!("A download of {} is already running", file_id);
    };

    let data = tokio::fs::read(&path).await?;
    println!("✓ Saved {} ({})", path.display(), format_file_size(data.len() as u64));
    println!("  SHA-256: {}", sha256_hex(&data));
    Ok(())
}

fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
