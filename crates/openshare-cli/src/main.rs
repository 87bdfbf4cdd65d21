use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

use openshare_core::discovery::{self, Endpoint};
use openshare_core::{ClientConfig, LocalIdentity, PeerEvent, PeerManager, TransferEngine, TransferEvent};
use storage::LocalInbox;

#[derive(Parser, Debug)]
#[command(name = "openshare", version, about = "OpenShare LAN P2P file transfer")]
struct Cli {
    /// Set log level: error,warn,info,debug,trace
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Data directory for identity, config, and inbox
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a local identity and a default config, if none exist yet.
    Init,

    /// Show this device's peer id and configuration.
    Info,

    /// Advertise this device on the LAN via mDNS.
    Announce {
        /// Port to advertise (defaults to the configured listen port).
        #[arg(long)]
        port: Option<u16>,

        /// Stop announcing after this many seconds (0 = forever).
        #[arg(long, default_value_t = 0)]
        ttl: u64,
    },

    /// Browse the LAN for other OpenShare peers.
    Discover {
        /// How long to listen for mDNS responses, in seconds.
        #[arg(long, default_value_t = 5)]
        timeout: u64,

        /// Print results as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Send a file to a peer reachable at `host:port`.
    Send {
        /// File to send.
        #[arg(long)]
        file: PathBuf,

        /// Peer address, e.g. 192.168.1.23:9876.
        #[arg(long)]
        peer: String,
    },

    /// Listen for inbound connections and auto-accept announced transfers.
    Listen {
        /// Port to listen on (0 = ephemeral).
        #[arg(long, default_value_t = 9876)]
        port: u16,

        /// Directory received files are written to (defaults to the data
        /// directory's inbox).
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Cancel an in-flight transfer with a peer reachable at `host:port`.
    Cancel {
        /// Peer address, e.g. 192.168.1.23:9876.
        #[arg(long)]
        peer: String,

        /// Transfer id to cancel.
        #[arg(long)]
        transfer_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(EnvFilter::new(&cli.log_level))
        .with_target(false)
        .init();

    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".openshare")
    });

    match cli.cmd {
        Commands::Init => init(&data_dir)?,
        Commands::Info => info(&data_dir)?,
        Commands::Announce { port, ttl } => announce(&data_dir, port, ttl).await?,
        Commands::Discover { timeout, json } => discover(timeout, json).await?,
        Commands::Send { file, peer } => send_file(&data_dir, &file, &peer).await?,
        Commands::Listen { port, output } => listen(&data_dir, port, output).await?,
        Commands::Cancel { peer, transfer_id } => {
            cancel_transfer(&data_dir, &peer, &transfer_id).await?
        }
    }

    Ok(())
}

fn load_config(data_dir: &PathBuf) -> Result<ClientConfig> {
    let cfg_path = data_dir.join("config.json");
    if !cfg_path.exists() {
        anyhow::bail!("device not initialized, run 'openshare init' first");
    }
    let cfg_json = std::fs::read_to_string(cfg_path)?;
    Ok(serde_json::from_str(&cfg_json)?)
}

fn load_identity(data_dir: &PathBuf) -> Result<LocalIdentity> {
    let path = data_dir.join("identity.key");
    LocalIdentity::load(&path).context("device not initialized, run 'openshare init' first")
}

fn init(data_dir: &PathBuf) -> Result<()> {
    let mut cfg = ClientConfig::default();
    cfg.data_dir = data_dir.clone();
    cfg.ensure_data_dir()?;

    let identity = LocalIdentity::load_or_generate(&cfg.identity_path())?;

    let cfg_path = data_dir.join("config.json");
    std::fs::write(&cfg_path, serde_json::to_string_pretty(&cfg)?)?;

    println!("device initialized");
    println!("  peer id: {}", identity.peer_id());
    println!("  data directory: {}", data_dir.display());
    Ok(())
}

fn info(data_dir: &PathBuf) -> Result<()> {
    let identity = load_identity(data_dir)?;
    let cfg = load_config(data_dir)?;

    println!("device information:");
    println!("  peer id: {}", identity.peer_id());
    println!("  fingerprint: {}", identity.fingerprint());
    println!("  data directory: {}", cfg.data_dir.display());
    println!("  listen port: {}", cfg.listen_port);
    println!("  mdns service: {}", cfg.service_type);
    Ok(())
}

async fn announce(data_dir: &PathBuf, port: Option<u16>, ttl: u64) -> Result<()> {
    let identity = load_identity(data_dir)?;
    let cfg = load_config(data_dir)?;
    let port = port.unwrap_or(cfg.listen_port);

    let ip = local_advertise_ip()?;
    let host_name = format!("{}.local.", identity.peer_id());
    let announcer = discovery::announce(&identity.peer_id(), &host_name, &ip.to_string(), port)?;

    println!("advertising {} on {}:{}", announcer.fullname(), ip, port);
    if ttl == 0 {
        println!("press ctrl+c to stop");
        tokio::signal::ctrl_c().await?;
    } else {
        tokio::time::sleep(Duration::from_secs(ttl)).await;
    }
    Ok(())
}

fn local_advertise_ip() -> Result<IpAddr> {
    let ips = mdns_core::net::list_interface_ips_result()?;
    ips.into_iter()
        .find(|i| !i.is_loopback && i.family == "ipv4")
        .map(|i| i.ip)
        .ok_or_else(|| anyhow::anyhow!("no non-loopback IPv4 interface found"))
}

async fn discover(timeout_secs: u64, json: bool) -> Result<()> {
    let results = tokio::task::spawn_blocking(move || {
        mdns_core::discover::browse_blocking(
            discovery::SERVICE_TYPE,
            Duration::from_secs(timeout_secs),
            "",
        )
    })
    .await??;

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }

    println!("discovered {} peer(s):", results.len());
    for svc in results {
        let peer_id = svc
            .txt
            .iter()
            .find(|(k, _)| k == "peer_id")
            .map(|(_, v)| v.as_str())
            .unwrap_or("?");
        println!("  {} @ {}:{}", peer_id, svc.host_name, svc.port);
        for addr in &svc.addresses {
            println!("    - {addr}");
        }
    }
    Ok(())
}

fn parse_endpoint(addr: &str) -> Result<Endpoint> {
    let sock: std::net::SocketAddr = addr
        .parse()
        .or_else(|_| format!("{addr}:0").parse())
        .with_context(|| format!("invalid peer address: {addr}"))?;
    Ok(Endpoint {
        addresses: vec![sock.ip()],
        port: sock.port(),
    })
}

/// Connects to `peer_addr` as an outbound-only session, returning the
/// manager plus the confirmed peer id once `PeerConnected` arrives.
async fn dial(
    identity: LocalIdentity,
    mut cfg: ClientConfig,
    peer_addr: &str,
) -> Result<(Arc<PeerManager>, tokio::sync::mpsc::Receiver<PeerEvent>, String)> {
    cfg.listen_port = 0;
    let (manager, mut events) = PeerManager::new(Arc::new(identity), cfg);
    manager.start().await?;

    let endpoint = parse_endpoint(peer_addr)?;
    manager.connect_to_endpoint(None, endpoint).await?;

    loop {
        match events.recv().await {
            Some(PeerEvent::PeerConnected { peer_id, .. }) => return Ok((manager, events, peer_id)),
            Some(PeerEvent::PeerConnectionFailed { reason, .. }) => {
                anyhow::bail!("connection failed: {reason}")
            }
            Some(_) => continue,
            None => anyhow::bail!("connection closed before handshake completed"),
        }
    }
}

async fn send_file(data_dir: &PathBuf, file: &PathBuf, peer_addr: &str) -> Result<()> {
    let identity = load_identity(data_dir)?;
    let cfg = load_config(data_dir)?;
    cfg.ensure_data_dir()?;

    let (manager, events, peer_id) = dial(identity, cfg.clone(), peer_addr).await?;
    println!("connected to {peer_id}");

    let inbox = Arc::new(LocalInbox::new(cfg.inbox_dir())?);
    let (engine, mut transfer_events) = TransferEngine::new(cfg, manager, inbox);
    tokio::spawn(Arc::clone(&engine).run(events));

    let transfer_id = engine.announce(file).await?;
    println!("announced transfer {transfer_id}");

    let outcome = tokio::time::timeout(Duration::from_secs(300), async {
        loop {
            match transfer_events.recv().await {
                Some(TransferEvent::Completed {
                    transfer_id: tid,
                    success,
                    detail,
                }) if tid == transfer_id => return Some((success, detail)),
                Some(TransferEvent::Progress {
                    bytes_transferred,
                    total_bytes,
                    ..
                }) => {
                    println!("  progress: {bytes_transferred}/{total_bytes} bytes");
                }
                Some(_) => continue,
                None => return None,
            }
        }
    })
    .await;

    match outcome {
        Ok(Some((true, _))) => println!("transfer complete"),
        Ok(Some((false, detail))) => anyhow::bail!("transfer failed: {detail}"),
        Ok(None) => anyhow::bail!("peer disconnected before the transfer finished"),
        Err(_) => anyhow::bail!("timed out waiting for the peer to finish the transfer"),
    }
    Ok(())
}

async fn listen(data_dir: &PathBuf, port: u16, output: Option<PathBuf>) -> Result<()> {
    let identity = load_identity(data_dir)?;
    let mut cfg = load_config(data_dir)?;
    cfg.ensure_data_dir()?;
    cfg.listen_port = port;

    let inbox_dir = output.unwrap_or_else(|| cfg.inbox_dir());
    let inbox = Arc::new(LocalInbox::new(inbox_dir.clone())?);

    let (manager, events) = PeerManager::new(Arc::new(identity), cfg.clone());
    let bound_port = manager.start().await?;
    println!("listening on port {bound_port}");
    println!("inbox: {}", inbox_dir.display());

    let (engine, mut transfer_events) = TransferEngine::new(cfg, manager, inbox);
    tokio::spawn(Arc::clone(&engine).run(events));

    loop {
        match transfer_events.recv().await {
            Some(TransferEvent::Announced {
                peer_id,
                transfer_id,
                file_name,
                file_size,
            }) => {
                println!("incoming transfer {transfer_id} from {peer_id}: {file_name} ({file_size} bytes)");
                if let Err(err) = engine.accept(&peer_id, &transfer_id).await {
                    tracing::warn!(transfer_id, error = %err, "failed to accept transfer");
                }
            }
            Some(TransferEvent::Progress {
                transfer_id,
                bytes_transferred,
                total_bytes,
            }) => {
                println!("  {transfer_id}: {bytes_transferred}/{total_bytes} bytes");
            }
            Some(TransferEvent::Completed {
                transfer_id,
                success,
                detail,
            }) => {
                if success {
                    println!("transfer {transfer_id} complete: {detail}");
                } else {
                    println!("transfer {transfer_id} failed: {detail}");
                }
            }
            None => break,
        }
    }
    Ok(())
}

async fn cancel_transfer(data_dir: &PathBuf, peer_addr: &str, transfer_id: &str) -> Result<()> {
    let identity = load_identity(data_dir)?;
    let cfg = load_config(data_dir)?;
    cfg.ensure_data_dir()?;

    let (manager, events, peer_id) = dial(identity, cfg.clone(), peer_addr).await?;
    let inbox = Arc::new(LocalInbox::new(cfg.inbox_dir())?);
    let (engine, _transfer_events) = TransferEngine::new(cfg, manager, inbox);
    tokio::spawn(Arc::clone(&engine).run(events));

    engine.cancel(&peer_id, transfer_id).await?;
    println!("cancelled transfer {transfer_id} with {peer_id}");
    Ok(())
}
