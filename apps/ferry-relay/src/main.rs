use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

mod config;

use ferry_core::{Priority, SystemClock};
use ferry_crypto::keys::load_or_generate_signer;
use ferry_crypto::signing::Signer;
use ferry_node::{BundleFilter, BundleStore, PublishRequest, Relay, SessionOutcome};
use ferry_transport::{LinkError, TcpAcceptor, TcpConnection, TcpDialer};
use humantime_serde::re::humantime;
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::flag;
use tokio::time::MissedTickBehavior;

use crate::config::RelayConfig;

const SIGNAL_POLL: Duration = Duration::from_millis(250);

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay (default)
    Run,
    /// Create the node key if missing and print the node id
    Keygen,
    /// Sign and store a bundle authored by this node
    Publish {
        #[arg(long = "type", default_value = "note")]
        payload_type: String,
        #[arg(long, default_value = "normal")]
        priority: Priority,
        #[arg(long, default_value = "24h", value_parser = humantime::parse_duration)]
        ttl: Duration,
        #[arg(long)]
        topic: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long, default_value = "public")]
        audience: String,
        /// Payload text
        payload: String,
    },
    /// List stored bundles
    Query {
        #[arg(long)]
        priority: Option<Priority>,
        #[arg(long)]
        topic: Option<String>,
        #[arg(long = "type")]
        payload_type: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Run one session against a peer and exit
    Sync { peer: String },
}

fn open_relay(cfg: &RelayConfig) -> Result<Relay, String> {
    let (signer, created) = load_or_generate_signer(&cfg.node_key_path)
        .map_err(|e| format!("node key {}: {e}", cfg.node_key_path.display()))?;
    if created {
        info!(path = %cfg.node_key_path.display(), "generated node key");
    }
    let store = BundleStore::open(&cfg.store_path)
        .map_err(|e| format!("open store {}: {e}", cfg.store_path.display()))?;
    Relay::new(
        Arc::new(store),
        cfg.node_config(),
        Arc::new(signer),
        Arc::new(SystemClock),
    )
    .map_err(|e| format!("start relay: {e}"))
}

fn dialer(cfg: &RelayConfig) -> TcpDialer {
    TcpDialer {
        connect_timeout: cfg.connect_timeout,
        max_frame_len: cfg.max_frame_len,
    }
}

async fn accept_next(acceptor: Option<&TcpAcceptor>) -> Result<TcpConnection, LinkError> {
    match acceptor {
        Some(acceptor) => acceptor.accept().await,
        None => std::future::pending().await,
    }
}

fn dial_peers(relay: &Relay, cfg: &RelayConfig) {
    let dialer = dialer(cfg);
    for peer in &cfg.peers {
        let relay = relay.clone();
        let dialer = dialer.clone();
        let peer = peer.clone();
        tokio::spawn(async move {
            if let Err(err) = relay.connect_and_sync(&dialer, &peer).await {
                warn!(peer = %peer, "dial failed: {err}");
            }
        });
    }
}

async fn run(config_path: Option<PathBuf>, mut cfg: RelayConfig) -> Result<(), String> {
    let relay = open_relay(&cfg)?;
    info!(
        node_id = %hex::encode(relay.node_id()),
        role = %cfg.role,
        store = %cfg.store_path.display(),
        "ferry relay starting"
    );
    let background = relay.start_background();

    let shutdown = Arc::new(AtomicBool::new(false));
    let reload = Arc::new(AtomicBool::new(false));
    let _ = flag::register(SIGTERM, Arc::clone(&shutdown));
    let _ = flag::register(SIGINT, Arc::clone(&shutdown));
    let _ = flag::register(SIGHUP, Arc::clone(&reload));

    let listen = cfg.listen.clone().filter(|addr| !addr.trim().is_empty());
    let acceptor = match listen.as_deref() {
        Some(addr) => {
            let acceptor = TcpAcceptor::bind(addr, cfg.max_frame_len)
                .await
                .map_err(|e| format!("bind {addr}: {e}"))?;
            info!(addr, "listening for peers");
            Some(acceptor)
        }
        None => None,
    };

    let mut sync_tick = tokio::time::interval(cfg.sync_interval);
    sync_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut signal_tick = tokio::time::interval(SIGNAL_POLL);

    loop {
        tokio::select! {
            accepted = accept_next(acceptor.as_ref()) => match accepted {
                Ok(conn) => {
                    relay.spawn_session(conn);
                }
                Err(err) => warn!("accept failed: {err}"),
            },
            _ = sync_tick.tick() => dial_peers(&relay, &cfg),
            _ = signal_tick.tick() => {}
        }

        if shutdown.load(Ordering::Relaxed) {
            info!("shutdown requested");
            break;
        }
        if reload.swap(false, Ordering::Relaxed) {
            match RelayConfig::new(config_path.clone()) {
                Ok(next) => {
                    if next.listen != cfg.listen || next.store_path != cfg.store_path {
                        warn!("listen address and store path changes apply on restart");
                    }
                    if let Err(err) = relay.reload_config(next.node_config()) {
                        error!("config reload failed: {err}");
                        continue;
                    }
                    if next.sync_interval != cfg.sync_interval {
                        sync_tick = tokio::time::interval(next.sync_interval);
                        sync_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    }
                    info!(role = %next.role, peers = next.peers.len(), "config reloaded");
                    cfg = next;
                }
                Err(err) => error!("config reload failed: {err}"),
            }
        }
    }

    background.shutdown().await;
    info!("ferry relay stopped");
    Ok(())
}

fn keygen(cfg: &RelayConfig) -> Result<(), String> {
    let (signer, created) = load_or_generate_signer(&cfg.node_key_path)
        .map_err(|e| format!("node key {}: {e}", cfg.node_key_path.display()))?;
    if !created {
        info!(path = %cfg.node_key_path.display(), "node key already present");
    }
    println!("{}", hex::encode(signer.public_key()));
    Ok(())
}

fn publish(cfg: &RelayConfig, request: PublishRequest) -> Result<(), String> {
    let relay = open_relay(cfg)?;
    let id = relay.publish(request).map_err(|e| format!("publish: {e}"))?;
    println!("{}", id.to_hex());
    Ok(())
}

fn query(cfg: &RelayConfig, filter: BundleFilter) -> Result<(), String> {
    let store = BundleStore::open(&cfg.store_path)
        .map_err(|e| format!("open store {}: {e}", cfg.store_path.display()))?;
    let bundles = store.list(&filter).map_err(|e| format!("query: {e}"))?;
    for b in &bundles {
        println!(
            "{} {:<10} {:<12} topic={} audience={} bytes={} expires_at={}",
            b.id.to_hex(),
            b.priority.as_str(),
            b.payload_type,
            b.topic,
            b.audience,
            b.size,
            b.expires_at.as_secs()
        );
    }
    Ok(())
}

async fn sync_once(cfg: &RelayConfig, peer: &str) -> Result<(), String> {
    let relay = open_relay(cfg)?;
    let report = relay
        .connect_and_sync(&dialer(cfg), peer)
        .await
        .map_err(|e| format!("dial {peer}: {e}"))?;
    println!(
        "outcome={:?} sent={} received={} stored={} duplicates={} rejected={} deferred={}",
        report.outcome,
        report.sent,
        report.received,
        report.stored,
        report.duplicates,
        report.rejected,
        report.deferred
    );
    if report.outcome != SessionOutcome::Completed {
        return Err(format!("session with {peer} did not complete"));
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let filter = std::env::var("FERRY_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    let cfg = match RelayConfig::new(cli.config.clone()) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("failed to load config: {err}");
            std::process::exit(1);
        }
    };

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(cli.config, cfg).await,
        Commands::Keygen => keygen(&cfg),
        Commands::Publish {
            payload_type,
            priority,
            ttl,
            topic,
            tags,
            audience,
            payload,
        } => {
            let mut request = PublishRequest::new(payload_type, payload, priority, ttl)
                .with_audience(audience)
                .with_tags(tags);
            if let Some(topic) = topic {
                request = request.with_topic(topic);
            }
            publish(&cfg, request)
        }
        Commands::Query {
            priority,
            topic,
            payload_type,
            limit,
        } => {
            let mut filter = BundleFilter::default().limit(limit);
            if let Some(priority) = priority {
                filter = filter.with_priority(priority);
            }
            if let Some(topic) = topic {
                filter = filter.with_topic(topic);
            }
            if let Some(payload_type) = payload_type {
                filter = filter.with_payload_type(payload_type);
            }
            query(&cfg, filter)
        }
        Commands::Sync { peer } => sync_once(&cfg, &peer).await,
    };

    if let Err(err) = result {
        error!("{err}");
        std::process::exit(1);
    }
}
