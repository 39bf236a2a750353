//! tradenetd: runs a small in-process network of membership nodes.
//!
//! The first node acts as the seed; the others bootstrap against it over
//! the in-process channel transport. Useful for watching the gossip and
//! eviction machinery work without deploying real infrastructure.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info};
use tradenet::config::LoggingConfig;
use tradenet::{
    Config, Hub, NodeAddress, PeerEvent, PeerManager, PeerManagerConfig, PeerManagerHandle,
    PeerStore, ShutdownManager,
};

#[derive(Parser, Debug)]
#[command(name = "tradenetd")]
#[command(about = "Gossip membership network daemon", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Number of in-process nodes to run, seed included.
    #[arg(short, long, default_value_t = 4)]
    nodes: usize,

    #[arg(short, long)]
    verbose: bool,

    /// Write a default config file and exit.
    #[arg(long)]
    generate_config: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config_path = PathBuf::from(&args.config);

    if args.generate_config {
        match Config::load_or_create(&config_path) {
            Ok(_) => println!("config written to {}", config_path.display()),
            Err(e) => {
                eprintln!("failed to write config: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    let config = match Config::load_or_create(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load config {}: {}", config_path.display(), e);
            std::process::exit(1);
        }
    };

    setup_logging(&config.logging, args.verbose);

    if let Err(e) = run(config, args.nodes.max(1)).await {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}

async fn run(config: Config, nodes: usize) -> Result<(), Box<dyn std::error::Error>> {
    let seed_address: NodeAddress = config.own_address()?;
    let data_dir = config.data_dir();
    let debounce = Duration::from_millis(config.storage.save_debounce_ms);
    let template = PeerManagerConfig::from_app_config(&config)?;

    let hub = Hub::new();
    let mut shutdown = ShutdownManager::new();
    let mut handles: Vec<(NodeAddress, PeerManagerHandle)> = Vec::new();

    // The seed node has no seeds of its own; it only answers.
    let (transport, events) = hub.register(seed_address.clone());
    let store = PeerStore::open(&data_dir.join(&seed_address.host), debounce)?;
    let mut seed_config = template.clone();
    seed_config.own_address = seed_address.clone();
    seed_config.seed_nodes = Vec::new();
    let seed_handle = PeerManager::spawn(
        seed_config,
        transport,
        events,
        Some(store),
        shutdown.token(),
    );
    info!("seed node {} up", seed_address);
    handles.push((seed_address.clone(), seed_handle));

    for i in 1..nodes {
        let address = NodeAddress::new(format!("node{}", i), seed_address.port);
        let (transport, events) = hub.register(address.clone());
        let store = PeerStore::open(&data_dir.join(&address.host), debounce)?;
        let mut node_config = template.clone();
        node_config.own_address = address.clone();
        node_config.seed_nodes = vec![seed_address.clone()];
        let handle = PeerManager::spawn(
            node_config,
            transport,
            events,
            Some(store),
            shutdown.token(),
        );
        handle.bootstrap().await?;
        info!("node {} bootstrapping", address);
        handles.push((address, handle));
    }

    // Log membership changes as the seed sees them.
    let mut seed_events = handles[0].1.subscribe();
    let token = shutdown.token();
    shutdown.register_task(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = seed_events.recv() => match event {
                    Ok(PeerEvent::PeerAuthenticated { address, .. }) => {
                        info!("seed: authenticated {}", address);
                    }
                    Ok(PeerEvent::PeerDisconnected { address }) => {
                        info!("seed: lost {}", address);
                    }
                    Ok(PeerEvent::Message { from, payload }) => {
                        info!("seed: {} byte(s) from {}", payload.len(), from);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                },
            }
        }
    }));

    // Periodic table dump.
    let report_handles: Vec<PeerManagerHandle> =
        handles.iter().map(|(_, handle)| handle.clone()).collect();
    let token = shutdown.token();
    shutdown.register_task(tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        interval.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    for handle in &report_handles {
                        info!("\n{}", handle.debug_report().await);
                    }
                }
            }
        }
    }));

    info!("running {} in-process node(s), ctrl-c to stop", nodes);
    shutdown.wait_for_shutdown().await;

    for (_, handle) in &handles {
        handle.shut_down().await;
    }
    info!("bye");
    Ok(())
}

fn setup_logging(config: &LoggingConfig, verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if verbose { "debug" } else { &config.level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();
}
