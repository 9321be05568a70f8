// Copyright (c) 2026 RFS Chain Contributors. MIT License.
// See LICENSE for details.

//! # RFS Miner
//!
//! Entry point for the `rfs-miner` binary. Parses CLI arguments, starts a
//! [`MinerNode`], and connects it to the outside world: the framed TCP
//! client and miners ports, the block flooder, periodic snapshots, and the
//! optional HTTP status API.
//!
//! - `run`     start a miner from a JSON config
//! - `init`    write a devnet config
//! - `genesis` print the genesis hash
//! - `inspect` render a snapshot as Graphviz dot
//! - `send`    issue one client request
//! - `version` print build information

mod api;
mod cli;
mod inspect;
mod logging;
mod metrics;
mod transport;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::net::TcpStream;
use tokio::signal;
use tracing::{error, info, warn};

use rfs_protocol::config::{MinerConfig, PEER_REQUEST_TIMEOUT, PROTOCOL_VERSION};
use rfs_protocol::network::wire::exchange;
use rfs_protocol::network::{Envelope, Flooder, MinerNode, Request, Response, TcpPeerClient};
use rfs_protocol::storage::block::Block;
use rfs_protocol::storage::snapshot;
use rfs_protocol::storage::ChainParams;

use cli::{Commands, RfsMinerCli, SendRequest};
use logging::LogFormat;
use metrics::NodeMetrics;
use transport::Port;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = RfsMinerCli::parse();
    let format = LogFormat::from_str_lossy(&cli.log_format);

    match cli.command {
        Commands::Run(args) => {
            logging::init_logging("rfs_node=info,rfs_protocol=info,tower_http=info", format);
            run_node(args).await
        }
        Commands::Init(args) => init_config(args),
        Commands::Genesis => {
            println!("{}", Block::genesis().hash_hex());
            Ok(())
        }
        Commands::Inspect(args) => inspect_snapshot(args),
        Commands::Send(args) => send_request(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Run a miner until it is signalled, or stopped by `StoreAndStop`.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    let config = MinerConfig::load(&args.config)
        .with_context(|| format!("failed to load config {}", args.config.display()))?;

    let restored = match &args.restore {
        Some(path) => Some(
            snapshot::restore(path, ChainParams::from_config(&config))
                .with_context(|| format!("failed to restore snapshot {}", path.display()))?,
        ),
        None => None,
    };

    info!(
        miner_id = %config.miner_id,
        clients = %config.incoming_clients_addr,
        miners = %config.incoming_miners_addr,
        peers = config.peer_addresses.len(),
        restored = restored.is_some(),
        "starting rfs-miner"
    );

    let mut runtime = MinerNode::start(config.clone(), restored).context("failed to start miner")?;
    let node = runtime.node.clone();
    let metrics = Arc::new(NodeMetrics::new().context("failed to register metrics")?);

    // --- Flooding ---
    let flooder = Flooder::new(
        config.incoming_miners_addr.clone(),
        config.peer_addresses.clone(),
        Arc::new(TcpPeerClient),
    )
    .with_timeout(PEER_REQUEST_TIMEOUT);
    let flood_metrics = metrics.clone();
    runtime.spawn_flooder(flooder, move |report| {
        flood_metrics.observe_flood(report);
        for (peer, e) in &report.failures {
            warn!(%peer, error = %e, "block not delivered");
        }
    });

    // --- Listeners ---
    let (clients, _) = transport::bind(&config.incoming_clients_addr).await?;
    let (miners, _) = transport::bind(&config.incoming_miners_addr).await?;
    let mut servers = vec![
        tokio::spawn(transport::serve(clients, Port::Clients, node.clone(), metrics.clone())),
        tokio::spawn(transport::serve(miners, Port::Miners, node.clone(), metrics.clone())),
    ];

    // --- Status API ---
    if let Some(http_addr) = &config.http_addr {
        let router = api::create_router(api::AppState {
            version: format!("{} (protocol {})", env!("CARGO_PKG_VERSION"), PROTOCOL_VERSION),
            node: node.clone(),
            metrics: metrics.clone(),
        });
        let (listener, addr) = transport::bind(http_addr).await?;
        info!(%addr, "status API listening");
        let mut shutdown = node.subscribe_shutdown();
        servers.push(tokio::spawn(async move {
            let graceful = async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(graceful)
                .await
            {
                error!(error = %e, "status API stopped");
            }
        }));
    }

    servers.push(tokio::spawn(metrics::track_chain(node.clone(), metrics.clone())));

    // --- Periodic snapshots ---
    if config.snapshot.interval_secs > 0 {
        servers.push(tokio::spawn(snapshot_loop(
            node.clone(),
            Duration::from_secs(config.snapshot.interval_secs),
        )));
    }

    // --- Wait ---
    let mut stopped = node.subscribe_shutdown();
    tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received");
            match node.store_snapshot() {
                Ok(blocks) => info!(blocks, "final snapshot stored"),
                Err(e) => error!(error = %e, "final snapshot failed"),
            }
            node.shutdown();
        }
        _ = stopped.wait_for(|stop| *stop) => {
            info!("miner stopped by request");
        }
    }

    runtime.join().await;
    for server in servers {
        if let Err(e) = server.await {
            warn!(error = %e, "server task ended abnormally");
        }
    }
    info!("rfs-miner stopped");
    Ok(())
}

async fn snapshot_loop(node: Arc<MinerNode>, every: Duration) {
    let mut shutdown = node.subscribe_shutdown();
    let mut interval = tokio::time::interval(every);
    // The first tick fires immediately.
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = node.store_snapshot() {
                    error!(error = %e, "periodic snapshot failed");
                }
            }
            _ = shutdown.wait_for(|stop| *stop) => break,
        }
    }
}

/// Write a devnet config for a single local miner.
fn init_config(args: cli::InitArgs) -> Result<()> {
    if args.output.exists() && !args.force {
        bail!(
            "{} already exists, pass --force to overwrite",
            args.output.display()
        );
    }
    let config = MinerConfig::devnet(args.miner_id);
    config.validate().context("devnet config is invalid")?;

    let body = serde_json::to_string_pretty(&config)?;
    std::fs::write(&args.output, body)
        .with_context(|| format!("failed to write {}", args.output.display()))?;

    println!("Config written to {}", args.output.display());
    println!("  Miner id     : {}", config.miner_id);
    println!("  Genesis hash : {}", config.common.genesis_block_hash);
    println!("  Clients port : {}", config.incoming_clients_addr);
    println!("  Miners port  : {}", config.incoming_miners_addr);
    Ok(())
}

fn inspect_snapshot(args: cli::InspectArgs) -> Result<()> {
    let tree = inspect::load_tree(&args.snapshot)
        .with_context(|| format!("failed to read snapshot {}", args.snapshot.display()))?;
    match &args.output {
        Some(path) => {
            let mut file = std::fs::File::create(path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            inspect::render_dot(&tree, &mut file)?;
            eprintln!(
                "{} blocks, height {}, written to {}",
                tree.len(),
                tree.height(),
                path.display()
            );
        }
        None => inspect::render_dot(&tree, &mut std::io::stdout().lock())?,
    }
    Ok(())
}

/// Send one request to a miner's client port and print the response.
async fn send_request(args: cli::SendArgs) -> Result<()> {
    let request = match args.request {
        SendRequest::Create { filename } => Request::CreateFile { filename },
        SendRequest::Append { filename, record } => Request::AppendRecord {
            filename,
            record: record.into_bytes(),
        },
        SendRequest::List => Request::ListFiles,
        SendRequest::Total { filename } => Request::TotalRecords { filename },
        SendRequest::Read { filename, index } => Request::ReadRecord { filename, index },
        SendRequest::StoreAndStop => Request::StoreAndStop,
    };

    let mut stream = TcpStream::connect(&args.addr)
        .await
        .with_context(|| format!("failed to connect to {}", args.addr))?;
    let response = exchange(&mut stream, &Envelope::client(request))
        .await
        .context("request failed")?;

    match response {
        Response::Error { message } => bail!("miner refused the request: {message}"),
        Response::Record { record } => println!("{}", String::from_utf8_lossy(&record)),
        other => println!("{}", serde_json::to_string_pretty(&other)?),
    }
    Ok(())
}

fn print_version() {
    println!("rfs-miner {}", env!("CARGO_PKG_VERSION"));
    println!("protocol  {}", PROTOCOL_VERSION);
    println!("genesis   {}", Block::genesis().hash_hex());
}

/// Resolves on SIGINT (Ctrl+C) or SIGTERM. If a handler cannot be
/// installed, that signal is logged and ignored.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
