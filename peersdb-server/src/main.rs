mod config;
mod net;
mod server;
mod shell;

use anyhow::Context;
use clap::Parser;
use config::Config;
use net::{HttpNetwork, NetworkContentStore};
use peersdb_core::{
    CommandClient, FsContentStore, Method, NodeBuilder, NodeService, NodeState, PeerId, Request,
};
use server::ServerState;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(name = "peersdb")]
#[command(about = "Peer-to-peer contribution log with quorum content validation")]
struct Cli {
    /// Path to an optional configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Name of the local repository
    #[arg(long)]
    repo: Option<String>,

    /// Directory holding node state, the benchmark and local stores
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Address the peer and command API listens on
    #[arg(long)]
    bind_addr: Option<String>,

    /// URL peers use to reach this node
    #[arg(long)]
    advertise_url: Option<String>,

    /// Create the contributions store if none is known yet
    #[arg(long)]
    root: bool,

    /// Read commands from stdin
    #[arg(long)]
    shell: bool,

    /// Serve POST /peersdb/command
    #[arg(long)]
    http: bool,

    /// Where GET stores fetched content
    #[arg(long)]
    download_dir: Option<String>,

    /// Record replication timings and hardware samples
    #[arg(long)]
    benchmark: bool,

    /// Pin every replicated contribution
    #[arg(long)]
    full_replica: bool,

    /// Region tag for the benchmark
    #[arg(long)]
    region: Option<String>,

    /// Peer URL to connect to at startup
    #[arg(long)]
    bootstrap: Option<String>,

    /// Verbose logging
    #[arg(long)]
    dev_logs: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).map(|mut config| {
        config.apply_cli(&cli);
        config
    });
    let dev_logs = config.as_ref().map(|c| c.dev_logs).unwrap_or(cli.dev_logs);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config::log_filter(dev_logs).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match config.and_then(|config| config.validate().map(|_| config)) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    tracing::info!(
        "Starting PeersDB node, repo: {}, bind: {}",
        config.repo,
        config.bind_addr
    );

    if let Err(e) = run(config).await {
        tracing::error!("Node error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let options = config.node_options();

    let state = NodeState::load(&options.state_path()).context("Failed to read node state")?;
    let peer_id = if state.peer_id.is_empty() {
        PeerId::generate()
    } else {
        PeerId::new(state.peer_id)
    };

    let network = Arc::new(
        HttpNetwork::new(peer_id, config.effective_advertise_url())
            .context("Failed to create peer network")?,
    );
    let local_content = Arc::new(
        FsContentStore::new(options.store_dir().join("content"))
            .context("Failed to open content store")?,
    );
    let content = Arc::new(NetworkContentStore::new(
        local_content.clone(),
        network.clone(),
    ));

    let shutdown = CancellationToken::new();
    let ctx = NodeBuilder::new()
        .options(options)
        .transport(network.clone())
        .content(content)
        .log_sync(network.clone())
        .shutdown(shutdown.clone())
        .build()
        .context("Failed to build node")?;
    network.attach_registry(&ctx.logs)?;

    let (client, queues) = CommandClient::channel();
    let service = NodeService::start(ctx.clone(), queues)
        .await
        .context("Failed to start node service")?;

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    tracing::info!(
        peer = %ctx.peer_id,
        "Listening on {}, advertised as {}",
        config.bind_addr,
        network.advertise_url()
    );

    let app = server::router(
        Arc::new(ServerState {
            ctx: ctx.clone(),
            network: network.clone(),
            local_content,
            client: client.clone(),
        }),
        config.http,
    );
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    if let Some(address) = &config.bootstrap {
        let request = Request::new(Method::Connect, vec![address.clone()])?;
        match client.call(request).await {
            Ok(body) => tracing::info!("Bootstrap: {}", body),
            Err(e) => tracing::warn!("Bootstrap connect to {} failed: {}", address, e),
        }
    }

    let shell = config
        .shell
        .then(|| shell::spawn(client.clone(), shutdown.clone()));

    tokio::select! {
        _ = wait_for_signal() => tracing::info!("Shutdown signal received"),
        _ = service.stopped() => tracing::warn!("Node stopped after a fatal error"),
    }
    shutdown.cancel();

    if let Some(shell) = shell {
        let _ = shell.await;
    }
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("HTTP server error: {}", e),
        Err(e) => tracing::warn!("HTTP server task failed: {}", e),
    }

    service
        .shutdown()
        .await
        .context("Failed to flush node state")?;
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        let mut terminate =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    tracing::warn!("Cannot listen for SIGTERM: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
