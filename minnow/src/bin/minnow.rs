//! minnow node binary.
//!
//! Connects to a proxy runtime and runs the node until Ctrl-C.
//!
//! ```bash
//! minnow --name sensor --proxy-uri calvinip://127.0.0.1:5000 --state-file sensor.state
//! ```
//!
//! Flags override the values of the JSON file given with `--config`.

use clap::Parser;
use minnow::{ActorRegistry, FileStateStore, MemoryStateStore, NodeConfig, Scheduler, StateStore};
use minnow_transport::TokioNetworkProvider;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI arguments
#[derive(Parser, Debug)]
#[command(name = "minnow")]
#[command(about = "Constrained-node actor runtime attached to a proxy runtime", long_about = None)]
struct Args {
    /// Node name published in the registry
    #[arg(long)]
    name: Option<String>,

    /// Proxy URI (calvinip://host:port), repeat for fallbacks
    #[arg(long = "proxy-uri")]
    proxy_uris: Vec<String>,

    /// JSON configuration file
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// File the node state is saved to and restored from
    #[arg(long)]
    state_file: Option<std::path::PathBuf>,

    /// Save state after every change, not only on stop
    #[arg(long)]
    checkpoint: bool,

    /// Vendor id sent to the proxy
    #[arg(long)]
    vid: Option<u32>,

    /// Product id sent to the proxy
    #[arg(long)]
    pid: Option<u32>,
}

fn load_config(args: Args) -> Result<NodeConfig, minnow::ConfigError> {
    let mut builder = NodeConfig::builder();
    if let Some(path) = &args.config {
        builder = builder.json_file(path)?;
    }
    if let Some(name) = args.name {
        builder = builder.name(name);
    }
    if !args.proxy_uris.is_empty() {
        builder = builder.proxy_uris(args.proxy_uris);
    }
    if let Some(path) = args.state_file {
        builder = builder.state_file(path);
    }
    if args.checkpoint {
        builder = builder.checkpoint(true);
    }
    if let Some(vid) = args.vid {
        builder = builder.vid(vid);
    }
    if let Some(pid) = args.pid {
        builder = builder.pid(pid);
    }
    builder.build()
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,minnow=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = load_config(args)?;
    tracing::info!(
        name = %config.name(),
        proxies = config.proxy_uris().len(),
        state_file = ?config.state_file(),
        "starting minnow node"
    );

    let registry = ActorRegistry::with_builtins();
    let network = TokioNetworkProvider::new();
    let store: Box<dyn StateStore> = match config.state_file() {
        Some(path) => Box::new(FileStateStore::new(path)),
        None => Box::new(MemoryStateStore::new()),
    };
    let mut scheduler = Scheduler::restore(config, registry, network, store).await?;

    let stop = scheduler.stop_handle();
    let run = scheduler.run();
    tokio::pin!(run);
    tokio::select! {
        result = &mut run => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, stopping");
            stop.stop();
            run.await?;
        }
    }
    Ok(())
}
