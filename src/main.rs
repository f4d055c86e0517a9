use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use tracing::info;

use layered_tunnel::{logging, Config, Context, Hub};

#[derive(Parser, Debug)]
#[command(name = "layered-tunnel", version, about = "Layered forward-proxy tunnel")]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Override the listen host
    #[arg(long)]
    host: Option<String>,

    /// Override the listen port
    #[arg(long)]
    port: Option<u16>,

    /// Override the log level (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    logging::init(&config.log_level);

    let ctx = Context::new(config).context("invalid configuration")?;
    info!(
        "layered-tunnel v{} starting: {}",
        env!("CARGO_PKG_VERSION"),
        ctx.config.summary()
    );

    let hub = Hub::bind(ctx.clone()).await.context("binding listener")?;
    tokio::select! {
        result = hub.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }
    ctx.stats.print_stats();
    Ok(())
}
