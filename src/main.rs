use anyhow::Context as _;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use redgate::{Config, Context, ProxyError, ReverseProxy, Server, Transport};

#[derive(Parser)]
#[command(name = "redgate")]
#[command(about = "A RESP reverse proxy that shards Redis traffic over a consistent-hash ring")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, overriding the configuration file.
    #[arg(short, long)]
    bind: Option<String>,

    /// Upstream servers: `[name@]host:port,…` or `consul://host/service`.
    #[arg(short, long)]
    upstream: Option<String>,

    /// Batch pipelined commands into single dispatches.
    #[arg(long)]
    enable_pipeline: bool,

    /// Reissue requests once when a backend answers with MOVED.
    #[arg(long)]
    enable_retry: bool,

    /// Seconds to wait for in-flight requests on shutdown.
    #[arg(long, default_value_t = 30)]
    grace_sec: u64,

    /// Enable debug logging.
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_from_file(path)
            .with_context(|| format!("loading configuration from {path:?}"))?,
        None => Config::default(),
    };

    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }
    if let Some(upstream) = cli.upstream {
        config.proxy.upstream = upstream;
    }
    if cli.enable_pipeline {
        config.server.enable_pipeline = true;
    }
    if cli.enable_retry {
        config.server.enable_retry = true;
    }
    if cli.debug {
        config.logging.level = "debug".to_string();
    }

    init_logging(&config);
    config.validate().context("invalid configuration")?;

    let registry = config.build_registry().context("building the registry")?;
    let transport = Arc::new(Transport::new(config.transport_config()));
    let proxy = Arc::new(ReverseProxy::new(transport, registry));
    let server = Arc::new(Server::new(config.server_config(), proxy));

    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %config.server.bind,
        upstream = %config.proxy.upstream,
        pipeline = config.server.enable_pipeline,
        retry = config.server.enable_retry,
        "starting redgate"
    );

    let serving = server.clone();
    let serve_task = tokio::spawn(async move { serving.listen_and_serve().await });

    wait_for_signal().await?;
    info!("signal received, shutting down");

    server
        .shutdown(Context::with_timeout(Duration::from_secs(cli.grace_sec)))
        .await
        .context("graceful shutdown")?;

    match serve_task.await? {
        Ok(()) | Err(ProxyError::ServerClosed) => Ok(()),
        Err(err) => Err(err).context("serve loop failed"),
    }
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Block until SIGINT or SIGTERM.
async fn wait_for_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            out = tokio::signal::ctrl_c() => out.context("installing SIGINT handler")?,
            _ = term.recv() => {}
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("installing SIGINT handler")?;
        Ok(())
    }
}
