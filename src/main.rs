use std::collections::HashMap;
use std::future::IntoFuture;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use lumberjack::{AppState, ConfigLayer, router};
use lumberjack_lodge::Lodge;
use lumberjack_logs::{LogBuffer, TailManager};
use lumberjack_types::{Fellow, Lumberfile};

/// Lumberjack - tail log files and watch them live, from any node
#[derive(Parser, Debug)]
#[command(name = "lumberjack")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log files to tail
    #[arg(value_name = "FILE")]
    files: Vec<PathBuf>,

    /// HTTP will be served on this port [default: 8080]
    #[arg(long)]
    listen_port: Option<u16>,

    /// Lines of logs to keep in memory per file [default: 200]
    #[arg(long)]
    buffer_len: Option<usize>,

    /// Lodge host to check in with; without it this node hosts the lodge
    #[arg(long, value_name = "HOST[:PORT]")]
    lodge: Option<String>,

    /// Name to check in under [default: hostname]
    #[arg(long)]
    name: Option<String>,

    /// Seconds of silence before a fellow counts as gone [default: 1200]
    #[arg(long)]
    curfew_secs: Option<u64>,

    /// Batches queued per live viewer before it is dropped [default: 64]
    #[arg(long)]
    subscriber_queue: Option<usize>,

    /// Seconds to wait when connecting to another node [default: 30]
    #[arg(long)]
    proxy_connect_timeout_secs: Option<u64>,

    /// TOML file with defaults for any of the options above
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Default log level when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,
}

impl Args {
    fn layer(&self) -> ConfigLayer {
        ConfigLayer {
            files: self.files.clone(),
            listen_port: self.listen_port,
            buffer_len: self.buffer_len,
            lodge: self.lodge.clone(),
            name: self.name.clone(),
            curfew_secs: self.curfew_secs,
            subscriber_queue: self.subscriber_queue,
            proxy_connect_timeout_secs: self.proxy_connect_timeout_secs,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(args.log_level.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = run(args).await;

    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }

    result
}

async fn run(args: Args) -> Result<()> {
    let file = match &args.config {
        Some(path) => ConfigLayer::load(path)?,
        None => ConfigLayer::default(),
    };
    let config = args.layer().over(file).resolve()?;

    // One buffer and one tail per file
    let mut tails = TailManager::new();
    let mut buffers = HashMap::new();
    let mut lumberfiles = Vec::new();
    for path in &config.files {
        let key = path.to_string_lossy().into_owned();
        let buffer = LogBuffer::new(config.buffer_len);
        tails
            .start(path, buffer.clone(), config.buffer_len)
            .with_context(|| format!("Failed to tail {}", key))?;
        lumberfiles.push(Lumberfile::new(key.clone()));
        buffers.insert(key, buffer);
    }

    let me = Fellow::new(config.name.clone())
        .with_curfew(config.curfew)
        .with_lumberfiles(lumberfiles);
    let lodge = Arc::new(Lodge::new(me, config.lodge_authority()).context("Failed to set up the lodge")?);

    let cancel = CancellationToken::new();
    let check_ins = lodge.spawn_check_ins(cancel.clone());

    let listener = TcpListener::bind(("0.0.0.0", config.listen_port))
        .await
        .with_context(|| format!("Failed to listen on port {}", config.listen_port))?;
    let authority = config.lodge_authority();
    info!(
        port = config.listen_port,
        name = %config.name,
        files = config.files.len(),
        lodge = authority.as_deref().unwrap_or("self"),
        "Lumberjack listening"
    );

    let app = router(AppState::new(lodge, buffers, &config));

    // Live streams never finish on their own, so stop without draining them
    tokio::select! {
        result = axum::serve(listener, app).into_future() => result.context("Server failed")?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for ctrl-c")?;
            info!("Shutting down");
        }
    }

    cancel.cancel();
    let _ = check_ins.await;
    tails.stop();

    Ok(())
}
