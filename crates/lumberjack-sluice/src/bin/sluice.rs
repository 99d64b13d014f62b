use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use serde_json::Value;
use tracing::info;

use lumberjack_sluice::{FrameParser, Sluice, SluiceFile, format_report};

/// Sluice - follow remote lumberjack streams and report on them
#[derive(Parser, Debug)]
#[command(name = "sluice")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML file listing the [[sluice]] entries to open
    #[arg(long, value_name = "FILE")]
    config: PathBuf,

    /// Default log level when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,

    /// Seconds between stats reports
    #[arg(long, default_value = "10")]
    report_interval: u64,
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
    let file = SluiceFile::load(&args.config)?;
    let config = file.sluice_config();

    let mut sluices = Vec::with_capacity(file.sluices.len());
    for entry in &file.sluices {
        let mut parser = entry.parser.build(&entry.url);
        let mut sluice = Sluice::new(
            entry.url.clone(),
            move |frame: Value| parser.parse(frame),
            config.clone(),
        );
        sluice.open()?;
        sluices.push(sluice);
    }
    info!(count = sluices.len(), "Sluices open");

    let mut report = tokio::time::interval(Duration::from_secs(args.report_interval.max(1)));
    report.tick().await;

    loop {
        tokio::select! {
            _ = report.tick() => {
                eprint!("{}", format_report(sluices.iter().map(|s| (s.url(), s.stats()))));
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
        }
    }

    info!("Closing sluices");
    for sluice in &mut sluices {
        sluice.close();
    }
    for sluice in &mut sluices {
        sluice.closed().await;
    }
    eprint!("{}", format_report(sluices.iter().map(|s| (s.url(), s.stats()))));

    Ok(())
}
