// netblast binary: load configuration, bring the engine up, run until
// signalled, and print the counters report.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use netblast::config::{load_config, CaptureConfig};
use netblast::sink::EtherTypeSink;
use netblast::Runtime;

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_signal: libc::c_int) {
    STOP.store(true, Ordering::Release);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, handle_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_signal as libc::sighandler_t);
    }
}

#[derive(Parser, Debug)]
#[command(name = "netblast", version, about = "BNG stress: packet engine and stream scheduler")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Write a pcap-NG capture to this file (overrides the config)
    #[arg(long)]
    pcap: Option<PathBuf>,

    /// Include generated stream frames in the capture
    #[arg(long)]
    pcap_streams: bool,

    /// Stop after this many seconds instead of waiting for a signal
    #[arg(long)]
    duration: Option<u64>,

    /// Log filter (tracing EnvFilter syntax)
    #[arg(long, default_value = "info")]
    log: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log).context("invalid log filter")?)
        .init();

    let mut config = load_config(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(path) = cli.pcap {
        let include_streams = cli.pcap_streams
            || config
                .capture
                .as_ref()
                .map(|cap| cap.include_streams)
                .unwrap_or(false);
        config.capture = Some(CaptureConfig {
            file: path,
            include_streams,
        });
    }

    install_signal_handlers();

    let sink = Arc::new(EtherTypeSink::default());
    let mut runtime =
        Runtime::from_config(&config, sink.clone()).context("interface bring-up failed")?;
    tracing::info!(
        interfaces = config.interfaces.len(),
        streams = config.streams.len(),
        "engine running"
    );

    runtime.run(&STOP, cli.duration.map(Duration::from_secs));

    tracing::info!(
        delivered = sink.delivered(),
        ignored = sink.ignored(),
        "shutting down"
    );
    let report = runtime.shutdown();
    serde_json::to_writer_pretty(std::io::stdout().lock(), &report)?;
    println!();
    Ok(())
}
