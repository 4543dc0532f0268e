//! lancast: a low-latency desktop streaming server.
//!
//! Captures the running compositor, encodes HEVC on the GPU and streams
//! it to a single TCP client, which can push HID input back.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lancast::audio::AudioConfig;
use lancast::server::{Server, ServerOpts};

#[derive(Parser)]
#[command(name = "lancast")]
#[command(about = "Stream the desktop to a single remote client", long_about = None)]
struct Cli {
    /// TCP port to listen on
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,

    /// Do not inject client input through /dev/uhid
    #[arg(long)]
    disable_uhid: bool,

    /// Capture audio with the given "<rate>:<channel_map>" configuration,
    /// e.g. "48000:FL,FR"
    #[arg(long, value_name = "CONFIG")]
    audio: Option<AudioConfig>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    // SIGINT/SIGTERM request an orderly shutdown, observed after each
    // reactor iteration. SIGPIPE is already ignored by the runtime, so
    // a vanished client surfaces as EPIPE on the socket.
    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, shutdown.clone())
            .context("failed to install signal handler")?;
    }

    let mut server = Server::new(
        ServerOpts {
            port: cli.port,
            disable_uhid: cli.disable_uhid,
            audio: cli.audio,
        },
        shutdown.clone(),
    )?;
    tracing::info!("listening on port {}", cli.port);
    server.run()
}
