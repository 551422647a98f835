#[cfg(not(target_os = "linux"))]
compile_error!("shmcast reads frames from POSIX shared memory and only builds on Linux");

mod config;
mod options;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use options::{Args, RunConfig};
use shmcast_media::{EncodeLoop, EncoderSettings, FrameEncoder, OpenH264Engine, PublishBridge, ShmFrameSource};
use shmcast_net::{BusHandle, UdpBus};
use tracing_subscriber::EnvFilter;

/// How long to wait for the encode loop to finish after a stop request.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "info,shmcast=debug,shmcast_media=debug,shmcast_net=debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .init();
}

type Bridge = EncodeLoop<Arc<ShmFrameSource>, OpenH264Engine, UdpBus>;

/// What the signal handler needs to stop a running bridge.
struct StopHandle {
    bus: BusHandle,
    source: Arc<ShmFrameSource>,
}

impl StopHandle {
    /// Stop the bus and wake the loop if it is blocked waiting for a frame.
    fn stop(&self) {
        self.bus.stop();
        self.source.interrupt();
    }
}

/// Resolve settings and acquire resources in order: source, encoder, bus.
///
/// Anything acquired before a failure is released on return.
fn start(run: &RunConfig) -> Result<(Bridge, StopHandle)> {
    let settings = EncoderSettings::build(&run.encoder)?;
    let source = Arc::new(ShmFrameSource::attach(&run.name)?);
    let encoder = FrameEncoder::open(&settings)?;
    let bus = UdpBus::connect(run.cid).context("failed to join bus session")?;
    let stop = StopHandle {
        bus: bus.handle(),
        source: Arc::clone(&source),
    };

    let bridge = PublishBridge::new(settings.width, settings.height, run.sender_id);
    let encode_loop = EncodeLoop::new(source, encoder, bridge, bus, settings.verbose)?;
    Ok((encode_loop, stop))
}

async fn run(args: Args) -> Result<()> {
    let file = config::load(args.config.as_deref())?;
    let run = args.resolve(file);
    tracing::info!(name = %run.name, cid = run.cid, sender_id = run.sender_id, "shmcast starting");

    let (encode_loop, stop) = start(&run)?;
    let mut task = tokio::task::spawn_blocking(move || encode_loop.run());

    tokio::select! {
        report = &mut task => {
            let report = report.context("encode loop panicked")?;
            tracing::info!(exit = ?report.exit, "shmcast stopped");
            return Ok(());
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for interrupt")?;
            tracing::info!("interrupt received");
            stop.stop();
        }
    }

    match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
        Ok(report) => {
            let report = report.context("encode loop panicked")?;
            tracing::info!(exit = ?report.exit, "shmcast stopped");
            Ok(())
        }
        Err(_) => {
            // The loop is stuck inside the engine, not in `wait`. Exiting here
            // leaves the engine unclosed; the OS reclaims it with the process.
            tracing::warn!("encode loop did not stop in time, exiting without closing the encoder");
            std::process::exit(0);
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    init_tracing(args.verbose);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("shmcast failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}
