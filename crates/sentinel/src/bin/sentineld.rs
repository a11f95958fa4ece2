//! sentineld: host-side sentinel server.
//!
//! Creates the host channel (attachable by name) and the device channels,
//! services the file catalogue on all of them, and runs until stdin closes.
//!
//! # Usage
//!
//! ```bash
//! RUST_LOG=sentinel=debug sentineld --map-name demo --devices 2 < /dev/tty
//! ```
//!
//! Flags override the `SENTINEL_*` environment variables.

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use sentinel::catalogue::file_executor;
use sentinel::{FatalPolicy, Sentinel, SentinelConfig, SentinelError};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sentineld")]
#[command(about = "Shared-memory sentinel server")]
struct Args {
    /// Name of the host channel's shared mapping
    #[arg(long)]
    map_name: Option<String>,

    /// Directory for shared mappings
    #[arg(long)]
    shm_dir: Option<PathBuf>,

    /// Number of device channels
    #[arg(long)]
    devices: Option<usize>,

    /// Do not create the host channel
    #[arg(long)]
    no_host: bool,

    /// Bytes per slot, header included
    #[arg(long)]
    slot_size: Option<u32>,

    /// Slots per channel
    #[arg(long)]
    slot_count: Option<u32>,

    /// Give up on unclaimed calls after this many milliseconds (0 = never)
    #[arg(long)]
    wait_timeout_ms: Option<u64>,

    /// What to do on a transport fault: exit, abort or panic
    #[arg(long)]
    fatal: Option<FatalPolicy>,
}

impl Args {
    fn apply(self, config: &mut SentinelConfig) {
        if let Some(name) = self.map_name {
            config.map_name = name;
        }
        if let Some(dir) = self.shm_dir {
            config.shm_dir = dir;
        }
        if let Some(n) = self.devices {
            config.device_channels = n;
        }
        if self.no_host {
            config.host_channel = false;
        }
        if let Some(size) = self.slot_size {
            config.slot_size = size;
        }
        if let Some(count) = self.slot_count {
            config.slot_count = count;
        }
        if let Some(ms) = self.wait_timeout_ms {
            config.wait.timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(policy) = self.fatal {
            config.fatal = policy;
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "sentineld failed");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), SentinelError> {
    let mut config = SentinelConfig::from_env()?;
    args.apply(&mut config);

    let mut sentinel = Sentinel::start(config, Some(file_executor()))?;
    if let Some(host) = sentinel.host() {
        tracing::info!(
            map = %sentinel.config().map_name,
            dir = %sentinel.config().shm_dir.display(),
            offset = host.relocation().offset(),
            "host channel ready"
        );
    }

    // Serve until stdin reaches EOF.
    let mut sink = Vec::new();
    let read = std::io::stdin().read_to_end(&mut sink);

    for channel in sentinel.devices().iter().chain(sentinel.host()) {
        let m = channel.metrics().snapshot();
        tracing::info!(
            channel = %channel.kind(),
            serviced = m.serviced,
            blocking = m.blocking,
            fire_and_forget = m.fire_and_forget,
            replies = m.replies,
            unclaimed = m.unclaimed,
            "channel metrics"
        );
    }
    sentinel.shutdown();
    read?;
    Ok(())
}
