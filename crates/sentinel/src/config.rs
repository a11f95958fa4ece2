//! Sentinel configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use sentinel_shm::{Backoff, MIN_SLOT_SIZE};

use crate::error::SentinelError;
use crate::fault::FatalPolicy;

/// Most device channels a single sentinel will create.
pub const MAX_DEVICE_CHANNELS: usize = 16;

/// How producers and consumers wait on a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    /// Sleep between polls once the spin budget is spent.
    pub poll_interval: Duration,
    /// Polls that only spin before sleeping starts.
    pub spin_iterations: u32,
    /// Give up on a call nobody has claimed after this long.
    pub timeout: Option<Duration>,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_micros(200),
            spin_iterations: 64,
            timeout: None,
        }
    }
}

impl WaitPolicy {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.spin_iterations)
    }

    /// One wait step: spin while the budget lasts, then sleep.
    #[inline]
    pub fn pause(&self, backoff: &mut Backoff) {
        if backoff.snooze() {
            thread::sleep(self.poll_interval);
        }
    }
}

/// Configuration for a [`crate::Sentinel`].
#[derive(Debug, Clone)]
pub struct SentinelConfig {
    /// Name of the host channel's shared mapping. Clients attach by it.
    pub map_name: String,
    /// Directory the named mapping lives in.
    pub shm_dir: PathBuf,
    /// Whether to create the host channel.
    pub host_channel: bool,
    /// Number of device channels to create.
    pub device_channels: usize,
    /// Bytes per slot, header included.
    pub slot_size: u32,
    pub slot_count: u32,
    pub wait: WaitPolicy,
    pub fatal: FatalPolicy,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            map_name: "sentinel".to_string(),
            shm_dir: default_shm_dir(),
            host_channel: true,
            device_channels: 1,
            slot_size: 4096,
            slot_count: 8,
            wait: WaitPolicy::default(),
            fatal: FatalPolicy::default(),
        }
    }
}

fn default_shm_dir() -> PathBuf {
    let shm = PathBuf::from("/dev/shm");
    if shm.is_dir() {
        shm
    } else {
        std::env::temp_dir()
    }
}

impl SentinelConfig {
    /// Defaults overridden by `SENTINEL_*` environment variables.
    pub fn from_env() -> Result<Self, SentinelError> {
        Self::from_vars(std::env::vars())
    }

    /// Defaults overridden by the `SENTINEL_*` entries of `vars`.
    /// Unrelated entries are ignored.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, SentinelError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in vars {
            let (key, value) = (key.as_ref(), value.as_ref());
            match key {
                "SENTINEL_MAP_NAME" => config.map_name = value.to_string(),
                "SENTINEL_SHM_DIR" => config.shm_dir = PathBuf::from(value),
                "SENTINEL_HOST" => config.host_channel = parse_bool(key, value)?,
                "SENTINEL_DEVICE_CHANNELS" => config.device_channels = parse(key, value)?,
                "SENTINEL_SLOT_SIZE" => config.slot_size = parse(key, value)?,
                "SENTINEL_SLOT_COUNT" => config.slot_count = parse(key, value)?,
                "SENTINEL_POLL_US" => {
                    config.wait.poll_interval = Duration::from_micros(parse(key, value)?)
                }
                "SENTINEL_SPIN" => config.wait.spin_iterations = parse(key, value)?,
                "SENTINEL_WAIT_TIMEOUT_MS" => {
                    let ms: u64 = parse(key, value)?;
                    config.wait.timeout = (ms > 0).then(|| Duration::from_millis(ms));
                }
                "SENTINEL_FATAL" => config.fatal = parse(key, value)?,
                other if other.starts_with("SENTINEL_") => {
                    tracing::warn!(var = other, "ignoring unknown sentinel variable");
                }
                _ => {}
            }
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SentinelError> {
        if self.map_name.is_empty() || self.map_name.contains('/') {
            return Err(SentinelError::Config(format!(
                "map name {:?} must be non-empty and contain no '/'",
                self.map_name
            )));
        }
        if self.slot_size < MIN_SLOT_SIZE || !self.slot_size.is_multiple_of(8) {
            return Err(SentinelError::Config(format!(
                "slot size {} must be a multiple of 8 and at least {}",
                self.slot_size, MIN_SLOT_SIZE
            )));
        }
        if self.slot_count == 0 {
            return Err(SentinelError::Config("slot count must be at least 1".into()));
        }
        if self.device_channels > MAX_DEVICE_CHANNELS {
            return Err(SentinelError::Config(format!(
                "{} device channels requested, at most {} supported",
                self.device_channels, MAX_DEVICE_CHANNELS
            )));
        }
        Ok(())
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T, SentinelError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| SentinelError::Config(format!("{}={:?}: {}", key, value, e)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, SentinelError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(SentinelError::Config(format!(
            "{}={:?}: expected a boolean",
            key, value
        ))),
    }
}
