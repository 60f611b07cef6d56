//! Board engine configuration

use std::time::Duration;

use thiserror::Error;

use crate::bus::DEFAULT_CHANNEL_CAPACITY;
use crate::media::preview::{DEFAULT_PREVIEW_QUALITY, DEFAULT_PREVIEW_WIDTH};

/// Default history capacity per board
pub const DEFAULT_CAPACITY: usize = 20;

/// Default rolling TTL of a board
pub const DEFAULT_TTL: Duration = Duration::from_secs(48 * 3600);

/// Default interval between orphan sweeps
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Default maximum accepted entry size (5 MiB)
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 5 * 1024 * 1024;

/// Error in configuration values
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {name}")]
    InvalidValue { name: &'static str, value: String },

    #[error("history capacity must be at least 1")]
    ZeroCapacity,

    #[error("ttl must be at least one second")]
    ZeroTtl,
}

/// Board engine configuration options
#[derive(Debug, Clone)]
pub struct BoardConfig {
    /// Maximum entries kept per board
    pub capacity: usize,

    /// Rolling expiry, refreshed on every write
    pub ttl: Duration,

    /// Maximum accepted entry size in bytes
    pub max_payload_bytes: usize,

    /// Events buffered per board channel before a slow session lags
    pub bus_capacity: usize,

    /// Push messages buffered per session before it is dropped
    pub outbound_buffer: usize,

    /// Periodic orphan sweep interval (None = sweep at start only)
    ///
    /// Expired boards leave their payloads behind until a sweep runs.
    pub sweep_interval: Option<Duration>,

    /// Payloads younger than this are never swept
    pub sweep_grace: Duration,

    /// Maximum preview width in pixels
    pub preview_width: u32,

    /// JPEG quality of previews
    pub preview_quality: u8,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            ttl: DEFAULT_TTL,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            bus_capacity: DEFAULT_CHANNEL_CAPACITY,
            outbound_buffer: 32,
            sweep_interval: Some(DEFAULT_SWEEP_INTERVAL),
            sweep_grace: Duration::from_secs(300),
            preview_width: DEFAULT_PREVIEW_WIDTH,
            preview_quality: DEFAULT_PREVIEW_QUALITY,
        }
    }
}

impl BoardConfig {
    /// Load from process environment on top of the defaults
    ///
    /// Reads `MAX_ENTRIES_PER_BOARD`, `ENTRY_TTL_HOURS`,
    /// `MAX_UPLOAD_SIZE_MB` and `PAYLOAD_SWEEP_SECS`. A sweep interval of `0`
    /// disables periodic sweeps.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load using an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(n) = parse_var::<usize, _>(&lookup, "MAX_ENTRIES_PER_BOARD")? {
            config.capacity = n;
        }
        if let Some(hours) = parse_var::<u64, _>(&lookup, "ENTRY_TTL_HOURS")? {
            config.ttl = Duration::from_secs(hours * 3600);
        }
        if let Some(mb) = parse_var::<usize, _>(&lookup, "MAX_UPLOAD_SIZE_MB")? {
            config.max_payload_bytes = mb * 1024 * 1024;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "PAYLOAD_SWEEP_SECS")? {
            config.sweep_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }

        config.validate()?;
        Ok(config)
    }

    /// Check invariants the engine relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.ttl.as_secs() == 0 {
            return Err(ConfigError::ZeroTtl);
        }
        Ok(())
    }

    /// Set history capacity
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set board TTL
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set maximum accepted entry size
    pub fn max_payload_bytes(mut self, max: usize) -> Self {
        self.max_payload_bytes = max;
        self
    }

    /// Set per-board bus buffer
    pub fn bus_capacity(mut self, capacity: usize) -> Self {
        self.bus_capacity = capacity;
        self
    }

    /// Set per-session outbound buffer
    pub fn outbound_buffer(mut self, size: usize) -> Self {
        self.outbound_buffer = size;
        self
    }

    /// Set the periodic orphan sweep interval
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    /// Sweep only once, at start
    pub fn without_periodic_sweep(mut self) -> Self {
        self.sweep_interval = None;
        self
    }

    /// Set the minimum payload age for sweeping
    pub fn sweep_grace(mut self, grace: Duration) -> Self {
        self.sweep_grace = grace;
        self
    }
}

fn parse_var<T, F>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { name, value }),
    }
}
