//! Server configuration: JSON file, then command line / environment overrides

use clap::{Parser, ValueEnum};
use emg_core::{config_error, EmgError, EmgResult};
use emg_processing::FilterSettings;
use emg_source::SourceSettings;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What the sweeper does with sessions whose connection is gone
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum OrphanPolicy {
    #[default]
    Discard,
    Save,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Directory holding saved sessions
    pub data_dir: PathBuf,
    /// Front end served at `/` when set
    pub static_dir: Option<PathBuf>,
    /// Samples per channel pulled on every tick
    pub chunk_size: usize,
    pub send_interval_ms: u64,
    pub orphan_grace_secs: u64,
    pub sweep_interval_secs: u64,
    pub orphan_policy: OrphanPolicy,
    pub filter: FilterSettings,
    pub source: SourceSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8000)),
            data_dir: PathBuf::from("./sessions"),
            static_dir: None,
            chunk_size: 20,
            send_interval_ms: 50,
            orphan_grace_secs: 300,
            sweep_interval_secs: 30,
            orphan_policy: OrphanPolicy::Discard,
            filter: FilterSettings::default(),
            source: SourceSettings::default(),
        }
    }
}

impl ServerConfig {
    /// File config (if any) with CLI and environment overrides applied, validated
    pub fn load(cli: &Cli) -> EmgResult<Self> {
        let mut config = match &cli.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        cli.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> EmgResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            config_error!("cannot read config file {}: {}", path.display(), e)
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(json: &str) -> EmgResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| EmgError::config(format!("Failed to parse server config: {}", e)))
    }

    pub fn validate(&self) -> EmgResult<()> {
        if self.chunk_size == 0 || self.chunk_size > self.source.buffer_capacity {
            return Err(config_error!(
                "chunk_size must be between 1 and the source buffer capacity ({}), got {}",
                self.source.buffer_capacity,
                self.chunk_size
            ));
        }
        if self.send_interval_ms == 0 {
            return Err(config_error!("send_interval_ms must be at least 1"));
        }
        if self.sweep_interval_secs == 0 {
            return Err(config_error!("sweep_interval_secs must be at least 1"));
        }
        self.filter.validate()?;
        self.source.validate()
    }

    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms)
    }

    pub fn orphan_grace(&self) -> Duration {
        Duration::from_secs(self.orphan_grace_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// EMG acquisition and streaming server
#[derive(Debug, Default, Parser)]
#[command(name = "emg-server", version, about)]
pub struct Cli {
    /// JSON configuration file
    #[arg(long, env = "EMG_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "EMG_BIND_ADDR")]
    pub bind_addr: Option<SocketAddr>,

    #[arg(long, env = "EMG_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[arg(long, env = "EMG_STATIC_DIR")]
    pub static_dir: Option<PathBuf>,

    #[arg(long, env = "EMG_CHUNK_SIZE")]
    pub chunk_size: Option<usize>,

    #[arg(long, env = "EMG_SEND_INTERVAL_MS")]
    pub send_interval_ms: Option<u64>,

    #[arg(long, env = "EMG_ORPHAN_GRACE_SECS")]
    pub orphan_grace_secs: Option<u64>,

    #[arg(long, value_enum, env = "EMG_ORPHAN_POLICY")]
    pub orphan_policy: Option<OrphanPolicy>,

    /// Synthetic source channel count
    #[arg(long, env = "EMG_CHANNELS")]
    pub channels: Option<usize>,

    /// Synthetic source sample rate in Hz
    #[arg(long, env = "EMG_SAMPLE_RATE")]
    pub sample_rate: Option<f64>,

    /// Seed for reproducible synthetic data
    #[arg(long, env = "EMG_SEED")]
    pub seed: Option<u64>,
}

impl Cli {
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(addr) = self.bind_addr {
            config.bind_addr = addr;
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(dir) = &self.static_dir {
            config.static_dir = Some(dir.clone());
        }
        if let Some(chunk_size) = self.chunk_size {
            config.chunk_size = chunk_size;
        }
        if let Some(ms) = self.send_interval_ms {
            config.send_interval_ms = ms;
        }
        if let Some(secs) = self.orphan_grace_secs {
            config.orphan_grace_secs = secs;
        }
        if let Some(policy) = self.orphan_policy {
            config.orphan_policy = policy;
        }
        if let Some(channels) = self.channels {
            config.source.channel_count = channels;
        }
        if let Some(rate) = self.sample_rate {
            config.source.sample_rate = rate;
        }
        if self.seed.is_some() {
            config.source.seed = self.seed;
        }
    }
}
