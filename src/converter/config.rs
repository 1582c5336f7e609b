//! Conversion configuration.
//!
//! Loadable from TOML. Example:
//!
//! ```toml
//! storage_root = "/data/converted"
//! data_kind = "order_log"
//! timeframe_secs = [60, 3600]
//! batch_size = 700
//! ```

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::candles::MAX_TIMEFRAME_SECS;
use super::types::DataKind;

/// Files converted in parallel before the next batch starts.
pub const DEFAULT_BATCH_SIZE: usize = 700;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConverterConfig {
    /// Output storage root; created if missing.
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,

    /// Kind of source files to convert.
    #[serde(default = "default_data_kind")]
    pub data_kind: DataKind,

    /// Candle timeframes in seconds. Empty disables candle derivation.
    #[serde(default)]
    pub timeframe_secs: Vec<u64>,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Worker threads per batch (default: number of cores).
    #[serde(default)]
    pub worker_threads: Option<usize>,
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("storage")
}

fn default_data_kind() -> DataKind {
    DataKind::OrderLog
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            storage_root: default_storage_root(),
            data_kind: default_data_kind(),
            timeframe_secs: Vec::new(),
            batch_size: default_batch_size(),
            worker_threads: None,
        }
    }
}

impl ConverterConfig {
    pub fn new(storage_root: impl Into<PathBuf>, data_kind: DataKind) -> Self {
        Self {
            storage_root: storage_root.into(),
            data_kind,
            ..Self::default()
        }
    }

    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `QSH_CONVERTER_CONFIG` or `qsh_converter.toml`, falling back to defaults.
    pub fn from_env() -> Self {
        let path = std::env::var("QSH_CONVERTER_CONFIG")
            .unwrap_or_else(|_| "qsh_converter.toml".to_string());

        Self::load(&path).unwrap_or_else(|e| {
            tracing::debug!("Using default converter config ({}): {:#}", path, e);
            Self::default()
        })
    }

    /// Save to TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.batch_size > 0, "batch_size must be positive");
        for &secs in &self.timeframe_secs {
            ensure!(
                (1..=MAX_TIMEFRAME_SECS).contains(&secs),
                "timeframe {}s outside 1..={}s",
                secs,
                MAX_TIMEFRAME_SECS
            );
        }
        ensure!(
            self.worker_threads != Some(0),
            "worker_threads must be positive when set"
        );
        Ok(())
    }

    pub fn timeframes(&self) -> Vec<Duration> {
        self.timeframe_secs
            .iter()
            .map(|&s| Duration::from_secs(s))
            .collect()
    }

    /// Replace the candle timeframes. Each must be a whole number of seconds
    /// within one day; on error the current timeframes are kept.
    pub fn set_timeframes(&mut self, timeframes: &[Duration]) -> Result<()> {
        let mut secs = Vec::with_capacity(timeframes.len());
        for tf in timeframes {
            ensure!(tf.subsec_nanos() == 0, "timeframe {:?} is not whole seconds", tf);
            ensure!(
                (1..=MAX_TIMEFRAME_SECS).contains(&tf.as_secs()),
                "timeframe {:?} outside 1..={}s",
                tf,
                MAX_TIMEFRAME_SECS
            );
            secs.push(tf.as_secs());
        }
        self.timeframe_secs = secs;
        Ok(())
    }
}
