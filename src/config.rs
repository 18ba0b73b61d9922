//! Configuration module for bdev-aio.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::aio::{QueueConfig, RetryPolicy};
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the AIO bench driver
#[derive(Parser, Debug)]
#[command(name = "bdev-aio")]
#[command(author = "bdev-aio authors")]
#[command(version = "0.1.0")]
#[command(about = "Drive batched Linux AIO writes against a file or block device", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// File or block device to write to
    #[arg(short = 'f', long)]
    pub target: Option<PathBuf>,

    /// Open the target with O_DIRECT
    #[arg(long)]
    pub direct: bool,

    /// Number of blocks to write
    #[arg(short = 'n', long)]
    pub blocks: Option<usize>,

    /// Size of each block in bytes
    #[arg(short = 'b', long)]
    pub block_size: Option<usize>,

    /// Requests handed to each submit_batch call
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Upper bound on requests per io_submit call
    #[arg(long)]
    pub max_submissions_per_call: Option<usize>,

    /// Depth of the kernel AIO context
    #[arg(short = 'd', long)]
    pub max_iodepth: Option<usize>,

    /// Sleep after each submitted chunk, in seconds
    #[arg(long)]
    pub post_chunk_sleep_seconds: Option<f64>,

    /// Read every block back and check its contents
    #[arg(long)]
    pub verify: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub aio: AioSection,
    #[serde(default)]
    pub bench: BenchSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Queue-related configuration
#[derive(Debug, Deserialize)]
pub struct AioSection {
    /// Upper bound on requests per io_submit call
    #[serde(default = "default_max_submissions_per_call")]
    pub max_submissions_per_call: usize,
    /// Throttle after each chunk of a blocking batch
    #[serde(default)]
    pub post_chunk_sleep_seconds: f64,
    /// Depth of the kernel AIO context
    #[serde(default = "default_max_iodepth")]
    pub max_iodepth: usize,
    /// First EAGAIN backoff delay in microseconds
    #[serde(default = "default_retry_initial_delay_us")]
    pub retry_initial_delay_us: u64,
    /// Maximum EAGAIN retries per submission
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    /// Reaper wait per poll in milliseconds
    #[serde(default = "default_reap_timeout_ms")]
    pub reap_timeout_ms: u64,
    /// Completions harvested per poll
    #[serde(default = "default_reap_max")]
    pub reap_max: usize,
}

impl Default for AioSection {
    fn default() -> Self {
        Self {
            max_submissions_per_call: default_max_submissions_per_call(),
            post_chunk_sleep_seconds: 0.0,
            max_iodepth: default_max_iodepth(),
            retry_initial_delay_us: default_retry_initial_delay_us(),
            retry_max_attempts: default_retry_max_attempts(),
            reap_timeout_ms: default_reap_timeout_ms(),
            reap_max: default_reap_max(),
        }
    }
}

/// Bench driver configuration
#[derive(Debug, Deserialize)]
pub struct BenchSection {
    /// File or block device to write to
    pub target: Option<PathBuf>,
    /// Open with O_DIRECT
    #[serde(default)]
    pub direct: bool,
    /// Number of blocks to write
    #[serde(default = "default_blocks")]
    pub blocks: usize,
    /// Size of each block
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    /// Requests per submit_batch call
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Submit batches in blocking mode
    #[serde(default)]
    pub block: bool,
}

impl Default for BenchSection {
    fn default() -> Self {
        Self {
            target: None,
            direct: false,
            blocks: default_blocks(),
            block_size: default_block_size(),
            batch_size: default_batch_size(),
            block: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_max_submissions_per_call() -> usize {
    16
}

fn default_max_iodepth() -> usize {
    1024
}

fn default_retry_initial_delay_us() -> u64 {
    125
}

fn default_retry_max_attempts() -> u32 {
    16
}

fn default_reap_timeout_ms() -> u64 {
    250
}

fn default_reap_max() -> usize {
    16
}

fn default_blocks() -> usize {
    1024
}

fn default_block_size() -> usize {
    4096
}

fn default_batch_size() -> usize {
    64
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_target() -> PathBuf {
    std::env::temp_dir().join("bdev-aio.dat")
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub max_submissions_per_call: usize,
    pub post_chunk_sleep: Duration,
    pub max_iodepth: usize,
    pub retry_initial_delay_us: u64,
    pub retry_max_attempts: u32,
    pub reap_timeout_ms: u64,
    pub reap_max: usize,
    pub target: PathBuf,
    pub direct: bool,
    pub blocks: usize,
    pub block_size: usize,
    pub batch_size: usize,
    pub block: bool,
    pub verify: bool,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Merge parsed CLI args over the TOML file they name, if any.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let TomlConfig {
            aio,
            bench,
            logging,
        } = toml_config;

        // Merge CLI args with TOML config (CLI takes precedence)
        let config = Config {
            max_submissions_per_call: cli
                .max_submissions_per_call
                .unwrap_or(aio.max_submissions_per_call),
            post_chunk_sleep: sleep_duration(
                cli.post_chunk_sleep_seconds
                    .unwrap_or(aio.post_chunk_sleep_seconds),
            )?,
            max_iodepth: cli.max_iodepth.unwrap_or(aio.max_iodepth),
            retry_initial_delay_us: aio.retry_initial_delay_us,
            retry_max_attempts: aio.retry_max_attempts,
            reap_timeout_ms: aio.reap_timeout_ms,
            reap_max: aio.reap_max,
            target: cli
                .target
                .or(bench.target)
                .unwrap_or_else(default_target),
            direct: cli.direct || bench.direct,
            blocks: cli.blocks.unwrap_or(bench.blocks),
            block_size: cli.block_size.unwrap_or(bench.block_size),
            batch_size: cli.batch_size.unwrap_or(bench.batch_size),
            block: bench.block,
            verify: cli.verify,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                logging.level
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the queue cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("max_submissions_per_call", self.max_submissions_per_call),
            ("max_iodepth", self.max_iodepth),
            ("reap_max", self.reap_max),
            ("block_size", self.block_size),
            ("batch_size", self.batch_size),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
            }
        }
        Ok(())
    }

    /// Settings handed to the queue.
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_submissions_per_call: self.max_submissions_per_call,
            post_chunk_sleep: self.post_chunk_sleep,
            max_iodepth: self.max_iodepth,
            retry: RetryPolicy {
                initial_delay: Duration::from_micros(self.retry_initial_delay_us),
                max_attempts: self.retry_max_attempts,
            },
        }
    }
}

/// Convert a sleep given in seconds, rejecting negative, NaN and
/// unrepresentably large values.
fn sleep_duration(secs: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs).map_err(|e| {
        ConfigError::Invalid(format!(
            "post_chunk_sleep_seconds must be a non-negative number of seconds, got {secs}: {e}"
        ))
    })
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
