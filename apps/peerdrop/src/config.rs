//! Command line configuration.
//!
//! Stored as TOML at `$XDG_CONFIG_HOME/peerdrop/config.toml`, falling back
//! to `~/.config/peerdrop/config.toml`. Missing keys take their defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use peerdrop_chunk_cache::CacheConfig;
use peerdrop_protocol::constants::{DEFAULT_BLOCK_SIZE, DEFAULT_CHUNK_SIZE};
use peerdrop_session::{ReconnectConfig, SessionConfig};
use peerdrop_transfer::TransferConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Holds the chunk database and merged files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Chunk size for files this peer sends.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Payload bytes per framed block.
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// zlib level, 0-9.
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,

    /// Parallel data channels per transfer.
    #[serde(default = "default_channels")]
    pub channels: usize,

    /// Seconds between receiver requests for missing chunks.
    #[serde(default = "default_request_interval")]
    pub request_interval_secs: u64,

    /// Queued chunks that trigger a batch commit.
    #[serde(default = "default_write_queue")]
    pub write_queue_capacity: usize,

    /// Files above this many bytes are merged chunk by chunk.
    #[serde(default = "default_stream_merge_threshold")]
    pub stream_merge_threshold: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
}

fn default_data_dir() -> PathBuf {
    data_dir_from(
        std::env::var("XDG_DATA_HOME").ok(),
        std::env::var("HOME").ok(),
    )
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_block_size() -> usize {
    DEFAULT_BLOCK_SIZE
}

fn default_compression_level() -> u32 {
    6
}

fn default_channels() -> usize {
    2
}

fn default_request_interval() -> u64 {
    10
}

fn default_write_queue() -> usize {
    CacheConfig::default().write_queue_capacity
}

fn default_stream_merge_threshold() -> u64 {
    CacheConfig::default().stream_merge_threshold
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_reconnect_attempts() -> u32 {
    ReconnectConfig::default().max_attempts
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            chunk_size: default_chunk_size(),
            block_size: default_block_size(),
            compression_level: default_compression_level(),
            channels: default_channels(),
            request_interval_secs: default_request_interval(),
            write_queue_capacity: default_write_queue(),
            stream_merge_threshold: default_stream_merge_threshold(),
            connect_timeout_secs: default_connect_timeout(),
            auto_reconnect: default_true(),
            reconnect_attempts: default_reconnect_attempts(),
        }
    }
}

impl Config {
    /// Loads `path` (or the default location), writing the defaults there
    /// when the file does not exist yet.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => config_path(),
        };

        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let config: Config = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.chunk_size > 0, "chunk_size must be positive");
        anyhow::ensure!(self.channels > 0, "channels must be at least 1");
        self.transfer_config().validate()?;
        Ok(())
    }

    /// SQLite database holding chunks and metadata.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("chunks.db")
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            files_dir: self.data_dir.join("files"),
            write_queue_capacity: self.write_queue_capacity,
            stream_merge_threshold: self.stream_merge_threshold,
        }
    }

    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            block_size: self.block_size,
            compression_level: self.compression_level,
            request_interval: Duration::from_secs(self.request_interval_secs),
            ..TransferConfig::default()
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            auto_reconnect: self.auto_reconnect,
            reconnect: ReconnectConfig {
                max_attempts: self.reconnect_attempts,
                ..ReconnectConfig::default()
            },
        }
    }
}

/// Default location of the configuration file.
pub fn config_path() -> PathBuf {
    config_path_from(
        std::env::var("XDG_CONFIG_HOME").ok(),
        std::env::var("HOME").ok(),
    )
}

fn config_path_from(xdg: Option<String>, home: Option<String>) -> PathBuf {
    base_dir(xdg, home, ".config")
        .join("peerdrop")
        .join("config.toml")
}

fn data_dir_from(xdg: Option<String>, home: Option<String>) -> PathBuf {
    base_dir(xdg, home, ".local/share").join("peerdrop")
}

/// `xdg` when set and non-empty, otherwise `home/fallback`.
fn base_dir(xdg: Option<String>, home: Option<String>, fallback: &str) -> PathBuf {
    match xdg.filter(|v| !v.is_empty()) {
        Some(dir) => PathBuf::from(dir),
        None => PathBuf::from(home.unwrap_or_else(|| "/tmp".into())).join(fallback),
    }
}
