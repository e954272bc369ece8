//! Typed, validated configuration (C10, ambient).
//!
//! Mirrors spec §6's configuration table. Every tunable has the documented
//! default; `MeshConfig::load` merges an optional TOML file over
//! `Default::default()`, the same layering the teacher applies to its own
//! `Args`/config handling in `main.rs`, adapted from CLI flags to a file
//! because the mesh engine is a library, not a standalone process.

use serde::{Deserialize, Serialize};
use std::net::SocketAddrV4;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{MeshError, Result};

pub const DEFAULT_PACKET_SIZE: u16 = 1430;
pub const DEFAULT_LISTENER_BACKLOG: u32 = 100;
pub const DEFAULT_DISCOVERY_TRANSMIT_INTERVAL_SECS: u16 = 5;
pub const MAX_DISCOVERY_TRANSMIT_INTERVAL_SECS: u16 = 60;
pub const DEFAULT_TIMESTAMP_ERROR_LIMIT_MS: u32 = 500;
pub const DEFAULT_FILE_CHUNK_SIZE: usize = 16 * 1024;
pub const MIN_FILE_CHUNK_SIZE: usize = 32;
pub const MAX_FILE_CHUNK_SIZE: usize = 1024 * 1024;
pub const DEFAULT_MAX_FILE_SIZE: u64 = 0x7FFF_F000;
pub const DEFAULT_DOWNLOAD_PROGRESS_GRANULARITY: u8 = 1;

/// Discovery engine tunables (spec §4.4 / §6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Beacon emission period. Bounded to <= 60s.
    pub transmit_interval_secs: u16,
    /// Max jitter before updating the stored time-difference estimate.
    pub timestamp_error_limit_ms: u32,
    /// Discovery targets: unicast/broadcast/multicast UDP peers to beacon to.
    pub targets: Vec<SocketAddrV4>,
    /// Local UDP bind address for sending and receiving beacons.
    pub bind: SocketAddrV4,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            transmit_interval_secs: DEFAULT_DISCOVERY_TRANSMIT_INTERVAL_SECS,
            timestamp_error_limit_ms: DEFAULT_TIMESTAMP_ERROR_LIMIT_MS,
            targets: Vec::new(),
            bind: "0.0.0.0:0".parse().unwrap(),
        }
    }
}

impl DiscoveryConfig {
    pub fn transmit_interval(&self) -> Duration {
        Duration::from_secs(self.transmit_interval_secs as u64)
    }

    pub fn timestamp_error_limit(&self) -> Duration {
        Duration::from_millis(self.timestamp_error_limit_ms as u64)
    }

    fn validate(&self) -> Result<()> {
        if self.transmit_interval_secs == 0
            || self.transmit_interval_secs > MAX_DISCOVERY_TRANSMIT_INTERVAL_SECS
        {
            return Err(MeshError::Configuration(format!(
                "discovery.transmit_interval must be in 1..={}s, got {}",
                MAX_DISCOVERY_TRANSMIT_INTERVAL_SECS, self.transmit_interval_secs
            )));
        }
        Ok(())
    }
}

/// File transporter tunables (spec §4.6 / §6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FileConfig {
    pub download_directory: PathBuf,
    pub file_chunk_size: usize,
    pub max_file_size: u64,
    pub download_progress_granularity: u8,
    pub remove_transient_files_on_error: bool,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            download_directory: PathBuf::from("./downloads"),
            file_chunk_size: DEFAULT_FILE_CHUNK_SIZE,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            download_progress_granularity: DEFAULT_DOWNLOAD_PROGRESS_GRANULARITY,
            remove_transient_files_on_error: false,
        }
    }
}

impl FileConfig {
    fn validate(&self) -> Result<()> {
        if self.file_chunk_size < MIN_FILE_CHUNK_SIZE || self.file_chunk_size > MAX_FILE_CHUNK_SIZE
        {
            return Err(MeshError::Configuration(format!(
                "file.file_chunk_size must be in {}..={}, got {}",
                MIN_FILE_CHUNK_SIZE, MAX_FILE_CHUNK_SIZE, self.file_chunk_size
            )));
        }
        if self.download_progress_granularity > 100 {
            return Err(MeshError::Configuration(
                "file.download_progress_granularity must be 0..=100".into(),
            ));
        }
        Ok(())
    }
}

/// Top-level mesh engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MeshConfig {
    pub listener_saddr: SocketAddrV4,
    pub listener_backlog: u32,
    pub packet_size: u16,
    pub discovery: DiscoveryConfig,
    pub file: FileConfig,
    /// Durable outbox directory (sled). Only meaningful when reliable
    /// delivery (C8) is enabled.
    pub outbox_directory: PathBuf,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            listener_saddr: "0.0.0.0:0".parse().unwrap(),
            listener_backlog: DEFAULT_LISTENER_BACKLOG,
            packet_size: DEFAULT_PACKET_SIZE,
            discovery: DiscoveryConfig::default(),
            file: FileConfig::default(),
            outbox_directory: PathBuf::from("./outbox"),
        }
    }
}

impl MeshConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            MeshError::Configuration(format!("cannot read {}: {e}", path.as_ref().display()))
        })?;
        let config: MeshConfig = toml::from_str(&text)
            .map_err(|e| MeshError::Configuration(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if (self.packet_size as usize) <= crate::packet::HEADER_SIZE {
            return Err(MeshError::Configuration(format!(
                "packet_size must exceed header size {}, got {}",
                crate::packet::HEADER_SIZE,
                self.packet_size
            )));
        }
        self.discovery.validate()?;
        self.file.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_self_consistent() {
        let cfg = MeshConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.discovery.transmit_interval_secs, 5);
        assert_eq!(cfg.file.file_chunk_size, 16384);
    }

    #[test]
    fn rejects_oversized_transmit_interval() {
        let mut cfg = MeshConfig::default();
        cfg.discovery.transmit_interval_secs = 61;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_undersized_chunk() {
        let mut cfg = MeshConfig::default();
        cfg.file.file_chunk_size = 4;
        assert!(cfg.validate().is_err());
    }
}
