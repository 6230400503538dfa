//! Engine configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{EngineError, Result};

/// Engine-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Base directory for allocated files
    pub download_dir: PathBuf,

    /// TCP port advertised to trackers for incoming peers
    pub incoming_port: u16,

    /// Serve block requests from remote peers (upload serving is not
    /// implemented; the flag is recognised and carried)
    pub enable_upload: bool,

    /// Keep peer connections open after a torrent completes
    pub enable_seeding: bool,

    /// Newly added torrents begin in the Started state
    pub auto_start: bool,

    /// Soft cap on outbound peer connections per torrent
    pub max_peers: usize,

    /// Lower-level knobs, rarely changed
    #[serde(default)]
    pub tuning: Tuning,
}

/// Tuning knobs for the torrent machinery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tuning {
    /// Pieces held in the storage write buffer before an automatic flush
    #[serde(default = "default_write_buffer_pieces")]
    pub write_buffer_pieces: usize,

    /// Capacity of the served-piece cache, in pieces
    #[serde(default = "default_cache_pieces")]
    pub cache_pieces: usize,
}

fn default_write_buffer_pieces() -> usize {
    crate::storage::DEFAULT_WRITE_BUFFER_PIECES
}

fn default_cache_pieces() -> usize {
    crate::storage::DEFAULT_CACHE_PIECES
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            write_buffer_pieces: default_write_buffer_pieces(),
            cache_pieces: default_cache_pieces(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("."),
            incoming_port: 6881,
            enable_upload: false,
            enable_seeding: false,
            auto_start: true,
            max_peers: 50,
            tuning: Tuning::default(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn download_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.download_dir = path.into();
        self
    }

    pub fn incoming_port(mut self, port: u16) -> Self {
        self.incoming_port = port;
        self
    }

    pub fn auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    pub fn enable_seeding(mut self, seeding: bool) -> Self {
        self.enable_seeding = seeding;
        self
    }

    pub fn max_peers(mut self, max: usize) -> Self {
        self.max_peers = max;
        self
    }

    /// Validate before use. Ports are u16 here, so the out-of-range
    /// check reduces to rejecting zero.
    pub fn validate(&self) -> Result<()> {
        if self.incoming_port == 0 {
            return Err(EngineError::config(
                "incoming_port",
                "port must be between 1 and 65535",
            ));
        }
        if self.download_dir.as_os_str().is_empty() {
            return Err(EngineError::config(
                "download_dir",
                "download directory is required",
            ));
        }
        if self.max_peers == 0 {
            return Err(EngineError::config("max_peers", "must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.incoming_port, 6881);
        assert_eq!(config.max_peers, 50);
        assert!(!config.enable_upload);
    }

    #[test]
    fn test_builder() {
        let config = EngineConfig::new()
            .download_dir("/tmp/downloads")
            .incoming_port(7000)
            .auto_start(false)
            .max_peers(8);
        assert_eq!(config.download_dir, PathBuf::from("/tmp/downloads"));
        assert_eq!(config.incoming_port, 7000);
        assert!(!config.auto_start);
        assert_eq!(config.max_peers, 8);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let config = EngineConfig::new().incoming_port(0);
        assert!(matches!(
            config.validate(),
            Err(EngineError::Configuration {
                field: "incoming_port",
                ..
            })
        ));

        let config = EngineConfig::new().download_dir("");
        assert!(config.validate().is_err());

        let config = EngineConfig::new().max_peers(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tuning_serde_defaults() {
        // A config serialized without tuning gets the defaults back
        let json = r#"{
            "download_dir": "/tmp",
            "incoming_port": 6881,
            "enable_upload": false,
            "enable_seeding": false,
            "auto_start": true,
            "max_peers": 10
        }"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.tuning.write_buffer_pieces, 10);
        assert_eq!(config.tuning.cache_pieces, 64);
    }
}
