//! Public status and event types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a registered torrent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TorrentState {
    /// Registered, not downloading
    Stopped,
    /// Announcing and downloading (or complete and seeding)
    Started,
    /// Added from a magnet URI; the info dictionary is still missing
    AwaitingMetadata,
}

/// Consistent point-in-time summary of one torrent.
///
/// Produced by `Engine::snapshot`; safe to hold, serialize, or ship to a
/// UI, since it borrows nothing from engine internals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorrentSnapshot {
    /// Info-hash, lowercase hex
    pub info_hash: String,
    /// Torrent name (or magnet display name)
    pub name: String,
    /// Total content size in bytes; 0 while metadata is pending
    pub total_size: u64,
    /// Verified bytes accepted by the storage engine
    pub bytes_downloaded: u64,
    /// Bytes served to remote peers
    pub bytes_uploaded: u64,
    /// Currently connected peers
    pub connected_peers: usize,
    /// Number of verified pieces
    pub pieces_complete: usize,
    /// Total number of pieces; 0 while metadata is pending
    pub pieces_total: usize,
    pub state: TorrentState,
    /// Whether every piece is verified
    pub is_complete: bool,
    /// Cause of the most recent failure, if any
    pub last_error: Option<String>,
    /// When the torrent was added
    pub added_at: DateTime<Utc>,
}

/// Events broadcast by the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TorrentEvent {
    /// A torrent was registered
    Added { info_hash: String },
    /// A torrent transitioned to Started
    Started { info_hash: String },
    /// A torrent transitioned to Stopped
    Stopped { info_hash: String },
    /// Every piece verified and accepted by storage
    Completed { info_hash: String },
    /// The torrent stopped on an unrecoverable error
    Failed { info_hash: String, error: String },
    /// A torrent was removed from the registry
    Removed { info_hash: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_serializes() {
        let snapshot = TorrentSnapshot {
            info_hash: "ab".repeat(20),
            name: "example".to_string(),
            total_size: 1024,
            bytes_downloaded: 512,
            bytes_uploaded: 0,
            connected_peers: 2,
            pieces_complete: 1,
            pieces_total: 2,
            state: TorrentState::Started,
            is_complete: false,
            last_error: None,
            added_at: Utc::now(),
        };

        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"state\":\"started\""));
        let back: TorrentSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.bytes_downloaded, 512);
    }
}
