//! Engine facade
//!
//! The `Engine` owns the torrent registry (info-hash to entry) and the
//! process-lifetime peer-id. Facade operations are idempotent where that
//! is natural: adding a known torrent returns it unchanged, starting a
//! started torrent is a no-op, and so on. Snapshots are consistent copies
//! assembled without holding registry locks across any I/O.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::torrent::{
    generate_peer_id, InfoHash, MagnetUri, Metainfo, Sha1Hash, TorrentDownloader, TorrentOptions,
};
use crate::types::{TorrentEvent, TorrentSnapshot, TorrentState};

/// Events buffered per subscriber before lagging
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// How long a magnet may sit without resolved metadata before the
/// timeout cause is recorded
const METADATA_TIMEOUT: Duration = Duration::from_secs(300);

/// Registry entry: either a live torrent or a magnet still waiting for
/// its info dictionary.
enum Entry {
    Active(Arc<TorrentDownloader>),
    AwaitingMetadata(Arc<PendingMagnet>),
}

struct PendingMagnet {
    magnet: MagnetUri,
    added_at: DateTime<Utc>,
    resolved: Arc<tokio::sync::Notify>,
    error: Mutex<Option<String>>,
}

/// Headless BitTorrent download engine
pub struct Engine {
    config: RwLock<EngineConfig>,
    /// One peer-id for the lifetime of the engine instance
    peer_id: Sha1Hash,
    torrents: RwLock<HashMap<InfoHash, Entry>>,
    event_tx: broadcast::Sender<TorrentEvent>,
}

impl Engine {
    /// Create an engine with a validated configuration.
    pub fn new(config: EngineConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Arc::new(Self {
            config: RwLock::new(config),
            peer_id: generate_peer_id(),
            torrents: RwLock::new(HashMap::new()),
            event_tx,
        }))
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<TorrentEvent> {
        self.event_tx.subscribe()
    }

    /// Current configuration (a copy).
    pub fn config(&self) -> EngineConfig {
        self.config.read().clone()
    }

    /// Replace the engine configuration. Any live session is gracefully
    /// stopped first; torrents keep their registration and can be
    /// started again under the new configuration.
    pub async fn configure(&self, config: EngineConfig) -> Result<()> {
        config.validate()?;

        for downloader in self.active_torrents() {
            if let Err(e) = downloader.stop().await {
                tracing::warn!(torrent = %downloader.name(), "stop during reconfigure: {e}");
            }
        }

        *self.config.write() = config;
        Ok(())
    }

    /// Register a torrent from raw .torrent bytes. Adding an info-hash
    /// the engine already knows returns it unchanged.
    pub async fn add_from_file(&self, torrent_bytes: &[u8]) -> Result<InfoHash> {
        let metainfo = Metainfo::parse(torrent_bytes)?;
        let info_hash = metainfo.info_hash;

        {
            let torrents = self.torrents.read();
            if torrents.contains_key(&info_hash) {
                return Ok(info_hash);
            }
        }

        let downloader = self.build_downloader(metainfo)?;
        self.torrents
            .write()
            .insert(info_hash, Entry::Active(Arc::clone(&downloader)));
        self.emit(TorrentEvent::Added {
            info_hash: hex::encode(info_hash),
        });
        tracing::info!(torrent = %downloader.name(), "torrent added");

        if self.config.read().auto_start {
            Arc::clone(&downloader).start().await?;
        }
        Ok(info_hash)
    }

    /// Register a torrent from a magnet URI. The torrent sits in
    /// `AwaitingMetadata` until `resolve_metadata` supplies the info
    /// dictionary; operations that need it fail with `MetadataPending`.
    pub fn add_from_magnet(&self, uri: &str) -> Result<InfoHash> {
        let magnet = MagnetUri::parse(uri)?;
        let info_hash = magnet.info_hash;

        {
            let torrents = self.torrents.read();
            if torrents.contains_key(&info_hash) {
                return Ok(info_hash);
            }
        }

        if !magnet.dropped_trackers.is_empty() {
            tracing::warn!(
                magnet = %magnet.name(),
                dropped = magnet.dropped_trackers.len(),
                "discarded trackers with unsupported schemes"
            );
        }

        let pending = Arc::new(PendingMagnet {
            magnet,
            added_at: Utc::now(),
            resolved: Arc::new(tokio::sync::Notify::new()),
            error: Mutex::new(None),
        });
        self.torrents
            .write()
            .insert(info_hash, Entry::AwaitingMetadata(Arc::clone(&pending)));
        self.emit(TorrentEvent::Added {
            info_hash: hex::encode(info_hash),
        });

        // Nothing may await metadata forever; record the timeout so it
        // shows up in snapshots.
        tokio::spawn(async move {
            let notified = pending.resolved.notified();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(METADATA_TIMEOUT) => {
                    *pending.error.lock() =
                        Some("metadata resolution timed out".to_string());
                }
            }
        });

        Ok(info_hash)
    }

    /// Supply the raw info dictionary for a magnet-added torrent. The
    /// bytes must hash to the registered info-hash.
    pub async fn resolve_metadata(
        &self,
        info_hash: InfoHash,
        info_bytes: &[u8],
    ) -> Result<()> {
        let pending = match self.torrents.read().get(&info_hash) {
            Some(Entry::AwaitingMetadata(p)) => Arc::clone(p),
            Some(Entry::Active(_)) => return Ok(()),
            None => return Err(EngineError::NotFound(hex::encode(info_hash))),
        };

        let metainfo = Metainfo::from_info_bytes(info_bytes, pending.magnet.trackers.clone())?;
        if metainfo.info_hash != info_hash {
            return Err(EngineError::malformed(
                "info dictionary",
                "bytes do not hash to the expected info-hash",
            ));
        }

        let downloader = self.build_downloader(metainfo)?;
        self.torrents
            .write()
            .insert(info_hash, Entry::Active(Arc::clone(&downloader)));
        pending.resolved.notify_waiters();
        tracing::info!(torrent = %downloader.name(), "metadata resolved");

        if self.config.read().auto_start {
            Arc::clone(&downloader).start().await?;
        }
        Ok(())
    }

    /// Transition a torrent to Started. Idempotent.
    pub async fn start(&self, info_hash: InfoHash) -> Result<()> {
        let downloader = self.get_active(info_hash)?;
        downloader.start().await
    }

    /// Close a torrent's connections, flush its storage, and transition
    /// it to Stopped. Idempotent. The completion map stays in memory.
    pub async fn stop(&self, info_hash: InfoHash) -> Result<()> {
        match self.get_entry(info_hash)? {
            Entry::Active(downloader) => downloader.stop().await,
            // Nothing is running for a pending magnet
            Entry::AwaitingMetadata(_) => Ok(()),
        }
    }

    /// Stop a torrent and remove it from the registry. Files on disk are
    /// left alone; their lifecycle belongs to the operator.
    pub async fn delete(&self, info_hash: InfoHash) -> Result<()> {
        let entry = {
            let mut torrents = self.torrents.write();
            torrents
                .remove(&info_hash)
                .ok_or_else(|| EngineError::NotFound(hex::encode(info_hash)))?
        };

        if let Entry::Active(downloader) = entry {
            downloader.stop().await?;
        }

        self.emit(TorrentEvent::Removed {
            info_hash: hex::encode(info_hash),
        });
        Ok(())
    }

    /// Stop every torrent and flush all storage.
    pub async fn shutdown(&self) -> Result<()> {
        for downloader in self.active_torrents() {
            downloader.stop().await?;
        }
        Ok(())
    }

    /// Summaries of every registered torrent. Entry references are
    /// cloned out under the registry lock; all per-torrent reads happen
    /// after it is released and touch no I/O.
    pub fn snapshot(&self) -> Vec<TorrentSnapshot> {
        enum Copied {
            Active(Arc<TorrentDownloader>),
            Pending(Arc<PendingMagnet>, InfoHash),
        }

        let entries: Vec<Copied> = {
            let torrents = self.torrents.read();
            torrents
                .iter()
                .map(|(hash, entry)| match entry {
                    Entry::Active(d) => Copied::Active(Arc::clone(d)),
                    Entry::AwaitingMetadata(p) => Copied::Pending(Arc::clone(p), *hash),
                })
                .collect()
        };

        entries
            .into_iter()
            .map(|entry| match entry {
                Copied::Active(d) => TorrentSnapshot {
                    info_hash: d.info_hash_hex(),
                    name: d.name(),
                    total_size: d.metainfo().info.total_size,
                    bytes_downloaded: d.bytes_downloaded(),
                    bytes_uploaded: d.bytes_uploaded(),
                    connected_peers: d.connected_peers(),
                    pieces_complete: d.pieces_complete(),
                    pieces_total: d.metainfo().num_pieces(),
                    state: d.state(),
                    is_complete: d.is_complete(),
                    last_error: d.last_error(),
                    added_at: d.added_at(),
                },
                Copied::Pending(p, hash) => TorrentSnapshot {
                    info_hash: hex::encode(hash),
                    name: p.magnet.name(),
                    total_size: 0,
                    bytes_downloaded: 0,
                    bytes_uploaded: 0,
                    connected_peers: 0,
                    pieces_complete: 0,
                    pieces_total: 0,
                    state: TorrentState::AwaitingMetadata,
                    is_complete: false,
                    last_error: p.error.lock().clone(),
                    added_at: p.added_at,
                },
            })
            .collect()
    }

    fn build_downloader(&self, metainfo: Metainfo) -> Result<Arc<TorrentDownloader>> {
        let config = self.config.read().clone();
        let options = TorrentOptions {
            max_peers: config.max_peers,
            incoming_port: config.incoming_port,
            enable_seeding: config.enable_seeding,
            enable_upload: config.enable_upload,
            write_buffer_pieces: config.tuning.write_buffer_pieces,
            cache_pieces: config.tuning.cache_pieces,
        };
        Ok(Arc::new(TorrentDownloader::new(
            metainfo,
            config.download_dir,
            options,
            self.peer_id,
            self.event_tx.clone(),
        )?))
    }

    fn get_entry(&self, info_hash: InfoHash) -> Result<Entry> {
        let torrents = self.torrents.read();
        match torrents.get(&info_hash) {
            Some(Entry::Active(d)) => Ok(Entry::Active(Arc::clone(d))),
            Some(Entry::AwaitingMetadata(p)) => Ok(Entry::AwaitingMetadata(Arc::clone(p))),
            None => Err(EngineError::NotFound(hex::encode(info_hash))),
        }
    }

    fn get_active(&self, info_hash: InfoHash) -> Result<Arc<TorrentDownloader>> {
        match self.get_entry(info_hash)? {
            Entry::Active(d) => Ok(d),
            Entry::AwaitingMetadata(_) => Err(EngineError::MetadataPending),
        }
    }

    /// Handle to a registered torrent, for status queries beyond the
    /// snapshot surface.
    pub fn torrent(&self, info_hash: InfoHash) -> Result<Arc<TorrentDownloader>> {
        self.get_active(info_hash)
    }

    fn active_torrents(&self) -> Vec<Arc<TorrentDownloader>> {
        let torrents = self.torrents.read();
        torrents
            .values()
            .filter_map(|entry| match entry {
                Entry::Active(d) => Some(Arc::clone(d)),
                Entry::AwaitingMetadata(_) => None,
            })
            .collect()
    }

    fn emit(&self, event: TorrentEvent) {
        let _ = self.event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha1::{Digest, Sha1};

    fn test_config(dir: &std::path::Path) -> EngineConfig {
        EngineConfig::new()
            .download_dir(dir)
            .auto_start(false)
            .max_peers(4)
    }

    /// Minimal single-file torrent with a real piece hash
    fn test_torrent_bytes() -> Vec<u8> {
        let content = b"hello world";
        let mut hasher = Sha1::new();
        hasher.update(content);
        let piece: [u8; 20] = hasher.finalize().into();

        let mut data = Vec::new();
        data.extend_from_slice(b"d8:announce25:http://t.example/announce");
        data.extend_from_slice(b"4:infod6:lengthi11e4:name9:hello.txt12:piece lengthi32768e");
        data.extend_from_slice(b"6:pieces20:");
        data.extend_from_slice(&piece);
        data.extend_from_slice(b"ee");
        data
    }

    #[tokio::test]
    async fn test_add_is_idempotent_by_info_hash() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(test_config(dir.path())).unwrap();

        let first = engine.add_from_file(&test_torrent_bytes()).await.unwrap();
        let second = engine.add_from_file(&test_torrent_bytes()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(engine.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_info_hash_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(test_config(dir.path())).unwrap();

        let missing = [0xabu8; 20];
        assert!(matches!(
            engine.start(missing).await,
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(
            engine.stop(missing).await,
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(
            engine.delete(missing).await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_removes_registration_but_not_files() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(test_config(dir.path())).unwrap();

        let hash = engine.add_from_file(&test_torrent_bytes()).await.unwrap();
        engine.delete(hash).await.unwrap();
        assert!(engine.snapshot().is_empty());
        assert!(matches!(
            engine.delete(hash).await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_magnet_sits_awaiting_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(test_config(dir.path())).unwrap();

        let uri = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&dn=pending";
        let hash = engine.add_from_magnet(uri).unwrap();

        let snapshots = engine.snapshot();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].state, TorrentState::AwaitingMetadata);
        assert_eq!(snapshots[0].name, "pending");
        assert_eq!(snapshots[0].total_size, 0);

        // Operations that need the info dictionary are refused
        assert!(matches!(
            engine.start(hash).await,
            Err(EngineError::MetadataPending)
        ));
        // Stop has nothing to do but is not an error
        engine.stop(hash).await.unwrap();
    }

    #[tokio::test]
    async fn test_resolve_metadata_upgrades_magnet() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(test_config(dir.path())).unwrap();

        // Carve the info bytes out of a real torrent and register its
        // magnet first
        let torrent = test_torrent_bytes();
        let span = crate::torrent::bencode::top_level_value_span(&torrent, b"info")
            .unwrap()
            .unwrap();
        let info_bytes = &torrent[span];
        let metainfo = Metainfo::parse(&torrent).unwrap();

        let uri = format!(
            "magnet:?xt=urn:btih:{}&dn=hello&tr=http%3A%2F%2Ft.example%2Fannounce",
            metainfo.info_hash_hex()
        );
        let hash = engine.add_from_magnet(&uri).unwrap();

        // Wrong bytes are rejected
        assert!(engine.resolve_metadata(hash, b"de").await.is_err());

        engine.resolve_metadata(hash, info_bytes).await.unwrap();
        let snapshots = engine.snapshot();
        assert_eq!(snapshots[0].state, TorrentState::Stopped);
        assert_eq!(snapshots[0].total_size, 11);
        assert_eq!(snapshots[0].name, "hello.txt");
    }

    #[tokio::test]
    async fn test_configure_rejects_invalid_port() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(test_config(dir.path())).unwrap();

        let bad = EngineConfig::new().download_dir(dir.path()).incoming_port(0);
        assert!(matches!(
            engine.configure(bad).await,
            Err(EngineError::Configuration { .. })
        ));

        // The old configuration is untouched
        assert_eq!(engine.config().incoming_port, 6881);
    }

    #[tokio::test]
    async fn test_snapshot_reflects_added_torrent() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(test_config(dir.path())).unwrap();

        let hash = engine.add_from_file(&test_torrent_bytes()).await.unwrap();
        let snapshots = engine.snapshot();
        assert_eq!(snapshots.len(), 1);

        let snap = &snapshots[0];
        assert_eq!(snap.info_hash, hex::encode(hash));
        assert_eq!(snap.name, "hello.txt");
        assert_eq!(snap.total_size, 11);
        assert_eq!(snap.pieces_total, 1);
        assert_eq!(snap.bytes_downloaded, 0);
        assert_eq!(snap.state, TorrentState::Stopped);
        assert!(!snap.is_complete);
    }
}
