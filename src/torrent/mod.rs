//! BitTorrent protocol stack
//!
//! Leaf modules implement the codec, metainfo, tracker, and peer wire
//! layers; `download` holds the piece pipeline; `TorrentDownloader` ties
//! them together as the per-torrent coordinator that owns the work queue,
//! the peer workers, the storage engine, and the tracker timers.

pub mod bencode;
pub mod download;
pub mod magnet;
pub mod metainfo;
pub mod peer;
pub mod tracker;

pub use bencode::BencodeValue;
pub use download::{download_piece, PieceFailure, PieceResult, WorkItem, PIPELINE_DEPTH};
pub use magnet::MagnetUri;
pub use metainfo::{FileInfo, Info, InfoHash, Metainfo, MetainfoError, Sha1Hash};
pub use peer::{PeerConnection, PeerMessage, BLOCK_SIZE, MAX_FRAME_SIZE};
pub use tracker::{
    generate_peer_id, AnnounceEvent, AnnounceRequest, AnnounceResponse, PeerAddr, TrackerClient,
};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitvec::prelude::*;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};
use crate::storage::StorageEngine;
use crate::types::{TorrentEvent, TorrentState};
use download::{PeerCommand, PeerWorker, WorkQueue};

/// Results the consumer buffers before workers back-pressure
const RESULT_CHANNEL_CAPACITY: usize = 64;

/// Per-torrent options, frozen at add time from the engine config
#[derive(Debug, Clone)]
pub struct TorrentOptions {
    pub max_peers: usize,
    pub incoming_port: u16,
    pub enable_seeding: bool,
    pub enable_upload: bool,
    pub write_buffer_pieces: usize,
    pub cache_pieces: usize,
}

struct TorrentStats {
    /// Verified bytes only; failed attempts do not count
    downloaded: AtomicU64,
    /// Upload serving is out of scope; the counter is announced as-is
    uploaded: AtomicU64,
    /// Piece attempts that came back failed
    failed_attempts: AtomicU64,
}

/// A running (or stopped) torrent: scheduler, peers, storage, timers.
pub struct TorrentDownloader {
    metainfo: Arc<Metainfo>,
    options: TorrentOptions,
    tracker: TrackerClient,
    storage: Arc<StorageEngine>,

    /// Which pieces are verified and accepted by storage. Survives stop;
    /// a restart re-queues only the missing ones.
    completed: Mutex<BitVec<u8, Msb0>>,
    state: Mutex<TorrentState>,
    stats: TorrentStats,
    last_error: Mutex<Option<String>>,

    /// Command channel per connected peer, keyed by address. Have
    /// broadcasts go through here so each socket keeps a single writer.
    peers: Arc<RwLock<HashMap<SocketAddr, mpsc::UnboundedSender<PeerCommand>>>>,

    session: Mutex<Option<Session>>,
    done_tx: watch::Sender<bool>,
    event_tx: broadcast::Sender<TorrentEvent>,
    added_at: DateTime<Utc>,
}

struct Session {
    cancel: CancellationToken,
    tasks: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>,
}

impl TorrentDownloader {
    pub fn new(
        metainfo: Metainfo,
        download_dir: PathBuf,
        options: TorrentOptions,
        peer_id: Sha1Hash,
        event_tx: broadcast::Sender<TorrentEvent>,
    ) -> Result<Self> {
        let metainfo = Arc::new(metainfo);
        let num_pieces = metainfo.num_pieces();
        let storage = Arc::new(StorageEngine::with_tuning(
            Arc::clone(&metainfo),
            download_dir,
            options.write_buffer_pieces,
            options.cache_pieces,
        ));
        let (done_tx, _) = watch::channel(false);

        Ok(Self {
            metainfo,
            options,
            tracker: TrackerClient::new(peer_id)?,
            storage,
            completed: Mutex::new(bitvec![u8, Msb0; 0; num_pieces]),
            state: Mutex::new(TorrentState::Stopped),
            stats: TorrentStats {
                downloaded: AtomicU64::new(0),
                uploaded: AtomicU64::new(0),
                failed_attempts: AtomicU64::new(0),
            },
            last_error: Mutex::new(None),
            peers: Arc::new(RwLock::new(HashMap::new())),
            session: Mutex::new(None),
            done_tx,
            event_tx,
            added_at: Utc::now(),
        })
    }

    pub fn metainfo(&self) -> &Arc<Metainfo> {
        &self.metainfo
    }

    pub fn info_hash(&self) -> InfoHash {
        self.metainfo.info_hash
    }

    pub fn info_hash_hex(&self) -> String {
        self.metainfo.info_hash_hex()
    }

    pub fn name(&self) -> String {
        self.metainfo.info.name.clone()
    }

    pub fn state(&self) -> TorrentState {
        *self.state.lock()
    }

    pub fn added_at(&self) -> DateTime<Utc> {
        self.added_at
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn connected_peers(&self) -> usize {
        self.peers.read().len()
    }

    pub fn pieces_complete(&self) -> usize {
        self.completed.lock().count_ones()
    }

    pub fn is_complete(&self) -> bool {
        self.pieces_complete() == self.metainfo.num_pieces()
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.stats.downloaded.load(Ordering::Relaxed)
    }

    pub fn bytes_uploaded(&self) -> u64 {
        self.stats.uploaded.load(Ordering::Relaxed)
    }

    pub fn failed_attempts(&self) -> u64 {
        self.stats.failed_attempts.load(Ordering::Relaxed)
    }

    /// Verified bytes, derived from the completion map
    pub fn bytes_completed(&self) -> u64 {
        let completed = self.completed.lock();
        completed
            .iter_ones()
            .map(|i| self.metainfo.piece_length(i).unwrap_or(0))
            .sum()
    }

    /// Bytes still missing (the `left` announce counter)
    pub fn bytes_left(&self) -> u64 {
        self.metainfo.info.total_size - self.bytes_completed()
    }

    /// Wait until every piece is verified or the timeout passes.
    pub async fn wait_until_complete(&self, limit: Duration) -> bool {
        let mut rx = self.done_tx.subscribe();
        if *rx.borrow() {
            return true;
        }
        tokio::time::timeout(limit, async {
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .is_ok()
    }

    /// Start the torrent: allocate storage, announce `started`, dial the
    /// returned peers, and spawn the scheduler tasks. Idempotent when
    /// already started.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        if *self.state.lock() == TorrentState::Started {
            return Ok(());
        }
        *self.last_error.lock() = None;

        self.storage.allocate().await.inspect_err(|e| {
            *self.last_error.lock() = Some(e.to_string());
        })?;

        // Everything already verified: nothing to schedule.
        if self.is_complete() {
            *self.state.lock() = TorrentState::Started;
            self.done_tx.send_replace(true);
            self.emit(TorrentEvent::Started {
                info_hash: self.info_hash_hex(),
            });
            return Ok(());
        }

        let response = self.announce(AnnounceEvent::Started).await.inspect_err(|e| {
            *self.last_error.lock() = Some(e.to_string());
        })?;
        tracing::info!(
            torrent = %self.name(),
            peers = response.peers.len(),
            interval = response.interval,
            "announced started"
        );

        let cancel = CancellationToken::new();
        let tasks: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

        let num_pieces = self.metainfo.num_pieces();
        let queue = WorkQueue::new(num_pieces);
        let missing: Vec<u32> = {
            let completed = self.completed.lock();
            (0..num_pieces as u32)
                .filter(|&i| !completed[i as usize])
                .collect()
        };
        for index in missing {
            queue
                .push(WorkItem {
                    index,
                    hash: *self.metainfo.piece_hash(index as usize).unwrap(),
                    length: self.metainfo.piece_length(index as usize).unwrap() as u32,
                })
                .await;
        }

        let (results_tx, results_rx) = mpsc::channel(RESULT_CHANNEL_CAPACITY);

        let connections = self.dial_peers(&response.peers).await;
        if connections.is_empty() {
            *self.last_error.lock() = Some("no peer connections established".to_string());
            return Err(EngineError::NoPeers);
        }
        for conn in connections {
            Self::spawn_peer(&self, conn, &queue, &results_tx, &cancel, &tasks);
        }

        // Result consumer
        {
            let this = Arc::clone(&self);
            let cancel = cancel.clone();
            tasks
                .lock()
                .push(tokio::spawn(async move { this.run_consumer(results_rx, cancel).await }));
        }

        // Tracker timer: wait at least the returned interval, then
        // re-announce and top up peers.
        {
            let this = Arc::clone(&self);
            let cancel = cancel.clone();
            let queue = queue.clone();
            let results_tx = results_tx.clone();
            let tasks_ref = Arc::clone(&tasks);
            let mut interval = response.interval;
            tasks.lock().push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_secs(interval as u64)) => {}
                    }
                    match this.announce(AnnounceEvent::None).await {
                        Ok(response) => {
                            interval = response.interval;
                            let room = this
                                .options
                                .max_peers
                                .saturating_sub(this.peers.read().len());
                            if room > 0 {
                                for conn in this.dial_peers(&response.peers).await {
                                    Self::spawn_peer(
                                        &this,
                                        conn,
                                        &queue,
                                        &results_tx,
                                        &cancel,
                                        &tasks_ref,
                                    );
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!(torrent = %this.name(), "re-announce failed: {e}");
                        }
                    }
                }
            }));
        }

        *self.session.lock() = Some(Session { cancel, tasks });
        *self.state.lock() = TorrentState::Started;
        self.emit(TorrentEvent::Started {
            info_hash: self.info_hash_hex(),
        });
        Ok(())
    }

    /// Stop the torrent: cancel every task, close the connections, flush
    /// storage, and announce `stopped`. The completion map stays in
    /// memory so a later start re-queues only missing pieces. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let session = self.session.lock().take();
        let Some(session) = session else {
            *self.state.lock() = TorrentState::Stopped;
            return Ok(());
        };

        session.cancel.cancel();
        loop {
            let handle = session.tasks.lock().pop();
            match handle {
                Some(handle) => {
                    let _ = handle.await;
                }
                None => break,
            }
        }
        self.peers.write().clear();

        self.storage.flush().await.inspect_err(|e| {
            *self.last_error.lock() = Some(e.to_string());
        })?;

        // The one allowed out-of-interval announce.
        if let Err(e) = self.announce(AnnounceEvent::Stopped).await {
            tracing::debug!(torrent = %self.name(), "stopped announce failed: {e}");
        }

        *self.state.lock() = TorrentState::Stopped;
        self.emit(TorrentEvent::Stopped {
            info_hash: self.info_hash_hex(),
        });
        Ok(())
    }

    /// Announce to the first reachable HTTP(S) tracker, in tier order.
    async fn announce(&self, event: AnnounceEvent) -> Result<AnnounceResponse> {
        let trackers: Vec<String> = self
            .metainfo
            .all_trackers()
            .into_iter()
            .filter(|url| url.starts_with("http://") || url.starts_with("https://"))
            .collect();
        if trackers.is_empty() {
            return Err(EngineError::TrackerFailure(
                "no http tracker available".to_string(),
            ));
        }

        let request = AnnounceRequest {
            info_hash: self.metainfo.info_hash,
            peer_id: *self.tracker.peer_id(),
            port: self.options.incoming_port,
            uploaded: self.bytes_uploaded(),
            downloaded: self.bytes_completed(),
            left: self.bytes_left(),
            event,
        };

        let mut last_error = None;
        for url in trackers {
            match self.tracker.announce(&url, &request).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    tracing::warn!(tracker = %url, "announce failed: {e}");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap())
    }

    /// Dial candidates concurrently; keep whatever survives the
    /// handshake, capped at the per-torrent peer limit.
    async fn dial_peers(&self, candidates: &[PeerAddr]) -> Vec<PeerConnection> {
        let connected = self.peers.read().clone();
        let room = self.options.max_peers.saturating_sub(connected.len());

        let mut seen = std::collections::HashSet::new();
        let dials: Vec<_> = candidates
            .iter()
            .map(|p| p.to_socket_addr())
            .filter(|addr| !connected.contains_key(addr) && seen.insert(*addr))
            .take(room)
            .map(|addr| {
                let info_hash = self.metainfo.info_hash;
                let peer_id = *self.tracker.peer_id();
                let num_pieces = self.metainfo.num_pieces();
                async move { PeerConnection::connect(addr, info_hash, peer_id, num_pieces).await }
            })
            .collect();

        join_all(dials)
            .await
            .into_iter()
            .filter_map(|result| match result {
                Ok(conn) => Some(conn),
                Err(e) => {
                    tracing::debug!("peer discarded: {e}");
                    None
                }
            })
            .collect()
    }

    fn spawn_peer(
        this: &Arc<Self>,
        conn: PeerConnection,
        queue: &WorkQueue,
        results_tx: &mpsc::Sender<PieceResult>,
        cancel: &CancellationToken,
        tasks: &Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>,
    ) {
        let addr = conn.addr();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        this.peers.write().insert(addr, cmd_tx);
        tracing::info!(torrent = %this.name(), peer = %addr, "peer connected");

        let worker = PeerWorker::new(
            conn,
            queue.clone(),
            results_tx.clone(),
            cmd_rx,
            cancel.clone(),
        );
        let this = Arc::clone(this);
        tasks.lock().push(tokio::spawn(async move {
            worker.run().await;
            this.peers.write().remove(&addr);
            tracing::debug!(peer = %addr, "peer disconnected");
        }));
    }

    /// Single consumer of piece results: persists verified pieces, keeps
    /// the counters, broadcasts Have announcements, and signals
    /// completion.
    async fn run_consumer(
        self: Arc<Self>,
        mut results: mpsc::Receiver<PieceResult>,
        cancel: CancellationToken,
    ) {
        let num_pieces = self.metainfo.num_pieces();
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = results.recv() => match result {
                    Some(result) => result,
                    None => return,
                },
            };

            match result.outcome {
                Ok(data) => {
                    // A piece can arrive twice when a worker finished it
                    // just before its connection died and the item got
                    // re-queued. Count it once.
                    if self.completed.lock()[result.index as usize] {
                        continue;
                    }

                    let len = data.len() as u64;
                    if let Err(e) = self.storage.write_piece(result.index, data).await {
                        tracing::error!(torrent = %self.name(), "storage failure: {e}");
                        *self.last_error.lock() = Some(e.to_string());
                        *self.state.lock() = TorrentState::Stopped;
                        self.emit(TorrentEvent::Failed {
                            info_hash: self.info_hash_hex(),
                            error: e.to_string(),
                        });
                        cancel.cancel();
                        return;
                    }

                    self.completed.lock().set(result.index as usize, true);
                    self.stats.downloaded.fetch_add(len, Ordering::Relaxed);

                    // Best-effort Have broadcast; sends are unbounded and
                    // the worker writes them out in order.
                    for sender in self.peers.read().values() {
                        let _ = sender.send(PeerCommand::Have(result.index));
                    }

                    if self.pieces_complete() == num_pieces {
                        tracing::info!(torrent = %self.name(), "download complete");
                        if let Err(e) = self.storage.flush().await {
                            *self.last_error.lock() = Some(e.to_string());
                        }
                        if let Err(e) = self.announce(AnnounceEvent::Completed).await {
                            tracing::debug!("completed announce failed: {e}");
                        }
                        self.emit(TorrentEvent::Completed {
                            info_hash: self.info_hash_hex(),
                        });
                        self.done_tx.send_replace(true);
                        if !self.options.enable_seeding {
                            cancel.cancel();
                        }
                        return;
                    }
                }
                Err(cause) => {
                    self.stats.failed_attempts.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        peer = %result.peer,
                        piece = result.index,
                        "piece attempt failed: {cause}"
                    );
                }
            }
        }
    }

    fn emit(&self, event: TorrentEvent) {
        let _ = self.event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_carry_engine_values() {
        let options = TorrentOptions {
            max_peers: 10,
            incoming_port: 6881,
            enable_seeding: false,
            enable_upload: false,
            write_buffer_pieces: 10,
            cache_pieces: 64,
        };
        assert_eq!(options.max_peers, 10);
    }
}
