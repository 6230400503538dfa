//! Piece download pipeline
//!
//! A `WorkItem` is one piece assignment. Workers take items from a shared
//! FIFO queue, pull the piece from their peer with a fixed request
//! pipeline, verify the SHA-1, and report a `PieceResult` to the torrent's
//! result consumer. An item a worker cannot finish goes back to the tail
//! of the queue on every unwind path, so no piece is orphaned while any
//! live peer still has it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sha1::{Digest, Sha1};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::metainfo::Sha1Hash;
use super::peer::{PeerConnection, PeerMessage, BLOCK_SIZE, KEEPALIVE_INTERVAL};
use crate::error::{EngineError, ProtocolErrorKind, Result};

/// Number of Request messages kept in flight on one connection
pub const PIPELINE_DEPTH: usize = 5;

/// Pause after returning an item the peer does not have, so a lone peer
/// cannot busy-loop on the queue head
const REQUEUE_DELAY: Duration = Duration::from_millis(50);

/// Hash failures tolerated from one peer before disconnecting it
const MAX_HASH_STRIKES: u32 = 3;

/// One piece assignment
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub index: u32,
    pub hash: Sha1Hash,
    pub length: u32,
}

/// Why a piece attempt failed
#[derive(Debug)]
pub enum PieceFailure {
    /// The peer's bitfield does not cover this piece
    NotAvailable,
    /// The peer choked mid-download; in-flight data is lost
    PeerChoked,
    /// The assembled piece did not match its expected hash
    HashMismatch,
    /// The connection failed or violated the protocol
    Connection(EngineError),
}

impl std::fmt::Display for PieceFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotAvailable => write!(f, "peer does not have the piece"),
            Self::PeerChoked => write!(f, "peer choked us"),
            Self::HashMismatch => write!(f, "hash verification failed"),
            Self::Connection(e) => write!(f, "{e}"),
        }
    }
}

/// Outcome of one piece attempt, reported to the result consumer
#[derive(Debug)]
pub struct PieceResult {
    pub index: u32,
    pub peer: SocketAddr,
    pub outcome: std::result::Result<Vec<u8>, PieceFailure>,
}

/// Download one piece from an unchoked peer.
///
/// Requests 16 KiB blocks with at most `PIPELINE_DEPTH` outstanding,
/// assembles them into a buffer, and verifies the SHA-1 before returning.
/// A Choke aborts the attempt; Have and keep-alive messages are absorbed
/// as side effects.
pub async fn download_piece(
    conn: &mut PeerConnection,
    work: &WorkItem,
) -> std::result::Result<Vec<u8>, PieceFailure> {
    if !conn.peer_has_piece(work.index as usize) {
        return Err(PieceFailure::NotAvailable);
    }

    let mut buf = vec![0u8; work.length as usize];
    let mut requested: u32 = 0;
    let mut received: u32 = 0;
    let mut in_flight: usize = 0;

    while received < work.length {
        while in_flight < PIPELINE_DEPTH && requested < work.length {
            let block_len = BLOCK_SIZE.min(work.length - requested);
            conn.request_block(work.index, requested, block_len)
                .await
                .map_err(PieceFailure::Connection)?;
            requested += block_len;
            in_flight += 1;
        }

        match conn.recv().await.map_err(PieceFailure::Connection)? {
            PeerMessage::KeepAlive => {}
            PeerMessage::Choke => return Err(PieceFailure::PeerChoked),
            PeerMessage::Piece {
                index,
                begin,
                block,
            } => {
                if index != work.index {
                    return Err(PieceFailure::Connection(EngineError::protocol_from(
                        ProtocolErrorKind::BadPieceIndex,
                        conn.addr(),
                    )));
                }
                let end = begin as usize + block.len();
                if end > buf.len() {
                    return Err(PieceFailure::Connection(EngineError::protocol_from(
                        ProtocolErrorKind::MalformedPayload,
                        conn.addr(),
                    )));
                }
                buf[begin as usize..end].copy_from_slice(&block);
                received += block.len() as u32;
                in_flight = in_flight.saturating_sub(1);
            }
            // Have updated the bitfield inside recv; everything else is
            // ignored here
            _ => {}
        }
    }

    let mut hasher = Sha1::new();
    hasher.update(&buf);
    let actual: Sha1Hash = hasher.finalize().into();
    if actual != work.hash {
        return Err(PieceFailure::HashMismatch);
    }

    Ok(buf)
}

/// FIFO work queue shared by all workers of one torrent.
///
/// Returned items go to the tail, which rotates the head across workers
/// and guarantees no item is starved behind a single uncooperative peer.
#[derive(Clone)]
pub struct WorkQueue {
    tx: mpsc::Sender<WorkItem>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<WorkItem>>>,
}

impl WorkQueue {
    /// Capacity must cover every piece of the torrent: each piece exists
    /// as at most one item, so pushes never block in practice.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }

    /// Append an item at the tail. A closed queue means the torrent is
    /// shutting down, in which case the item is intentionally dropped.
    pub async fn push(&self, item: WorkItem) {
        let _ = self.tx.send(item).await;
    }

    /// Take the head item. `None` when the queue is closed and drained.
    pub async fn pop(&self) -> Option<WorkItem> {
        self.rx.lock().await.recv().await
    }
}

/// Broadcast orders delivered to a worker for its peer
#[derive(Debug, Clone, Copy)]
pub enum PeerCommand {
    /// Announce that we now have a verified piece
    Have(u32),
}

/// Per-peer worker: owns the connection and at most one WorkItem.
pub struct PeerWorker {
    conn: PeerConnection,
    queue: WorkQueue,
    results: mpsc::Sender<PieceResult>,
    commands: mpsc::UnboundedReceiver<PeerCommand>,
    cancel: CancellationToken,
    hash_strikes: u32,
}

impl PeerWorker {
    pub fn new(
        conn: PeerConnection,
        queue: WorkQueue,
        results: mpsc::Sender<PieceResult>,
        commands: mpsc::UnboundedReceiver<PeerCommand>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            conn,
            queue,
            results,
            commands,
            cancel,
            hash_strikes: 0,
        }
    }

    /// Drive the connection until the peer fails, the torrent is
    /// cancelled, or the peer earns too many hash strikes.
    pub async fn run(mut self) {
        let addr = self.conn.addr();
        if let Err(e) = self.drive().await {
            tracing::debug!(peer = %addr, "worker stopped: {e}");
        }
        // Flush any Have orders that queued up while we were unwinding
        self.flush_commands().await;
        self.conn.shutdown().await;
    }

    async fn drive(&mut self) -> Result<()> {
        // The first real message is the only legal slot for a Bitfield.
        // Anything else starts normal flow with an all-false bitfield;
        // recv() applies either outcome to the connection state.
        tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            first = self.conn.recv() => { first?; }
        }

        self.conn.interested().await?;

        // Wait for Unchoke; Have/Bitfield/keep-alive are processed for
        // their side effects in the meantime.
        while self.conn.peer_choking() {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                msg = self.conn.recv() => { msg?; }
            }
        }

        loop {
            // Orders first, so completed pieces get announced before we
            // commit to another long download.
            while let Ok(cmd) = self.commands.try_recv() {
                self.handle_command(cmd).await?;
            }

            let work = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                cmd = self.commands.recv() => {
                    if let Some(cmd) = cmd {
                        self.handle_command(cmd).await?;
                    }
                    continue;
                }
                _ = tokio::time::sleep(KEEPALIVE_INTERVAL) => {
                    self.conn.keep_alive().await?;
                    continue;
                }
                item = self.queue.pop() => match item {
                    Some(item) => item,
                    None => return Ok(()),
                },
            };

            if !self.conn.peer_has_piece(work.index as usize) {
                self.queue.push(work).await;
                tokio::time::sleep(REQUEUE_DELAY).await;
                continue;
            }

            // The item must go back to the queue even if the torrent is
            // cancelled mid-download.
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => None,
                outcome = download_piece(&mut self.conn, &work) => Some(outcome),
            };
            let Some(outcome) = outcome else {
                self.queue.push(work).await;
                return Ok(());
            };

            match outcome {
                Ok(data) => {
                    tracing::debug!(peer = %self.conn.addr(), piece = work.index, "piece downloaded");
                    self.report(work.index, Ok(data)).await;
                }
                Err(PieceFailure::NotAvailable) => {
                    self.queue.push(work).await;
                    tokio::time::sleep(REQUEUE_DELAY).await;
                }
                Err(PieceFailure::HashMismatch) => {
                    tracing::warn!(peer = %self.conn.addr(), piece = work.index, "hash mismatch");
                    self.report(work.index, Err(PieceFailure::HashMismatch)).await;
                    let piece_index = work.index;
                    self.queue.push(work).await;
                    self.hash_strikes += 1;
                    if self.hash_strikes >= MAX_HASH_STRIKES {
                        return Err(EngineError::Verification { piece: piece_index });
                    }
                    tokio::time::sleep(REQUEUE_DELAY).await;
                }
                Err(failure) => {
                    // Choke or connection loss: re-queue and drop the peer
                    self.report(work.index, Err(failure)).await;
                    self.queue.push(work).await;
                    return Ok(());
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: PeerCommand) -> Result<()> {
        match cmd {
            PeerCommand::Have(index) => self.conn.have(index).await,
        }
    }

    async fn report(&self, index: u32, outcome: std::result::Result<Vec<u8>, PieceFailure>) {
        let result = PieceResult {
            index,
            peer: self.conn.addr(),
            outcome,
        };
        let _ = self.results.send(result).await;
    }

    async fn flush_commands(&mut self) {
        while let Ok(PeerCommand::Have(index)) = self.commands.try_recv() {
            if self.conn.have(index).await.is_err() {
                break;
            }
        }
    }
}
