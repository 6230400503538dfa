//! # swarm-dl
//!
//! A headless BitTorrent v1 (BEP 3) download engine.
//!
//! Given a torrent metainfo (a `.torrent` file, or a magnet URI whose
//! info dictionary is resolved out of band), the engine discovers peers
//! through an HTTP tracker, runs the peer wire protocol over TCP,
//! downloads pieces concurrently with pipelined block requests, verifies
//! every piece against its SHA-1 hash, and writes verified data to sparse
//! files on disk.
//!
//! ## Features
//!
//! - **Byte-exact bencode**: deterministic encoding and positional
//!   info-hash capture, so identities survive round trips
//! - **Fault-tolerant scheduling**: one worker per peer, a rotating work
//!   queue, automatic re-queue on peer failure
//! - **Buffered storage**: sparse allocation, write aggregation, and an
//!   LRU cache of verified pieces
//! - **Async**: built on Tokio; cancellation propagates to every worker
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use swarm_dl::{Engine, EngineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::new().download_dir("/tmp/downloads");
//!     let engine = Engine::new(config)?;
//!
//!     let bytes = std::fs::read("example.torrent")?;
//!     let info_hash = engine.add_from_file(&bytes).await?;
//!     engine.start(info_hash).await?;
//!
//!     for snapshot in engine.snapshot() {
//!         println!("{}: {} bytes", snapshot.name, snapshot.bytes_downloaded);
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod storage;
pub mod torrent;
pub mod types;

pub use config::{EngineConfig, Tuning};
pub use engine::Engine;
pub use error::{EngineError, ProtocolErrorKind, Result, TransportErrorKind};
pub use storage::StorageEngine;
pub use torrent::{
    InfoHash, MagnetUri, Metainfo, PeerConnection, PeerMessage, TorrentDownloader, TorrentOptions,
};
pub use types::{TorrentEvent, TorrentSnapshot, TorrentState};
