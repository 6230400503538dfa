//! Typed error hierarchy for swarm-dl
//!
//! Errors fall into a handful of categories with distinct recovery rules:
//! malformed input is never retried, protocol violations are fatal for the
//! offending connection only, transport failures drop the affected peer,
//! and storage failures stop the torrent and surface through snapshots.

use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

use crate::torrent::bencode::BencodeError;
use crate::torrent::metainfo::MetainfoError;

/// Main error type for the download engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Input bytes did not match their grammar. Never retried for the
    /// same input.
    #[error("malformed {what}: {message}")]
    Malformed {
        what: &'static str,
        message: String,
    },

    /// The remote peer violated the wire protocol. Fatal for that
    /// connection; the torrent continues with the remaining peers.
    #[error("peer protocol error: {kind}")]
    Protocol {
        kind: ProtocolErrorKind,
        peer: Option<SocketAddr>,
    },

    /// Dial, read/write, or timeout failure. The affected peer is dropped.
    #[error("transport error: {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },

    /// A downloaded piece failed SHA-1 verification.
    #[error("piece {piece} failed hash verification")]
    Verification { piece: u32 },

    /// A buffered or on-disk piece no longer matches its expected hash.
    #[error("piece {piece} failed re-verification on read")]
    CacheCorrupt { piece: u32 },

    /// Disk or allocation failure. Stops the torrent; the cause is
    /// reported through snapshots.
    #[error("storage error at {path:?}: {message}")]
    ResourceExhausted { path: PathBuf, message: String },

    /// Invalid configuration value. The operation that introduced the
    /// value is refused.
    #[error("invalid configuration for '{field}': {message}")]
    Configuration {
        field: &'static str,
        message: String,
    },

    /// An operation referenced an info-hash the engine does not know.
    #[error("unknown torrent: {0}")]
    NotFound(String),

    /// The torrent was added from a magnet URI and its info dictionary
    /// has not been resolved yet.
    #[error("torrent metadata is not resolved yet")]
    MetadataPending,

    /// The tracker answered the announce with a failure reason.
    #[error("tracker failure: {0}")]
    TrackerFailure(String),

    /// A compact peer list length was not a multiple of 6.
    #[error("compact peer list length {0} is not a multiple of 6")]
    CompactLengthInvalid(usize),

    /// No peer survived the handshake round at torrent start.
    #[error("no peer connections established")]
    NoPeers,

    /// Engine is shutting down.
    #[error("engine is shutting down")]
    Shutdown,
}

/// Peer wire protocol violation subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// Handshake length byte, identifier, or info-hash did not match
    HandshakeMismatch,
    /// Handshake did not complete within its deadline
    HandshakeTimeout,
    /// Frame length prefix exceeded the protocol maximum
    FrameTooLarge,
    /// Message payload shorter than its fixed layout requires
    MalformedPayload,
    /// Bitfield received after the first message
    UnexpectedMessageOrder,
    /// Piece message carried an index or offset outside the request
    BadPieceIndex,
}

impl std::fmt::Display for ProtocolErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::HandshakeMismatch => "handshake mismatch",
            Self::HandshakeTimeout => "handshake timeout",
            Self::FrameTooLarge => "frame too large",
            Self::MalformedPayload => "malformed payload",
            Self::UnexpectedMessageOrder => "unexpected message order",
            Self::BadPieceIndex => "bad piece index",
        };
        f.write_str(s)
    }
}

/// Transport failure subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// TCP dial failed or timed out
    Dial,
    /// Read or write deadline expired
    Timeout,
    /// The remote side closed the connection
    ConnectionClosed,
    /// Any other socket error
    Io,
}

impl EngineError {
    /// Check whether retrying the same operation can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. }
                | Self::Verification { .. }
                | Self::TrackerFailure(_)
                | Self::NoPeers
        )
    }

    pub fn malformed(what: &'static str, message: impl Into<String>) -> Self {
        Self::Malformed {
            what,
            message: message.into(),
        }
    }

    pub fn protocol(kind: ProtocolErrorKind) -> Self {
        Self::Protocol { kind, peer: None }
    }

    pub fn protocol_from(kind: ProtocolErrorKind, peer: SocketAddr) -> Self {
        Self::Protocol {
            kind,
            peer: Some(peer),
        }
    }

    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self::Transport {
            kind,
            message: message.into(),
        }
    }

    pub fn storage(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn config(field: &'static str, message: impl Into<String>) -> Self {
        Self::Configuration {
            field,
            message: message.into(),
        }
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

impl From<BencodeError> for EngineError {
    fn from(err: BencodeError) -> Self {
        Self::Malformed {
            what: "bencode",
            message: err.to_string(),
        }
    }
}

impl From<MetainfoError> for EngineError {
    fn from(err: MetainfoError) -> Self {
        Self::Malformed {
            what: "metainfo",
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let kind = match err.kind() {
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => TransportErrorKind::ConnectionClosed,
            ErrorKind::TimedOut | ErrorKind::WouldBlock => TransportErrorKind::Timeout,
            ErrorKind::ConnectionRefused => TransportErrorKind::Dial,
            _ => TransportErrorKind::Io,
        };
        Self::Transport {
            kind,
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            TransportErrorKind::Timeout
        } else if err.is_connect() {
            TransportErrorKind::Dial
        } else {
            TransportErrorKind::Io
        };
        Self::Transport {
            kind,
            message: err.to_string(),
        }
    }
}
