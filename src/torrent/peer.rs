//! Peer wire protocol
//!
//! One `PeerConnection` per TCP link: the 68-byte handshake, the
//! length-prefixed message framing, the four choke/interest flags, and the
//! remote bitfield. The connection is exclusively owned by its worker
//! task, which keeps the one-writer-per-socket ordering guarantee trivial.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bitvec::prelude::*;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::metainfo::{InfoHash, Sha1Hash};
use crate::error::{EngineError, ProtocolErrorKind, Result, TransportErrorKind};

/// Protocol identifier exchanged in the handshake
const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// Total handshake size: 1 + 19 + 8 + 20 + 20
const HANDSHAKE_SIZE: usize = 68;

/// TCP dial timeout per peer
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Read/write deadline applying only to the handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A connection with no bytes for this long is considered dead
const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(180);

/// Send a keep-alive whenever the connection has been idle this long
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// Standard block size; larger requests may be refused by peers
pub const BLOCK_SIZE: u32 = 16384;

/// Largest legal frame: a Piece message carrying a 128 KiB block
/// (4-byte index + 4-byte begin + 1-byte id + 2^17 block + length slack).
pub const MAX_FRAME_SIZE: usize = (1 << 17) + 13;

/// Peer wire messages (BEP 3 catalogue)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Length-0 frame; keeps an idle connection open
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: u32,
    },
    Bitfield {
        bitfield: Vec<u8>,
    },
    Request {
        index: u32,
        begin: u32,
        length: u32,
    },
    Piece {
        index: u32,
        begin: u32,
        block: Vec<u8>,
    },
    Cancel {
        index: u32,
        begin: u32,
        length: u32,
    },
    /// Message id outside the base catalogue; tolerated and ignored
    Unknown {
        id: u8,
        payload: Vec<u8>,
    },
}

impl PeerMessage {
    /// Encode the message including its length prefix
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::KeepAlive => vec![0, 0, 0, 0],
            Self::Choke => vec![0, 0, 0, 1, 0],
            Self::Unchoke => vec![0, 0, 0, 1, 1],
            Self::Interested => vec![0, 0, 0, 1, 2],
            Self::NotInterested => vec![0, 0, 0, 1, 3],
            Self::Have { piece_index } => {
                let mut buf = vec![0, 0, 0, 5, 4];
                buf.extend_from_slice(&piece_index.to_be_bytes());
                buf
            }
            Self::Bitfield { bitfield } => {
                let len = 1 + bitfield.len() as u32;
                let mut buf = Vec::with_capacity(4 + len as usize);
                buf.extend_from_slice(&len.to_be_bytes());
                buf.push(5);
                buf.extend_from_slice(bitfield);
                buf
            }
            Self::Request {
                index,
                begin,
                length,
            } => encode_triple(6, *index, *begin, *length),
            Self::Piece {
                index,
                begin,
                block,
            } => {
                let len = 9 + block.len() as u32;
                let mut buf = Vec::with_capacity(4 + len as usize);
                buf.extend_from_slice(&len.to_be_bytes());
                buf.push(7);
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(block);
                buf
            }
            Self::Cancel {
                index,
                begin,
                length,
            } => encode_triple(8, *index, *begin, *length),
            Self::Unknown { id, payload } => {
                let len = 1 + payload.len() as u32;
                let mut buf = Vec::with_capacity(4 + len as usize);
                buf.extend_from_slice(&len.to_be_bytes());
                buf.push(*id);
                buf.extend_from_slice(payload);
                buf
            }
        }
    }

    /// Decode a message body (without the length prefix). An empty body
    /// is a keep-alive.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Ok(Self::KeepAlive);
        }

        let id = data[0];
        let payload = &data[1..];

        match id {
            0 => Ok(Self::Choke),
            1 => Ok(Self::Unchoke),
            2 => Ok(Self::Interested),
            3 => Ok(Self::NotInterested),
            4 => {
                let piece_index = read_u32(payload, 0)?;
                Ok(Self::Have { piece_index })
            }
            5 => Ok(Self::Bitfield {
                bitfield: payload.to_vec(),
            }),
            6 => {
                let (index, begin, length) = read_triple(payload)?;
                Ok(Self::Request {
                    index,
                    begin,
                    length,
                })
            }
            7 => {
                if payload.len() < 8 {
                    return Err(EngineError::protocol(ProtocolErrorKind::MalformedPayload));
                }
                let index = read_u32(payload, 0)?;
                let begin = read_u32(payload, 4)?;
                Ok(Self::Piece {
                    index,
                    begin,
                    block: payload[8..].to_vec(),
                })
            }
            8 => {
                let (index, begin, length) = read_triple(payload)?;
                Ok(Self::Cancel {
                    index,
                    begin,
                    length,
                })
            }
            _ => Ok(Self::Unknown {
                id,
                payload: payload.to_vec(),
            }),
        }
    }
}

fn encode_triple(id: u8, index: u32, begin: u32, length: u32) -> Vec<u8> {
    let mut buf = vec![0, 0, 0, 13, id];
    buf.extend_from_slice(&index.to_be_bytes());
    buf.extend_from_slice(&begin.to_be_bytes());
    buf.extend_from_slice(&length.to_be_bytes());
    buf
}

fn read_u32(payload: &[u8], offset: usize) -> Result<u32> {
    payload
        .get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| EngineError::protocol(ProtocolErrorKind::MalformedPayload))
}

fn read_triple(payload: &[u8]) -> Result<(u32, u32, u32)> {
    Ok((
        read_u32(payload, 0)?,
        read_u32(payload, 4)?,
        read_u32(payload, 8)?,
    ))
}

/// One TCP link to one remote peer
#[derive(Debug)]
pub struct PeerConnection {
    stream: TcpStream,
    addr: SocketAddr,
    remote_peer_id: Sha1Hash,

    // The four protocol flags, initial values (true, false, true, false)
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,

    /// Which pieces the remote claims to have; all-false until a Bitfield
    /// or Have arrives
    peer_pieces: BitVec<u8, Msb0>,
    num_pieces: usize,

    /// A Bitfield is only legal as the very first real message
    saw_first_message: bool,

    last_send: Instant,
    last_recv: Instant,
    read_buffer: BytesMut,
}

impl PeerConnection {
    /// Dial a peer and perform the handshake.
    pub async fn connect(
        addr: SocketAddr,
        info_hash: InfoHash,
        our_peer_id: Sha1Hash,
        num_pieces: usize,
    ) -> Result<Self> {
        let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                EngineError::transport(TransportErrorKind::Dial, format!("dial {addr} timed out"))
            })?
            .map_err(|e| {
                EngineError::transport(TransportErrorKind::Dial, format!("dial {addr}: {e}"))
            })?;

        let mut conn = Self {
            stream,
            addr,
            remote_peer_id: [0u8; 20],
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            peer_pieces: bitvec![u8, Msb0; 0; num_pieces],
            num_pieces,
            saw_first_message: false,
            last_send: Instant::now(),
            last_recv: Instant::now(),
            read_buffer: BytesMut::with_capacity(MAX_FRAME_SIZE.min(64 * 1024)),
        };

        conn.handshake(info_hash, our_peer_id).await?;
        tracing::debug!(peer = %addr, "handshake complete");
        Ok(conn)
    }

    /// Exchange the 68-byte handshake. 10 s deadlines apply to this
    /// exchange only.
    async fn handshake(&mut self, info_hash: InfoHash, our_peer_id: Sha1Hash) -> Result<()> {
        let mut outgoing = Vec::with_capacity(HANDSHAKE_SIZE);
        outgoing.push(PROTOCOL_STRING.len() as u8);
        outgoing.extend_from_slice(PROTOCOL_STRING);
        outgoing.extend_from_slice(&[0u8; 8]);
        outgoing.extend_from_slice(&info_hash);
        outgoing.extend_from_slice(&our_peer_id);

        timeout(HANDSHAKE_TIMEOUT, self.stream.write_all(&outgoing))
            .await
            .map_err(|_| {
                EngineError::protocol_from(ProtocolErrorKind::HandshakeTimeout, self.addr)
            })?
            .map_err(EngineError::from)?;

        let mut incoming = [0u8; HANDSHAKE_SIZE];
        timeout(HANDSHAKE_TIMEOUT, self.stream.read_exact(&mut incoming))
            .await
            .map_err(|_| {
                EngineError::protocol_from(ProtocolErrorKind::HandshakeTimeout, self.addr)
            })?
            .map_err(EngineError::from)?;

        if incoming[0] as usize != PROTOCOL_STRING.len()
            || &incoming[1..20] != PROTOCOL_STRING
            || incoming[28..48] != info_hash
        {
            return Err(EngineError::protocol_from(
                ProtocolErrorKind::HandshakeMismatch,
                self.addr,
            ));
        }

        self.remote_peer_id.copy_from_slice(&incoming[48..68]);
        self.last_recv = Instant::now();
        Ok(())
    }

    /// Send one message. Outgoing messages are emitted in call order.
    pub async fn send(&mut self, msg: PeerMessage) -> Result<()> {
        match &msg {
            PeerMessage::Choke => self.am_choking = true,
            PeerMessage::Unchoke => self.am_choking = false,
            PeerMessage::Interested => self.am_interested = true,
            PeerMessage::NotInterested => self.am_interested = false,
            _ => {}
        }

        self.stream.write_all(&msg.encode()).await?;
        self.last_send = Instant::now();
        Ok(())
    }

    /// Receive one framed message and apply its state transitions.
    pub async fn recv(&mut self) -> Result<PeerMessage> {
        let mut len_buf = [0u8; 4];
        timeout(READ_IDLE_TIMEOUT, self.stream.read_exact(&mut len_buf))
            .await
            .map_err(|_| {
                EngineError::transport(
                    TransportErrorKind::Timeout,
                    format!("peer {} idle for {:?}", self.addr, READ_IDLE_TIMEOUT),
                )
            })?
            .map_err(EngineError::from)?;

        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            // Keep-alive carries no id and does not count as the first
            // message for the bitfield ordering rule.
            self.last_recv = Instant::now();
            return Ok(PeerMessage::KeepAlive);
        }
        if len > MAX_FRAME_SIZE {
            return Err(EngineError::protocol_from(
                ProtocolErrorKind::FrameTooLarge,
                self.addr,
            ));
        }

        self.read_buffer.resize(len, 0);
        timeout(READ_IDLE_TIMEOUT, self.stream.read_exact(&mut self.read_buffer))
            .await
            .map_err(|_| {
                EngineError::transport(
                    TransportErrorKind::Timeout,
                    format!("peer {} stalled mid-frame", self.addr),
                )
            })?
            .map_err(EngineError::from)?;

        let msg = PeerMessage::decode(&self.read_buffer)?;

        if matches!(msg, PeerMessage::Bitfield { .. }) && self.saw_first_message {
            return Err(EngineError::protocol_from(
                ProtocolErrorKind::UnexpectedMessageOrder,
                self.addr,
            ));
        }
        self.saw_first_message = true;

        self.apply(&msg);
        self.last_recv = Instant::now();
        Ok(msg)
    }

    /// State transitions driven by received messages
    fn apply(&mut self, msg: &PeerMessage) {
        match msg {
            PeerMessage::Choke => self.peer_choking = true,
            PeerMessage::Unchoke => self.peer_choking = false,
            PeerMessage::Interested => self.peer_interested = true,
            PeerMessage::NotInterested => self.peer_interested = false,
            PeerMessage::Have { piece_index } => {
                // Out-of-range indices are ignored rather than fatal
                if (*piece_index as usize) < self.num_pieces {
                    self.peer_pieces.set(*piece_index as usize, true);
                }
            }
            PeerMessage::Bitfield { bitfield } => {
                // Bit i is the high bit of byte i/8. Trailing pad bits
                // beyond num_pieces are ignored; a short bitfield leaves
                // the remainder all-false.
                for i in 0..self.num_pieces {
                    let byte = match bitfield.get(i / 8) {
                        Some(b) => *b,
                        None => break,
                    };
                    self.peer_pieces.set(i, byte & (0x80 >> (i % 8)) != 0);
                }
            }
            _ => {}
        }
    }

    // Flag-changing sends

    pub async fn interested(&mut self) -> Result<()> {
        self.send(PeerMessage::Interested).await
    }

    pub async fn not_interested(&mut self) -> Result<()> {
        self.send(PeerMessage::NotInterested).await
    }

    pub async fn request_block(&mut self, index: u32, begin: u32, length: u32) -> Result<()> {
        self.send(PeerMessage::Request {
            index,
            begin,
            length,
        })
        .await
    }

    pub async fn have(&mut self, piece_index: u32) -> Result<()> {
        self.send(PeerMessage::Have { piece_index }).await
    }

    pub async fn keep_alive(&mut self) -> Result<()> {
        self.send(PeerMessage::KeepAlive).await
    }

    // Accessors

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn remote_peer_id(&self) -> &Sha1Hash {
        &self.remote_peer_id
    }

    pub fn am_choking(&self) -> bool {
        self.am_choking
    }

    pub fn am_interested(&self) -> bool {
        self.am_interested
    }

    pub fn peer_choking(&self) -> bool {
        self.peer_choking
    }

    pub fn peer_interested(&self) -> bool {
        self.peer_interested
    }

    pub fn peer_has_piece(&self, index: usize) -> bool {
        self.peer_pieces.get(index).map(|b| *b).unwrap_or(false)
    }

    pub fn peer_pieces(&self) -> &BitVec<u8, Msb0> {
        &self.peer_pieces
    }

    /// Time since the last send on this link
    pub fn idle_since_send(&self) -> Duration {
        self.last_send.elapsed()
    }

    /// Time since the last byte arrived
    pub fn idle_since_recv(&self) -> Duration {
        self.last_recv.elapsed()
    }

    /// Close the link.
    pub async fn shutdown(mut self) {
        let _ = self.stream.shutdown().await;
    }
}
