//! Tracker client
//!
//! HTTP tracker announces per BEP 3. The client itself is stateless; the
//! per-torrent coordinator owns the announce timers and the interval
//! etiquette (never re-announce before the interval the tracker returned,
//! with the one-off `stopped`/`completed` event announce as the allowed
//! exception).

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use rand::Rng;

use super::bencode::{self, BencodeValue};
use super::metainfo::{InfoHash, Sha1Hash};
use crate::error::{EngineError, Result};

/// Timeout for a tracker HTTP round trip
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(15);

/// Floor for the announce interval. Raising the floor still honours the
/// wait-at-least-interval rule; shortening it would not.
const MIN_ANNOUNCE_INTERVAL: u32 = 1;

/// Client prefix of our peer-id (Azureus style, dash delimited)
const PEER_ID_PREFIX: &[u8; 8] = b"-SW0001-";

/// Announce event type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    /// Regular interval announce (no event parameter)
    None,
    Started,
    Stopped,
    Completed,
}

impl AnnounceEvent {
    fn as_query_value(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
        }
    }
}

/// Announce request parameters
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: InfoHash,
    pub peer_id: Sha1Hash,
    /// Port advertised for incoming connections
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    /// Bytes still missing
    pub left: u64,
    pub event: AnnounceEvent,
}

/// Announce response from the tracker
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    /// Seconds the caller must wait before the next regular announce
    pub interval: u32,
    /// Peers in the swarm
    pub peers: Vec<PeerAddr>,
}

/// A peer address from the compact peer list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl PeerAddr {
    pub fn to_socket_addr(self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }
}

impl std::fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// HTTP tracker client
pub struct TrackerClient {
    http: reqwest::Client,
    peer_id: Sha1Hash,
}

impl TrackerClient {
    /// Create a client announcing under the given peer-id.
    pub fn new(peer_id: Sha1Hash) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(ANNOUNCE_TIMEOUT)
            .build()
            .map_err(EngineError::from)?;
        Ok(Self { http, peer_id })
    }

    pub fn peer_id(&self) -> &Sha1Hash {
        &self.peer_id
    }

    /// Perform one announce round trip against an HTTP(S) tracker.
    pub async fn announce(
        &self,
        tracker_url: &str,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse> {
        if !tracker_url.starts_with("http://") && !tracker_url.starts_with("https://") {
            return Err(EngineError::malformed(
                "tracker url",
                format!("unsupported scheme: {tracker_url}"),
            ));
        }

        let url = build_announce_url(tracker_url, request);

        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(EngineError::TrackerFailure(format!(
                "tracker returned HTTP {}",
                response.status()
            )));
        }

        let body = response.bytes().await?;
        parse_announce_response(&body)
    }
}

fn build_announce_url(tracker_url: &str, request: &AnnounceRequest) -> String {
    let mut url = tracker_url.to_string();
    url.push(if url.contains('?') { '&' } else { '?' });

    url.push_str("info_hash=");
    url.push_str(&urlencode_bytes(&request.info_hash));
    url.push_str("&peer_id=");
    url.push_str(&urlencode_bytes(&request.peer_id));
    url.push_str(&format!("&port={}", request.port));
    url.push_str(&format!("&uploaded={}", request.uploaded));
    url.push_str(&format!("&downloaded={}", request.downloaded));
    url.push_str(&format!("&left={}", request.left));
    url.push_str("&compact=1");

    let event = request.event.as_query_value();
    if !event.is_empty() {
        url.push_str("&event=");
        url.push_str(event);
    }

    url
}

/// Percent-encode raw bytes for a query string: unreserved bytes go
/// through literally, every other byte becomes `%XX`.
fn urlencode_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for &b in bytes {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

fn parse_announce_response(data: &[u8]) -> Result<AnnounceResponse> {
    let value = bencode::decode_exact(data)
        .map_err(|e| EngineError::malformed("tracker response", e.to_string()))?;
    let dict = value
        .as_dict()
        .ok_or_else(|| EngineError::malformed("tracker response", "not a dictionary"))?;

    if let Some(reason) = dict.get(b"failure reason".as_slice()) {
        let text = reason.as_str().unwrap_or("(unreadable reason)").to_string();
        return Err(EngineError::TrackerFailure(text));
    }

    let interval = dict
        .get(b"interval".as_slice())
        .and_then(|v| v.as_uint())
        .ok_or_else(|| EngineError::malformed("tracker response", "missing 'interval'"))?
        as u32;
    let interval = interval.max(MIN_ANNOUNCE_INTERVAL);

    let peers = parse_compact_peers(dict.get(b"peers".as_slice()))?;

    Ok(AnnounceResponse { interval, peers })
}

/// Decode the compact peer format: 6 bytes per peer, four IPv4 octets
/// followed by a big-endian port.
fn parse_compact_peers(value: Option<&BencodeValue>) -> Result<Vec<PeerAddr>> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };

    let data = value
        .as_bytes()
        .ok_or_else(|| EngineError::malformed("tracker response", "'peers' is not a byte string"))?;

    if data.len() % 6 != 0 {
        return Err(EngineError::CompactLengthInvalid(data.len()));
    }

    Ok(data
        .chunks_exact(6)
        .map(|chunk| PeerAddr {
            ip: Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]),
            port: u16::from_be_bytes([chunk[4], chunk[5]]),
        })
        .collect())
}

/// Generate a peer-id: 8-byte readable client prefix followed by 12 bytes
/// from the thread-local CSPRNG. Generated once per engine instance.
pub fn generate_peer_id() -> Sha1Hash {
    let mut peer_id = [0u8; 20];
    peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
    rand::rng().fill(&mut peer_id[8..]);
    peer_id
}
