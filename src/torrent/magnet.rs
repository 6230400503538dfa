//! Magnet URI parser
//!
//! Parses `magnet:?xt=urn:btih:<hash>&dn=<name>&tr=<tracker>` links. Only
//! the parameters the engine acts on are kept: the info-hash, the display
//! name, and the tracker list. Trackers with schemes outside http, https
//! and udp are discarded up front; the dropped ones are remembered so a
//! caller can warn about them.

use url::Url;

use super::metainfo::InfoHash;
use crate::error::{EngineError, Result};

/// Parsed magnet URI
#[derive(Debug, Clone)]
pub struct MagnetUri {
    /// Info-hash from the first `urn:btih:` exact topic
    pub info_hash: InfoHash,
    /// Display name (`dn`)
    pub display_name: Option<String>,
    /// Tracker URLs (`tr`) with accepted schemes, in order
    pub trackers: Vec<String>,
    /// Tracker URLs that were discarded for their scheme
    pub dropped_trackers: Vec<String>,
}

impl MagnetUri {
    /// Parse and sanitize a magnet URI.
    pub fn parse(uri: &str) -> Result<Self> {
        let trimmed = uri.trim();
        if !trimmed.starts_with("magnet:?") {
            return Err(EngineError::malformed(
                "magnet uri",
                "missing 'magnet:?' scheme",
            ));
        }

        let mut info_hash: Option<InfoHash> = None;
        let mut display_name: Option<String> = None;
        let mut trackers = Vec::new();
        let mut dropped_trackers = Vec::new();

        for param in trimmed["magnet:?".len()..].split('&') {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            let value = percent_decode(value);

            match key {
                "xt" => {
                    // First urn:btih wins; later xt entries are ignored
                    if info_hash.is_none() {
                        info_hash = parse_btih(&value);
                    }
                }
                "dn" => display_name = Some(value),
                "tr" => {
                    if value.is_empty() {
                        continue;
                    }
                    match Url::parse(&value) {
                        Ok(parsed)
                            if matches!(parsed.scheme(), "http" | "https" | "udp") =>
                        {
                            trackers.push(value)
                        }
                        _ => dropped_trackers.push(value),
                    }
                }
                _ => {}
            }
        }

        let info_hash = info_hash.ok_or_else(|| {
            EngineError::malformed("magnet uri", "missing or invalid 'xt' parameter")
        })?;

        Ok(MagnetUri {
            info_hash,
            display_name,
            trackers,
            dropped_trackers,
        })
    }

    /// Display name, or the hex info-hash when none was given
    pub fn name(&self) -> String {
        self.display_name
            .clone()
            .unwrap_or_else(|| hex::encode(self.info_hash))
    }

    /// Tracker URLs the HTTP announce path can actually use
    pub fn http_trackers(&self) -> Vec<String> {
        self.trackers
            .iter()
            .filter(|t| t.starts_with("http://") || t.starts_with("https://"))
            .cloned()
            .collect()
    }
}

/// Parse `urn:btih:<40 hex chars>`. 32-char base32 hashes are accepted
/// too since plenty of magnets in the wild still carry them.
fn parse_btih(xt: &str) -> Option<InfoHash> {
    let hash = xt.strip_prefix("urn:btih:")?;
    match hash.len() {
        40 => {
            let bytes = hex::decode(hash).ok()?;
            let mut out = [0u8; 20];
            out.copy_from_slice(&bytes);
            Some(out)
        }
        32 => base32_decode(hash),
        _ => None,
    }
}

/// RFC 4648 base32 without padding, exactly 20 output bytes
fn base32_decode(input: &str) -> Option<InfoHash> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

    let upper = input.to_uppercase();
    let mut bits = 0u64;
    let mut bit_count = 0u32;
    let mut out = Vec::with_capacity(20);

    for &c in upper.as_bytes() {
        let value = ALPHABET.iter().position(|&a| a == c)? as u64;
        bits = (bits << 5) | value;
        bit_count += 5;
        while bit_count >= 8 {
            bit_count -= 8;
            out.push((bits >> bit_count) as u8);
            bits &= (1 << bit_count) - 1;
        }
    }

    (out.len() == 20).then(|| {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&out);
        hash
    })
}

fn percent_decode(s: &str) -> String {
    let mut bytes = Vec::with_capacity(s.len());
    let raw = s.as_bytes();
    let mut i = 0;
    while i < raw.len() {
        match raw[i] {
            b'%' if i + 2 < raw.len() => {
                if let Ok(byte) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                    bytes.push(byte);
                    i += 3;
                    continue;
                }
                bytes.push(b'%');
                i += 1;
            }
            b'+' => {
                bytes.push(b' ');
                i += 1;
            }
            b => {
                bytes.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}
