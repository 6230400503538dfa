//! Bencode codec
//!
//! A hand-written bencode parser and encoder. Off-the-shelf serde codecs
//! exist, but the info-hash is defined over the *original* bytes of the
//! info dictionary, so the decoder must be able to report the exact byte
//! span of a sub-value in addition to the parsed tree.
//!
//! Wire grammar:
//! - Integers:   `i<number>e`        Example: `i42e`
//! - Strings:    `<length>:<data>`   Example: `4:spam`
//! - Lists:      `l<items>e`         Example: `l4:spami42ee`
//! - Dicts:      `d<pairs>e`         Example: `d3:cow3:moo4:spam4:eggse`
//!
//! Dictionary keys must appear in ascending byte order. The strict
//! decoder rejects unordered or duplicate keys; the lenient decoder
//! accepts them and canonicalises on re-encode (the value model stores
//! dictionaries in a `BTreeMap`, so `encode` always emits sorted keys).

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

use thiserror::Error;

/// Largest string payload the decoder will allocate (100 MiB).
/// Caps memory use on hostile input.
const MAX_STRING_LENGTH: usize = 100 * 1024 * 1024;

/// Decode failure kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BencodeErrorKind {
    #[error("unexpected end of input")]
    UnexpectedEnd,
    #[error("invalid integer digits")]
    InvalidDigits,
    #[error("invalid string length")]
    InvalidStringLength,
    #[error("dictionary key is not a string")]
    NonStringKey,
    #[error("dictionary keys out of order")]
    UnorderedKeys,
    #[error("trailing data after value")]
    TrailingData,
}

/// A decode failure together with the byte offset it was detected at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{kind} at byte {position}")]
pub struct BencodeError {
    pub kind: BencodeErrorKind,
    pub position: usize,
}

impl BencodeError {
    fn new(kind: BencodeErrorKind, position: usize) -> Self {
        Self { kind, position }
    }
}

/// A bencode value
#[derive(Clone, PartialEq, Eq)]
pub enum BencodeValue {
    /// Signed 64-bit integer
    Integer(i64),
    /// Byte string (not necessarily valid UTF-8)
    Bytes(Vec<u8>),
    /// Ordered list of values
    List(Vec<BencodeValue>),
    /// Dictionary with byte-string keys, kept sorted by raw key bytes
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl fmt::Debug for BencodeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(n) => write!(f, "Integer({n})"),
            Self::Bytes(b) => match std::str::from_utf8(b) {
                Ok(s) if s.len() <= 50 => write!(f, "Bytes({s:?})"),
                _ => write!(f, "Bytes([{} bytes])", b.len()),
            },
            Self::List(l) => f.debug_tuple("List").field(l).finish(),
            Self::Dict(d) => {
                let readable: BTreeMap<String, &BencodeValue> = d
                    .iter()
                    .map(|(k, v)| (String::from_utf8_lossy(k).into_owned(), v))
                    .collect();
                f.debug_tuple("Dict").field(&readable).finish()
            }
        }
    }
}

/// Decode the first value in `data`.
///
/// Returns the value and the number of bytes consumed. Strict mode:
/// unordered or duplicate dictionary keys are rejected.
pub fn decode(data: &[u8]) -> Result<(BencodeValue, usize), BencodeError> {
    let mut dec = Decoder::new(data);
    let value = dec.decode_value()?;
    Ok((value, dec.position()))
}

/// Decode a complete value, rejecting trailing bytes.
pub fn decode_exact(data: &[u8]) -> Result<BencodeValue, BencodeError> {
    let (value, consumed) = decode(data)?;
    if consumed != data.len() {
        return Err(BencodeError::new(BencodeErrorKind::TrailingData, consumed));
    }
    Ok(value)
}

/// Decode a complete value in lenient mode: out-of-order and duplicate
/// dictionary keys are accepted (last occurrence wins) and come out
/// sorted on re-encode.
pub fn decode_exact_lenient(data: &[u8]) -> Result<BencodeValue, BencodeError> {
    let mut dec = Decoder::lenient(data);
    let value = dec.decode_value()?;
    if dec.position() != data.len() {
        return Err(BencodeError::new(
            BencodeErrorKind::TrailingData,
            dec.position(),
        ));
    }
    Ok(value)
}

/// Find the byte span of the value stored under `key` in a top-level
/// dictionary, without re-encoding anything.
///
/// This is the capture mode used for info-hash computation: the returned
/// range indexes the exact original bytes of the sub-value. `Ok(None)`
/// means the top-level dictionary has no such key.
pub fn top_level_value_span(
    data: &[u8],
    key: &[u8],
) -> Result<Option<Range<usize>>, BencodeError> {
    let mut dec = Decoder::new(data);
    if dec.peek()? != b'd' {
        return Err(BencodeError::new(
            BencodeErrorKind::UnexpectedEnd,
            dec.position(),
        ));
    }
    dec.pos += 1;

    let mut last_key: Option<Vec<u8>> = None;
    loop {
        if dec.peek()? == b'e' {
            dec.pos += 1;
            return Ok(None);
        }

        let entry_key = dec.decode_key(&mut last_key)?;
        let value_start = dec.pos;
        dec.decode_value()?;
        if entry_key == key {
            return Ok(Some(value_start..dec.pos));
        }
    }
}

/// Cursor-based bencode decoder
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
    strict: bool,
}

impl<'a> Decoder<'a> {
    /// Strict decoder: dictionary keys must be unique and sorted.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            strict: true,
        }
    }

    /// Lenient decoder: key order violations are tolerated.
    pub fn lenient(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            strict: false,
        }
    }

    /// Current byte offset into the input
    pub fn position(&self) -> usize {
        self.pos
    }

    fn err(&self, kind: BencodeErrorKind) -> BencodeError {
        BencodeError::new(kind, self.pos)
    }

    fn peek(&self) -> Result<u8, BencodeError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or_else(|| self.err(BencodeErrorKind::UnexpectedEnd))
    }

    /// Decode one value starting at the cursor.
    pub fn decode_value(&mut self) -> Result<BencodeValue, BencodeError> {
        match self.peek()? {
            b'i' => self.decode_integer(),
            b'l' => self.decode_list(),
            b'd' => self.decode_dict(),
            b'0'..=b'9' => self.decode_bytes().map(BencodeValue::Bytes),
            _ => Err(self.err(BencodeErrorKind::InvalidDigits)),
        }
    }

    fn decode_integer(&mut self) -> Result<BencodeValue, BencodeError> {
        let start = self.pos;
        self.pos += 1; // skip 'i'

        let end_rel = self.data[self.pos..]
            .iter()
            .position(|&c| c == b'e')
            .ok_or(BencodeError::new(BencodeErrorKind::UnexpectedEnd, start))?;
        let digits = &self.data[self.pos..self.pos + end_rel];

        if !valid_integer_digits(digits) {
            return Err(BencodeError::new(BencodeErrorKind::InvalidDigits, start));
        }

        let text = std::str::from_utf8(digits)
            .map_err(|_| BencodeError::new(BencodeErrorKind::InvalidDigits, start))?;
        let value = text
            .parse::<i64>()
            .map_err(|_| BencodeError::new(BencodeErrorKind::InvalidDigits, start))?;

        self.pos += end_rel + 1; // digits + 'e'
        Ok(BencodeValue::Integer(value))
    }

    fn decode_bytes(&mut self) -> Result<Vec<u8>, BencodeError> {
        let start = self.pos;

        let colon_rel = self.data[self.pos..]
            .iter()
            .position(|&c| c == b':')
            .ok_or(BencodeError::new(
                BencodeErrorKind::InvalidStringLength,
                start,
            ))?;
        let digits = &self.data[self.pos..self.pos + colon_rel];

        // Length must be plain decimal digits without a redundant leading
        // zero ("0:" itself is fine).
        if digits.is_empty()
            || !digits.iter().all(u8::is_ascii_digit)
            || (digits.len() > 1 && digits[0] == b'0')
        {
            return Err(BencodeError::new(
                BencodeErrorKind::InvalidStringLength,
                start,
            ));
        }

        let len: usize = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(BencodeError::new(
                BencodeErrorKind::InvalidStringLength,
                start,
            ))?;
        if len > MAX_STRING_LENGTH {
            return Err(BencodeError::new(
                BencodeErrorKind::InvalidStringLength,
                start,
            ));
        }

        let body_start = self.pos + colon_rel + 1;
        let body_end = body_start
            .checked_add(len)
            .ok_or(BencodeError::new(
                BencodeErrorKind::InvalidStringLength,
                start,
            ))?;
        if body_end > self.data.len() {
            return Err(BencodeError::new(BencodeErrorKind::UnexpectedEnd, start));
        }

        self.pos = body_end;
        Ok(self.data[body_start..body_end].to_vec())
    }

    fn decode_list(&mut self) -> Result<BencodeValue, BencodeError> {
        self.pos += 1; // skip 'l'
        let mut items = Vec::new();
        loop {
            if self.peek()? == b'e' {
                self.pos += 1;
                return Ok(BencodeValue::List(items));
            }
            items.push(self.decode_value()?);
        }
    }

    fn decode_dict(&mut self) -> Result<BencodeValue, BencodeError> {
        self.pos += 1; // skip 'd'
        let mut entries = BTreeMap::new();
        let mut last_key: Option<Vec<u8>> = None;
        loop {
            if self.peek()? == b'e' {
                self.pos += 1;
                return Ok(BencodeValue::Dict(entries));
            }
            let key = self.decode_key(&mut last_key)?;
            let value = self.decode_value()?;
            entries.insert(key, value);
        }
    }

    fn decode_key(&mut self, last_key: &mut Option<Vec<u8>>) -> Result<Vec<u8>, BencodeError> {
        let key_start = self.pos;
        if !self.peek()?.is_ascii_digit() {
            return Err(BencodeError::new(BencodeErrorKind::NonStringKey, key_start));
        }
        let key = self.decode_bytes()?;

        if self.strict {
            if let Some(prev) = last_key {
                // Duplicates are malformed too, hence <= rather than <.
                if key <= *prev {
                    return Err(BencodeError::new(
                        BencodeErrorKind::UnorderedKeys,
                        key_start,
                    ));
                }
            }
        }
        *last_key = Some(key.clone());
        Ok(key)
    }
}

fn valid_integer_digits(digits: &[u8]) -> bool {
    let unsigned = match digits {
        [b'-', rest @ ..] => rest,
        other => other,
    };
    if unsigned.is_empty() || !unsigned.iter().all(u8::is_ascii_digit) {
        return false;
    }
    // No leading zeros, and -0 is not a thing.
    if unsigned.len() > 1 && unsigned[0] == b'0' {
        return false;
    }
    if digits[0] == b'-' && unsigned == b"0" {
        return false;
    }
    true
}

impl BencodeValue {
    /// Encode to bencode bytes.
    ///
    /// Pure and deterministic: dictionary keys come out in ascending byte
    /// order, so `encode` of equal values is byte-equal. The info-hash
    /// depends on this.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_to(&mut buf);
        buf
    }

    /// Encode into an existing buffer
    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Integer(n) => {
                buf.push(b'i');
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.push(b'e');
            }
            Self::Bytes(b) => {
                buf.extend_from_slice(b.len().to_string().as_bytes());
                buf.push(b':');
                buf.extend_from_slice(b);
            }
            Self::List(items) => {
                buf.push(b'l');
                for item in items {
                    item.encode_to(buf);
                }
                buf.push(b'e');
            }
            Self::Dict(entries) => {
                buf.push(b'd');
                for (key, value) in entries {
                    buf.extend_from_slice(key.len().to_string().as_bytes());
                    buf.push(b':');
                    buf.extend_from_slice(key);
                    value.encode_to(buf);
                }
                buf.push(b'e');
            }
        }
    }

    // Accessors

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Self::Integer(n) if *n >= 0 => Some(*n as u64),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            Self::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Get a dictionary value by key
    pub fn get(&self, key: &str) -> Option<&BencodeValue> {
        match self {
            Self::Dict(d) => d.get(key.as_bytes()),
            _ => None,
        }
    }
}
