//! Torrent metainfo parser
//!
//! Parses .torrent files (BEP 3) into structured metadata. The info-hash
//! is computed over the exact bytes of the `info` sub-value as they appear
//! in the input, never over a re-encoding, so it matches what every other
//! client and tracker derives for the same file.

use sha1::{Digest, Sha1};
use std::path::PathBuf;

use super::bencode::{self, BencodeValue};
use thiserror::Error;

/// SHA-1 hash (20 raw bytes)
pub type Sha1Hash = [u8; 20];

/// Info-hash: the torrent's identity everywhere (tracker, handshake,
/// engine registry). Equality is byte equality.
pub type InfoHash = Sha1Hash;

/// Metainfo parse failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetainfoError {
    #[error("not a bencoded dictionary")]
    NotADictionary,
    #[error("missing field '{0}'")]
    MissingField(&'static str),
    #[error("invalid field '{0}'")]
    InvalidField(&'static str),
    #[error("'pieces' length is not a multiple of 20")]
    InvalidPieces,
    #[error("both 'length' and 'files' present")]
    AmbiguousMode,
    #[error("neither 'length' nor 'files' present")]
    MissingMode,
    #[error("piece count {have} does not match {expected} expected for the content length")]
    PieceCountMismatch { have: u64, expected: u64 },
    #[error(transparent)]
    Bencode(#[from] bencode::BencodeError),
}

/// Parsed torrent metainfo
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// SHA-1 of the raw bencoded info dictionary
    pub info_hash: InfoHash,
    /// The parsed info dictionary
    pub info: Info,
    /// Primary announce URL (optional when announce-list is present)
    pub announce: Option<String>,
    /// Announce list (BEP 12): ordered tiers of tracker URLs
    pub announce_list: Vec<Vec<String>>,
}

/// The info dictionary
#[derive(Debug, Clone)]
pub struct Info {
    /// Suggested name for the file or directory
    pub name: String,
    /// Bytes per piece (every piece but possibly the last)
    pub piece_length: u64,
    /// SHA-1 hash of each piece, in order
    pub pieces: Vec<Sha1Hash>,
    /// Files in content order; a single entry for single-file torrents
    pub files: Vec<FileInfo>,
    /// Sum of all file lengths
    pub total_size: u64,
    /// Single-file torrents place the file directly under the download
    /// dir; multi-file torrents get a directory named after the torrent
    pub is_single_file: bool,
}

/// One file of the torrent content
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Path components joined (relative to the torrent directory)
    pub path: PathBuf,
    /// File size in bytes
    pub length: u64,
    /// Start offset in the concatenated content stream
    pub offset: u64,
}

impl Metainfo {
    /// Parse a .torrent file from its raw bytes.
    pub fn parse(data: &[u8]) -> Result<Self, MetainfoError> {
        let root = bencode::decode_exact(data)?;
        let dict = root.as_dict().ok_or(MetainfoError::NotADictionary)?;

        // The hash is over the original bytes of the info value, located
        // positionally. Re-encoding could reorder or renormalise and
        // silently change the identity of the torrent.
        let info_span = bencode::top_level_value_span(data, b"info")?
            .ok_or(MetainfoError::MissingField("info"))?;
        let info_hash = sha1_of(&data[info_span]);

        let info_value = dict
            .get(b"info".as_slice())
            .ok_or(MetainfoError::MissingField("info"))?;
        let info = Info::parse(info_value)?;

        let announce = dict
            .get(b"announce".as_slice())
            .and_then(|v| v.as_str())
            .map(String::from);

        let announce_list = parse_announce_list(dict.get(b"announce-list".as_slice()));

        if announce.is_none() && announce_list.is_empty() {
            return Err(MetainfoError::MissingField("announce"));
        }

        Ok(Metainfo {
            info_hash,
            info,
            announce,
            announce_list,
        })
    }

    /// Build a Metainfo from a raw info dictionary plus tracker URLs.
    ///
    /// This is the completion path for magnet adds: the info bytes arrive
    /// out of band and the trackers come from the magnet URI. The caller
    /// is responsible for checking the hash against the expected one.
    pub fn from_info_bytes(
        info_bytes: &[u8],
        trackers: Vec<String>,
    ) -> Result<Self, MetainfoError> {
        let info_value = bencode::decode_exact(info_bytes)?;
        let info = Info::parse(&info_value)?;
        let info_hash = sha1_of(info_bytes);

        let announce = trackers.first().cloned();
        let announce_list = if trackers.is_empty() {
            Vec::new()
        } else {
            vec![trackers]
        };

        Ok(Metainfo {
            info_hash,
            info,
            announce,
            announce_list,
        })
    }

    /// Number of pieces
    pub fn num_pieces(&self) -> usize {
        self.info.pieces.len()
    }

    /// Expected hash for a piece
    pub fn piece_hash(&self, index: usize) -> Option<&Sha1Hash> {
        self.info.pieces.get(index)
    }

    /// Byte range `[start, end)` of a piece in the content stream
    pub fn piece_range(&self, index: usize) -> Option<(u64, u64)> {
        if index >= self.info.pieces.len() {
            return None;
        }
        let start = index as u64 * self.info.piece_length;
        let end = (start + self.info.piece_length).min(self.info.total_size);
        Some((start, end))
    }

    /// Length of a piece (the last one may be shorter)
    pub fn piece_length(&self, index: usize) -> Option<u64> {
        self.piece_range(index).map(|(start, end)| end - start)
    }

    /// Files overlapping a piece, as (file index, offset in file, length).
    ///
    /// The returned segments tile the piece in content order; the storage
    /// layer walks them for both writes and reads.
    pub fn files_for_piece(&self, piece_index: usize) -> Vec<(usize, u64, u64)> {
        let Some((piece_start, piece_end)) = self.piece_range(piece_index) else {
            return Vec::new();
        };

        let mut segments = Vec::new();
        for (file_idx, file) in self.info.files.iter().enumerate() {
            let file_start = file.offset;
            let file_end = file.offset + file.length;
            if file_start >= piece_end || file_end <= piece_start {
                continue;
            }
            let overlap_start = piece_start.max(file_start);
            let overlap_end = piece_end.min(file_end);
            segments.push((file_idx, overlap_start - file_start, overlap_end - overlap_start));
        }
        segments
    }

    /// All tracker URLs: announce first, then the announce-list flattened
    /// in tier order, deduplicated.
    pub fn all_trackers(&self) -> Vec<String> {
        let mut trackers = Vec::new();
        if let Some(ref announce) = self.announce {
            trackers.push(announce.clone());
        }
        for tier in &self.announce_list {
            for url in tier {
                if !trackers.contains(url) {
                    trackers.push(url.clone());
                }
            }
        }
        trackers
    }

    /// Info-hash as a lowercase hex string
    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

impl Info {
    fn parse(value: &BencodeValue) -> Result<Self, MetainfoError> {
        let dict = value.as_dict().ok_or(MetainfoError::NotADictionary)?;

        let name = dict
            .get(b"name".as_slice())
            .and_then(|v| v.as_str())
            .ok_or(MetainfoError::MissingField("name"))?
            .to_string();

        let piece_length = dict
            .get(b"piece length".as_slice())
            .and_then(|v| v.as_uint())
            .ok_or(MetainfoError::MissingField("piece length"))?;
        if piece_length == 0 {
            return Err(MetainfoError::InvalidField("piece length"));
        }

        let pieces_bytes = dict
            .get(b"pieces".as_slice())
            .and_then(|v| v.as_bytes())
            .ok_or(MetainfoError::MissingField("pieces"))?;
        if pieces_bytes.len() % 20 != 0 {
            return Err(MetainfoError::InvalidPieces);
        }
        let pieces: Vec<Sha1Hash> = pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let has_length = dict.get(b"length".as_slice()).is_some();
        let has_files = dict.get(b"files".as_slice()).is_some();
        let (files, total_size, is_single_file) = match (has_length, has_files) {
            (true, true) => return Err(MetainfoError::AmbiguousMode),
            (false, false) => return Err(MetainfoError::MissingMode),
            (true, false) => {
                let length = dict
                    .get(b"length".as_slice())
                    .and_then(|v| v.as_uint())
                    .ok_or(MetainfoError::InvalidField("length"))?;
                let file = FileInfo {
                    path: PathBuf::from(&name),
                    length,
                    offset: 0,
                };
                (vec![file], length, true)
            }
            (false, true) => {
                let (files, total) = parse_files(dict.get(b"files".as_slice()).unwrap())?;
                (files, total, false)
            }
        };

        // num_pieces == ceil(total_size / piece_length); together with the
        // multiple-of-20 check above this pins the last piece's length.
        let expected_pieces = total_size.div_ceil(piece_length);
        if pieces.len() as u64 != expected_pieces {
            return Err(MetainfoError::PieceCountMismatch {
                have: pieces.len() as u64,
                expected: expected_pieces,
            });
        }

        Ok(Info {
            name,
            piece_length,
            pieces,
            files,
            total_size,
            is_single_file,
        })
    }
}

fn parse_files(value: &BencodeValue) -> Result<(Vec<FileInfo>, u64), MetainfoError> {
    let entries = value.as_list().ok_or(MetainfoError::InvalidField("files"))?;
    if entries.is_empty() {
        return Err(MetainfoError::InvalidField("files"));
    }

    let mut files = Vec::with_capacity(entries.len());
    let mut offset = 0u64;

    for entry in entries {
        let dict = entry.as_dict().ok_or(MetainfoError::InvalidField("files"))?;

        let length = dict
            .get(b"length".as_slice())
            .and_then(|v| v.as_uint())
            .ok_or(MetainfoError::MissingField("length"))?;

        let components = dict
            .get(b"path".as_slice())
            .and_then(|v| v.as_list())
            .ok_or(MetainfoError::MissingField("path"))?;
        if components.is_empty() {
            return Err(MetainfoError::InvalidField("path"));
        }

        let mut path = PathBuf::new();
        for component in components {
            let part = component
                .as_str()
                .ok_or(MetainfoError::InvalidField("path"))?;
            path.push(part);
        }

        files.push(FileInfo {
            path,
            length,
            offset,
        });
        offset += length;
    }

    Ok((files, offset))
}

fn parse_announce_list(value: Option<&BencodeValue>) -> Vec<Vec<String>> {
    let Some(tiers) = value.and_then(|v| v.as_list()) else {
        return Vec::new();
    };

    tiers
        .iter()
        .filter_map(|tier| {
            tier.as_list().map(|urls| {
                urls.iter()
                    .filter_map(|url| url.as_str().map(String::from))
                    .collect::<Vec<String>>()
            })
        })
        .filter(|tier| !tier.is_empty())
        .collect()
}

fn sha1_of(bytes: &[u8]) -> Sha1Hash {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hasher.finalize().into()
}
