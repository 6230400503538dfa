//! Storage engine
//!
//! Owns the on-disk layout of one torrent: sparse file allocation, the
//! piece-to-file write mapping, a small write-aggregation buffer, and an
//! LRU cache of verified pieces for serving reads.
//!
//! Locking discipline: the buffer and cache use fast in-memory mutexes
//! that are never held across disk I/O; a single async mutex serializes
//! the disk path itself so that a read racing a flush still observes the
//! bytes of every `write_piece` that has returned.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::num::NonZeroUsize;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::{EngineError, Result};
use crate::torrent::metainfo::{Metainfo, Sha1Hash};

/// Pieces held in the write buffer before an automatic flush
pub const DEFAULT_WRITE_BUFFER_PIECES: usize = 10;

/// Default capacity of the served-piece cache, in pieces
pub const DEFAULT_CACHE_PIECES: usize = 64;

#[cfg(unix)]
const DIR_MODE: u32 = 0o755;
#[cfg(unix)]
const FILE_MODE: u32 = 0o644;

/// Disk layer for one torrent
pub struct StorageEngine {
    metainfo: Arc<Metainfo>,
    download_dir: PathBuf,

    /// Pieces accepted but not yet written to their files
    buffer: Mutex<HashMap<u32, Arc<Vec<u8>>>>,
    /// Verified pieces kept around for reads, least-recently-used out
    cache: Mutex<LruCache<u32, Arc<Vec<u8>>>>,
    /// Serializes the disk path; held across file writes so that
    /// buffer-drain and disk reads cannot interleave inconsistently
    io_lock: tokio::sync::Mutex<()>,

    flush_threshold: usize,
}

impl StorageEngine {
    pub fn new(metainfo: Arc<Metainfo>, download_dir: PathBuf) -> Self {
        Self::with_tuning(
            metainfo,
            download_dir,
            DEFAULT_WRITE_BUFFER_PIECES,
            DEFAULT_CACHE_PIECES,
        )
    }

    pub fn with_tuning(
        metainfo: Arc<Metainfo>,
        download_dir: PathBuf,
        flush_threshold: usize,
        cache_pieces: usize,
    ) -> Self {
        let cache_pieces = NonZeroUsize::new(cache_pieces.max(1)).unwrap();
        Self {
            metainfo,
            download_dir,
            buffer: Mutex::new(HashMap::new()),
            cache: Mutex::new(LruCache::new(cache_pieces)),
            io_lock: tokio::sync::Mutex::new(()),
            flush_threshold: flush_threshold.max(1),
        }
    }

    /// Create the directory tree and truncate every file to its declared
    /// length. Truncation requests sparse allocation; the OS assigns
    /// blocks lazily on write.
    pub async fn allocate(&self) -> Result<()> {
        validate_components(Path::new(&self.metainfo.info.name))?;

        create_dir_all(&self.download_dir).await?;

        for file_info in &self.metainfo.info.files {
            validate_components(&file_info.path)?;
            let path = self.file_path(&file_info.path);

            if let Some(parent) = path.parent() {
                create_dir_all(parent).await?;
            }

            let file = open_rw(&path).await?;
            file.set_len(file_info.length)
                .await
                .map_err(|e| EngineError::storage(&path, e.to_string()))?;
            set_file_mode(&path).await?;
        }

        tracing::debug!(
            torrent = %self.metainfo.info.name,
            files = self.metainfo.info.files.len(),
            "allocated sparse files"
        );
        Ok(())
    }

    /// Accept a verified piece. Returns once the piece is durably
    /// buffered; the disk write happens when the buffer reaches the
    /// flush threshold, on `flush`, or on shutdown.
    pub async fn write_piece(&self, index: u32, data: Vec<u8>) -> Result<()> {
        let data = Arc::new(data);

        self.cache.lock().put(index, Arc::clone(&data));

        let should_flush = {
            let mut buffer = self.buffer.lock();
            buffer.insert(index, data);
            buffer.len() >= self.flush_threshold
        };

        if should_flush {
            self.flush().await?;
        }
        Ok(())
    }

    /// Write every buffered piece to its files. Data is durable once
    /// this returns. Buffer entries are removed only after their disk
    /// write completed, so a concurrent read can never miss a piece.
    pub async fn flush(&self) -> Result<()> {
        let _io = self.io_lock.lock().await;

        let entries: Vec<(u32, Arc<Vec<u8>>)> = {
            let buffer = self.buffer.lock();
            buffer.iter().map(|(i, d)| (*i, Arc::clone(d))).collect()
        };

        for (index, data) in &entries {
            self.write_piece_to_disk(*index, data).await?;
        }

        let mut buffer = self.buffer.lock();
        for (index, _) in entries {
            buffer.remove(&index);
        }
        Ok(())
    }

    /// Read a verified piece: cache first, then the write buffer, then
    /// the files with a SHA-1 re-check.
    pub async fn read_piece(&self, index: u32) -> Result<Vec<u8>> {
        if let Some(data) = self.cache.lock().get(&index) {
            return Ok(data.as_ref().clone());
        }

        if let Some(data) = self.buffer.lock().get(&index) {
            let data = Arc::clone(data);
            self.cache.lock().put(index, Arc::clone(&data));
            return Ok(data.as_ref().clone());
        }

        let _io = self.io_lock.lock().await;
        let data = self.read_piece_from_disk(index).await?;

        let expected = self
            .metainfo
            .piece_hash(index as usize)
            .ok_or(EngineError::CacheCorrupt { piece: index })?;
        let mut hasher = Sha1::new();
        hasher.update(&data);
        let actual: Sha1Hash = hasher.finalize().into();
        if actual != *expected {
            return Err(EngineError::CacheCorrupt { piece: index });
        }

        let data = Arc::new(data);
        self.cache.lock().put(index, Arc::clone(&data));
        Ok(data.as_ref().clone())
    }

    /// Walk the ordered file list and write each overlapping slice of
    /// the piece at its offset within the file.
    async fn write_piece_to_disk(&self, index: u32, data: &[u8]) -> Result<()> {
        let mut consumed = 0usize;
        for (file_idx, file_offset, length) in self.metainfo.files_for_piece(index as usize) {
            let path = self.file_path(&self.metainfo.info.files[file_idx].path);

            let mut file = open_rw(&path).await?;
            file.seek(SeekFrom::Start(file_offset))
                .await
                .map_err(|e| EngineError::storage(&path, e.to_string()))?;
            let end = consumed + length as usize;
            file.write_all(&data[consumed..end])
                .await
                .map_err(|e| EngineError::storage(&path, e.to_string()))?;
            consumed = end;
        }
        Ok(())
    }

    async fn read_piece_from_disk(&self, index: u32) -> Result<Vec<u8>> {
        let piece_length = self
            .metainfo
            .piece_length(index as usize)
            .ok_or(EngineError::CacheCorrupt { piece: index })? as usize;

        let mut data = Vec::with_capacity(piece_length);
        for (file_idx, file_offset, length) in self.metainfo.files_for_piece(index as usize) {
            let path = self.file_path(&self.metainfo.info.files[file_idx].path);

            let mut file = File::open(&path)
                .await
                .map_err(|e| EngineError::storage(&path, e.to_string()))?;
            file.seek(SeekFrom::Start(file_offset))
                .await
                .map_err(|e| EngineError::storage(&path, e.to_string()))?;

            let mut chunk = vec![0u8; length as usize];
            file.read_exact(&mut chunk)
                .await
                .map_err(|e| EngineError::storage(&path, e.to_string()))?;
            data.extend_from_slice(&chunk);
        }
        Ok(data)
    }

    /// `<download_dir>/<name>` for the single file, or
    /// `<download_dir>/<name>/<relative path>` for a torrent directory.
    fn file_path(&self, relative: &Path) -> PathBuf {
        if self.metainfo.info.is_single_file {
            self.download_dir.join(&self.metainfo.info.name)
        } else {
            self.download_dir
                .join(&self.metainfo.info.name)
                .join(relative)
        }
    }
}

/// Reject path components that would escape the download directory.
fn validate_components(path: &Path) -> Result<()> {
    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(EngineError::malformed(
                    "file path",
                    "contains parent directory reference",
                ))
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(EngineError::malformed("file path", "is absolute"))
            }
            _ => {}
        }
    }
    Ok(())
}

async fn create_dir_all(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| EngineError::storage(path, e.to_string()))?;
    set_dir_mode(path).await
}

async fn open_rw(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .await
        .map_err(|e| EngineError::storage(path, e.to_string()))
}

#[cfg(unix)]
async fn set_dir_mode(path: &Path) -> Result<()> {
    use std::fs::Permissions;
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, Permissions::from_mode(DIR_MODE))
        .await
        .map_err(|e| EngineError::storage(path, e.to_string()))
}

#[cfg(not(unix))]
async fn set_dir_mode(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
async fn set_file_mode(path: &Path) -> Result<()> {
    use std::fs::Permissions;
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, Permissions::from_mode(FILE_MODE))
        .await
        .map_err(|e| EngineError::storage(path, e.to_string()))
}

#[cfg(not(unix))]
async fn set_file_mode(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::metainfo::{FileInfo, Info};

    fn sha1_of(data: &[u8]) -> Sha1Hash {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    /// Multi-file metainfo: files of 10, 25, and 7 bytes at piece length
    /// 16 (3 pieces, last one 10 bytes).
    fn multi_file_metainfo(content: &[u8]) -> Arc<Metainfo> {
        assert_eq!(content.len(), 42);
        let piece_length = 16u64;
        let pieces: Vec<Sha1Hash> = content.chunks(16).map(sha1_of).collect();

        Arc::new(Metainfo {
            info_hash: [9u8; 20],
            info: Info {
                name: "multi".to_string(),
                piece_length,
                pieces,
                files: vec![
                    FileInfo {
                        path: PathBuf::from("a.bin"),
                        length: 10,
                        offset: 0,
                    },
                    FileInfo {
                        path: PathBuf::from("nested/b.bin"),
                        length: 25,
                        offset: 10,
                    },
                    FileInfo {
                        path: PathBuf::from("c.bin"),
                        length: 7,
                        offset: 35,
                    },
                ],
                total_size: 42,
                is_single_file: false,
            },
            announce: Some("http://t.example/announce".to_string()),
            announce_list: Vec::new(),
        })
    }

    fn test_content() -> Vec<u8> {
        (0..42u8).collect()
    }

    #[tokio::test]
    async fn test_allocate_creates_sparse_files() {
        let dir = tempfile::tempdir().unwrap();
        let metainfo = multi_file_metainfo(&test_content());
        let storage = StorageEngine::new(metainfo, dir.path().to_path_buf());

        storage.allocate().await.unwrap();

        let a = dir.path().join("multi/a.bin");
        let b = dir.path().join("multi/nested/b.bin");
        let c = dir.path().join("multi/c.bin");
        assert_eq!(std::fs::metadata(&a).unwrap().len(), 10);
        assert_eq!(std::fs::metadata(&b).unwrap().len(), 25);
        assert_eq!(std::fs::metadata(&c).unwrap().len(), 7);
    }

    #[tokio::test]
    async fn test_write_read_across_file_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let content = test_content();
        let metainfo = multi_file_metainfo(&content);
        let storage =
            StorageEngine::with_tuning(metainfo, dir.path().to_path_buf(), 1, 4);

        storage.allocate().await.unwrap();
        for (i, chunk) in content.chunks(16).enumerate() {
            storage.write_piece(i as u32, chunk.to_vec()).await.unwrap();
        }
        storage.flush().await.unwrap();

        // Every byte lands in the right file at the right offset
        let a = std::fs::read(dir.path().join("multi/a.bin")).unwrap();
        let b = std::fs::read(dir.path().join("multi/nested/b.bin")).unwrap();
        let c = std::fs::read(dir.path().join("multi/c.bin")).unwrap();
        assert_eq!(a, &content[..10]);
        assert_eq!(b, &content[10..35]);
        assert_eq!(c, &content[35..]);

        // And reads reassemble the original pieces
        for (i, chunk) in content.chunks(16).enumerate() {
            assert_eq!(storage.read_piece(i as u32).await.unwrap(), chunk);
        }
    }

    #[tokio::test]
    async fn test_buffered_piece_visible_before_flush() {
        let dir = tempfile::tempdir().unwrap();
        let content = test_content();
        let metainfo = multi_file_metainfo(&content);
        // Threshold high enough that nothing auto-flushes
        let storage =
            StorageEngine::with_tuning(metainfo, dir.path().to_path_buf(), 10, 1);

        storage.allocate().await.unwrap();
        storage.write_piece(0, content[..16].to_vec()).await.unwrap();

        // Files still hold zeros
        let a = std::fs::read(dir.path().join("multi/a.bin")).unwrap();
        assert_eq!(a, vec![0u8; 10]);

        // Cache capacity is 1, so writing piece 1 evicts piece 0 from the
        // cache; the read must then come from the write buffer
        storage.write_piece(1, content[16..32].to_vec()).await.unwrap();
        assert_eq!(storage.read_piece(0).await.unwrap(), &content[..16]);

        storage.flush().await.unwrap();
        let a = std::fs::read(dir.path().join("multi/a.bin")).unwrap();
        assert_eq!(a, &content[..10]);
    }

    #[tokio::test]
    async fn test_auto_flush_at_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let content = test_content();
        let metainfo = multi_file_metainfo(&content);
        let storage =
            StorageEngine::with_tuning(metainfo, dir.path().to_path_buf(), 2, 4);

        storage.allocate().await.unwrap();
        storage.write_piece(0, content[..16].to_vec()).await.unwrap();
        storage.write_piece(1, content[16..32].to_vec()).await.unwrap();

        // Second write crossed the threshold; both pieces hit the disk
        let a = std::fs::read(dir.path().join("multi/a.bin")).unwrap();
        assert_eq!(a, &content[..10]);
        let b = std::fs::read(dir.path().join("multi/nested/b.bin")).unwrap();
        assert_eq!(&b[..22], &content[10..32]);
    }

    #[tokio::test]
    async fn test_disk_read_reverifies_hash() {
        let dir = tempfile::tempdir().unwrap();
        let content = test_content();
        let metainfo = multi_file_metainfo(&content);

        {
            let storage =
                StorageEngine::with_tuning(Arc::clone(&metainfo), dir.path().to_path_buf(), 1, 4);
            storage.allocate().await.unwrap();
            for (i, chunk) in content.chunks(16).enumerate() {
                storage.write_piece(i as u32, chunk.to_vec()).await.unwrap();
            }
            storage.flush().await.unwrap();
        }

        // Fresh engine: no cache, no buffer; read must verify from disk
        let storage =
            StorageEngine::with_tuning(Arc::clone(&metainfo), dir.path().to_path_buf(), 1, 4);
        assert_eq!(storage.read_piece(1).await.unwrap(), &content[16..32]);

        // Corrupt a byte of piece 2 on disk
        let c_path = dir.path().join("multi/c.bin");
        let mut c = std::fs::read(&c_path).unwrap();
        c[3] ^= 0xff;
        std::fs::write(&c_path, &c).unwrap();

        let storage = StorageEngine::with_tuning(metainfo, dir.path().to_path_buf(), 1, 4);
        let err = storage.read_piece(2).await.unwrap_err();
        assert!(matches!(err, EngineError::CacheCorrupt { piece: 2 }));
    }

    #[tokio::test]
    async fn test_single_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let content = b"hello world".to_vec();
        let metainfo = Arc::new(Metainfo {
            info_hash: [1u8; 20],
            info: Info {
                name: "hello.txt".to_string(),
                piece_length: 32768,
                pieces: vec![sha1_of(&content)],
                files: vec![FileInfo {
                    path: PathBuf::from("hello.txt"),
                    length: 11,
                    offset: 0,
                }],
                total_size: 11,
                is_single_file: true,
            },
            announce: Some("http://t.example/announce".to_string()),
            announce_list: Vec::new(),
        });

        let storage = StorageEngine::with_tuning(metainfo, dir.path().to_path_buf(), 1, 4);
        storage.allocate().await.unwrap();
        storage.write_piece(0, content.clone()).await.unwrap();
        storage.flush().await.unwrap();

        // Single file sits directly under the download dir
        let on_disk = std::fs::read(dir.path().join("hello.txt")).unwrap();
        assert_eq!(on_disk, content);
    }

    #[test]
    fn test_path_validation() {
        assert!(validate_components(Path::new("ok/nested/file.bin")).is_ok());
        assert!(validate_components(Path::new("../etc/passwd")).is_err());
        assert!(validate_components(Path::new("/etc/passwd")).is_err());
        assert!(validate_components(Path::new("a/../../b")).is_err());
    }
}
