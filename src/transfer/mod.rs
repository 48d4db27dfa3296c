//! Transfer engine: upload and download orchestration.
//!
//! Offer/accept/decline handshake, ordered chunk reassembly, pause/resume
//! streaming under buffer pressure, and whole-file integrity verification,
//! layered on the [`crate::codec`] frames and the [`crate::transport`]
//! session. State lives in one owned [`registry::TransferRegistry`] injected
//! into the sibling coordinators; nothing here is process-global.

pub mod download;
pub mod registry;
pub mod upload;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::Result;

pub use download::DownloadCoordinator;
pub use registry::{FileDownload, FileUpload, TransferRegistry, TransferStatus};
pub use upload::UploadCoordinator;

/// Generate a transfer id: UUID plus a millisecond timestamp, globally
/// unique even across retries of the same file.
pub fn new_transfer_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("{}-{}", Uuid::new_v4(), millis)
}

/// Number of chunks a file of `size` bytes splits into. An empty file still
/// travels as one empty chunk so the receiver learns the total and completes.
pub fn chunk_count(size: u64, chunk_size: usize) -> u32 {
    (size.div_ceil(chunk_size as u64) as u32).max(1)
}

// ── Chunk sources ────────────────────────────────────────────────────────────

/// Where a transfer's bytes come from. File-backed for real uploads,
/// memory-backed for small payloads and tests; either way the engine pulls
/// one bounded chunk at a time instead of materializing the file.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    /// Total size in bytes.
    fn size(&self) -> u64;

    /// Read the chunk at `index`. The last chunk may be shorter than
    /// `chunk_size`; reading past the end returns an empty buffer.
    async fn read_chunk(&self, index: u32, chunk_size: usize) -> Result<Vec<u8>>;
}

/// In-memory chunk source.
pub struct MemorySource {
    data: Bytes,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

#[async_trait]
impl ChunkSource for MemorySource {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read_chunk(&self, index: u32, chunk_size: usize) -> Result<Vec<u8>> {
        let start = (index as usize).saturating_mul(chunk_size);
        if start >= self.data.len() {
            return Ok(Vec::new());
        }
        let end = (start + chunk_size).min(self.data.len());
        Ok(self.data[start..end].to_vec())
    }
}

/// Disk-backed chunk source; positional seek + read per chunk.
pub struct FileSource {
    file: Mutex<tokio::fs::File>,
    size: u64,
}

impl FileSource {
    pub async fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        Ok(Self {
            file: Mutex::new(file),
            size,
        })
    }
}

#[async_trait]
impl ChunkSource for FileSource {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read_chunk(&self, index: u32, chunk_size: usize) -> Result<Vec<u8>> {
        let offset = (index as u64).saturating_mul(chunk_size as u64);
        if offset >= self.size {
            return Ok(Vec::new());
        }
        let want = chunk_size.min((self.size - offset) as usize);
        let mut buf = vec![0u8; want];
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.read_exact(&mut buf).await?;
        Ok(buf)
    }
}

/// Compute the whole-file digest of a source, chunk by chunk.
pub async fn source_digest(
    source: &Arc<dyn ChunkSource>,
    chunk_size: usize,
) -> Result<String> {
    let total = chunk_count(source.size(), chunk_size);
    let mut hasher = crate::codec::FileHasher::new();
    for index in 0..total {
        let chunk = source.read_chunk(index, chunk_size).await?;
        hasher.update(&chunk);
    }
    Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_ids_are_unique() {
        let a = new_transfer_id();
        let b = new_transfer_id();
        assert_ne!(a, b);
        assert!(a.contains('-'));
    }

    #[test]
    fn chunk_count_rounds_up() {
        assert_eq!(chunk_count(0, 256), 1);
        assert_eq!(chunk_count(1, 256), 1);
        assert_eq!(chunk_count(256, 256), 1);
        assert_eq!(chunk_count(257, 256), 2);
    }

    #[tokio::test]
    async fn memory_source_slices_and_bounds() {
        let source = MemorySource::new(vec![7u8; 700]);
        assert_eq!(source.size(), 700);
        assert_eq!(source.read_chunk(0, 256).await.unwrap().len(), 256);
        assert_eq!(source.read_chunk(2, 256).await.unwrap().len(), 188);
        assert!(source.read_chunk(3, 256).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn source_digest_matches_contiguous_hash() {
        let data = vec![42u8; 1000];
        let source: Arc<dyn ChunkSource> = Arc::new(MemorySource::new(data.clone()));
        let digest = source_digest(&source, 256).await.unwrap();
        assert_eq!(digest, crate::codec::file_digest(&data));
    }
}
