//! Wire codec: self-describing binary chunk frames.
//!
//! Frame layout (little-endian):
//!
//!   [u16 idLen][idLen bytes: transfer id, UTF-8]
//!   [u32 chunkIndex][u32 totalChunks][u32 crc32(payload)][payload]
//!
//! Every chunk frame carries enough metadata to attribute the payload to the
//! right file and position even if control and binary data race on the
//! channel. The CRC32 (reflected polynomial 0xEDB88320, init/final XOR
//! 0xFFFFFFFF) catches channel-level corruption per chunk; the slower
//! whole-file SHA-256 is computed once per file, incrementally, via
//! [`FileHasher`].

use bytes::BufMut;
use sha2::{Digest, Sha256};

/// Fixed part of the frame header: id length (2) + chunk index (4) +
/// total chunks (4) + checksum (4).
pub const FRAME_HEADER_MIN: usize = 2 + 4 + 4 + 4;

/// A decoded chunk frame.
///
/// `is_valid` records whether the payload CRC matched the stored checksum.
/// Decoding never rejects a structurally valid but checksum-mismatched
/// frame; the transfer engine decides policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    pub transfer_id: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub checksum: u32,
    pub payload: Vec<u8>,
    pub is_valid: bool,
}

/// CRC32 over a payload (IEEE reflected, 0xEDB88320).
pub fn crc32(payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

/// Encode a chunk frame. Pure; no error conditions.
pub fn encode_chunk(
    transfer_id: &str,
    chunk_index: u32,
    total_chunks: u32,
    payload: &[u8],
) -> Vec<u8> {
    let id = transfer_id.as_bytes();
    debug_assert!(id.len() <= u16::MAX as usize);

    let mut buf = Vec::with_capacity(FRAME_HEADER_MIN + id.len() + payload.len());
    buf.put_u16_le(id.len() as u16);
    buf.extend_from_slice(id);
    buf.put_u32_le(chunk_index);
    buf.put_u32_le(total_chunks);
    buf.put_u32_le(crc32(payload));
    buf.extend_from_slice(payload);
    buf
}

/// Decode a chunk frame.
///
/// Returns `None` when the buffer is shorter than the minimum header, shorter
/// than `header + idLen` implies, or the id bytes are not UTF-8. Never panics
/// and never reads out of bounds; malformed frames are the caller's to log
/// and drop.
pub fn decode_chunk(frame: &[u8]) -> Option<ChunkFrame> {
    if frame.len() < FRAME_HEADER_MIN {
        return None;
    }

    let id_len = u16::from_le_bytes([frame[0], frame[1]]) as usize;
    if frame.len() < FRAME_HEADER_MIN + id_len {
        return None;
    }

    let transfer_id = std::str::from_utf8(&frame[2..2 + id_len]).ok()?.to_string();

    let mut at = 2 + id_len;
    let mut read_u32 = |buf: &[u8]| {
        let v = u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        at += 4;
        v
    };
    let chunk_index = read_u32(frame);
    let total_chunks = read_u32(frame);
    let checksum = read_u32(frame);

    let payload = frame[at..].to_vec();
    let is_valid = crc32(&payload) == checksum;

    Some(ChunkFrame {
        transfer_id,
        chunk_index,
        total_chunks,
        checksum,
        payload,
        is_valid,
    })
}

// ── Whole-file hashing ───────────────────────────────────────────────────────

/// Incremental SHA-256 over a file's chunks, fed strictly in index order.
///
/// The sender advertises the finished digest in the file offer before any
/// chunk leaves; the receiver recomputes it over the ordered parts during
/// assembly, without materializing the whole file into one buffer first.
pub struct FileHasher {
    inner: Sha256,
}

impl FileHasher {
    pub fn new() -> Self {
        Self {
            inner: Sha256::new(),
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
    }

    /// Finish and render the digest as lowercase hex.
    pub fn finalize(self) -> String {
        let digest = self.inner.finalize();
        let mut out = String::with_capacity(digest.len() * 2);
        for byte in digest {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }
}

impl Default for FileHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash a contiguous buffer in one shot (sender side, small files).
pub fn file_digest(data: &[u8]) -> String {
    let mut hasher = FileHasher::new();
    hasher.update(data);
    hasher.finalize()
}
