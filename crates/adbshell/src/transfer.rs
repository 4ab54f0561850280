//! Chunk planning for file pushes.
//!
//! The sync sub-protocol moves file bodies as a sequence of DATA packets no
//! larger than the configured chunk size. [`ChunkPlan`] owns the payload and
//! hands out zero-copy slices of it.

use bytes::Bytes;

/// Default push chunk size (64KB).
pub const DEFAULT_PUSH_CHUNK_SIZE: usize = 64 * 1024;

/// Maximum push chunk size accepted by the sync protocol (64KB).
pub const MAX_PUSH_CHUNK_SIZE: usize = 64 * 1024;

/// Default permission bits for pushed files.
pub const DEFAULT_PUSH_FILE_MODE: u32 = 0o644;

/// A payload segmented into fixed-size chunks. The final chunk may be shorter.
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    data: Bytes,
    chunk_size: usize,
}

impl ChunkPlan {
    /// Plans `data` in chunks of `chunk_size` bytes. A zero size is treated as 1.
    pub fn new(data: Bytes, chunk_size: usize) -> Self {
        Self {
            data,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Size of every chunk but the last.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Total payload size in bytes.
    pub fn total_size(&self) -> usize {
        self.data.len()
    }

    /// Number of chunks the payload splits into.
    pub fn chunk_count(&self) -> usize {
        self.data.len().div_ceil(self.chunk_size)
    }

    /// Returns true if there is nothing to send.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The whole payload.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Iterates over the chunks in order.
    pub fn chunks(&self) -> impl Iterator<Item = Bytes> + '_ {
        (0..self.data.len())
            .step_by(self.chunk_size)
            .map(move |start| {
                let end = (start + self.chunk_size).min(self.data.len());
                self.data.slice(start..end)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_multiple_splits_evenly() {
        let plan = ChunkPlan::new(Bytes::from(vec![1u8; 12]), 4);
        let chunks: Vec<Bytes> = plan.chunks().collect();
        assert_eq!(plan.chunk_count(), 3);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() == 4));
    }

    #[test]
    fn test_remainder_goes_into_short_last_chunk() {
        let data: Vec<u8> = (0..10).collect();
        let plan = ChunkPlan::new(Bytes::from(data.clone()), 4);
        let chunks: Vec<Bytes> = plan.chunks().collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].as_ref(), &[8, 9]);
        assert_eq!(chunks.concat(), data);
    }

    #[test]
    fn test_empty_payload_has_no_chunks() {
        let plan = ChunkPlan::new(Bytes::new(), 4);
        assert!(plan.is_empty());
        assert_eq!(plan.chunk_count(), 0);
        assert_eq!(plan.chunks().count(), 0);
    }

    #[test]
    fn test_zero_chunk_size_is_clamped() {
        let plan = ChunkPlan::new(Bytes::from_static(b"abc"), 0);
        assert_eq!(plan.chunk_size(), 1);
        assert_eq!(plan.chunk_count(), 3);
    }

    #[test]
    fn test_payload_smaller_than_chunk() {
        let plan = ChunkPlan::new(Bytes::from_static(b"hello"), DEFAULT_PUSH_CHUNK_SIZE);
        let chunks: Vec<Bytes> = plan.chunks().collect();
        assert_eq!(chunks, vec![Bytes::from_static(b"hello")]);
        assert_eq!(plan.total_size(), 5);
    }
}
