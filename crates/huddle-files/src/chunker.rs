//! Range partitioning and frame chunking.

use crate::{FRAME_CHUNK_SIZE, MAX_THREADS, MIB};
use std::fmt;

/// Half-open byte range `[start, end)` within a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    /// First byte (inclusive)
    pub start: u64,
    /// Last byte (exclusive)
    pub end: u64,
}

impl ByteRange {
    /// Create a new range
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Number of bytes covered
    pub const fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    /// Whether the range covers no bytes
    pub const fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Whether the range lies within a file of `size` bytes
    pub const fn fits(&self, size: u64) -> bool {
        self.start <= self.end && self.end <= size
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Number of parallel threads used for a file of `size` bytes
///
/// | size       | threads |
/// |------------|---------|
/// | < 1 MiB    | 2       |
/// | < 5 MiB    | 4       |
/// | < 20 MiB   | 8       |
/// | < 100 MiB  | 10      |
/// | otherwise  | 12      |
///
/// The count never exceeds the byte count, so no thread receives an empty
/// range. A zero-byte file still reports one thread.
pub fn thread_count_for(size: u64) -> usize {
    let tier = if size < MIB {
        2
    } else if size < 5 * MIB {
        4
    } else if size < 20 * MIB {
        8
    } else if size < 100 * MIB {
        10
    } else {
        MAX_THREADS
    };

    tier.min(usize::try_from(size).unwrap_or(usize::MAX)).max(1)
}

/// Split `[0, size)` into `threads` contiguous, non-overlapping ranges
///
/// The remainder of `size / threads` is spread one byte at a time over the
/// first ranges. When `size < threads` the trailing ranges are empty.
pub fn partition(size: u64, threads: usize) -> Vec<ByteRange> {
    let threads = threads.max(1) as u64;
    let base = size / threads;
    let remainder = size % threads;

    let mut ranges = Vec::with_capacity(threads as usize);
    let mut start = 0u64;
    for i in 0..threads {
        let len = base + u64::from(i < remainder);
        ranges.push(ByteRange::new(start, start + len));
        start += len;
    }
    ranges
}

/// Thread ranges for a file of `size` bytes using the tiered thread count
pub fn plan_ranges(size: u64) -> Vec<ByteRange> {
    partition(size, thread_count_for(size))
}

/// Splits byte slices into fixed-size transfer frames
#[derive(Debug, Clone, Copy)]
pub struct FileChunker {
    chunk_size: usize,
}

impl FileChunker {
    /// Create a new chunker with the default 4 MiB frame size
    pub fn new() -> Self {
        Self::with_chunk_size(FRAME_CHUNK_SIZE)
    }

    /// Create a new chunker with custom frame size
    pub fn with_chunk_size(size: usize) -> Self {
        Self {
            chunk_size: size.max(1),
        }
    }

    /// Get chunk size
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Calculate number of chunks for `len` bytes
    pub fn chunk_count(&self, len: u64) -> u32 {
        let count = len.div_ceil(self.chunk_size as u64);
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    /// Iterate over `(chunk_index, bytes)` pairs of a buffer
    pub fn chunks<'a>(&self, data: &'a [u8]) -> impl Iterator<Item = (u32, &'a [u8])> + 'a {
        data.chunks(self.chunk_size)
            .enumerate()
            .map(|(i, chunk)| (i as u32, chunk))
    }
}

impl Default for FileChunker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_tiers() {
        assert_eq!(thread_count_for(1), 1);
        assert_eq!(thread_count_for(512 * 1024), 2);
        assert_eq!(thread_count_for(MIB), 4);
        assert_eq!(thread_count_for(5 * MIB - 1), 4);
        assert_eq!(thread_count_for(5 * MIB), 8);
        assert_eq!(thread_count_for(20 * MIB), 10);
        assert_eq!(thread_count_for(100 * MIB), 12);
        assert_eq!(thread_count_for(40 * 1024 * MIB), 12);
    }

    #[test]
    fn test_twelve_mib_plan() {
        let ranges = plan_ranges(12_582_912);
        assert_eq!(ranges.len(), 8);
        for (i, range) in ranges.iter().enumerate() {
            assert_eq!(range.len(), 1_572_864);
            assert_eq!(range.start, i as u64 * 1_572_864);
        }
        assert_eq!(ranges.last().map(|r| r.end), Some(12_582_912));
    }

    #[test]
    fn test_partition_spreads_remainder() {
        let ranges = partition(10, 4);
        let lens: Vec<u64> = ranges.iter().map(ByteRange::len).collect();
        assert_eq!(lens, vec![3, 3, 2, 2]);
        assert_eq!(ranges[3], ByteRange::new(8, 10));
    }

    #[test]
    fn test_small_file_never_gets_empty_range() {
        let ranges = plan_ranges(1);
        assert_eq!(ranges, vec![ByteRange::new(0, 1)]);
        assert!(plan_ranges(3).iter().all(|r| !r.is_empty()));
    }

    #[test]
    fn test_chunker() {
        let chunker = FileChunker::with_chunk_size(4);
        assert_eq!(chunker.chunk_count(0), 0);
        assert_eq!(chunker.chunk_count(4), 1);
        assert_eq!(chunker.chunk_count(9), 3);

        let data = b"abcdefghi";
        let pieces: Vec<(u32, &[u8])> = chunker.chunks(data).collect();
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[2], (2, &b"i"[..]));
    }

    #[test]
    fn test_default_frame_size() {
        let chunker = FileChunker::default();
        assert_eq!(chunker.chunk_size(), FRAME_CHUNK_SIZE);
        assert_eq!(chunker.chunk_count(1_572_864), 1);
        assert_eq!(chunker.chunk_count(10 * MIB), 3);
    }

    #[test]
    fn test_range_fits() {
        assert!(ByteRange::new(0, 10).fits(10));
        assert!(!ByteRange::new(5, 11).fits(10));
        assert_eq!(ByteRange::new(2, 7).to_string(), "[2, 7)");
    }
}
