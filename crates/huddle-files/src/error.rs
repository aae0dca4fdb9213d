//! Error types for file handling

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while reading, reassembling or persisting files
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FileError {
    /// Underlying I/O failed
    #[error("File I/O error: {0}")]
    Io(String),

    /// File does not exist
    #[error("File not found: {}", .0.display())]
    NotFound(PathBuf),

    /// Requested range lies outside the file
    #[error("Range [{start}, {end}) is outside a file of {size} bytes")]
    InvalidRange {
        /// Range start
        start: u64,
        /// Range end
        end: u64,
        /// File size
        size: u64,
    },

    /// Thread index beyond the partition
    #[error("Thread {index} out of range (file has {threads} threads)")]
    ThreadOutOfRange {
        /// Offending thread index
        index: usize,
        /// Number of threads
        threads: usize,
    },

    /// Chunk index beyond the declared total
    #[error("Chunk {index} out of range (thread has {total} chunks)")]
    ChunkOutOfRange {
        /// Offending chunk index
        index: u32,
        /// Declared total
        total: u32,
    },

    /// Two frames disagree on a thread's chunk count
    #[error("Thread declared {first} chunks, later frame declared {second}")]
    ChunkCountMismatch {
        /// Count seen first
        first: u32,
        /// Conflicting count
        second: u32,
    },

    /// Merge attempted before every thread finished
    #[error("Reassembly incomplete: thread {thread} is missing chunks")]
    Incomplete {
        /// First unfinished thread
        thread: usize,
    },
}

impl From<std::io::Error> for FileError {
    fn from(e: std::io::Error) -> Self {
        FileError::Io(e.to_string())
    }
}

/// Result type for file operations
pub type Result<T> = std::result::Result<T, FileError>;
