//! # HUDDLE Files
//!
//! File side of peer-to-peer transfers.
//!
//! This crate provides:
//! - Thread-count tiers and contiguous byte-range partitioning
//! - Splitting a range into fixed-size transfer frames
//! - Per-thread reassembly buffers that tolerate out-of-order delivery
//! - The [`store::FileStore`] capability used to read and persist files

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunker;
pub mod error;
pub mod reassembly;
pub mod store;

pub use chunker::{ByteRange, FileChunker, partition, plan_ranges, thread_count_for};
pub use error::{FileError, Result};
pub use reassembly::{Reassembler, ThreadBuffer};
pub use store::{FileStore, LocalFileStore, MemoryFileStore};

/// One mebibyte
pub const MIB: u64 = 1024 * 1024;

/// Size of a single transfer frame payload (4 MiB)
pub const FRAME_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Largest number of parallel threads a single file is split into
pub const MAX_THREADS: usize = 12;
