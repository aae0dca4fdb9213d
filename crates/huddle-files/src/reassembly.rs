//! Out-of-order reassembly of parallel transfer threads.
//!
//! Frames arrive over an unordered channel, so a thread's `complete` marker
//! may overtake its last chunks. A thread is only finished once the marker
//! has arrived **and** every chunk it announced is present.

use crate::error::{FileError, Result};
use std::collections::BTreeMap;

/// Chunks received for one thread, keyed by chunk index
#[derive(Debug, Default)]
pub struct ThreadBuffer {
    chunks: BTreeMap<u32, Vec<u8>>,
    total: Option<u32>,
    completed: bool,
    bytes: u64,
}

impl ThreadBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    fn declare_total(&mut self, total: u32) -> Result<()> {
        match self.total {
            Some(first) if first != total => Err(FileError::ChunkCountMismatch {
                first,
                second: total,
            }),
            _ => {
                self.total = Some(total);
                Ok(())
            }
        }
    }

    /// Store a chunk
    ///
    /// Returns the number of new bytes stored (zero for a duplicate).
    ///
    /// # Errors
    ///
    /// Returns an error if `index >= total` or `total` disagrees with an
    /// earlier frame.
    pub fn insert(&mut self, index: u32, total: u32, data: Vec<u8>) -> Result<u64> {
        if index >= total {
            return Err(FileError::ChunkOutOfRange { index, total });
        }
        self.declare_total(total)?;

        if self.chunks.contains_key(&index) {
            return Ok(0);
        }
        let len = data.len() as u64;
        self.chunks.insert(index, data);
        self.bytes += len;
        Ok(len)
    }

    /// Record the thread's `complete` marker
    ///
    /// # Errors
    ///
    /// Returns an error if `total` disagrees with the chunks already seen.
    pub fn mark_complete(&mut self, total: u32) -> Result<()> {
        self.declare_total(total)?;
        self.completed = true;
        Ok(())
    }

    /// Whether the marker arrived and no chunk is missing
    pub fn is_complete(&self) -> bool {
        self.completed && self.total.is_some_and(|t| self.chunks.len() as u64 == u64::from(t))
    }

    /// Bytes stored so far
    pub fn received_bytes(&self) -> u64 {
        self.bytes
    }

    /// Number of chunks stored
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    fn drain_into(self, out: &mut Vec<u8>) {
        for (_, chunk) in self.chunks {
            out.extend_from_slice(&chunk);
        }
    }
}

/// Reassembly state for one whole-file download
#[derive(Debug)]
pub struct Reassembler {
    threads: Vec<ThreadBuffer>,
}

impl Reassembler {
    /// Create buffers for `thread_count` threads
    pub fn new(thread_count: usize) -> Self {
        Self {
            threads: (0..thread_count).map(|_| ThreadBuffer::new()).collect(),
        }
    }

    /// Number of threads
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    fn thread_mut(&mut self, index: usize) -> Result<&mut ThreadBuffer> {
        let threads = self.threads.len();
        self.threads
            .get_mut(index)
            .ok_or(FileError::ThreadOutOfRange { index, threads })
    }

    /// Store a chunk for `thread`
    ///
    /// Returns `true` if this chunk finished the thread.
    pub fn insert_chunk(
        &mut self,
        thread: usize,
        index: u32,
        total: u32,
        data: Vec<u8>,
    ) -> Result<bool> {
        let buffer = self.thread_mut(thread)?;
        let was_complete = buffer.is_complete();
        buffer.insert(index, total, data)?;
        Ok(!was_complete && buffer.is_complete())
    }

    /// Record the `complete` marker for `thread`
    ///
    /// Returns `true` if this marker finished the thread.
    pub fn mark_complete(&mut self, thread: usize, total: u32) -> Result<bool> {
        let buffer = self.thread_mut(thread)?;
        let was_complete = buffer.is_complete();
        buffer.mark_complete(total)?;
        Ok(!was_complete && buffer.is_complete())
    }

    /// Whether `thread` has finished
    pub fn is_thread_complete(&self, thread: usize) -> bool {
        self.threads.get(thread).is_some_and(ThreadBuffer::is_complete)
    }

    /// Whether every thread has finished
    pub fn is_complete(&self) -> bool {
        self.threads.iter().all(ThreadBuffer::is_complete)
    }

    /// Bytes stored across all threads
    pub fn received_bytes(&self) -> u64 {
        self.threads.iter().map(ThreadBuffer::received_bytes).sum()
    }

    /// Concatenate chunks in chunk order, then thread order
    ///
    /// # Errors
    ///
    /// Returns [`FileError::Incomplete`] naming the first unfinished thread.
    pub fn merge(self) -> Result<Vec<u8>> {
        if let Some(thread) = self.threads.iter().position(|t| !t.is_complete()) {
            return Err(FileError::Incomplete { thread });
        }

        let total = self.received_bytes() as usize;
        let mut out = Vec::with_capacity(total);
        for buffer in self.threads {
            buffer.drain_into(&mut out);
        }
        Ok(out)
    }
}
