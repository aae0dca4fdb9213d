//! Transfer progress tracking
//!
//! Progress snapshots are published on a broadcast channel as a download
//! advances and can be queried per request.

use std::time::{Duration, Instant};

/// Shortest span a speed sample covers
const SPEED_WINDOW: Duration = Duration::from_millis(500);

/// Transfer status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Waiting for an admission slot
    Pending,
    /// Threads are running
    Transferring,
    /// File written to its destination
    Completed,
    /// A thread failed, the request was aborted
    Failed,
    /// Cancelled locally
    Cancelled,
}

impl TransferStatus {
    /// Whether the status is final
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Transferring => write!(f, "transferring"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Progress snapshot for one download
#[derive(Debug, Clone)]
pub struct TransferProgress {
    /// Request id
    pub request_id: String,

    /// Declared file size
    pub total_size: u64,

    /// Bytes received so far
    pub transferred: u64,

    /// Progress percentage (0.0 to 100.0)
    pub percent: f64,

    /// Speed over the most recent sample window, in bytes/second
    pub speed_bytes_per_sec: f64,

    /// Current status
    pub status: TransferStatus,

    /// Failure reason
    pub error: Option<String>,

    /// Start of the current speed window and the byte count at that time
    sample: Option<(Instant, u64)>,
}

impl TransferProgress {
    /// Create a pending progress record
    pub fn new(request_id: impl Into<String>, total_size: u64) -> Self {
        Self {
            request_id: request_id.into(),
            total_size,
            transferred: 0,
            percent: 0.0,
            speed_bytes_per_sec: 0.0,
            status: TransferStatus::Pending,
            error: None,
            sample: None,
        }
    }

    /// Mark the transfer as running
    pub fn start(&mut self) {
        self.status = TransferStatus::Transferring;
        self.sample = Some((Instant::now(), self.transferred));
    }

    /// Record the byte count received so far
    pub fn update(&mut self, transferred: u64) {
        self.update_at(transferred, Instant::now());
    }

    pub(crate) fn update_at(&mut self, transferred: u64, now: Instant) {
        if self.status.is_terminal() {
            return;
        }
        self.transferred = transferred.min(self.total_size);

        if self.total_size > 0 {
            self.percent = (self.transferred as f64 / self.total_size as f64) * 100.0;
        }

        if let Some((since, bytes)) = self.sample {
            let elapsed = now.saturating_duration_since(since);
            if elapsed >= SPEED_WINDOW {
                let delta = self.transferred.saturating_sub(bytes);
                self.speed_bytes_per_sec = delta as f64 / elapsed.as_secs_f64();
                self.sample = Some((now, self.transferred));
            }
        }
    }

    /// Mark the transfer as complete
    pub fn complete(&mut self) {
        self.transferred = self.total_size;
        self.percent = 100.0;
        self.status = TransferStatus::Completed;
    }

    /// Mark the transfer as failed
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = TransferStatus::Failed;
        self.error = Some(error.into());
    }

    /// Mark the transfer as cancelled
    pub fn cancel(&mut self) {
        self.status = TransferStatus::Cancelled;
    }

    /// Check if the transfer completed
    pub fn is_complete(&self) -> bool {
        self.status == TransferStatus::Completed
    }

    /// Human-readable speed
    pub fn speed_string(&self) -> String {
        let speed = self.speed_bytes_per_sec;
        if speed < 1024.0 {
            format!("{speed:.2} B/s")
        } else if speed < 1024.0 * 1024.0 {
            format!("{:.2} KiB/s", speed / 1024.0)
        } else {
            format!("{:.2} MiB/s", speed / (1024.0 * 1024.0))
        }
    }
}
