//! Health monitoring and metrics for pipeline

use std::sync::atomic::{AtomicU64, Ordering};

/// Health metrics for a pipeline
///
/// Tracks various counters to monitor pipeline health.
/// All fields use atomic operations so observers can read them while the
/// pipeline task is running.
pub struct PipelineHealth {
    /// Number of chunks pulled from the source
    pub chunks_read: AtomicU64,

    /// Total bytes pulled from the source
    pub bytes_read: AtomicU64,

    /// Number of chunks accepted by the sink
    pub chunks_written: AtomicU64,

    /// Total bytes accepted by the sink
    pub bytes_written: AtomicU64,

    /// Number of pause/resume cycles caused by a full sink
    pub backpressure_pauses: AtomicU64,

    /// Number of chunks discarded after the sink was detached
    pub chunks_discarded: AtomicU64,
}

impl PipelineHealth {
    /// Create a new health metrics instance
    pub fn new() -> Self {
        Self {
            chunks_read: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            chunks_written: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            backpressure_pauses: AtomicU64::new(0),
            chunks_discarded: AtomicU64::new(0),
        }
    }

    /// Record a chunk pulled from the source
    pub fn record_read(&self, size: usize) {
        self.chunks_read.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(size as u64, Ordering::Relaxed);
    }

    /// Record a chunk handed to the sink
    pub fn record_write(&self, size: usize) {
        self.chunks_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn record_pause(&self) {
        self.backpressure_pauses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discard(&self) {
        self.chunks_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn chunks_read(&self) -> u64 {
        self.chunks_read.load(Ordering::Relaxed)
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn chunks_written(&self) -> u64 {
        self.chunks_written.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn backpressure_pauses(&self) -> u64 {
        self.backpressure_pauses.load(Ordering::Relaxed)
    }

    pub fn chunks_discarded(&self) -> u64 {
        self.chunks_discarded.load(Ordering::Relaxed)
    }

    /// Get a summary of health metrics
    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            chunks_read: self.chunks_read(),
            bytes_read: self.bytes_read(),
            chunks_written: self.chunks_written(),
            bytes_written: self.bytes_written(),
            backpressure_pauses: self.backpressure_pauses(),
            chunks_discarded: self.chunks_discarded(),
        }
    }
}

impl Default for PipelineHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of health metrics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthSummary {
    pub chunks_read: u64,
    pub bytes_read: u64,
    pub chunks_written: u64,
    pub bytes_written: u64,
    pub backpressure_pauses: u64,
    pub chunks_discarded: u64,
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Health: {} chunks in ({} bytes), {} chunks out ({} bytes), {} pauses, {} discarded",
            self.chunks_read,
            self.bytes_read,
            self.chunks_written,
            self.bytes_written,
            self.backpressure_pauses,
            self.chunks_discarded
        )
    }
}
