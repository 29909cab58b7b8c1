use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the replay counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplayStatsSnapshot {
    pub ops_completed: u64,
    pub ops_skipped: u64,
    pub wait_timeouts: u64,
    pub bytes_submitted: u64,
    pub queue_entries: u64,
    pub bytes_downloaded: u64,
    pub relocs_applied: u64,
    pub words_committed: u64,
}

/// Telemetry counters for one trace playback.
///
/// Cheap relaxed increments on the replay path; safe to read from another
/// thread for progress reporting.
#[derive(Debug, Default)]
pub struct ReplayStats {
    ops_completed: AtomicU64,
    ops_skipped: AtomicU64,
    wait_timeouts: AtomicU64,
    bytes_submitted: AtomicU64,
    queue_entries: AtomicU64,
    bytes_downloaded: AtomicU64,
    relocs_applied: AtomicU64,
    words_committed: AtomicU64,
}

impl ReplayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_ops_completed(&self) {
        self.ops_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_ops_skipped(&self) {
        self.ops_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_wait_timeouts(&self) {
        self.wait_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_submitted(&self, bytes: u64) {
        self.bytes_submitted.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_queue_entries(&self) {
        self.queue_entries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_downloaded(&self, bytes: u64) {
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_relocs_applied(&self, count: u64) {
        self.relocs_applied.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_words_committed(&self, count: u64) {
        self.words_committed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ReplayStatsSnapshot {
        ReplayStatsSnapshot {
            ops_completed: self.ops_completed.load(Ordering::Relaxed),
            ops_skipped: self.ops_skipped.load(Ordering::Relaxed),
            wait_timeouts: self.wait_timeouts.load(Ordering::Relaxed),
            bytes_submitted: self.bytes_submitted.load(Ordering::Relaxed),
            queue_entries: self.queue_entries.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            relocs_applied: self.relocs_applied.load(Ordering::Relaxed),
            words_committed: self.words_committed.load(Ordering::Relaxed),
        }
    }
}
