use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Snapshot of [`ServiceStats`], suitable for logging or JSON output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ServiceStatsSnapshot {
    pub flushes: u64,
    pub commands_processed: u64,
    pub parse_errors: u64,
    pub transfer_buffers_registered: u64,
    pub transfer_buffers_destroyed: u64,
}

/// Counters for one command buffer service.
///
/// Updated on the service thread; may be read from any thread.
#[derive(Debug, Default)]
pub struct ServiceStats {
    flushes: AtomicU64,
    commands_processed: AtomicU64,
    parse_errors: AtomicU64,
    transfer_buffers_registered: AtomicU64,
    transfer_buffers_destroyed: AtomicU64,
}

impl ServiceStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_flushes(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_commands_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_parse_errors(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_transfer_buffers_registered(&self) {
        self.transfer_buffers_registered
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_transfer_buffers_destroyed(&self) {
        self.transfer_buffers_destroyed
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ServiceStatsSnapshot {
        ServiceStatsSnapshot {
            flushes: self.flushes.load(Ordering::Relaxed),
            commands_processed: self.commands_processed.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            transfer_buffers_registered: self.transfer_buffers_registered.load(Ordering::Relaxed),
            transfer_buffers_destroyed: self.transfer_buffers_destroyed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let stats = ServiceStats::new();
        stats.inc_flushes();
        stats.inc_flushes();
        stats.inc_commands_processed();
        stats.inc_parse_errors();

        let snap = stats.snapshot();
        assert_eq!(snap.flushes, 2);
        assert_eq!(snap.commands_processed, 1);
        assert_eq!(snap.parse_errors, 1);
        assert_eq!(snap.transfer_buffers_registered, 0);
    }
}
