//! Flush-path counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct FlushMetrics {
    /// Ticks that found work to do.
    ticks: AtomicU64,
    /// Successful write transactions.
    transactions: AtomicU64,
    bytes_written: AtomicU64,
    /// Failed opens, seeks, writes and syncs.
    errors: AtomicU64,
    syncs: AtomicU64,
    handle_opens: AtomicU64,
}

impl FlushMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self, bytes: usize) {
        self.transactions.fetch_add(1, Ordering::Relaxed);
        self.bytes_written
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sync(&self) {
        self.syncs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_open(&self) {
        self.handle_opens.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> FlushMetricsSnapshot {
        FlushMetricsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            transactions: self.transactions.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            syncs: self.syncs.load(Ordering::Relaxed),
            handle_opens: self.handle_opens.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushMetricsSnapshot {
    pub ticks: u64,
    pub transactions: u64,
    pub bytes_written: u64,
    pub errors: u64,
    pub syncs: u64,
    pub handle_opens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_events() {
        let metrics = FlushMetrics::new();
        metrics.record_tick();
        metrics.record_open();
        metrics.record_write(512);
        metrics.record_write(128);
        metrics.record_error();
        metrics.record_sync();

        assert_eq!(
            metrics.snapshot(),
            FlushMetricsSnapshot {
                ticks: 1,
                transactions: 2,
                bytes_written: 640,
                errors: 1,
                syncs: 1,
                handle_opens: 1,
            }
        );
    }
}
