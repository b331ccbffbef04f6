//! Lock-free pool metrics (spec §3).

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

/// Atomic counters for the worker pool. All updates are lock-free.
#[derive(Debug, Default)]
pub struct Metrics {
    processed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    retried: AtomicU64,
    queue_size: AtomicU32,
    priority_queue_size: AtomicU32,
    /// Exponentially smoothed average processing time, in milliseconds,
    /// stored as a fixed-point integer (scaled by 1000) so it can live in an
    /// atomic without a lock. `new = (9*old + sample)/10`.
    avg_processing_ms_x1000: AtomicI64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSnapshot {
    pub processed: u64,
    pub failed: u64,
    pub dropped: u64,
    pub retried: u64,
    pub queue_size: u32,
    pub priority_queue_size: u32,
    pub avg_processing_ms: f64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_processed(&self, duration_ms: u64) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.update_avg(duration_ms);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_queue_size(&self) {
        self.queue_size.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decr_queue_size(&self) {
        self.queue_size.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn incr_priority_queue_size(&self) {
        self.priority_queue_size.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decr_priority_queue_size(&self) {
        self.priority_queue_size.fetch_sub(1, Ordering::Relaxed);
    }

    fn update_avg(&self, sample_ms: u64) {
        let sample = (sample_ms as i64) * 1000;
        let _ = self
            .avg_processing_ms_x1000
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |old| {
                Some((9 * old + sample) / 10)
            });
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            queue_size: self.queue_size.load(Ordering::Relaxed),
            priority_queue_size: self.priority_queue_size.load(Ordering::Relaxed),
            avg_processing_ms: self.avg_processing_ms_x1000.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_converges_toward_sample() {
        let m = Metrics::new();
        for _ in 0..200 {
            m.record_processed(100);
        }
        let snap = m.snapshot();
        assert!((snap.avg_processing_ms - 100.0).abs() < 0.5);
        assert_eq!(snap.processed, 200);
    }

    #[test]
    fn counters_are_independent() {
        let m = Metrics::new();
        m.record_failed();
        m.record_dropped();
        m.record_retried();
        let snap = m.snapshot();
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.dropped, 1);
        assert_eq!(snap.retried, 1);
        assert_eq!(snap.processed, 0);
    }

    #[test]
    fn queue_size_tracks_incr_decr() {
        let m = Metrics::new();
        m.incr_queue_size();
        m.incr_queue_size();
        m.decr_queue_size();
        assert_eq!(m.snapshot().queue_size, 1);
    }
}
