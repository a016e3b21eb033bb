//! Metrics for distribution queue observability.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    value: AtomicU64,
}

impl Counter {
    /// Create a new counter.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            value: AtomicU64::new(0),
        }
    }

    /// Get the counter name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Increment the counter by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the counter by a specific amount.
    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Get the current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A gauge that can increase or decrease.
#[derive(Debug)]
pub struct Gauge {
    name: &'static str,
    value: AtomicI64,
}

impl Gauge {
    /// Create a new gauge.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            value: AtomicI64::new(0),
        }
    }

    /// Get the gauge name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Set the gauge to a specific value.
    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    /// Increment the gauge by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement the gauge by 1.
    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    /// Add to the gauge.
    pub fn add(&self, n: i64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Get the current value.
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Metrics for the distribution queue.
#[derive(Debug)]
pub struct QueueMetrics {
    /// Moves currently queued (fetching sources or awaiting launch).
    pub relocations_queued: Gauge,
    /// Moves currently in flight.
    pub relocations_active: Gauge,
    /// Moves at an unhealthy-team priority, queued or in flight.
    pub relocations_unhealthy: Gauge,
    /// Relocations handed to a relocator.
    pub relocations_started: Counter,
    /// Relocations finished successfully.
    pub relocations_completed: Counter,
    /// Relocations that ended in an error.
    pub relocations_errored: Counter,
    /// Bytes written by completed moves.
    pub bytes_written: Counter,
    /// Background rebalance moves emitted.
    pub rebalance_moves_emitted: Counter,
    /// Data-move cancellations processed.
    pub data_moves_cancelled: Counter,
}

impl QueueMetrics {
    /// Create queue metrics.
    pub fn new() -> Self {
        Self {
            relocations_queued: Gauge::new("ddq_relocations_queued"),
            relocations_active: Gauge::new("ddq_relocations_active"),
            relocations_unhealthy: Gauge::new("ddq_relocations_unhealthy"),
            relocations_started: Counter::new("ddq_relocations_started"),
            relocations_completed: Counter::new("ddq_relocations_completed"),
            relocations_errored: Counter::new("ddq_relocations_errored"),
            bytes_written: Counter::new("ddq_bytes_written"),
            rebalance_moves_emitted: Counter::new("ddq_rebalance_moves_emitted"),
            data_moves_cancelled: Counter::new("ddq_data_moves_cancelled"),
        }
    }

    /// Point-in-time snapshot.
    pub fn snapshot(&self) -> QueueMetricsSnapshot {
        QueueMetricsSnapshot {
            queued: self.relocations_queued.get(),
            active: self.relocations_active.get(),
            unhealthy: self.relocations_unhealthy.get(),
            started: self.relocations_started.get(),
            completed: self.relocations_completed.get(),
            errored: self.relocations_errored.get(),
            bytes_written: self.bytes_written.get(),
            rebalance_moves_emitted: self.rebalance_moves_emitted.get(),
            data_moves_cancelled: self.data_moves_cancelled.get(),
        }
    }
}

/// Snapshot of queue metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMetricsSnapshot {
    /// Moves currently queued.
    pub queued: i64,
    /// Moves currently in flight.
    pub active: i64,
    /// Unhealthy-priority moves, queued or in flight.
    pub unhealthy: i64,
    /// Relocations handed to a relocator.
    pub started: u64,
    /// Relocations finished successfully.
    pub completed: u64,
    /// Relocations that ended in an error.
    pub errored: u64,
    /// Bytes written by completed moves.
    pub bytes_written: u64,
    /// Background rebalance moves emitted.
    pub rebalance_moves_emitted: u64,
    /// Data-move cancellations processed.
    pub data_moves_cancelled: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new("test_counter");
        assert_eq!(counter.get(), 0);
        counter.inc();
        counter.inc_by(5);
        assert_eq!(counter.get(), 6);
        assert_eq!(counter.name(), "test_counter");
    }

    #[test]
    fn test_gauge() {
        let gauge = Gauge::new("test_gauge");
        gauge.inc();
        gauge.inc();
        gauge.dec();
        assert_eq!(gauge.get(), 1);
        gauge.add(10);
        assert_eq!(gauge.get(), 11);
        gauge.set(-3);
        assert_eq!(gauge.get(), -3);
    }

    #[test]
    fn test_queue_metrics_snapshot() {
        let metrics = QueueMetrics::new();
        metrics.relocations_queued.inc();
        metrics.relocations_started.inc();
        metrics.bytes_written.inc_by(1024);

        let snap = metrics.snapshot();
        assert_eq!(snap.queued, 1);
        assert_eq!(snap.started, 1);
        assert_eq!(snap.bytes_written, 1024);
        assert_eq!(snap.completed, 0);
    }
}
