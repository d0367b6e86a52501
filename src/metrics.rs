use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sliding window of measurements with percentile queries
#[derive(Debug, Clone)]
pub struct PercentileTracker {
    measurements: Arc<Mutex<VecDeque<u64>>>,
    window_size: usize,
}

impl PercentileTracker {
    /// Keep the last `window_size` measurements
    pub fn new(window_size: usize) -> Self {
        Self {
            measurements: Arc::new(Mutex::new(VecDeque::with_capacity(window_size))),
            window_size,
        }
    }

    /// Record a measurement in nanoseconds
    pub fn record(&self, nanos: u64) {
        let mut measurements = self.measurements.lock();
        if measurements.len() >= self.window_size {
            measurements.pop_front();
        }
        measurements.push_back(nanos);
    }

    /// Median in microseconds
    pub fn p50_us(&self) -> f64 {
        self.percentile(0.50)
    }

    /// 99th percentile in microseconds
    pub fn p99_us(&self) -> f64 {
        self.percentile(0.99)
    }

    fn percentile(&self, p: f64) -> f64 {
        let measurements = self.measurements.lock();
        if measurements.is_empty() {
            return 0.0;
        }

        let mut sorted: Vec<_> = measurements.iter().copied().collect();
        sorted.sort_unstable();

        let idx = ((sorted.len() as f64 * p).ceil() as usize).saturating_sub(1);
        sorted[idx] as f64 / 1000.0
    }

    /// Measurements currently in the window
    pub fn count(&self) -> usize {
        self.measurements.lock().len()
    }
}

/// Per-stage counters, shared between the stage and whoever observes it
#[derive(Debug, Clone)]
pub struct LinkStats {
    new_data: Arc<AtomicU64>,
    received: Arc<AtomicU64>,
    forwarded: Arc<AtomicU64>,
    released: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    errors: Arc<AtomicU64>,
    cycle_latency: PercentileTracker,
    start_time: Instant,
}

impl LinkStats {
    /// Zeroed counters
    pub fn new() -> Self {
        Self {
            new_data: Arc::new(AtomicU64::new(0)),
            received: Arc::new(AtomicU64::new(0)),
            forwarded: Arc::new(AtomicU64::new(0)),
            released: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
            errors: Arc::new(AtomicU64::new(0)),
            cycle_latency: PercentileTracker::new(1000),
            start_time: Instant::now(),
        }
    }

    /// One NEW_DATA cycle finished after `elapsed`
    pub fn record_cycle(&self, elapsed: Duration) {
        self.new_data.fetch_add(1, Ordering::Relaxed);
        self.cycle_latency.record(elapsed.as_nanos() as u64);
    }

    /// Buffers pulled from a predecessor (or produced, for a source)
    pub fn record_received(&self, n: usize) {
        self.received.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Buffers made available to successors
    pub fn record_forwarded(&self, n: usize) {
        self.forwarded.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Buffers given back to their owner
    pub fn record_released(&self, n: usize) {
        self.released.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Buffers discarded because a queue was full
    pub fn record_dropped(&self, n: usize) {
        self.dropped.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Processing step that returned an error
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// NEW_DATA cycles handled
    pub fn new_data_cycles(&self) -> u64 {
        self.new_data.load(Ordering::Relaxed)
    }

    /// Buffers received
    pub fn total_received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Buffers forwarded
    pub fn total_forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Buffers released
    pub fn total_released(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }

    /// Buffers dropped
    pub fn total_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Processing errors
    pub fn total_errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Forwarded buffers per second since creation
    pub fn throughput_bps(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            0.0
        } else {
            self.total_forwarded() as f64 / elapsed
        }
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            new_data_cycles: self.new_data_cycles(),
            received: self.total_received(),
            forwarded: self.total_forwarded(),
            released: self.total_released(),
            dropped: self.total_dropped(),
            errors: self.total_errors(),
            throughput_bps: self.throughput_bps(),
            cycle_p50_us: self.cycle_latency.p50_us(),
            cycle_p99_us: self.cycle_latency.p99_us(),
            elapsed: self.start_time.elapsed(),
        }
    }
}

impl Default for LinkStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters of one stage at a point in time
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub new_data_cycles: u64,
    pub received: u64,
    pub forwarded: u64,
    pub released: u64,
    pub dropped: u64,
    pub errors: u64,
    pub throughput_bps: f64,
    pub cycle_p50_us: f64,
    pub cycle_p99_us: f64,
    pub elapsed: Duration,
}

impl StatsSnapshot {
    /// One-line human-readable summary
    pub fn format(&self) -> String {
        format!(
            "Cycles: {}, Received: {}, Forwarded: {}, Released: {}, Dropped: {}, Errors: {}, \
             Throughput: {:.2} buf/s, Cycle P50: {:.2}µs, P99: {:.2}µs, Elapsed: {:.2}s",
            self.new_data_cycles,
            self.received,
            self.forwarded,
            self.released,
            self.dropped,
            self.errors,
            self.throughput_bps,
            self.cycle_p50_us,
            self.cycle_p99_us,
            self.elapsed.as_secs_f64()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile_tracker_window() {
        let tracker = PercentileTracker::new(4);
        for i in 1..=8 {
            tracker.record(i * 1000);
        }
        assert_eq!(tracker.count(), 4);
        assert_eq!(tracker.p50_us(), 6.0);
        assert_eq!(tracker.p99_us(), 8.0);
    }

    #[test]
    fn test_stats_shared_between_clones() {
        let stats = LinkStats::new();
        let observer = stats.clone();
        stats.record_cycle(Duration::from_micros(5));
        stats.record_received(3);
        stats.record_forwarded(2);
        stats.record_dropped(1);
        stats.record_error();

        let snap = observer.snapshot();
        assert_eq!(snap.new_data_cycles, 1);
        assert_eq!(snap.received, 3);
        assert_eq!(snap.forwarded, 2);
        assert_eq!(snap.dropped, 1);
        assert_eq!(snap.errors, 1);
        assert!(snap.format().contains("Forwarded: 2"));
    }
}
