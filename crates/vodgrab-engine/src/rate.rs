// Byte-rate sampling: trailing-window throughput counters for progress reports
// and bandwidth probing. Never used to gate correctness.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

const BUCKET_WIDTH: Duration = Duration::from_millis(100);

/// Time-bucketed byte accumulator. Old buckets are pruned when read.
#[derive(Debug)]
pub struct RateSampler {
    window: Duration,
    buckets: Mutex<VecDeque<(Instant, u64)>>,
}

impl RateSampler {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            buckets: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record(&self, bytes: u64) {
        self.record_at(Instant::now(), bytes);
    }

    pub fn record_at(&self, at: Instant, bytes: u64) {
        let mut buckets = self.buckets.lock();
        match buckets.back_mut() {
            Some((start, total)) if at.saturating_duration_since(*start) < BUCKET_WIDTH => {
                *total += bytes;
            }
            _ => buckets.push_back((at, bytes)),
        }
    }

    /// Bytes recorded within the window ending at `now`.
    pub fn total_within(&self, now: Instant) -> u64 {
        let mut buckets = self.buckets.lock();
        while let Some((start, _)) = buckets.front() {
            if now.saturating_duration_since(*start) > self.window {
                buckets.pop_front();
            } else {
                break;
            }
        }
        buckets.iter().map(|(_, bytes)| bytes).sum()
    }

    /// Average KB/s over the window, or over `elapsed` while the transfer is
    /// younger than the window.
    pub fn kbps(&self, now: Instant, elapsed: Duration) -> f64 {
        let span = elapsed.min(self.window).as_secs_f64();
        if span <= f64::EPSILON {
            return 0.0;
        }
        self.total_within(now) as f64 / 1024.0 / span
    }
}

/// Shared transfer counters fed by fetchers and the writer.
#[derive(Debug)]
pub struct TransferStats {
    started: Mutex<Instant>,
    downloaded: RateSampler,
    written: RateSampler,
    total_downloaded: AtomicU64,
    total_written: AtomicU64,
    probe_active: AtomicBool,
    probe_bytes: AtomicU64,
    chunk_sizes: Mutex<VecDeque<u64>>,
    chunk_size_samples: usize,
}

impl TransferStats {
    pub fn new(averaging_window: Duration, chunk_size_samples: usize) -> Self {
        Self {
            started: Mutex::new(Instant::now()),
            downloaded: RateSampler::new(averaging_window),
            written: RateSampler::new(averaging_window),
            total_downloaded: AtomicU64::new(0),
            total_written: AtomicU64::new(0),
            probe_active: AtomicBool::new(false),
            probe_bytes: AtomicU64::new(0),
            chunk_sizes: Mutex::new(VecDeque::with_capacity(chunk_size_samples)),
            chunk_size_samples: chunk_size_samples.max(1),
        }
    }

    pub fn restart_clock(&self) {
        *self.started.lock() = Instant::now();
    }

    pub fn elapsed(&self) -> Duration {
        self.started.lock().elapsed()
    }

    pub fn record_downloaded(&self, bytes: u64) {
        self.downloaded.record(bytes);
        self.total_downloaded.fetch_add(bytes, Ordering::Relaxed);
        if self.probe_active.load(Ordering::Acquire) {
            self.probe_bytes.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    pub fn record_written(&self, bytes: u64) {
        self.written.record(bytes);
        self.total_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_chunk_size(&self, bytes: u64) {
        let mut sizes = self.chunk_sizes.lock();
        sizes.push_back(bytes);
        while sizes.len() > self.chunk_size_samples {
            sizes.pop_front();
        }
    }

    /// Mean size of the most recent chunks, 0 before the first completes.
    pub fn average_chunk_size(&self) -> f64 {
        let sizes = self.chunk_sizes.lock();
        if sizes.is_empty() {
            return 0.0;
        }
        sizes.iter().sum::<u64>() as f64 / sizes.len() as f64
    }

    pub fn begin_probe(&self) {
        self.probe_bytes.store(0, Ordering::Relaxed);
        self.probe_active.store(true, Ordering::Release);
    }

    /// Ends the probe window and returns the bytes seen during it.
    pub fn finish_probe(&self) -> u64 {
        self.probe_active.store(false, Ordering::Release);
        self.probe_bytes.swap(0, Ordering::Relaxed)
    }

    pub fn is_probing(&self) -> bool {
        self.probe_active.load(Ordering::Acquire)
    }

    /// Trailing `(download, write)` speeds in KB/s.
    pub fn speeds(&self) -> (f64, f64) {
        let now = Instant::now();
        let elapsed = self.elapsed();
        (
            self.downloaded.kbps(now, elapsed),
            self.written.kbps(now, elapsed),
        )
    }

    pub fn total_downloaded(&self) -> u64 {
        self.total_downloaded.load(Ordering::Relaxed)
    }

    pub fn total_written(&self) -> u64 {
        self.total_written.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn samples_outside_window_are_pruned() {
        let sampler = RateSampler::new(Duration::from_secs(20));
        let t0 = Instant::now();
        sampler.record_at(t0, 1000);
        sampler.record_at(t0 + Duration::from_secs(10), 500);

        assert_eq!(sampler.total_within(t0 + Duration::from_secs(15)), 1500);
        assert_eq!(sampler.total_within(t0 + Duration::from_secs(25)), 500);
        assert_eq!(sampler.total_within(t0 + Duration::from_secs(40)), 0);
    }

    #[test]
    fn young_transfers_average_over_elapsed_time() {
        let sampler = RateSampler::new(Duration::from_secs(20));
        let t0 = Instant::now();
        sampler.record_at(t0, 2048);
        let rate = sampler.kbps(t0 + Duration::from_millis(50), Duration::from_secs(2));
        assert!((rate - 1.0).abs() < 1e-9);
        assert_eq!(sampler.kbps(t0, Duration::ZERO), 0.0);
    }

    #[test]
    fn probe_counts_only_while_active() {
        let stats = TransferStats::new(Duration::from_secs(20), 50);
        stats.record_downloaded(100);
        stats.begin_probe();
        stats.record_downloaded(300);
        assert!(stats.is_probing());
        assert_eq!(stats.finish_probe(), 300);
        stats.record_downloaded(50);
        assert_eq!(stats.finish_probe(), 0);
        assert_eq!(stats.total_downloaded(), 450);
    }

    #[test]
    fn chunk_size_average_is_bounded_to_recent_samples() {
        let stats = TransferStats::new(Duration::from_secs(20), 2);
        assert_eq!(stats.average_chunk_size(), 0.0);
        stats.record_chunk_size(10);
        stats.record_chunk_size(20);
        stats.record_chunk_size(40);
        assert_eq!(stats.average_chunk_size(), 30.0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Every recorded byte is counted exactly once while inside the window.
        #[test]
        fn prop_total_matches_recorded_bytes(
            samples in prop::collection::vec((0u64..5_000, 1u64..1_000_000), 1..64),
        ) {
            let sampler = RateSampler::new(Duration::from_secs(3600));
            let t0 = Instant::now();
            let mut offset = 0u64;
            let mut expected = 0u64;
            for (step_ms, bytes) in &samples {
                offset += step_ms;
                sampler.record_at(t0 + Duration::from_millis(offset), *bytes);
                expected += bytes;
            }
            let now = t0 + Duration::from_millis(offset);
            prop_assert_eq!(sampler.total_within(now), expected);
        }
    }
}
