// Progress Reporter: samples shared counters on a fixed interval and pushes
// snapshots to a bounded channel. Has no effect on control flow.

use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Point-in-time view of a running download.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub target_file: PathBuf,
    pub seconds_elapsed: f64,
    pub chunks_total: u64,
    /// Written plus buffered chunks
    pub chunks_downloaded: u64,
    pub chunks_written: u64,
    pub download_speed_kbps: f64,
    pub write_speed_kbps: f64,
    pub paused: bool,
    /// Active cap in KB/s, if any limit is enabled
    pub active_speed_limit: Option<u32>,
    /// Share of probed bandwidth while the variable limit is active
    pub target_percent: Option<u8>,
    /// A bandwidth probe window is currently open
    pub measuring: bool,
}

impl ProgressSnapshot {
    /// Average of download and write completion, in `0.0..=1.0`.
    pub fn fraction_done(&self) -> f64 {
        if self.chunks_total == 0 {
            return 1.0;
        }
        let total = self.chunks_total as f64;
        (self.chunks_downloaded as f64 / total + self.chunks_written as f64 / total) / 2.0
    }

    pub fn is_complete(&self) -> bool {
        self.chunks_written >= self.chunks_total
    }
}

/// Something that can produce a snapshot on demand.
pub trait SnapshotSource: Send + Sync {
    fn snapshot(&self) -> ProgressSnapshot;
}

/// Sends a snapshot without blocking; a lagging subscriber misses updates.
pub fn publish(sink: &mpsc::Sender<ProgressSnapshot>, snapshot: ProgressSnapshot) -> bool {
    match sink.try_send(snapshot) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            trace!("Progress subscriber lagging, snapshot dropped");
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

/// Reporting loop. Ends on shutdown or when the subscriber goes away.
pub async fn run_reporter<S: SnapshotSource + ?Sized>(
    source: &S,
    sink: mpsc::Sender<ProgressSnapshot>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if !publish(&sink, source.snapshot()) {
                    trace!("Progress subscriber closed, reporter stopping");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct Counter(AtomicU64);

    impl SnapshotSource for Counter {
        fn snapshot(&self) -> ProgressSnapshot {
            let written = self.0.fetch_add(1, Ordering::Relaxed);
            ProgressSnapshot {
                target_file: PathBuf::from("out.mp4"),
                seconds_elapsed: 0.0,
                chunks_total: 10,
                chunks_downloaded: written + 2,
                chunks_written: written,
                download_speed_kbps: 0.0,
                write_speed_kbps: 0.0,
                paused: false,
                active_speed_limit: None,
                target_percent: None,
                measuring: false,
            }
        }
    }

    #[test]
    fn fraction_done_averages_download_and_write() {
        let snapshot = Counter(AtomicU64::new(4)).snapshot();
        assert!((snapshot.fraction_done() - 0.5).abs() < 1e-9);
        assert!(!snapshot.is_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn reporter_emits_on_interval_until_shutdown() {
        let source = Counter(AtomicU64::new(0));
        let (tx, mut rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();

        let stop = shutdown.clone();
        let reporter = async move {
            run_reporter(&source, tx, Duration::from_millis(333), shutdown).await;
        };
        let stopper = async move {
            tokio::time::sleep(Duration::from_millis(1000)).await;
            stop.cancel();
        };
        tokio::join!(reporter, stopper);

        let mut seen = Vec::new();
        while let Ok(snapshot) = rx.try_recv() {
            seen.push(snapshot.chunks_written);
        }
        // ticks at 0, 333, 666 and 999 ms
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn reporter_stops_when_subscriber_drops() {
        let source = Counter(AtomicU64::new(0));
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let result = tokio::time::timeout(
            Duration::from_secs(1),
            run_reporter(&source, tx, Duration::from_millis(10), CancellationToken::new()),
        )
        .await;
        assert!(result.is_ok());
    }
}
