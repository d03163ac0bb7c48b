// Rate-Limited Fetcher: streams one chunk at a time through the pause and
// byte-allowance gates.

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::FetcherConfig;
use crate::error::DownloadError;
use crate::rate::TransferStats;
use crate::source::ChunkSource;

/// Consumable byte budget of one fetcher. `None` means unthrottled.
#[derive(Debug)]
pub struct Allowance {
    bytes: Mutex<Option<i64>>,
    granted: Notify,
    ceiling: i64,
}

impl Allowance {
    pub fn unlimited(ceiling: i64) -> Self {
        Self {
            bytes: Mutex::new(None),
            granted: Notify::new(),
            ceiling,
        }
    }

    /// Replaces the budget, `None` lifts the limit.
    pub fn set(&self, bytes: Option<i64>) {
        *self.bytes.lock() = bytes.map(|b| b.min(self.ceiling));
        self.granted.notify_waiters();
    }

    /// Adds to the budget, clamped to the saved-up ceiling.
    pub fn grant(&self, bytes: i64) {
        {
            let mut current = self.bytes.lock();
            *current = Some((current.unwrap_or(0) + bytes).min(self.ceiling));
        }
        self.granted.notify_waiters();
    }

    pub fn available(&self) -> Option<i64> {
        *self.bytes.lock()
    }

    pub fn consume(&self, bytes: i64) {
        if let Some(current) = self.bytes.lock().as_mut() {
            *current -= bytes;
        }
    }
}

/// Shared pause flag. Resuming wakes every blocked fetcher.
#[derive(Debug, Default)]
pub struct PauseGate {
    paused: AtomicBool,
    resumed: Notify,
}

impl PauseGate {
    pub fn pause(&self) -> Result<(), DownloadError> {
        if self.paused.swap(true, Ordering::AcqRel) {
            return Err(DownloadError::AlreadyPaused);
        }
        Ok(())
    }

    pub fn resume(&self) -> Result<(), DownloadError> {
        if !self.paused.swap(false, Ordering::AcqRel) {
            return Err(DownloadError::AlreadyResumed);
        }
        self.resumed.notify_waiters();
        Ok(())
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Blocks while paused. Returns `Aborted` if `abort` fires first.
    pub async fn wait_resumed(
        &self,
        abort: &CancellationToken,
        poll_interval: std::time::Duration,
    ) -> Result<(), DownloadError> {
        loop {
            let resumed = self.resumed.notified();
            tokio::pin!(resumed);
            resumed.as_mut().enable();

            if !self.is_paused() {
                return Ok(());
            }

            tokio::select! {
                _ = abort.cancelled() => return Err(DownloadError::Aborted),
                _ = &mut resumed => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }
}

pub struct RateLimitedFetcher {
    worker: usize,
    source: Arc<dyn ChunkSource>,
    allowance: Arc<Allowance>,
    pause: Arc<PauseGate>,
    stats: Arc<TransferStats>,
    config: FetcherConfig,
    abort: CancellationToken,
}

impl RateLimitedFetcher {
    pub fn new(
        worker: usize,
        source: Arc<dyn ChunkSource>,
        allowance: Arc<Allowance>,
        pause: Arc<PauseGate>,
        stats: Arc<TransferStats>,
        config: FetcherConfig,
        abort: CancellationToken,
    ) -> Self {
        Self {
            worker,
            source,
            allowance,
            pause,
            stats,
            config,
            abort,
        }
    }

    pub fn worker(&self) -> usize {
        self.worker
    }

    /// Downloads `url` into one owned buffer, reading at most
    /// `min(read_buffer_size, allowance)` bytes per step.
    pub async fn download(&self, url: &str) -> Result<Bytes, DownloadError> {
        debug!(worker = self.worker, url, "Requesting chunk");
        let mut body = self.source.open(url).await?;
        let mut content = BytesMut::new();
        let mut pending = Bytes::new();

        loop {
            if pending.is_empty() {
                match body.next().await {
                    Some(piece) => {
                        pending = piece?;
                        continue;
                    }
                    None => break,
                }
            }

            let budget = self.acquire().await?;
            let piece = pending.split_to(budget.min(pending.len()));
            self.allowance.consume(piece.len() as i64);
            self.stats.record_downloaded(piece.len() as u64);
            content.extend_from_slice(&piece);
        }

        trace!(
            worker = self.worker,
            url,
            bytes = content.len(),
            "Chunk body complete"
        );
        Ok(content.freeze())
    }

    /// Waits until the fetcher is neither paused nor out of allowance and
    /// returns how many bytes it may consume next.
    async fn acquire(&self) -> Result<usize, DownloadError> {
        let read_size = self.config.read_buffer_size.max(1);
        loop {
            let resumed = self.pause.resumed.notified();
            let granted = self.allowance.granted.notified();
            tokio::pin!(resumed, granted);
            resumed.as_mut().enable();
            granted.as_mut().enable();

            let paused = self.pause.is_paused();
            if !paused {
                match self.allowance.available() {
                    None => return Ok(read_size),
                    Some(bytes) if bytes > 0 => return Ok(read_size.min(bytes as usize)),
                    Some(_) => {}
                }
            }

            trace!(
                worker = self.worker,
                paused,
                "Waiting for resume or allowance"
            );
            tokio::select! {
                _ = self.abort.cancelled() => return Err(DownloadError::Aborted),
                _ = &mut resumed => {}
                _ = &mut granted => {}
                _ = tokio::time::sleep(self.config.gate_poll_interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::ChunkBody;
    use async_trait::async_trait;
    use std::time::Duration;

    struct StaticSource {
        pieces: Vec<Bytes>,
    }

    #[async_trait]
    impl ChunkSource for StaticSource {
        async fn open(&self, _url: &str) -> Result<ChunkBody, DownloadError> {
            let pieces: Vec<Result<Bytes, DownloadError>> =
                self.pieces.iter().cloned().map(Ok).collect();
            Ok(futures::stream::iter(pieces).boxed())
        }
    }

    fn fetcher_with(
        pieces: Vec<Bytes>,
        allowance: Arc<Allowance>,
        pause: Arc<PauseGate>,
        abort: CancellationToken,
    ) -> (RateLimitedFetcher, Arc<TransferStats>) {
        let stats = Arc::new(TransferStats::new(Duration::from_secs(20), 50));
        let config = FetcherConfig {
            read_buffer_size: 4,
            max_saved_allowance: 1024,
            gate_poll_interval: Duration::from_millis(10),
        };
        let fetcher = RateLimitedFetcher::new(
            0,
            Arc::new(StaticSource { pieces }),
            allowance,
            pause,
            Arc::clone(&stats),
            config,
            abort,
        );
        (fetcher, stats)
    }

    #[test]
    fn grants_are_clamped_to_ceiling() {
        let allowance = Allowance::unlimited(100);
        assert_eq!(allowance.available(), None);
        allowance.grant(60);
        allowance.grant(60);
        assert_eq!(allowance.available(), Some(100));
        allowance.consume(130);
        assert_eq!(allowance.available(), Some(-30));
        allowance.grant(10);
        assert_eq!(allowance.available(), Some(-20));
        allowance.set(None);
        allowance.consume(10);
        assert_eq!(allowance.available(), None);
    }

    #[test]
    fn pause_and_resume_reject_repeats() {
        let gate = PauseGate::default();
        assert!(matches!(gate.resume(), Err(DownloadError::AlreadyResumed)));
        gate.pause().unwrap();
        assert!(matches!(gate.pause(), Err(DownloadError::AlreadyPaused)));
        gate.resume().unwrap();
        assert!(!gate.is_paused());
    }

    #[tokio::test]
    async fn unthrottled_download_concatenates_pieces() {
        let pieces = vec![
            Bytes::from_static(b"hello "),
            Bytes::new(),
            Bytes::from_static(b"world"),
        ];
        let (fetcher, stats) = fetcher_with(
            pieces,
            Arc::new(Allowance::unlimited(1024)),
            Arc::new(PauseGate::default()),
            CancellationToken::new(),
        );
        let body = fetcher.download("memory://a").await.unwrap();
        assert_eq!(&body[..], b"hello world");
        assert_eq!(stats.total_downloaded(), 11);
    }

    #[tokio::test]
    async fn exhausted_allowance_blocks_until_granted() {
        let allowance = Arc::new(Allowance::unlimited(1024));
        allowance.set(Some(3));
        let (fetcher, stats) = fetcher_with(
            vec![Bytes::from_static(b"0123456789")],
            Arc::clone(&allowance),
            Arc::new(PauseGate::default()),
            CancellationToken::new(),
        );

        let task = tokio::spawn(async move { fetcher.download("memory://a").await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(stats.total_downloaded(), 3);
        assert!(!task.is_finished());

        allowance.grant(100);
        let body = task.await.unwrap().unwrap();
        assert_eq!(&body[..], b"0123456789");
        assert_eq!(allowance.available(), Some(93));
    }

    #[tokio::test]
    async fn paused_fetcher_reads_nothing_until_resumed() {
        let pause = Arc::new(PauseGate::default());
        pause.pause().unwrap();
        let (fetcher, stats) = fetcher_with(
            vec![Bytes::from_static(b"abcdef")],
            Arc::new(Allowance::unlimited(1024)),
            Arc::clone(&pause),
            CancellationToken::new(),
        );

        let task = tokio::spawn(async move { fetcher.download("memory://a").await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(stats.total_downloaded(), 0);

        pause.resume().unwrap();
        assert_eq!(&task.await.unwrap().unwrap()[..], b"abcdef");
    }

    #[tokio::test]
    async fn abort_releases_a_blocked_fetcher() {
        let pause = Arc::new(PauseGate::default());
        pause.pause().unwrap();
        let abort = CancellationToken::new();
        let (fetcher, _) = fetcher_with(
            vec![Bytes::from_static(b"abcdef")],
            Arc::new(Allowance::unlimited(1024)),
            pause,
            abort.clone(),
        );

        let task = tokio::spawn(async move { fetcher.download("memory://a").await });
        abort.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(DownloadError::Aborted)));
    }
}
