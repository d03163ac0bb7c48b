// Download Orchestrator: seeds the backlog, runs the fetcher pool and the
// timer tasks, and reassembles finished chunks into the output files.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::chunk::{Chunk, parted_path, seed_backlog};
use crate::command::{DownloadController, DownloaderCommand, run_commands};
use crate::config::{DEFAULT_THREAD_COUNT, EngineConfig};
use crate::error::DownloadError;
use crate::fetcher::{Allowance, PauseGate, RateLimitedFetcher};
use crate::progress::{ProgressSnapshot, SnapshotSource, publish, run_reporter};
use crate::rate::TransferStats;
use crate::reassembly::{ChunkSink, DrainGate, FileSink, Reassembly};
use crate::retry::{RetryAction, retry_fixed};
use crate::source::{ChunkSource, HttpChunkSource};
use crate::throttle::{SpeedLimit, Throttle};

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Number of parallel fetchers
    pub thread_count: usize,
    /// Start with a fixed speed limit in KB/s
    pub target_kbps: Option<u32>,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            thread_count: DEFAULT_THREAD_COUNT,
            target_kbps: None,
        }
    }
}

/// Outcome of a completed download.
#[derive(Debug, Clone)]
pub struct DownloadSummary {
    pub chunks: u64,
    pub bytes_written: u64,
    pub files: Vec<PathBuf>,
    pub elapsed: Duration,
    /// Largest number of chunks held in the reassembly buffer at once
    pub peak_buffered: usize,
}

/// Control state that exists before `start` so a controller can be handed out
/// early.
struct Control {
    pause: Arc<PauseGate>,
    allowances: Vec<Arc<Allowance>>,
    stats: Arc<TransferStats>,
    throttle: Arc<Throttle>,
}

impl Control {
    fn new(thread_count: usize, config: &EngineConfig) -> Self {
        let allowances: Vec<_> = (0..thread_count.max(1))
            .map(|_| Arc::new(Allowance::unlimited(config.fetcher.max_saved_allowance)))
            .collect();
        let stats = Arc::new(TransferStats::new(
            config.progress.averaging_window,
            config.speed_limit.chunk_size_samples,
        ));
        let throttle = Arc::new(Throttle::new(
            config.speed_limit.clone(),
            allowances.clone(),
            Arc::clone(&stats),
        ));
        Self {
            pause: Arc::new(PauseGate::default()),
            allowances,
            stats,
            throttle,
        }
    }
}

/// Single-use engine that downloads ordered chunk groups into files.
pub struct ChunkedDownloader {
    groups: Vec<Vec<String>>,
    target_path: PathBuf,
    options: DownloadOptions,
    config: EngineConfig,
    control: Control,
    source: Option<Arc<dyn ChunkSource>>,
    sinks: Mutex<Option<Vec<Box<dyn ChunkSink>>>>,
    commands: Mutex<Option<mpsc::Receiver<DownloaderCommand>>>,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl ChunkedDownloader {
    pub fn new(
        groups: Vec<Vec<String>>,
        target_path: impl Into<PathBuf>,
        options: DownloadOptions,
    ) -> Self {
        let config = EngineConfig::default();
        let control = Control::new(options.thread_count, &config);
        Self {
            groups,
            target_path: target_path.into(),
            options,
            config,
            control,
            source: None,
            sinks: Mutex::new(None),
            commands: Mutex::new(None),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Replaces the engine configuration. Controllers handed out before this
    /// call are detached from the download.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.control = Control::new(self.options.thread_count, &config);
        self.config = config;
        self
    }

    /// Overrides the HTTP transport.
    pub fn with_source(mut self, source: Arc<dyn ChunkSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Overrides the output files, one sink per group in group order.
    pub fn with_sinks(self, sinks: Vec<Box<dyn ChunkSink>>) -> Self {
        *self.sinks.lock() = Some(sinks);
        self
    }

    /// Commands received here are applied while the download runs.
    pub fn with_commands(self, commands: mpsc::Receiver<DownloaderCommand>) -> Self {
        *self.commands.lock() = Some(commands);
        self
    }

    /// Cancelling `token` stops the fetchers, closes the outputs and makes
    /// `start` return `Aborted`.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn controller(&self) -> DownloadController {
        DownloadController::new(
            Arc::clone(&self.control.pause),
            Arc::clone(&self.control.throttle),
            &self.config.speed_limit,
        )
    }

    /// Output path of every group.
    pub fn output_files(&self) -> Vec<PathBuf> {
        let count = self.groups.len();
        (0..count)
            .map(|i| parted_path(&self.target_path, i, count))
            .collect()
    }

    /// Runs the download to completion or to the first unrecoverable error.
    /// Partial output is left on disk after a failure.
    pub async fn start(
        &self,
        progress: Option<mpsc::Sender<ProgressSnapshot>>,
    ) -> Result<DownloadSummary, DownloadError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(DownloadError::AlreadyStarted);
        }
        if self.options.thread_count == 0 {
            return Err(DownloadError::invalid_request("thread count must be at least 1"));
        }

        let backlog = seed_backlog(&self.groups);
        let total = backlog.len() as u64;
        if total == 0 {
            return Err(DownloadError::invalid_request("no chunks to download"));
        }

        let files = self.output_files();
        let provided = self.sinks.lock().take();
        let sinks = match provided {
            Some(sinks) if sinks.len() == self.groups.len() => sinks,
            Some(sinks) => {
                return Err(DownloadError::invalid_request(format!(
                    "{} sinks given for {} groups",
                    sinks.len(),
                    self.groups.len()
                )));
            }
            None => {
                let mut sinks: Vec<Box<dyn ChunkSink>> = Vec::with_capacity(files.len());
                for path in &files {
                    sinks.push(Box::new(FileSink::create(path).await?));
                }
                sinks
            }
        };
        let source = match &self.source {
            Some(source) => Arc::clone(source),
            None => Arc::new(HttpChunkSource::from_config(&self.config.http)?),
        };

        let pool_size = self.options.thread_count;
        info!(
            chunks = total,
            files = files.len(),
            workers = pool_size,
            target = %self.target_path.display(),
            "Starting chunked download"
        );

        self.control.stats.restart_clock();
        if let Some(kbps) = self.options.target_kbps {
            self.control.throttle.enable_fixed(kbps);
        }

        let shared = Arc::new(Shared {
            backlog: Mutex::new(backlog),
            reassembly: tokio::sync::Mutex::new(Reassembly::new(total, sinks)),
            pause: Arc::clone(&self.control.pause),
            stats: Arc::clone(&self.control.stats),
            throttle: Arc::clone(&self.control.throttle),
            config: self.config.clone(),
            abort: self.cancel.child_token(),
            completed: CancellationToken::new(),
            failure: Mutex::new(None),
            written: AtomicU64::new(0),
            buffered: AtomicU64::new(0),
            total,
            pool_size,
            target_file: self.target_path.clone(),
        });

        let shutdown = CancellationToken::new();
        let mut background = JoinSet::new();
        background.spawn(Arc::clone(&shared.throttle).run_rotation(shutdown.clone()));
        background.spawn(Arc::clone(&shared.throttle).run_probe(shutdown.clone()));
        if let Some(sink) = progress.clone() {
            let shared = Arc::clone(&shared);
            let interval = self.config.progress.interval;
            let shutdown = shutdown.clone();
            background.spawn(async move {
                run_reporter(shared.as_ref(), sink, interval, shutdown).await;
            });
        }
        if let Some(commands) = self.commands.lock().take() {
            background.spawn(run_commands(self.controller(), commands, shutdown.clone()));
        }

        let mut workers = JoinSet::new();
        for worker in 0..pool_size {
            let fetcher = RateLimitedFetcher::new(
                worker,
                Arc::clone(&source),
                Arc::clone(&self.control.allowances[worker]),
                Arc::clone(&shared.pause),
                Arc::clone(&shared.stats),
                self.config.fetcher.clone(),
                shared.abort.clone(),
            );
            workers.spawn(run_worker(Arc::clone(&shared), fetcher));
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                shared.fail(DownloadError::internal(format!("fetcher task died: {e}")));
            }
        }
        debug!("All fetchers stopped");

        shutdown.cancel();
        while background.join_next().await.is_some() {}

        if let Some(sink) = &progress {
            publish(sink, shared.snapshot());
        }

        let mut reassembly = shared.reassembly.lock().await;
        let closed = reassembly.finish().await;

        if let Some(err) = shared.failure.lock().take() {
            error!(error = %err, written = reassembly.written(), total, "Download aborted");
            return Err(err);
        }
        closed?;
        if !reassembly.is_finished() && self.cancel.is_cancelled() {
            info!(written = reassembly.written(), total, "Download cancelled");
            return Err(DownloadError::Aborted);
        }
        if !reassembly.is_finished() {
            return Err(DownloadError::internal(format!(
                "fetchers exited with {} of {total} chunks written",
                reassembly.written()
            )));
        }

        let summary = DownloadSummary {
            chunks: total,
            bytes_written: reassembly.bytes_written(),
            files,
            elapsed: shared.stats.elapsed(),
            peak_buffered: reassembly.peak_buffered(),
        };
        info!(
            chunks = summary.chunks,
            bytes = summary.bytes_written,
            elapsed_secs = summary.elapsed.as_secs_f64(),
            "Download finished"
        );
        Ok(summary)
    }
}

/// State shared by the fetcher pool and the timer tasks of one run.
struct Shared {
    backlog: Mutex<VecDeque<Chunk>>,
    /// Insert, cursor check and drain all happen under this lock
    reassembly: tokio::sync::Mutex<Reassembly>,
    pause: Arc<PauseGate>,
    stats: Arc<TransferStats>,
    throttle: Arc<Throttle>,
    config: EngineConfig,
    /// Cancelled on the first unrecoverable error
    abort: CancellationToken,
    /// Cancelled once the cursor passes the last chunk
    completed: CancellationToken,
    failure: Mutex<Option<DownloadError>>,
    written: AtomicU64,
    buffered: AtomicU64,
    total: u64,
    pool_size: usize,
    target_file: PathBuf,
}

impl Shared {
    /// Records the first error and stops the pool. Later errors are dropped.
    fn fail(&self, err: DownloadError) {
        if matches!(err, DownloadError::Aborted) {
            return;
        }
        {
            let mut failure = self.failure.lock();
            if failure.is_some() {
                debug!(error = %err, "Ignoring error after abort");
                return;
            }
            error!(error = %err, "Unrecoverable error, stopping all fetchers");
            *failure = Some(err);
        }
        self.abort.cancel();
    }

    fn drain_gate(&self) -> DrainGate<'_> {
        DrainGate {
            pause: &self.pause,
            abort: &self.abort,
            poll_interval: self.config.fetcher.gate_poll_interval,
            stats: &self.stats,
        }
    }

    /// Sleeps a fetcher that finished ahead of the write cursor.
    async fn backpressure(&self, worker: usize, buffered: usize) {
        let Some(delay) = self
            .config
            .backpressure
            .delay_for(buffered, self.pool_size)
        else {
            return;
        };
        debug!(
            worker,
            buffered,
            delay_ms = delay.as_millis() as u64,
            "Reassembly buffer growing, throttling fetcher"
        );
        tokio::select! {
            _ = self.abort.cancelled() => {}
            _ = self.completed.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

impl SnapshotSource for Shared {
    fn snapshot(&self) -> ProgressSnapshot {
        let (download_speed_kbps, write_speed_kbps) = self.stats.speeds();
        let written = self.written.load(Ordering::Relaxed);
        let buffered = self.buffered.load(Ordering::Relaxed);
        let (active_speed_limit, target_percent) = match self.throttle.speed_limit() {
            SpeedLimit::None => (None, None),
            SpeedLimit::Fixed { kbps } => (Some(kbps), None),
            SpeedLimit::Variable { percent, kbps } => (Some(kbps), Some(percent)),
        };
        ProgressSnapshot {
            target_file: self.target_file.clone(),
            seconds_elapsed: self.stats.elapsed().as_secs_f64(),
            chunks_total: self.total,
            chunks_downloaded: written + buffered,
            chunks_written: written,
            download_speed_kbps,
            write_speed_kbps,
            paused: self.pause.is_paused(),
            active_speed_limit,
            target_percent,
            measuring: self.throttle.is_measuring(),
        }
    }
}

async fn run_worker(shared: Arc<Shared>, fetcher: RateLimitedFetcher) {
    if let Err(e) = fetch_loop(&shared, &fetcher).await {
        shared.fail(e);
    }
}

/// Pops chunks until the backlog is empty or the pool is aborted.
async fn fetch_loop(shared: &Shared, fetcher: &RateLimitedFetcher) -> Result<(), DownloadError> {
    let worker = fetcher.worker();
    loop {
        if shared.abort.is_cancelled() {
            trace!(worker, "Abort observed, fetcher exiting");
            return Ok(());
        }
        let Some(mut chunk) = shared.backlog.lock().pop_front() else {
            trace!(worker, "Backlog empty, fetcher exiting");
            return Ok(());
        };

        let index = chunk.sequence_index;
        let url = chunk.url.clone();
        let fetched = retry_fixed(&shared.config.retry, &shared.abort, index, &url, |attempt| {
            let url = url.as_str();
            async move {
                if attempt > 0 {
                    debug!(worker, chunk = index, attempt, "Retrying chunk");
                }
                RetryAction::from(fetcher.download(url).await)
            }
        })
        .await;

        let content = match fetched {
            Ok(content) => content,
            Err(DownloadError::Aborted) => return Ok(()),
            Err(e) => return Err(e),
        };
        shared.stats.record_chunk_size(content.len() as u64);
        chunk.content = Some(content);

        let completion = {
            let mut reassembly = shared.reassembly.lock().await;
            let result = reassembly.complete(chunk, &shared.drain_gate()).await;
            shared.written.store(reassembly.written(), Ordering::Relaxed);
            shared
                .buffered
                .store(reassembly.buffered() as u64, Ordering::Relaxed);
            result
        };

        match completion {
            Ok(completion) if completion.finished => {
                info!(chunks = shared.total, "All chunks written");
                shared.completed.cancel();
            }
            Ok(completion) if completion.drained == 0 => {
                shared.backpressure(worker, completion.buffered).await;
            }
            Ok(_) => {}
            Err(DownloadError::Aborted) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}
