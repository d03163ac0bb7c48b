#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::StatusCode;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use vodgrab_engine::{
    BackpressureLadder, ChunkBody, ChunkSink, ChunkSource, DownloadError, EngineConfig,
    RetryPolicy,
};

/// In-memory transport with scripted failures and per-URL latency.
#[derive(Default)]
pub struct MemorySource {
    bodies: HashMap<String, Bytes>,
    failures: Mutex<HashMap<String, VecDeque<StatusCode>>>,
    delays: HashMap<String, Duration>,
    requests: Mutex<HashMap<String, u32>>,
    piece_size: usize,
}

impl MemorySource {
    pub fn new(piece_size: usize) -> Self {
        Self {
            piece_size: piece_size.max(1),
            ..Default::default()
        }
    }

    pub fn with_body(mut self, url: &str, body: Bytes) -> Self {
        self.bodies.insert(url.to_string(), body);
        self
    }

    /// Fails the next `times` requests for `url` with `status`.
    pub fn failing(self, url: &str, status: StatusCode, times: usize) -> Self {
        self.failures
            .lock()
            .entry(url.to_string())
            .or_default()
            .extend(std::iter::repeat_n(status, times));
        self
    }

    pub fn delayed(mut self, url: &str, delay: Duration) -> Self {
        self.delays.insert(url.to_string(), delay);
        self
    }

    pub fn requests(&self, url: &str) -> u32 {
        self.requests.lock().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ChunkSource for MemorySource {
    async fn open(&self, url: &str) -> Result<ChunkBody, DownloadError> {
        *self.requests.lock().entry(url.to_string()).or_default() += 1;

        if let Some(delay) = self.delays.get(url) {
            tokio::time::sleep(*delay).await;
        }
        let failure = self
            .failures
            .lock()
            .get_mut(url)
            .and_then(VecDeque::pop_front);
        if let Some(status) = failure {
            return Err(DownloadError::from_status(status, url));
        }

        let body = self
            .bodies
            .get(url)
            .cloned()
            .ok_or_else(|| DownloadError::from_status(StatusCode::NOT_FOUND, url))?;
        let pieces: Vec<Result<Bytes, DownloadError>> = body
            .chunks(self.piece_size)
            .map(|piece| Ok(Bytes::copy_from_slice(piece)))
            .collect();
        Ok(futures::stream::iter(pieces).boxed())
    }
}

/// Sink that keeps every write for inspection.
#[derive(Clone, Default)]
pub struct MemorySink {
    pub writes: Arc<Mutex<Vec<(u64, Bytes)>>>,
}

impl MemorySink {
    pub fn indexes(&self) -> Vec<u64> {
        self.writes.lock().iter().map(|(i, _)| *i).collect()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.writes
            .lock()
            .iter()
            .flat_map(|(_, b)| b.iter().copied())
            .collect()
    }
}

#[async_trait]
impl ChunkSink for MemorySink {
    async fn write_chunk(&mut self, index: u64, content: Bytes) -> Result<(), DownloadError> {
        self.writes.lock().push((index, content));
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), DownloadError> {
        Ok(())
    }
}

pub fn chunk_url(group: usize, index: usize) -> String {
    format!("memory://vod/{group}/{index}.ts")
}

pub fn chunk_body(group: usize, index: usize, len: usize) -> Bytes {
    let fill = (group * 31 + index) as u8;
    let mut body = format!("[{group}:{index}]").into_bytes();
    body.resize(len.max(body.len()), fill);
    Bytes::from(body)
}

/// Groups of the given sizes plus a source serving all of them.
pub fn fixture(sizes: &[usize], body_len: usize) -> (Vec<Vec<String>>, MemorySource) {
    let mut source = MemorySource::new(1024);
    let mut groups = Vec::new();
    for (group, size) in sizes.iter().enumerate() {
        let mut urls = Vec::new();
        for index in 0..*size {
            let url = chunk_url(group, index);
            source = source.with_body(&url, chunk_body(group, index, body_len));
            urls.push(url);
        }
        groups.push(urls);
    }
    (groups, source)
}

pub fn expected_group(group: usize, size: usize, body_len: usize) -> Vec<u8> {
    (0..size)
        .flat_map(|i| chunk_body(group, i, body_len).to_vec())
        .collect()
}

/// Millisecond-scale timings for tests.
pub fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.retry = RetryPolicy {
        max_retries: 5,
        delay: Duration::from_millis(10),
    };
    config.backpressure = BackpressureLadder::new(vec![
        (4.0, Duration::from_millis(40)),
        (2.0, Duration::from_millis(10)),
    ]);
    config.fetcher.gate_poll_interval = Duration::from_millis(10);
    config.progress.interval = Duration::from_millis(20);
    config
}
