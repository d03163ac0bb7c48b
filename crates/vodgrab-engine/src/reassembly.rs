// Reassembly Buffer: holds chunks that finished ahead of the write cursor and
// flushes contiguous runs to the per-group output sinks.
//
// The whole insert + cursor check + drain sequence runs while the caller holds
// one lock around `Reassembly`, so a chunk is written at most once and every
// sink sees strictly increasing sequence indexes.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::chunk::Chunk;
use crate::error::DownloadError;
use crate::fetcher::PauseGate;
use crate::rate::TransferStats;

/// Destination of one output group.
#[async_trait]
pub trait ChunkSink: Send {
    /// Receives chunk bodies in increasing `sequence_index` order.
    async fn write_chunk(&mut self, sequence_index: u64, content: Bytes)
    -> Result<(), DownloadError>;

    /// Flushes and closes. Called once, on success and on abort.
    async fn finish(&mut self) -> Result<(), DownloadError>;
}

/// Buffered file output. The file is created (or truncated) on open.
pub struct FileSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl FileSink {
    pub async fn create(path: impl AsRef<Path>) -> Result<Self, DownloadError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let file = File::create(&path).await?;
        debug!(path = %path.display(), "Opened output file");
        Ok(Self {
            path,
            writer: Some(BufWriter::new(file)),
        })
    }
}

#[async_trait]
impl ChunkSink for FileSink {
    async fn write_chunk(
        &mut self,
        _sequence_index: u64,
        content: Bytes,
    ) -> Result<(), DownloadError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| DownloadError::internal("write after output file was closed"))?;
        writer.write_all(&content).await?;
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), DownloadError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().await?;
            writer.into_inner().sync_all().await?;
            debug!(path = %self.path.display(), "Closed output file");
        }
        Ok(())
    }
}

/// What a single completion did to the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Chunks flushed to disk by this completion
    pub drained: usize,
    /// Chunks still waiting for an earlier index
    pub buffered: usize,
    /// Every chunk has been written
    pub finished: bool,
}

/// Gates consulted before each write.
pub struct DrainGate<'a> {
    pub pause: &'a PauseGate,
    pub abort: &'a CancellationToken,
    pub poll_interval: Duration,
    pub stats: &'a TransferStats,
}

pub struct Reassembly {
    pending: BTreeMap<u64, Chunk>,
    /// Next sequence index to write; every index below it is on disk
    next_index: u64,
    total: u64,
    sinks: Vec<Box<dyn ChunkSink>>,
    bytes_written: u64,
    peak_buffered: usize,
}

impl Reassembly {
    pub fn new(total: u64, sinks: Vec<Box<dyn ChunkSink>>) -> Self {
        Self {
            pending: BTreeMap::new(),
            next_index: 0,
            total,
            sinks,
            bytes_written: 0,
            peak_buffered: 0,
        }
    }

    pub fn written(&self) -> u64 {
        self.next_index
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    pub fn peak_buffered(&self) -> usize {
        self.peak_buffered
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn is_finished(&self) -> bool {
        self.next_index >= self.total
    }

    /// Buffers a downloaded chunk and, if it unblocks the cursor, writes the
    /// contiguous run that follows.
    pub async fn complete(
        &mut self,
        chunk: Chunk,
        gate: &DrainGate<'_>,
    ) -> Result<Completion, DownloadError> {
        let index = chunk.sequence_index;
        if index < self.next_index || self.pending.contains_key(&index) {
            return Err(DownloadError::internal(format!(
                "chunk {index} completed twice"
            )));
        }
        if index >= self.total {
            return Err(DownloadError::internal(format!(
                "chunk {index} is outside the backlog of {}",
                self.total
            )));
        }
        if chunk.file_index >= self.sinks.len() {
            return Err(DownloadError::internal(format!(
                "chunk {index} targets missing output {}",
                chunk.file_index
            )));
        }

        self.pending.insert(index, chunk);
        self.peak_buffered = self.peak_buffered.max(self.pending.len());

        let drained = self.drain(gate).await?;
        Ok(Completion {
            drained,
            buffered: self.pending.len(),
            finished: self.is_finished(),
        })
    }

    async fn drain(&mut self, gate: &DrainGate<'_>) -> Result<usize, DownloadError> {
        let mut drained = 0;
        while self.pending.contains_key(&self.next_index) {
            gate.pause
                .wait_resumed(gate.abort, gate.poll_interval)
                .await?;

            let Some(mut chunk) = self.pending.remove(&self.next_index) else {
                break;
            };
            let content = chunk.content.take().unwrap_or_default();
            let len = content.len() as u64;
            self.sinks[chunk.file_index]
                .write_chunk(chunk.sequence_index, content)
                .await?;

            gate.stats.record_written(len);
            self.bytes_written += len;
            self.next_index += 1;
            drained += 1;
            trace!(
                chunk = chunk.sequence_index,
                file = chunk.file_index,
                bytes = len,
                "Chunk written"
            );
        }
        if drained > 1 {
            debug!(drained, cursor = self.next_index, "Flushed buffered run");
        }
        Ok(drained)
    }

    /// Closes every sink. All sinks are attempted; the first error is kept.
    pub async fn finish(&mut self) -> Result<(), DownloadError> {
        let mut first_error = None;
        for sink in &mut self.sinks {
            if let Err(e) = sink.finish().await {
                first_error.get_or_insert(e);
            }
        }
        // partial runs are discarded on abort
        self.pending.clear();
        first_error.map_or(Ok(()), Err)
    }
}
