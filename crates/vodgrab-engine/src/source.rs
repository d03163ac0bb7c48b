// Chunk transport: opens a byte stream for a chunk URL.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::Client;
use tracing::trace;

use crate::config::HttpConfig;
use crate::error::DownloadError;

/// Streamed body of a single chunk.
pub type ChunkBody = BoxStream<'static, Result<Bytes, DownloadError>>;

#[async_trait]
pub trait ChunkSource: Send + Sync {
    /// Sends the request and returns the body once response headers arrived.
    /// Non-success statuses must be reported as errors here.
    async fn open(&self, url: &str) -> Result<ChunkBody, DownloadError>;
}

/// HTTP transport backed by one shared `reqwest` connection pool.
#[derive(Debug, Clone)]
pub struct HttpChunkSource {
    http_client: Client,
}

impl HttpChunkSource {
    pub fn new(http_client: Client) -> Self {
        Self { http_client }
    }

    pub fn from_config(config: &HttpConfig) -> Result<Self, DownloadError> {
        Ok(Self::new(config.build_client()?))
    }
}

#[async_trait]
impl ChunkSource for HttpChunkSource {
    async fn open(&self, url: &str) -> Result<ChunkBody, DownloadError> {
        let response = self.http_client.get(url).send().await?;
        let status = response.status();
        trace!(url, %status, version = ?response.version(), "Chunk response headers received");

        if !status.is_success() {
            return Err(DownloadError::from_status(status, url));
        }

        Ok(response.bytes_stream().map_err(DownloadError::from).boxed())
    }
}
