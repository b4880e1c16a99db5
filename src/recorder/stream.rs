use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info};
use reqwest::{Client, Response, StatusCode};
use thiserror::Error;
use url::Url;

use std::time::Duration;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/**
 * Failures of the network side of a capture. `Connect` and `Status` happen
 * while establishing the stream; `Transport` and `ReadTimeout` happen after
 * the stream was established.
 */
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("failed to connect: {0}")]
    Connect(#[source] BoxError),

    #[error("server responded with HTTP {0}")]
    Status(StatusCode),

    #[error("stream interrupted: {0}")]
    Transport(#[source] BoxError),

    #[error("no data received for {0:?}")]
    ReadTimeout(Duration),
}

/**
 * Opens live byte streams. Every call yields a fresh connection positioned at
 * the current point of the broadcast.
 */
#[async_trait]
pub trait StreamSource: Send + Sync {
    async fn open(&self, url: &Url) -> Result<Box<dyn ChunkStream>, StreamError>;
}

/**
 * A lazily read stream. `Ok(None)` means the server closed the stream
 * cleanly.
 */
#[async_trait]
pub trait ChunkStream: Send {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, StreamError>;
}

pub struct HttpSource {
    client: Client,
    chunk_size: usize,
    read_timeout: Duration,
}

impl HttpSource {
    pub fn new(
        connect_timeout: Duration,
        read_timeout: Duration,
        chunk_size: usize,
    ) -> Result<Self, StreamError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| StreamError::Connect(e.into()))?;
        Ok(Self::with_client(client, read_timeout, chunk_size))
    }

    pub fn with_client(client: Client, read_timeout: Duration, chunk_size: usize) -> Self {
        HttpSource {
            client,
            chunk_size: chunk_size.max(1),
            read_timeout,
        }
    }
}

#[async_trait]
impl StreamSource for HttpSource {
    async fn open(&self, url: &Url) -> Result<Box<dyn ChunkStream>, StreamError> {
        info!("Connecting to {}", url);
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| StreamError::Connect(e.into()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(StreamError::Status(status));
        }

        debug!(
            "Stream open, content-type: {:?}",
            response.headers().get(reqwest::header::CONTENT_TYPE)
        );

        Ok(Box::new(HttpStream {
            response,
            pending: Bytes::new(),
            chunk_size: self.chunk_size,
            read_timeout: self.read_timeout,
        }))
    }
}

/**
 * Response body reader that hands out at most `chunk_size` bytes per call.
 * Oversized network frames are kept in `pending` and sliced without copying.
 */
struct HttpStream {
    response: Response,
    pending: Bytes,
    chunk_size: usize,
    read_timeout: Duration,
}

impl HttpStream {
    fn take_pending(&mut self) -> Bytes {
        let n = self.chunk_size.min(self.pending.len());
        self.pending.split_to(n)
    }
}

#[async_trait]
impl ChunkStream for HttpStream {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, StreamError> {
        if !self.pending.is_empty() {
            return Ok(Some(self.take_pending()));
        }

        match tokio::time::timeout(self.read_timeout, self.response.chunk()).await {
            Ok(Ok(Some(frame))) => {
                self.pending = frame;
                Ok(Some(self.take_pending()))
            }
            Ok(Ok(None)) => Ok(None),
            Ok(Err(e)) => Err(StreamError::Transport(e.into())),
            Err(_) => Err(StreamError::ReadTimeout(self.read_timeout)),
        }
    }
}
