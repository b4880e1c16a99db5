use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use url::Url;

use std::io;
use std::path::PathBuf;
use std::time::Duration;

mod sink;
pub mod stats;
pub mod stream;

use self::sink::ChunkedSink;
use self::stream::{ChunkStream, StreamError, StreamSource};

pub const DEFAULT_CHUNK_SIZE: usize = 8192;

const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/**
 * What to record, where to, and for how long. Built once at startup.
 */
#[derive(Debug, Clone)]
pub struct RecordingRequest {
    pub stream_url: Url,
    pub duration: Duration,
    pub output_path: PathBuf,
}

/**
 * Bounded exponential backoff between reconnect attempts.
 */
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32, // consecutive transport failures that end the session
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        RetryPolicy {
            max_attempts,
            initial_backoff,
            max_backoff: initial_backoff * 8,
        }
    }

    /// Delay before reconnecting after the `failures`-th consecutive failure.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1 << exp)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::new(3, Duration::from_secs(1))
    }
}

/**
 * Ways a capture can go wrong. Only `Transport` is ever retried, and only
 * after the stream was established once.
 */
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("cannot open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot connect to stream: {0}")]
    Connect(#[source] StreamError),

    #[error("stream lost after {attempts} consecutive failures: {source}")]
    Transport {
        attempts: u32,
        #[source]
        source: StreamError,
    },

    #[error("cannot write recording: {0}")]
    Write(#[source] io::Error),

    #[error("cancelled before any audio was captured")]
    Cancelled,
}

impl CaptureError {
    pub fn class(&self) -> &'static str {
        match self {
            CaptureError::Open { .. } => "OpenError",
            CaptureError::Connect(_) => "ConnectError",
            CaptureError::Transport { .. } => "TransportError",
            CaptureError::Write(_) => "WriteError",
            CaptureError::Cancelled => "Cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    PartialSuccess,
    Failure,
}

#[derive(Debug)]
pub struct CaptureResult {
    pub outcome: Outcome,
    pub path: PathBuf, // where the bytes actually went
    pub bytes_written: u64,
    pub elapsed: Duration,
    pub error: Option<CaptureError>,
}

impl CaptureResult {
    pub fn error_detail(&self) -> Option<String> {
        self.error.as_ref().map(|e| e.to_string())
    }
}

/**
 * Receives progress from a running capture. Keeps console output out of the
 * recording loop.
 */
pub trait CaptureObserver {
    fn on_progress(&mut self, bytes_written: u64);
    fn on_finalize(&mut self, result: &CaptureResult);
}

/**
 * Reports through the `log` facade, roughly once per MiB.
 */
#[derive(Default)]
pub struct LogObserver {
    last_logged_mib: u64,
}

impl CaptureObserver for LogObserver {
    fn on_progress(&mut self, bytes_written: u64) {
        let mib = bytes_written / (1024 * 1024);
        if mib > self.last_logged_mib {
            self.last_logged_mib = mib;
            info!("Recorded {} MiB", mib);
        }
    }

    fn on_finalize(&mut self, result: &CaptureResult) {
        match &result.error {
            None => info!(
                "Recording finished: {} bytes in {:.1}s",
                result.bytes_written,
                result.elapsed.as_secs_f64()
            ),
            Some(e) => error!(
                "Recording ended with {:?} after {} bytes: {}",
                result.outcome, result.bytes_written, e
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Connecting,
    Recording,
    Retrying,
    Finished,
    Failed,
}

struct CaptureSession<'a> {
    request: &'a RecordingRequest,
    bytes_written: u64,
    start: Instant,
    state: SessionState,
}

impl<'a> CaptureSession<'a> {
    fn new(request: &'a RecordingRequest) -> Self {
        CaptureSession {
            request,
            bytes_written: 0,
            start: Instant::now(),
            state: SessionState::Connecting,
        }
    }

    fn deadline(&self) -> Instant {
        // Durations past the clock's range never expire
        self.start
            .checked_add(self.request.duration)
            .unwrap_or_else(|| self.start + FAR_FUTURE)
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            debug!("Session {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}

// Why the read loop stopped
enum Stop {
    Deadline,
    EndOfStream,
    Cancelled,
    Fatal(CaptureError),
    // retries exhausted, or the deadline passed mid-retry
    GaveUp(CaptureError),
}

/**
 * Drives one recording at a time from a `StreamSource` into a file.
 */
pub struct Recorder<S> {
    source: S,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl<S: StreamSource> Recorder<S> {
    pub fn new(source: S, retry: RetryPolicy, cancel: CancellationToken) -> Self {
        Recorder {
            source,
            retry,
            cancel,
        }
    }

    /**
     * Records `request.stream_url` until the duration elapses, the stream
     * ends, retries run out, or the cancellation token fires. Never fails:
     * every error is folded into the returned `CaptureResult`, and whatever
     * was written stays on disk.
     */
    pub async fn capture(
        &self,
        request: &RecordingRequest,
        observer: &mut dyn CaptureObserver,
    ) -> CaptureResult {
        let mut session = CaptureSession::new(request);

        let mut sink = match ChunkedSink::open(&request.output_path) {
            Ok(sink) => sink,
            Err(source) => {
                session.transition(SessionState::Failed);
                let result = CaptureResult {
                    outcome: Outcome::Failure,
                    path: request.output_path.clone(),
                    bytes_written: 0,
                    elapsed: session.start.elapsed(),
                    error: Some(CaptureError::Open {
                        path: request.output_path.clone(),
                        source,
                    }),
                };
                observer.on_finalize(&result);
                return result;
            }
        };
        info!("Recording to {}...", sink.path().display());

        let stop = self.record(&mut session, &mut sink, observer).await;
        let closed = sink.close();
        let bytes = session.bytes_written;

        let (mut outcome, mut error) = match stop {
            Stop::Deadline | Stop::EndOfStream => (Outcome::Success, None),
            Stop::Cancelled if bytes > 0 => (Outcome::PartialSuccess, None),
            Stop::Cancelled => (Outcome::Failure, Some(CaptureError::Cancelled)),
            Stop::Fatal(e) => (Outcome::Failure, Some(e)),
            Stop::GaveUp(e) if bytes > 0 => (Outcome::PartialSuccess, Some(e)),
            Stop::GaveUp(e) => (Outcome::Failure, Some(e)),
        };

        if let Err(e) = closed {
            if error.is_none() {
                outcome = Outcome::Failure;
                error = Some(CaptureError::Write(e));
            } else {
                warn!("Error closing {}: {}", sink.path().display(), e);
            }
        }

        session.transition(match outcome {
            Outcome::Failure => SessionState::Failed,
            _ => SessionState::Finished,
        });

        let result = CaptureResult {
            outcome,
            path: sink.path().to_path_buf(),
            bytes_written: bytes,
            elapsed: session.start.elapsed(),
            error,
        };
        observer.on_finalize(&result);
        result
    }

    async fn record(
        &self,
        session: &mut CaptureSession<'_>,
        sink: &mut ChunkedSink,
        observer: &mut dyn CaptureObserver,
    ) -> Stop {
        let url = &session.request.stream_url;
        let deadline = session.deadline();

        // A bad URL or stream id will not fix itself, so no retry here
        let mut stream = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Stop::Cancelled,
            opened = self.source.open(url) => match opened {
                Ok(stream) => stream,
                Err(e) => return Stop::Fatal(CaptureError::Connect(e)),
            },
        };
        session.transition(SessionState::Recording);

        // The deadline is only checked between chunks, so a read in flight
        // when it passes is still written. A stalled read ends at the read
        // timeout.
        let mut failures = 0;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Stop::Cancelled,
                next = stream.next_chunk() => next,
            };

            match next {
                Ok(Some(chunk)) => {
                    failures = 0;
                    if !chunk.is_empty() {
                        if let Err(e) = sink.append(&chunk) {
                            return Stop::Fatal(CaptureError::Write(e));
                        }
                        session.bytes_written = sink.bytes_written();
                        observer.on_progress(session.bytes_written);
                    }
                }
                Ok(None) => {
                    info!("Stream ended by server");
                    return Stop::EndOfStream;
                }
                Err(e) if Instant::now() >= deadline => {
                    info!("Stream error after the deadline, stopping: {}", e);
                    return Stop::Deadline;
                }
                Err(e) => {
                    failures += 1;
                    stream = match self.reconnect(session, &mut failures, e).await {
                        Ok(stream) => stream,
                        Err(stop) => return stop,
                    };
                }
            }

            if Instant::now() >= deadline {
                return Stop::Deadline;
            }
            if self.cancel.is_cancelled() {
                return Stop::Cancelled;
            }
        }
    }

    /**
     * Backs off and reopens the stream until it succeeds or the consecutive
     * failure count reaches the retry cap. The new connection picks up the
     * broadcast at the current wall-clock point.
     */
    async fn reconnect(
        &self,
        session: &mut CaptureSession<'_>,
        failures: &mut u32,
        mut last: StreamError,
    ) -> Result<Box<dyn ChunkStream>, Stop> {
        session.transition(SessionState::Retrying);
        let deadline = session.deadline();

        loop {
            if *failures >= self.retry.max_attempts {
                return Err(Stop::GaveUp(CaptureError::Transport {
                    attempts: *failures,
                    source: last,
                }));
            }

            let delay = self.retry.backoff(*failures);
            warn!(
                "Stream error ({}), reconnecting in {:?} [{}/{}]",
                last, delay, failures, self.retry.max_attempts
            );

            let opened = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Stop::Cancelled),
                _ = sleep_until(deadline) => {
                    return Err(Stop::GaveUp(CaptureError::Transport {
                        attempts: *failures,
                        source: last,
                    }));
                }
                opened = async {
                    sleep(delay).await;
                    self.source.open(&session.request.stream_url).await
                } => opened,
            };

            match opened {
                Ok(stream) => {
                    info!("Reconnected after {} failure(s)", failures);
                    session.transition(SessionState::Recording);
                    return Ok(stream);
                }
                Err(e) => {
                    *failures += 1;
                    last = e;
                }
            }
        }
    }
}
