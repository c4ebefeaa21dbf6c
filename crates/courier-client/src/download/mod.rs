//! Resumable HTTP downloads.
//!
//! A [`Downloader`] streams a URL into a [`ChunkSink`], resuming with
//! `Range`/`If-Range` after interruptions. The sink only ever sees a
//! contiguous prefix of the resource: whenever the server stops honouring the
//! requested range the sink is told to [`reset`](ChunkSink::reset) before any
//! byte from offset zero is written.
//!
//! HTTP, timers and URL re-signing are injected through [`Fetcher`],
//! [`Sleeper`] and [`UrlRefresher`] so the state machine can be driven by a
//! script in tests.

pub mod cancel;
pub mod headers;
pub mod http;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::HeaderMap;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::error::{DownloadError, FetchError, SinkError};

pub use cancel::{CancelHandle, CancelSignal};
pub use http::HttpFetcher;

pub type ByteStream = BoxStream<'static, Result<Bytes, FetchError>>;

/// Status line, headers and body of one HTTP GET.
pub struct FetchResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

impl fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, headers: HeaderMap) -> Result<FetchResponse, FetchError>;
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, delay: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

/// Produces a freshly signed URL when the current one is refused (401/403).
#[async_trait]
pub trait UrlRefresher: Send + Sync {
    async fn refresh(&self, expired_url: &str) -> Result<String, FetchError>;
}

/// Why a sink had to drop what it already holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    /// A resume request was answered with the full body (200).
    RangeIgnored,
    /// A 206 started at a different offset than requested.
    RangeMismatch,
    /// 416 for an offset short of the known size.
    RangeNotSatisfiable,
}

impl ResetReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ResetReason::RangeIgnored => "range_ignored",
            ResetReason::RangeMismatch => "range_mismatch",
            ResetReason::RangeNotSatisfiable => "range_not_satisfiable",
        }
    }
}

impl fmt::Display for ResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination of downloaded bytes.
#[async_trait]
pub trait ChunkSink: Send {
    /// Append `chunk` at the current end.
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), SinkError>;

    /// Discard everything written so far; the next chunk starts at offset 0.
    async fn reset(&mut self, reason: ResetReason) -> Result<(), SinkError>;

    fn progress(&mut self, _state: &TransferState) {}
}

#[async_trait]
impl ChunkSink for Vec<u8> {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), SinkError> {
        self.extend_from_slice(&chunk);
        Ok(())
    }

    async fn reset(&mut self, _reason: ResetReason) -> Result<(), SinkError> {
        self.clear();
        Ok(())
    }
}

/// Resume bookkeeping for one download.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferState {
    pub received: u64,
    pub total: Option<u64>,
    pub etag: Option<String>,
    pub url_refresh_count: u32,
}

impl TransferState {
    pub fn percent(&self) -> Option<u8> {
        let total = self.total.filter(|t| *t > 0)?;
        let pct = self.received.min(total).saturating_mul(100) / total;
        Some(pct as u8)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub url: String,
    /// Bytes the sink already holds.
    pub offset: u64,
    /// Validator those bytes were fetched under.
    pub etag: Option<String>,
    pub expected_size: Option<u64>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            offset: 0,
            etag: None,
            expected_size: None,
        }
    }

    pub fn resume_from(mut self, offset: u64, etag: Option<String>) -> Self {
        self.offset = offset;
        self.etag = etag.filter(|e| !e.trim().is_empty());
        self
    }

    pub fn with_expected_size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadOptions {
    /// Transient failures tolerated before giving up.
    pub max_retries: u32,
    pub backoff: Backoff,
    pub max_url_refreshes: u32,
    /// Upper bound on a server-provided `Retry-After`.
    pub retry_after_cap: Duration,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            max_retries: 6,
            backoff: Backoff::new(Duration::from_millis(400), Duration::from_millis(8000)),
            max_url_refreshes: 2,
            retry_after_cap: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    /// Last URL used, possibly refreshed.
    pub url: String,
    pub received: u64,
    pub total: Option<u64>,
    pub etag: Option<String>,
    pub mime: Option<String>,
    pub url_refresh_count: u32,
}

pub struct Downloader {
    fetcher: Arc<dyn Fetcher>,
    sleeper: Arc<dyn Sleeper>,
    refresher: Option<Arc<dyn UrlRefresher>>,
    options: DownloadOptions,
}

/// What to do after a response has been classified.
enum Step {
    Stream { body: ByteStream },
    Retry { hint: Option<Duration>, error: DownloadError },
    Again,
    Done,
}

async fn until_cancelled(cancel: &mut Option<CancelSignal>) {
    match cancel {
        Some(signal) => signal.cancelled().await,
        None => std::future::pending().await,
    }
}

fn is_cancelled(cancel: &Option<CancelSignal>) -> bool {
    cancel.as_ref().is_some_and(CancelSignal::is_cancelled)
}

impl Downloader {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            fetcher,
            sleeper: Arc::new(TokioSleeper),
            refresher: None,
            options: DownloadOptions::default(),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_refresher(mut self, refresher: Arc<dyn UrlRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn with_options(mut self, options: DownloadOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &DownloadOptions {
        &self.options
    }

    /// Download `request.url` into `sink`, which must already hold exactly
    /// `request.offset` bytes.
    pub async fn download<S>(
        &self,
        request: DownloadRequest,
        sink: &mut S,
        mut cancel: Option<CancelSignal>,
    ) -> Result<DownloadOutcome, DownloadError>
    where
        S: ChunkSink + ?Sized,
    {
        let mut url = request.url;
        let mut state = TransferState {
            received: request.offset,
            total: request.expected_size,
            etag: request.etag,
            url_refresh_count: 0,
        };
        let mut mime = None;
        let mut retries = 0u32;

        loop {
            if is_cancelled(&cancel) {
                return Err(DownloadError::Cancelled);
            }

            let request_headers = headers::resume_headers(state.received, state.etag.as_deref());
            let fetched = tokio::select! {
                biased;
                _ = until_cancelled(&mut cancel) => return Err(DownloadError::Cancelled),
                fetched = self.fetcher.fetch(&url, request_headers) => fetched,
            };

            let response = match fetched {
                Ok(response) => response,
                Err(e) => {
                    debug!(error = %e, "download request failed");
                    self.retry(&mut retries, None, &mut cancel, DownloadError::Transport(e))
                        .await?;
                    continue;
                }
            };

            let status = response.status;
            let response_mime = headers::mime(&response.headers);

            let step = match status {
                401 | 403 => {
                    url = self.refresh_url(&url, status, &mut state).await?;
                    retries = 0;
                    Step::Again
                }
                416 => {
                    self.range_not_satisfiable(&response.headers, sink, &mut state, &mut retries)
                        .await?
                }
                429 | 503 => Step::Retry {
                    hint: headers::retry_after(&response.headers)
                        .map(|d| d.min(self.options.retry_after_cap)),
                    error: DownloadError::Status(status),
                },
                500..=599 => Step::Retry {
                    hint: None,
                    error: DownloadError::Status(status),
                },
                200 => {
                    if state.received > 0 {
                        self.reset(sink, &mut state, &mut retries, ResetReason::RangeIgnored)
                            .await?;
                    }
                    state.etag = headers::etag(&response.headers);
                    state.total = headers::content_length(&response.headers).or(state.total);
                    Step::Stream {
                        body: response.body,
                    }
                }
                206 => {
                    let range = headers::content_range(&response.headers);
                    match range.and_then(|r| r.start) {
                        Some(start) if start == state.received => {
                            if let Some(size) = range.and_then(|r| r.size) {
                                state.total = Some(size);
                            } else if let Some(len) = headers::content_length(&response.headers) {
                                state.total = Some(state.received + len);
                            }
                            if state.etag.is_none() {
                                state.etag = headers::etag(&response.headers);
                            }
                            Step::Stream {
                                body: response.body,
                            }
                        }
                        start => {
                            warn!(
                                requested = state.received,
                                served = ?start,
                                "partial response does not start at the requested offset"
                            );
                            if state.received > 0 {
                                self.reset(
                                    sink,
                                    &mut state,
                                    &mut retries,
                                    ResetReason::RangeMismatch,
                                )
                                .await?;
                            }
                            Step::Retry {
                                hint: None,
                                error: DownloadError::Status(status),
                            }
                        }
                    }
                }
                other => return Err(DownloadError::Status(other)),
            };

            let body = match step {
                Step::Stream { body } => {
                    if response_mime.is_some() {
                        mime = response_mime;
                    }
                    body
                }
                Step::Retry { hint, error } => {
                    self.retry(&mut retries, hint, &mut cancel, error).await?;
                    continue;
                }
                Step::Again => continue,
                Step::Done => return Ok(outcome(url, state, mime)),
            };

            sink.progress(&state);
            if let Err(e) = self.stream_body(body, sink, &mut state, &mut cancel).await? {
                warn!(received = state.received, error = %e, "download interrupted");
                self.retry(&mut retries, None, &mut cancel, DownloadError::Transport(e))
                    .await?;
                continue;
            }

            if let Some(total) = state.total {
                if state.received < total {
                    let error = DownloadError::Incomplete {
                        received: state.received,
                        total,
                    };
                    self.retry(&mut retries, None, &mut cancel, error).await?;
                    continue;
                }
            }

            info!(received = state.received, refreshes = state.url_refresh_count, "download complete");
            return Ok(outcome(url, state, mime));
        }
    }

    /// Copy `body` into the sink. The outer error is fatal; the inner one is
    /// a stream failure worth resuming after.
    async fn stream_body<S>(
        &self,
        mut body: ByteStream,
        sink: &mut S,
        state: &mut TransferState,
        cancel: &mut Option<CancelSignal>,
    ) -> Result<Result<(), FetchError>, DownloadError>
    where
        S: ChunkSink + ?Sized,
    {
        loop {
            let next = tokio::select! {
                biased;
                _ = until_cancelled(cancel) => return Err(DownloadError::Cancelled),
                next = body.next() => next,
            };
            match next {
                Some(Ok(chunk)) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    let len = chunk.len() as u64;
                    sink.write_chunk(chunk).await?;
                    state.received += len;
                    sink.progress(state);
                }
                Some(Err(e)) => return Ok(Err(e)),
                None => return Ok(Ok(())),
            }
        }
    }

    async fn refresh_url(
        &self,
        url: &str,
        status: u16,
        state: &mut TransferState,
    ) -> Result<String, DownloadError> {
        let expired = DownloadError::UrlExpired {
            status,
            refreshes: state.url_refresh_count,
        };
        let Some(refresher) = &self.refresher else {
            return Err(expired);
        };
        if state.url_refresh_count >= self.options.max_url_refreshes {
            return Err(expired);
        }
        let fresh = refresher.refresh(url).await.map_err(DownloadError::Refresh)?;
        state.url_refresh_count += 1;
        info!(status, refreshes = state.url_refresh_count, "download URL refreshed");
        Ok(fresh)
    }

    async fn range_not_satisfiable<S>(
        &self,
        response_headers: &HeaderMap,
        sink: &mut S,
        state: &mut TransferState,
        retries: &mut u32,
    ) -> Result<Step, DownloadError>
    where
        S: ChunkSink + ?Sized,
    {
        let size = headers::content_range(response_headers)
            .and_then(|r| r.size)
            .or(state.total);
        match size {
            Some(size) if state.received > 0 && state.received >= size => {
                state.total = Some(size);
                Ok(Step::Done)
            }
            _ if state.received == 0 => Err(DownloadError::RangeNotSatisfiable),
            _ => {
                self.reset(sink, state, retries, ResetReason::RangeNotSatisfiable)
                    .await?;
                Ok(Step::Again)
            }
        }
    }

    /// Start over from byte zero with a fresh retry budget.
    async fn reset<S>(
        &self,
        sink: &mut S,
        state: &mut TransferState,
        retries: &mut u32,
        reason: ResetReason,
    ) -> Result<(), DownloadError>
    where
        S: ChunkSink + ?Sized,
    {
        info!(%reason, discarded = state.received, "restarting download from zero");
        sink.reset(reason).await?;
        state.received = 0;
        state.total = None;
        state.etag = None;
        *retries = 0;
        sink.progress(state);
        Ok(())
    }

    async fn retry(
        &self,
        retries: &mut u32,
        hint: Option<Duration>,
        cancel: &mut Option<CancelSignal>,
        error: DownloadError,
    ) -> Result<(), DownloadError> {
        if *retries >= self.options.max_retries {
            warn!(retries = *retries, %error, "download retries exhausted");
            return Err(error);
        }
        *retries += 1;
        // A server hint can lengthen the backoff, never shorten it.
        let backoff = self.options.backoff.jittered(*retries);
        let delay = hint.map_or(backoff, |hint| hint.max(backoff));
        debug!(attempt = *retries, delay_ms = delay.as_millis() as u64, %error, "download retry scheduled");

        tokio::select! {
            biased;
            _ = until_cancelled(cancel) => Err(DownloadError::Cancelled),
            _ = self.sleeper.sleep(delay) => Ok(()),
        }
    }
}

fn outcome(url: String, state: TransferState, mime: Option<String>) -> DownloadOutcome {
    DownloadOutcome {
        url,
        received: state.received,
        total: state.total,
        etag: state.etag,
        mime,
        url_refresh_count: state.url_refresh_count,
    }
}
