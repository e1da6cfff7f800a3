//! Streaming download reader with transparent resume.
//!
//! The reader tracks the bytes *delivered to the caller*, not the bytes
//! pulled into its internal buffer, so a reconnect after a mid-stream
//! failure asks for `Range: bytes=<delivered>-` and the caller never sees a
//! gap or a duplicate. EOF from the service is terminal; transport failures
//! consume the shared retry budget.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tracing::{debug, warn};

use crate::client::HttpClient;
use crate::dot::{api, DotKind, Dotter};
use crate::error::ApiError;
use crate::host::HostSelector;

/// Resuming streaming reader over one object.
///
/// Created by [`Downloader::download_reader`](super::Downloader::download_reader).
/// Not `AsyncRead`: reads are explicit async calls so the reconnect path can
/// await freely.
pub struct DownloadReader {
    selector: Arc<HostSelector>,
    client: HttpClient,
    dotter: Option<Arc<Dotter>>,
    /// URL path below the host, `getfile/<ak>/<bucket>/<key>`.
    object_path: String,
    /// Remaining reconnect budget.
    tries_left: usize,
    /// Bytes handed to the caller so far; the resume offset.
    delivered: u64,
    /// Current response body, if connected.
    stream: Option<BoxStream<'static, reqwest::Result<Bytes>>>,
    /// Bytes received but not yet handed out.
    pending: Bytes,
    finished: bool,
}

impl std::fmt::Debug for DownloadReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadReader")
            .field("object_path", &self.object_path)
            .field("delivered", &self.delivered)
            .field("tries_left", &self.tries_left)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl DownloadReader {
    pub(crate) fn new(
        selector: Arc<HostSelector>,
        client: HttpClient,
        dotter: Option<Arc<Dotter>>,
        object_path: String,
        tries: usize,
    ) -> Self {
        Self {
            selector,
            client,
            dotter,
            object_path,
            tries_left: tries.max(1),
            delivered: 0,
            stream: None,
            pending: Bytes::new(),
            finished: false,
        }
    }

    /// Reads up to `buf.len()` bytes, reconnecting on failure.
    ///
    /// Returns `Ok(0)` only at end of object.
    ///
    /// # Errors
    ///
    /// Returns the last connection or read error once the retry budget is
    /// exhausted.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, ApiError> {
        if buf.is_empty() || self.finished {
            return Ok(0);
        }
        if !self.pending.is_empty() {
            return Ok(self.take_pending(buf));
        }

        loop {
            if self.stream.is_none() {
                self.connect().await?;
            }
            // Connected stream is set by connect() above.
            let Some(stream) = self.stream.as_mut() else {
                return Err(ApiError::unexpected(&self.object_path, "reader lost its stream"));
            };
            match stream.next().await {
                Some(Ok(chunk)) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    self.pending = chunk;
                    return Ok(self.take_pending(buf));
                }
                Some(Err(err)) => {
                    self.stream = None;
                    self.consume_try(ApiError::transport(&self.object_path, err))?;
                }
                None => {
                    self.finished = true;
                    return Ok(0);
                }
            }
        }
    }

    /// Reads the remainder of the object into memory.
    ///
    /// # Errors
    ///
    /// Same conditions as [`DownloadReader::read`].
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, ApiError> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    /// Total bytes delivered to the caller so far.
    #[must_use]
    pub fn bytes_delivered(&self) -> u64 {
        self.delivered
    }

    fn take_pending(&mut self, buf: &mut [u8]) -> usize {
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending = self.pending.slice(n..);
        self.delivered += n as u64;
        n
    }

    /// Opens a fresh response resuming after the delivered offset. Failed
    /// connections consume the retry budget and rotate hosts.
    async fn connect(&mut self) -> Result<(), ApiError> {
        loop {
            let Some(host) = self.selector.select_host() else {
                return Err(ApiError::NoHost { service: "io" });
            };
            let url = format!("{host}/{}", self.object_path);
            let mut request = self
                .client
                .inner()
                .get(&url)
                .header(reqwest::header::ACCEPT_ENCODING, "identity");
            if self.delivered > 0 {
                request =
                    request.header(reqwest::header::RANGE, format!("bytes={}-", self.delivered));
            }

            let started = Instant::now();
            let result = request.send().await;
            let outcome = match result {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if status == 200 || status == 206 {
                        if self.delivered > 0 && status == 200 {
                            // Range ignored: replaying from the start would
                            // duplicate delivered bytes.
                            Err(ApiError::unexpected(&url, "server ignored range on resume"))
                        } else {
                            Ok(response)
                        }
                    } else {
                        Err(ApiError::status(&url, status))
                    }
                }
                Err(err) => Err(ApiError::transport(&url, err)),
            };

            match outcome {
                Ok(response) => {
                    self.selector.reward(&host);
                    if let Some(dotter) = &self.dotter {
                        let _ = dotter.dot(
                            DotKind::Http,
                            api::DOWNLOAD_READER,
                            true,
                            started.elapsed(),
                        );
                    }
                    debug!(host = %host, offset = self.delivered, "reader connected");
                    self.stream = Some(response.bytes_stream().boxed());
                    return Ok(());
                }
                Err(err) => {
                    let punished = self.selector.punish_if_needed(&host, &err);
                    if let Some(dotter) = &self.dotter {
                        let _ = dotter.dot(
                            DotKind::Http,
                            api::DOWNLOAD_READER,
                            !punished,
                            started.elapsed(),
                        );
                        if punished {
                            let _ = dotter.punish();
                        }
                    }
                    warn!(host = %host, error = %err, "reader connect failed");
                    self.consume_try(err)?;
                }
            }
        }
    }

    /// Burns one retry; surfaces `err` once the budget is gone or the error
    /// is terminal.
    fn consume_try(&mut self, err: ApiError) -> Result<(), ApiError> {
        self.tries_left = self.tries_left.saturating_sub(1);
        if self.tries_left == 0 || !err.should_retry() {
            return Err(err);
        }
        Ok(())
    }
}
