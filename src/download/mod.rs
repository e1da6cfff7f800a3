//! Object download over the io host pool.
//!
//! Four shapes: whole object to a file (resuming a partial file via a
//! `Range` request), whole object to memory, an explicit byte range
//! (including suffix ranges), and a streaming reader that reconnects and
//! resumes on read errors ([`DownloadReader`]).

mod reader;

use std::path::Path;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

pub use reader::DownloadReader;

use crate::client::HttpClient;
use crate::config::Config;
use crate::discovery::{DiscoveredHosts, Queryer, ServiceClass};
use crate::dot::{api, Dotter};
use crate::encode::escape_key_path;
use crate::error::ApiError;
use crate::host::{HostSelector, HostSelectorOptions};
use crate::retry::{retry_with_hosts, with_sdk_dot};

/// A byte range of an object plus the total object size the service
/// reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangePart {
    /// The requested bytes.
    pub bytes: Vec<u8>,
    /// Total object size, parsed from `Content-Range`.
    pub total_size: u64,
}

/// Download client over the io host pool.
#[derive(Debug)]
pub struct Downloader {
    bucket: String,
    access_key: String,
    io_selector: Arc<HostSelector>,
    client: HttpClient,
    dotter: Option<Arc<Dotter>>,
    tries: usize,
}

impl Downloader {
    /// Creates a downloader. With a [`Queryer`] attached, the io pool
    /// refreshes from discovery in the background.
    #[must_use]
    pub fn new(
        config: &Config,
        client: HttpClient,
        queryer: Option<Arc<Queryer>>,
        dotter: Option<Arc<Dotter>>,
    ) -> Self {
        let io_selector = HostSelector::new(
            "io",
            config.io_hosts.clone(),
            HostSelectorOptions {
                provider: queryer.as_ref().map(|q| {
                    DiscoveredHosts::new(Arc::clone(q), ServiceClass::Io, false)
                        as Arc<dyn crate::host::HostsProvider>
                }),
                punish_duration: config.punish_duration(),
                ..HostSelectorOptions::default()
            },
        );
        Self {
            bucket: config.bucket.clone(),
            access_key: config.ak.clone(),
            io_selector,
            client,
            dotter,
            tries: config.retry(),
        }
    }

    /// Downloads an object to `path`, resuming a partial file in place.
    ///
    /// An existing non-empty file at `path` resumes with
    /// `Range: bytes=<len>-`; a 416 answer means the file is already
    /// complete. The returned file is positioned at the start.
    ///
    /// # Errors
    ///
    /// Returns the final error of the last attempt.
    #[instrument(skip(self, path), fields(path = %path.as_ref().display()))]
    pub async fn download_file(
        &self,
        key: &str,
        path: impl AsRef<Path>,
    ) -> Result<tokio::fs::File, ApiError> {
        self.download_file_with_cancel(key, path, &CancellationToken::new())
            .await
    }

    /// [`Downloader::download_file`] with cooperative cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Cancelled`] once `token` trips, or the final
    /// error of the last attempt.
    pub async fn download_file_with_cancel(
        &self,
        key: &str,
        path: impl AsRef<Path>,
        token: &CancellationToken,
    ) -> Result<tokio::fs::File, ApiError> {
        let path = path.as_ref();
        with_sdk_dot(self.dotter.as_ref(), api::DOWNLOAD_FILE, async {
            retry_with_hosts(
                &self.io_selector,
                self.dotter.as_ref(),
                api::DOWNLOAD_FILE,
                "io",
                self.tries,
                |host| self.download_file_attempt(host, key, path, token.clone()),
            )
            .await
        })
        .await
    }

    async fn download_file_attempt(
        &self,
        host: String,
        key: &str,
        path: &Path,
        token: CancellationToken,
    ) -> Result<tokio::fs::File, ApiError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .await
            .map_err(|e| ApiError::io(path, e))?;
        let existing = file
            .seek(std::io::SeekFrom::End(0))
            .await
            .map_err(|e| ApiError::io(path, e))?;

        let url = self.object_url(&host, key);
        let mut request = self
            .client
            .inner()
            .get(&url)
            .header(reqwest::header::ACCEPT_ENCODING, "identity");
        if existing > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={existing}-"));
        }

        let response = tokio::select! {
            () = token.cancelled() => return Err(ApiError::Cancelled),
            result = request.send() => result.map_err(|e| ApiError::transport(&url, e))?,
        };

        let status = response.status().as_u16();
        if status == 416 {
            // The partial file already covers the whole object.
            file.seek(std::io::SeekFrom::Start(0))
                .await
                .map_err(|e| ApiError::io(path, e))?;
            return Ok(file);
        }
        if status != 200 && status != 206 {
            return Err(ApiError::status(&url, status));
        }
        if status == 200 && existing > 0 {
            // Server ignored the range; start the file over.
            file.set_len(0).await.map_err(|e| ApiError::io(path, e))?;
            file.seek(std::io::SeekFrom::Start(0))
                .await
                .map_err(|e| ApiError::io(path, e))?;
        }

        let expected = response.content_length();
        let mut copied: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            if token.is_cancelled() {
                return Err(ApiError::Cancelled);
            }
            let chunk = chunk.map_err(|e| ApiError::transport(&url, e))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| ApiError::io(path, e))?;
            copied += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| ApiError::io(path, e))?;

        if let Some(expected) = expected {
            if expected != copied {
                warn!(url = %url, expected, copied, "content length mismatch");
            }
        }
        info!(key, bytes = copied, resumed = status == 206, "download complete");

        file.seek(std::io::SeekFrom::Start(0))
            .await
            .map_err(|e| ApiError::io(path, e))?;
        Ok(file)
    }

    /// Downloads a whole object into memory.
    ///
    /// # Errors
    ///
    /// Returns the final error of the last attempt.
    #[instrument(skip(self))]
    pub async fn download_bytes(&self, key: &str) -> Result<Vec<u8>, ApiError> {
        self.download_bytes_with_cancel(key, &CancellationToken::new())
            .await
    }

    /// [`Downloader::download_bytes`] with cooperative cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Cancelled`] once `token` trips, or the final
    /// error of the last attempt.
    pub async fn download_bytes_with_cancel(
        &self,
        key: &str,
        token: &CancellationToken,
    ) -> Result<Vec<u8>, ApiError> {
        with_sdk_dot(self.dotter.as_ref(), api::DOWNLOAD_BYTES, async {
            retry_with_hosts(
                &self.io_selector,
                self.dotter.as_ref(),
                api::DOWNLOAD_BYTES,
                "io",
                self.tries,
                |host| {
                    let url = self.object_url(&host, key);
                    let client = self.client.clone();
                    let token = token.clone();
                    async move {
                        let request = client
                            .inner()
                            .get(&url)
                            .header(reqwest::header::ACCEPT_ENCODING, "identity");
                        let response = tokio::select! {
                            () = token.cancelled() => return Err(ApiError::Cancelled),
                            result = request.send() => {
                                result.map_err(|e| ApiError::transport(&url, e))?
                            }
                        };
                        if response.status().as_u16() != 200 {
                            return Err(ApiError::status(&url, response.status().as_u16()));
                        }
                        let bytes = response
                            .bytes()
                            .await
                            .map_err(|e| ApiError::transport(&url, e))?;
                        Ok(bytes.to_vec())
                    }
                },
            )
            .await
        })
        .await
    }

    /// Downloads a byte range.
    ///
    /// `offset >= 0` requests `size` bytes starting there; a negative
    /// `offset` requests the trailing `size` bytes (suffix range). The
    /// service must answer 206 with a `Content-Range` carrying the total
    /// object size.
    ///
    /// # Errors
    ///
    /// Returns the final error of the last attempt, or an
    /// unexpected-response error when the 206/`Content-Range` contract is
    /// broken.
    #[instrument(skip(self))]
    pub async fn download_range_bytes(
        &self,
        key: &str,
        offset: i64,
        size: u64,
    ) -> Result<RangePart, ApiError> {
        self.download_range_bytes_with_cancel(key, offset, size, &CancellationToken::new())
            .await
    }

    /// [`Downloader::download_range_bytes`] with cooperative cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Cancelled`] once `token` trips, or the same
    /// errors as [`Downloader::download_range_bytes`].
    pub async fn download_range_bytes_with_cancel(
        &self,
        key: &str,
        offset: i64,
        size: u64,
        token: &CancellationToken,
    ) -> Result<RangePart, ApiError> {
        if size == 0 {
            return Err(ApiError::invalid_input("range size must be positive"));
        }
        let range = if offset >= 0 {
            #[allow(clippy::cast_sign_loss)]
            let start = offset as u64;
            format!("bytes={start}-{}", start + size - 1)
        } else {
            format!("bytes=-{size}")
        };

        with_sdk_dot(self.dotter.as_ref(), api::DOWNLOAD_RANGE, async {
            retry_with_hosts(
                &self.io_selector,
                self.dotter.as_ref(),
                api::DOWNLOAD_RANGE,
                "io",
                self.tries,
                |host| {
                    let url = self.object_url(&host, key);
                    let client = self.client.clone();
                    let range = range.clone();
                    let token = token.clone();
                    async move {
                        let request = client
                            .inner()
                            .get(&url)
                            .header(reqwest::header::ACCEPT_ENCODING, "identity")
                            .header(reqwest::header::RANGE, range);
                        let response = tokio::select! {
                            () = token.cancelled() => return Err(ApiError::Cancelled),
                            result = request.send() => {
                                result.map_err(|e| ApiError::transport(&url, e))?
                            }
                        };
                        if response.status().as_u16() != 206 {
                            return Err(ApiError::status(&url, response.status().as_u16()));
                        }
                        let total_size = parse_content_range_total(
                            response
                                .headers()
                                .get(reqwest::header::CONTENT_RANGE)
                                .and_then(|v| v.to_str().ok()),
                        )
                        .ok_or_else(|| {
                            ApiError::unexpected(&url, "missing or malformed Content-Range")
                        })?;
                        let bytes = response
                            .bytes()
                            .await
                            .map_err(|e| ApiError::transport(&url, e))?;
                        Ok(RangePart {
                            bytes: bytes.to_vec(),
                            total_size,
                        })
                    }
                },
            )
            .await
        })
        .await
    }

    /// Opens a streaming reader over the object.
    ///
    /// The reader issues its first request lazily and transparently
    /// reconnects with a `Range` resuming after the bytes already delivered
    /// whenever a read fails, up to the configured retry budget.
    #[must_use]
    pub fn download_reader(&self, key: &str) -> DownloadReader {
        DownloadReader::new(
            Arc::clone(&self.io_selector),
            self.client.clone(),
            self.dotter.clone(),
            self.object_path(key),
            self.tries,
        )
    }

    fn object_url(&self, host: &str, key: &str) -> String {
        format!("{host}/{}", self.object_path(key))
    }

    fn object_path(&self, key: &str) -> String {
        let key = key.trim_start_matches('/');
        format!(
            "getfile/{}/{}/{}",
            self.access_key,
            self.bucket,
            escape_key_path(key)
        )
    }
}

/// Extracts the total length from `Content-Range: bytes <s>-<e>/<total>`.
fn parse_content_range_total(header: Option<&str>) -> Option<u64> {
    let header = header?;
    let total = header.rsplit('/').next()?;
    total.trim().parse().ok()
}
