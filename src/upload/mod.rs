//! Object upload over the up host pool.
//!
//! Sources no larger than one part go up in a single authenticated form
//! POST; anything bigger runs the multipart session protocol with parallel
//! part workers ([`multipart`]). Non-seekable sources use
//! [`Uploader::stream_upload`], which walks the same session protocol
//! strictly sequentially.

mod multipart;
mod source;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

pub use multipart::{CompletePartsRet, Part, PartCallback};
pub use source::{BytesPartSource, FilePartSource, PartSource};

use multipart::{make_parts, MultipartClient};

use crate::auth::{Signer, UploadPolicy};
use crate::client::HttpClient;
use crate::config::Config;
use crate::discovery::{DiscoveredHosts, Queryer, ServiceClass};
use crate::dot::{api, Dotter};
use crate::error::ApiError;
use crate::host::{HostSelector, HostSelectorOptions};
use crate::retry::{retry_with_hosts, with_sdk_dot};

/// Upload tokens signed by the convenience entry points live for a day.
const UPLOAD_TOKEN_TTL_SECS: u64 = 24 * 60 * 60;

/// Sleep between non-rate-limited part retries and commit retries.
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Unit of the random 1-9x back-off after a 509.
const DEFAULT_RATE_LIMIT_DELAY_UNIT: Duration = Duration::from_secs(1);

/// Optional attributes committed with an object.
#[derive(Debug, Clone, Default)]
pub struct UploadExtra {
    /// Original file name.
    pub fname: String,
    /// MIME type; empty lets the service sniff.
    pub mime_type: String,
    /// User metadata; keys are prefixed on the wire.
    pub metadata: HashMap<String, String>,
    /// Service-side magic variables.
    pub custom_vars: HashMap<String, String>,
}

/// Upload client over the up host pool.
#[derive(Debug)]
pub struct Uploader {
    bucket: String,
    signer: Arc<dyn Signer>,
    dotter: Option<Arc<Dotter>>,
    client: HttpClient,
    mp: MultipartClient,
    part_size: u64,
    concurrency: usize,
    tries: usize,
}

impl Uploader {
    /// Creates an uploader. With a [`Queryer`] attached, the up pool
    /// refreshes from discovery in the background.
    #[must_use]
    pub fn new(
        config: &Config,
        client: HttpClient,
        signer: Arc<dyn Signer>,
        queryer: Option<Arc<Queryer>>,
        dotter: Option<Arc<Dotter>>,
    ) -> Self {
        let up_selector = HostSelector::new(
            "up",
            config.up_hosts.clone(),
            HostSelectorOptions {
                provider: queryer.as_ref().map(|q| {
                    DiscoveredHosts::new(Arc::clone(q), ServiceClass::Up, false)
                        as Arc<dyn crate::host::HostsProvider>
                }),
                punish_duration: config.punish_duration(),
                ..HostSelectorOptions::default()
            },
        );
        let mp = MultipartClient {
            bucket: config.bucket.clone(),
            client: client.clone(),
            selector: up_selector,
            dotter: dotter.clone(),
            tries: config.retry(),
            retry_delay: DEFAULT_RETRY_DELAY,
            rate_limit_delay_unit: DEFAULT_RATE_LIMIT_DELAY_UNIT,
        };
        Self {
            bucket: config.bucket.clone(),
            signer,
            dotter,
            client,
            mp,
            part_size: config.part_size(),
            concurrency: config.up_concurrency(),
            tries: config.retry(),
        }
    }

    /// Overrides the retry back-off delays. Mainly useful to keep tests and
    /// latency-sensitive embedders from sleeping for whole seconds.
    #[must_use]
    pub fn with_retry_delays(mut self, retry_delay: Duration, rate_limit_unit: Duration) -> Self {
        self.mp.retry_delay = retry_delay;
        self.mp.rate_limit_delay_unit = rate_limit_unit;
        self
    }

    /// Uploads a file under `key`, choosing the single-request path for
    /// sources no larger than one part and the multipart path otherwise.
    ///
    /// # Errors
    ///
    /// Returns the final error of the last attempt.
    #[instrument(skip(self, path), fields(path = %path.as_ref().display()))]
    pub async fn upload_file(
        &self,
        path: impl AsRef<Path>,
        key: &str,
    ) -> Result<CompletePartsRet, ApiError> {
        self.upload_file_with_cancel(path, key, &CancellationToken::new())
            .await
    }

    /// [`Uploader::upload_file`] with cooperative cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Cancelled`] once `token` trips, or the final
    /// error of the last attempt.
    pub async fn upload_file_with_cancel(
        &self,
        path: impl AsRef<Path>,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<CompletePartsRet, ApiError> {
        let path = path.as_ref();
        let key = key.trim_start_matches('/');
        let size = tokio::fs::metadata(path)
            .await
            .map_err(|e| ApiError::io(path, e))?
            .len();
        let token = self.object_token(key);
        let fname = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(key)
            .to_string();

        if size <= self.part_size {
            let data = tokio::fs::read(path)
                .await
                .map_err(|e| ApiError::io(path, e))?;
            return self
                .form_upload(&token, key, &fname, Bytes::from(data), cancel)
                .await;
        }

        let source = Arc::new(FilePartSource::new(path));
        let extra = UploadExtra {
            fname,
            ..UploadExtra::default()
        };
        self.upload(cancel, &token, Some(key), source, size, &extra, None)
            .await
    }

    /// Uploads in-memory bytes under `key`.
    ///
    /// # Errors
    ///
    /// Returns the final error of the last attempt.
    #[instrument(skip(self, data))]
    pub async fn upload_data(
        &self,
        data: impl Into<Bytes>,
        key: &str,
    ) -> Result<CompletePartsRet, ApiError> {
        let data = data.into();
        let key = key.trim_start_matches('/');
        let token = self.object_token(key);
        let cancel = CancellationToken::new();

        if data.len() as u64 <= self.part_size {
            return self
                .form_upload(&token, key, key, data, &cancel)
                .await;
        }
        let size = data.len() as u64;
        let source = Arc::new(BytesPartSource::new(data));
        self.upload(&cancel, &token, Some(key), source, size, &UploadExtra::default(), None)
            .await
    }

    /// Multipart upload of a seekable source: init, parallel parts under
    /// the concurrency bound, then commit. The first fatal part error
    /// cancels the in-flight siblings, deletes the session and surfaces.
    ///
    /// # Errors
    ///
    /// Returns the first recorded part error, the final commit error, or
    /// [`ApiError::Cancelled`].
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(self, cancel, up_token, source, extra, callback))]
    pub async fn upload(
        &self,
        cancel: &CancellationToken,
        up_token: &str,
        key: Option<&str>,
        source: Arc<dyn PartSource>,
        size: u64,
        extra: &UploadExtra,
        callback: Option<PartCallback>,
    ) -> Result<CompletePartsRet, ApiError> {
        with_sdk_dot(
            self.dotter.as_ref(),
            api::UPLOAD,
            self.mp.upload(
                source,
                size,
                up_token,
                key,
                extra,
                callback,
                cancel,
                self.part_size,
                self.concurrency,
            ),
        )
        .await
    }

    /// Multipart upload of a non-seekable source. Parts go up strictly in
    /// order because the input cannot be re-read; everything else matches
    /// [`Uploader::upload`].
    ///
    /// # Errors
    ///
    /// Returns the first part error, the final commit error, or
    /// [`ApiError::Cancelled`]; the session is deleted before any error
    /// surfaces.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(self, cancel, up_token, reader, extra, callback))]
    pub async fn stream_upload<R>(
        &self,
        cancel: &CancellationToken,
        up_token: &str,
        key: Option<&str>,
        reader: &mut R,
        size: u64,
        extra: &UploadExtra,
        callback: Option<PartCallback>,
    ) -> Result<CompletePartsRet, ApiError>
    where
        R: AsyncRead + Unpin + Send,
    {
        with_sdk_dot(self.dotter.as_ref(), api::UPLOAD, async {
            if size == 0 {
                return Err(ApiError::invalid_input("cannot upload an empty source"));
            }
            let init = self.mp.init_parts(up_token, key, cancel).await?;
            let part_size = init.suggested_part_size.unwrap_or(self.part_size);
            let plan = make_parts(size, part_size);

            let mut parts = Vec::with_capacity(plan.len());
            for (part_number, _offset, len) in plan {
                if cancel.is_cancelled() {
                    self.mp.abort_session(up_token, key, &init.upload_id).await;
                    return Err(ApiError::Cancelled);
                }
                let mut buf = vec![0u8; len];
                if let Err(err) = reader.read_exact(&mut buf).await {
                    self.mp.abort_session(up_token, key, &init.upload_id).await;
                    return Err(ApiError::io("<stream>", err));
                }
                match self
                    .mp
                    .upload_part_with_retry(
                        up_token,
                        key,
                        &init.upload_id,
                        part_number,
                        Bytes::from(buf),
                        cancel,
                    )
                    .await
                {
                    Ok(part) => {
                        if let Some(callback) = &callback {
                            callback(part_number, &part.etag);
                        }
                        parts.push(part);
                    }
                    Err(err) => {
                        self.mp.abort_session(up_token, key, &init.upload_id).await;
                        return Err(err);
                    }
                }
            }
            match self
                .mp
                .complete_parts(up_token, key, &init.upload_id, parts, extra, cancel)
                .await
            {
                Ok(ret) => Ok(ret),
                Err(err) => {
                    self.mp.abort_session(up_token, key, &init.upload_id).await;
                    Err(err)
                }
            }
        })
        .await
    }

    /// Single-request path for small sources: one authenticated form POST,
    /// retried through the pipeline. The server treats a repeated key with
    /// the same token as an overwrite, so retrying is safe.
    async fn form_upload(
        &self,
        up_token: &str,
        key: &str,
        fname: &str,
        data: Bytes,
        cancel: &CancellationToken,
    ) -> Result<CompletePartsRet, ApiError> {
        with_sdk_dot(self.dotter.as_ref(), api::FORM_UPLOAD, async {
            retry_with_hosts(
                &self.mp.selector,
                self.dotter.as_ref(),
                api::FORM_UPLOAD,
                "up",
                self.tries,
                |host| {
                    let url = format!("{host}/");
                    let client = self.client.clone();
                    let data = data.clone();
                    let cancel = cancel.clone();
                    let token = up_token.to_string();
                    let key = key.to_string();
                    let fname = fname.to_string();
                    async move {
                        let form = reqwest::multipart::Form::new()
                            .text("token", token)
                            .text("key", key)
                            .part(
                                "file",
                                reqwest::multipart::Part::bytes(data.to_vec()).file_name(fname),
                            );
                        let request = client.inner().post(&url).multipart(form);
                        let response = tokio::select! {
                            () = cancel.cancelled() => return Err(ApiError::Cancelled),
                            result = request.send() => {
                                result.map_err(|e| ApiError::transport(&url, e))?
                            }
                        };
                        if !response.status().is_success() {
                            return Err(ApiError::status(&url, response.status().as_u16()));
                        }
                        response
                            .json::<CompletePartsRet>()
                            .await
                            .map_err(|e| ApiError::unexpected(&url, e.to_string()))
                    }
                },
            )
            .await
        })
        .await
    }

    fn object_token(&self, key: &str) -> String {
        self.signer
            .sign_upload_policy(&UploadPolicy::for_object(
                &self.bucket,
                key,
                UPLOAD_TOKEN_TTL_SECS,
            ))
    }
}
