//! Multipart upload session protocol and the parallel part engine.
//!
//! One upload session: `init` creates a server-side `uploadId`, parts are
//! PUT independently (in parallel for seekable sources), `complete` commits
//! the ordered part list, `delete` destroys the session. The engine owns the
//! failure protocol: the first fatal part error wins, trips a shared
//! cancellation signal so admitted-but-idle workers exit without network
//! calls, and the session is deleted before the error surfaces.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::HttpClient;
use crate::dot::{api, DotKind, Dotter};
use crate::encode::encode_key;
use crate::error::{ApiError, STATUS_MD5_MISMATCH, STATUS_RATE_LIMITED};
use crate::host::HostSelector;
use crate::upload::source::PartSource;
use crate::upload::UploadExtra;

/// Attempts per part. Rate-limited attempts do not count against it.
pub(crate) const UPLOAD_PART_TRY_TIMES: usize = 5;

/// Attempts to delete a failed session.
pub(crate) const DELETE_PARTS_TRY_TIMES: usize = 10;

/// Attempts to commit a session.
pub(crate) const COMPLETE_PARTS_TRY_TIMES: usize = 5;

/// Metadata keys are sent with this prefix.
const META_KEY_PREFIX: &str = "x-qn-meta-";

/// One committed part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    #[serde(rename = "partNumber")]
    pub part_number: usize,
    pub etag: String,
}

/// Answer of the init step.
#[derive(Debug, Deserialize)]
pub(crate) struct InitPartsRet {
    #[serde(rename = "uploadId")]
    pub upload_id: String,
    /// When present, replaces the configured part size verbatim.
    #[serde(rename = "suggestedPartSize", default)]
    pub suggested_part_size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct UploadPartRet {
    etag: String,
    #[serde(default)]
    md5: String,
}

/// Answer of the commit step.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompletePartsRet {
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub key: String,
}

#[derive(Debug, Serialize)]
struct CompleteBody {
    parts: Vec<Part>,
    fname: String,
    #[serde(rename = "mimeType")]
    mime_type: String,
    metadata: HashMap<String, String>,
    #[serde(rename = "customVars")]
    custom_vars: HashMap<String, String>,
}

/// Callback invoked as each part lands, with its number and etag.
pub type PartCallback = Arc<dyn Fn(usize, &str) + Send + Sync>;

/// `(part_number, offset, len)` tuples covering `[0, size)` exactly:
/// parts 1..n-1 are `part_size`, part n takes the remainder.
pub(crate) fn make_parts(size: u64, part_size: u64) -> Vec<(usize, u64, usize)> {
    debug_assert!(part_size > 0);
    let count = size.div_ceil(part_size);
    (0..count)
        .map(|i| {
            let offset = i * part_size;
            let len = if i == count - 1 {
                size - offset
            } else {
                part_size
            };
            #[allow(clippy::cast_possible_truncation)]
            let len = len as usize;
            #[allow(clippy::cast_possible_truncation)]
            let number = i as usize + 1;
            (number, offset, len)
        })
        .collect()
}

/// Wire client plus engine for one up pool.
#[derive(Debug, Clone)]
pub(crate) struct MultipartClient {
    pub bucket: String,
    pub client: HttpClient,
    pub selector: Arc<HostSelector>,
    pub dotter: Option<Arc<Dotter>>,
    /// Attempts for the init step.
    pub tries: usize,
    /// Sleep between non-rate-limited part retries and commit retries.
    pub retry_delay: Duration,
    /// Unit of the random 1-9x rate-limit back-off.
    pub rate_limit_delay_unit: Duration,
}

impl MultipartClient {
    /// Runs the full parallel upload: init, bounded-concurrency parts,
    /// barrier, then commit or abort.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn upload(
        &self,
        source: Arc<dyn PartSource>,
        size: u64,
        up_token: &str,
        key: Option<&str>,
        extra: &UploadExtra,
        callback: Option<PartCallback>,
        cancel: &CancellationToken,
        part_size: u64,
        concurrency: usize,
    ) -> Result<CompletePartsRet, ApiError> {
        if size == 0 {
            return Err(ApiError::invalid_input("cannot upload an empty source"));
        }

        let init = self.init_parts(up_token, key, cancel).await?;
        let part_size = init.suggested_part_size.unwrap_or(part_size);
        let plan = make_parts(size, part_size);
        debug!(upload_id = %init.upload_id, parts = plan.len(), part_size, "session initialised");

        let child = cancel.child_token();
        let results: Arc<Mutex<Vec<Option<Part>>>> = Arc::new(Mutex::new(vec![None; plan.len()]));
        let first_error: Arc<Mutex<Option<ApiError>>> = Arc::new(Mutex::new(None));
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));

        let mut workers = JoinSet::new();
        for (part_number, offset, len) in plan {
            let engine = self.clone();
            let source = Arc::clone(&source);
            let up_token = up_token.to_string();
            let key = key.map(ToString::to_string);
            let upload_id = init.upload_id.clone();
            let child = child.clone();
            let results = Arc::clone(&results);
            let first_error = Arc::clone(&first_error);
            let callback = callback.clone();
            let semaphore = Arc::clone(&semaphore);

            workers.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                // Admitted after the signal tripped: exit without touching
                // the network.
                if child.is_cancelled() {
                    return;
                }
                let body = match source.read_part(offset, len).await {
                    Ok(body) => body,
                    Err(err) => {
                        record_first_error(&first_error, err);
                        child.cancel();
                        return;
                    }
                };
                let outcome = engine
                    .upload_part_with_retry(
                        &up_token,
                        key.as_deref(),
                        &upload_id,
                        part_number,
                        body,
                        &child,
                    )
                    .await;
                match outcome {
                    Ok(part) => {
                        results
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)[part_number - 1] =
                            Some(part.clone());
                        if let Some(callback) = &callback {
                            callback(part_number, &part.etag);
                        }
                    }
                    Err(err) if err.is_cancelled() => {}
                    Err(err) => {
                        record_first_error(&first_error, err);
                        child.cancel();
                    }
                }
            });
        }
        while workers.join_next().await.is_some() {}

        let first_error = first_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(err) = first_error {
            self.abort_session(up_token, key, &init.upload_id).await;
            return Err(err);
        }
        if cancel.is_cancelled() {
            self.abort_session(up_token, key, &init.upload_id).await;
            return Err(ApiError::Cancelled);
        }

        let collected = results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect::<Option<Vec<Part>>>();
        let Some(parts) = collected else {
            self.abort_session(up_token, key, &init.upload_id).await;
            return Err(ApiError::unexpected(
                "upload",
                "a part finished without a result",
            ));
        };

        match self
            .complete_parts(up_token, key, &init.upload_id, parts, extra, cancel)
            .await
        {
            Ok(ret) => Ok(ret),
            Err(err) => {
                self.abort_session(up_token, key, &init.upload_id).await;
                Err(err)
            }
        }
    }

    /// Opens an upload session.
    pub(crate) async fn init_parts(
        &self,
        up_token: &str,
        key: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<InitPartsRet, ApiError> {
        crate::retry::retry_with_hosts(
            &self.selector,
            self.dotter.as_ref(),
            api::INIT_PARTS,
            "up",
            self.tries,
            |host| {
                let url = format!("{}/uploads", self.object_base(&host, key));
                let client = self.client.clone();
                let token = up_token.to_string();
                let cancel = cancel.clone();
                async move {
                    let request = client
                        .inner()
                        .post(&url)
                        .header(reqwest::header::AUTHORIZATION, format!("UpToken {token}"));
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
                        .json::<InitPartsRet>()
                        .await
                        .map_err(|e| ApiError::unexpected(&url, e.to_string()))
                }
            },
        )
        .await
    }

    /// Uploads one part, rotating hosts, verifying the echoed MD5 and
    /// applying the part failure protocol:
    ///
    /// - 509 sleeps a random 1-9 back-off units and retries for free;
    /// - MD5 mismatch (406), 5xx and transport errors burn one of the 5
    ///   tries, with a fixed delay between them;
    /// - any other 4xx is terminal.
    pub(crate) async fn upload_part_with_retry(
        &self,
        up_token: &str,
        key: Option<&str>,
        upload_id: &str,
        part_number: usize,
        body: Bytes,
        cancel: &CancellationToken,
    ) -> Result<Part, ApiError> {
        let local_md5 = hex::encode(md5::compute(&body).0);
        let mut tries_left = UPLOAD_PART_TRY_TIMES;
        loop {
            if cancel.is_cancelled() {
                return Err(ApiError::Cancelled);
            }
            let Some(host) = self.selector.select_host() else {
                return Err(ApiError::NoHost { service: "up" });
            };

            let started = Instant::now();
            let attempt = self.put_part(&host, up_token, key, upload_id, part_number, body.clone());
            let result = tokio::select! {
                () = cancel.cancelled() => return Err(ApiError::Cancelled),
                result = attempt => result,
            };
            let result = result.and_then(|ret| {
                if ret.md5 == local_md5 {
                    Ok(ret)
                } else {
                    Err(ApiError::Md5Mismatch {
                        part_number,
                        local: local_md5.clone(),
                        remote: ret.md5,
                    })
                }
            });

            match result {
                Ok(ret) => {
                    self.selector.reward(&host);
                    self.dot(api::UPLOAD_PART, true, started.elapsed());
                    return Ok(Part {
                        part_number,
                        etag: ret.etag,
                    });
                }
                Err(err) => {
                    let punished = self.selector.punish_if_needed(&host, &err);
                    self.dot(api::UPLOAD_PART, !punished, started.elapsed());
                    if punished {
                        if let Some(dotter) = &self.dotter {
                            let _ = dotter.punish();
                        }
                    }
                    warn!(part_number, host = %host, error = %err, "part attempt failed");

                    let code = err.status_code();
                    if code == Some(STATUS_RATE_LIMITED) {
                        let units = rand::thread_rng().gen_range(1..=9u32);
                        sleep_cancellable(self.rate_limit_delay_unit * units, cancel).await?;
                        continue;
                    }
                    let terminal_client_error =
                        code.is_some_and(|c| c / 100 == 4 && c != STATUS_MD5_MISMATCH);
                    if !terminal_client_error && tries_left > 1 {
                        tries_left -= 1;
                        sleep_cancellable(self.retry_delay, cancel).await?;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Commits the session with the ordered part list.
    ///
    /// 612, 614 and 579 mean the object already landed (a prior attempt got
    /// through); they are logged and treated as success. Other 4xx are
    /// terminal; 5xx retries after a delay, up to 5 attempts.
    pub(crate) async fn complete_parts(
        &self,
        up_token: &str,
        key: Option<&str>,
        upload_id: &str,
        mut parts: Vec<Part>,
        extra: &UploadExtra,
        cancel: &CancellationToken,
    ) -> Result<CompletePartsRet, ApiError> {
        parts.sort_by_key(|part| part.part_number);
        let body = CompleteBody {
            parts,
            fname: extra.fname.clone(),
            mime_type: extra.mime_type.clone(),
            metadata: extra
                .metadata
                .iter()
                .map(|(k, v)| (format!("{META_KEY_PREFIX}{k}"), v.clone()))
                .collect(),
            custom_vars: extra.custom_vars.clone(),
        };

        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(ApiError::Cancelled);
            }
            let Some(host) = self.selector.select_host() else {
                return Err(ApiError::NoHost { service: "up" });
            };
            let url = format!("{}/uploads/{upload_id}", self.object_base(&host, key));

            let started = Instant::now();
            let request = self
                .client
                .inner()
                .post(&url)
                .header(reqwest::header::AUTHORIZATION, format!("UpToken {up_token}"))
                .json(&body);
            let result = tokio::select! {
                () = cancel.cancelled() => return Err(ApiError::Cancelled),
                result = request.send() => result,
            };
            let err = match result {
                Ok(response) if response.status().is_success() => {
                    match response.json::<CompletePartsRet>().await {
                        Ok(ret) => {
                            self.selector.reward(&host);
                            self.dot(api::COMPLETE_PARTS, true, started.elapsed());
                            return Ok(ret);
                        }
                        Err(err) => ApiError::unexpected(&url, err.to_string()),
                    }
                }
                Ok(response) => ApiError::status(&url, response.status().as_u16()),
                Err(err) => ApiError::transport(&url, err),
            };
            let code = err.status_code();
            if matches!(code, Some(612 | 614 | 579)) {
                warn!(upload_id, code, "complete answered an already-committed alias");
                self.dot(api::COMPLETE_PARTS, true, started.elapsed());
                return Ok(CompletePartsRet::default());
            }

            let punished = self.selector.punish_if_needed(&host, &err);
            self.dot(api::COMPLETE_PARTS, !punished, started.elapsed());
            warn!(upload_id, error = %err, "complete attempt failed");

            attempt += 1;
            let terminal_client_error = code.is_some_and(|c| c / 100 == 4);
            if terminal_client_error || attempt >= COMPLETE_PARTS_TRY_TIMES {
                return Err(err);
            }
            sleep_cancellable(self.retry_delay, cancel).await?;
        }
    }

    /// Destroys the session, trying up to 10 times. A 4xx answer means the
    /// session is already gone and counts as done.
    pub(crate) async fn delete_parts(
        &self,
        up_token: &str,
        key: Option<&str>,
        upload_id: &str,
    ) -> Result<(), ApiError> {
        let mut last_error = None;
        for _ in 0..DELETE_PARTS_TRY_TIMES {
            let Some(host) = self.selector.select_host() else {
                return Err(ApiError::NoHost { service: "up" });
            };
            let url = format!("{}/uploads/{upload_id}", self.object_base(&host, key));

            let started = Instant::now();
            let result = self
                .client
                .inner()
                .delete(&url)
                .header(reqwest::header::AUTHORIZATION, format!("UpToken {up_token}"))
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => {
                    self.selector.reward(&host);
                    self.dot(api::DELETE_PARTS, true, started.elapsed());
                    return Ok(());
                }
                Ok(response) if response.status().is_client_error() => {
                    // Session unknown: a prior delete (or expiry) got there
                    // first.
                    self.dot(api::DELETE_PARTS, true, started.elapsed());
                    return Ok(());
                }
                Ok(response) => {
                    let err = ApiError::status(&url, response.status().as_u16());
                    let punished = self.selector.punish_if_needed(&host, &err);
                    self.dot(api::DELETE_PARTS, !punished, started.elapsed());
                    last_error = Some(err);
                }
                Err(err) => {
                    let err = ApiError::transport(&url, err);
                    let punished = self.selector.punish_if_needed(&host, &err);
                    self.dot(api::DELETE_PARTS, !punished, started.elapsed());
                    last_error = Some(err);
                }
            }
            tokio::time::sleep(self.retry_delay).await;
        }
        Err(last_error.unwrap_or(ApiError::NoHost { service: "up" }))
    }

    /// Best-effort session teardown on the failure path.
    pub(crate) async fn abort_session(&self, up_token: &str, key: Option<&str>, upload_id: &str) {
        if let Err(err) = self.delete_parts(up_token, key, upload_id).await {
            warn!(upload_id, error = %err, "failed to delete upload session");
        }
    }

    async fn put_part(
        &self,
        host: &str,
        up_token: &str,
        key: Option<&str>,
        upload_id: &str,
        part_number: usize,
        body: Bytes,
    ) -> Result<UploadPartRet, ApiError> {
        let url = format!(
            "{}/uploads/{upload_id}/{part_number}",
            self.object_base(host, key)
        );
        let response = self
            .client
            .inner()
            .put(&url)
            .header(reqwest::header::AUTHORIZATION, format!("UpToken {up_token}"))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await
            .map_err(|e| ApiError::transport(&url, e))?;
        if !response.status().is_success() {
            return Err(ApiError::status(&url, response.status().as_u16()));
        }
        response
            .json()
            .await
            .map_err(|e| ApiError::unexpected(&url, e.to_string()))
    }

    fn object_base(&self, host: &str, key: Option<&str>) -> String {
        let encoded = key.map_or_else(|| "~".to_string(), encode_key);
        format!("{host}/buckets/{}/objects/{encoded}", self.bucket)
    }

    fn dot(&self, api: &'static str, success: bool, elapsed: Duration) {
        if let Some(dotter) = &self.dotter {
            let _ = dotter.dot(DotKind::Http, api, success, elapsed);
        }
    }
}

fn record_first_error(slot: &Mutex<Option<ApiError>>, err: ApiError) {
    let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
    if slot.is_none() {
        *slot = Some(err);
    }
}

async fn sleep_cancellable(delay: Duration, cancel: &CancellationToken) -> Result<(), ApiError> {
    tokio::select! {
        () = cancel.cancelled() => Err(ApiError::Cancelled),
        () = tokio::time::sleep(delay) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_parts_exact_multiple() {
        let parts = make_parts(8 * 1024, 4 * 1024);
        assert_eq!(parts, vec![(1, 0, 4096), (2, 4096, 4096)]);
    }

    #[test]
    fn test_make_parts_with_remainder() {
        // 10 MiB at 4 MiB parts: 4 + 4 + 2.
        let mib = 1024 * 1024;
        let parts = make_parts(10 * mib, 4 * mib);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], (1, 0, (4 * mib) as usize));
        assert_eq!(parts[1], (2, 4 * mib, (4 * mib) as usize));
        assert_eq!(parts[2], (3, 8 * mib, (2 * mib) as usize));
    }

    #[test]
    fn test_make_parts_covers_source_exactly() {
        for (size, part_size) in [(1, 4096), (4096, 4096), (4097, 4096), (123_457, 4096)] {
            let parts = make_parts(size, part_size);
            let mut expected_offset = 0u64;
            for (i, (number, offset, len)) in parts.iter().enumerate() {
                assert_eq!(*number, i + 1);
                assert_eq!(*offset, expected_offset);
                expected_offset += *len as u64;
            }
            assert_eq!(expected_offset, size, "size {size} part {part_size}");
        }
    }

    #[test]
    fn test_single_part_source() {
        let parts = make_parts(100, 4096);
        assert_eq!(parts, vec![(1, 0, 100)]);
    }
}
