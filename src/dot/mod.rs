//! Telemetry buffer ("dotter").
//!
//! Every API call records one *dot*: its outcome and latency. Dots are
//! buffered in memory, appended as JSON lines to `<cacheDir>/dot-file`
//! under a cross-process advisory lock, and periodically aggregated and
//! uploaded to a monitor host. Recording is cheap, safe from any concurrent
//! context, and never blocks on network I/O; the upload runs in a detached
//! task.
//!
//! # Storage protocol
//!
//! 1. Push the record onto the in-process buffer (mutex-guarded).
//! 2. Try a non-blocking advisory lock on `dot-file.lock`. Contended lock
//!    means another thread or process is flushing; the buffer rides along
//!    with whoever holds it.
//! 3. Under the lock, append all buffered records to `dot-file` and clear
//!    the buffer.
//! 4. If the upload interval elapsed or the file outgrew its cap, spawn the
//!    uploader and return without awaiting it.
//!
//! The uploader re-takes the file lock (skipping if contended), aggregates
//! the log by `(type, api)`, POSTs the aggregate to `/v1/stat`, and
//! truncates the log on 2xx. The upload's own outcome is recorded as a dot,
//! but strictly fire-and-forget so telemetry can never recurse into itself.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write as _};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::auth::{Signer, UploadPolicy};
use crate::client::HttpClient;
use crate::config::Config;
use crate::error::ApiError;
use crate::host::{HostSelector, HostSelectorOptions};

/// Telemetry log file name inside the cache directory.
const DOT_FILE: &str = "dot-file";

/// Advisory lock file name. The file content is never read.
const DOT_LOCK_FILE: &str = "dot-file.lock";

/// Lifetime of the token signed for a telemetry upload.
const UPLOAD_TOKEN_TTL_SECS: u64 = 10;

/// API names recorded in telemetry, one per wire operation.
pub mod api {
    pub const UC_QUERY: &str = "uc_query";
    pub const MONITOR_V1_STAT: &str = "monitor_v1_stat";
    pub const UPLOAD: &str = "upload";
    pub const INIT_PARTS: &str = "init_parts";
    pub const UPLOAD_PART: &str = "upload_part";
    pub const COMPLETE_PARTS: &str = "complete_parts";
    pub const DELETE_PARTS: &str = "delete_parts";
    pub const FORM_UPLOAD: &str = "form_upload";
    pub const DOWNLOAD_FILE: &str = "download_file";
    pub const DOWNLOAD_BYTES: &str = "download_bytes";
    pub const DOWNLOAD_RANGE: &str = "download_range";
    pub const DOWNLOAD_READER: &str = "download_reader";
    pub const STAT: &str = "stat";
    pub const BATCH_STAT: &str = "batch_stat";
    pub const COPY: &str = "copy";
    pub const MOVE: &str = "move";
    pub const DELETE: &str = "delete";
    pub const LIST: &str = "list";
}

static DOTTING_DISABLED: AtomicBool = AtomicBool::new(false);
static DOT_UPLOADING_DISABLED: AtomicBool = AtomicBool::new(false);

/// Suppresses all telemetry recording process-wide.
pub fn disable_dotting() {
    DOTTING_DISABLED.store(true, Ordering::SeqCst);
}

/// Re-enables telemetry recording.
pub fn enable_dotting() {
    DOTTING_DISABLED.store(false, Ordering::SeqCst);
}

/// Returns whether telemetry recording is enabled.
#[must_use]
pub fn is_dotting_enabled() -> bool {
    !DOTTING_DISABLED.load(Ordering::SeqCst)
}

/// Suppresses only the aggregate upload; recording continues.
pub fn disable_dot_uploading() {
    DOT_UPLOADING_DISABLED.store(true, Ordering::SeqCst);
}

/// Re-enables the aggregate upload.
pub fn enable_dot_uploading() {
    DOT_UPLOADING_DISABLED.store(false, Ordering::SeqCst);
}

/// Returns whether the aggregate upload is enabled.
#[must_use]
pub fn is_dot_uploading_enabled() -> bool {
    !DOT_UPLOADING_DISABLED.load(Ordering::SeqCst)
}

/// Which layer produced a record: a whole SDK operation or one HTTP attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DotKind {
    /// One public SDK operation, success reflecting the final outcome.
    #[serde(rename = "sdk")]
    Sdk,
    /// One HTTP attempt inside an operation.
    #[serde(rename = "http")]
    Http,
}

/// One line of the on-disk telemetry log.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LocalDotRecord {
    #[serde(rename = "t")]
    kind: DotKind,
    #[serde(rename = "a")]
    api: String,
    #[serde(rename = "f", default)]
    failed: bool,
    #[serde(rename = "e", default)]
    elapsed_ms: i64,
    #[serde(rename = "p", default)]
    punished: bool,
}

/// One aggregated group in the upload payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteDotRecord {
    #[serde(rename = "type")]
    pub kind: DotKind,
    pub api_name: String,
    pub success_count: u64,
    pub success_avg_elapsed_duration: i64,
    pub failed_count: u64,
    pub failed_avg_elapsed_duration: i64,
    pub punished_count: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct RemoteDotRecords {
    logs: Vec<RemoteDotRecord>,
}

/// Buffered, lock-protected telemetry recorder.
#[derive(Debug)]
pub struct Dotter {
    bucket: String,
    signer: Arc<dyn Signer>,
    client: HttpClient,
    selector: Arc<HostSelector>,
    cache_dir: PathBuf,
    interval: Duration,
    max_buffer_size: u64,
    tries: usize,
    buffer: Mutex<Vec<LocalDotRecord>>,
    uploaded_at: Mutex<Instant>,
    weak_self: Weak<Dotter>,
}

impl Dotter {
    /// Creates a dotter, or `None` when no monitor hosts are configured
    /// (telemetry disabled for this deployment).
    #[must_use]
    pub fn new(
        config: &Config,
        client: HttpClient,
        signer: Arc<dyn Signer>,
        cache_dir: &Path,
    ) -> Option<Arc<Self>> {
        if config.monitor_hosts.is_empty() {
            return None;
        }
        let selector = HostSelector::new(
            "monitor",
            config.monitor_hosts.clone(),
            HostSelectorOptions {
                punish_duration: config.punish_duration(),
                ..HostSelectorOptions::default()
            },
        );
        Some(Arc::new_cyclic(|weak| Self {
            bucket: config.bucket.clone(),
            signer,
            client,
            selector,
            cache_dir: cache_dir.to_path_buf(),
            interval: config.dot_interval(),
            max_buffer_size: config.max_dot_buffer_size(),
            tries: config.retry(),
            buffer: Mutex::new(Vec::new()),
            uploaded_at: Mutex::new(Instant::now()),
            weak_self: weak.clone(),
        }))
    }

    /// Records one API call outcome.
    ///
    /// Cheap and non-blocking on the network: at most one short file append
    /// happens inline, and the aggregate upload (if due) is spawned, never
    /// awaited.
    ///
    /// # Errors
    ///
    /// Returns an error only for local file failures other than lock
    /// contention; callers on the request path are expected to absorb it.
    pub fn dot(
        &self,
        kind: DotKind,
        api: &str,
        success: bool,
        elapsed: Duration,
    ) -> Result<(), ApiError> {
        self.record(LocalDotRecord {
            kind,
            api: api.to_string(),
            failed: !success,
            #[allow(clippy::cast_possible_truncation)]
            elapsed_ms: elapsed.as_millis() as i64,
            punished: false,
        })
    }

    /// Records that the selector punished a host.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Dotter::dot`].
    pub fn punish(&self) -> Result<(), ApiError> {
        self.record(LocalDotRecord {
            kind: DotKind::Sdk,
            api: String::new(),
            failed: false,
            elapsed_ms: 0,
            punished: true,
        })
    }

    fn record(&self, record: LocalDotRecord) -> Result<(), ApiError> {
        if !is_dotting_enabled() {
            return Ok(());
        }

        let mut buffer = self
            .buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        buffer.push(record);

        // Contended lock: whoever holds it will flush our buffer later.
        let Some(lock) = self.try_lock_file()? else {
            return Ok(());
        };

        let dot_path = self.cache_dir.join(DOT_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&dot_path)
            .map_err(|e| ApiError::io(&dot_path, e))?;
        for line in buffer.drain(..) {
            let encoded = serde_json::to_string(&line)
                .map_err(|e| ApiError::io(&dot_path, std::io::Error::other(e)))?;
            writeln!(file, "{encoded}").map_err(|e| ApiError::io(&dot_path, e))?;
        }
        drop(buffer);

        if self.time_to_upload() {
            self.spawn_upload();
        }

        unlock_file(&lock);
        Ok(())
    }

    fn time_to_upload(&self) -> bool {
        if !is_dotting_enabled() || !is_dot_uploading_enabled() {
            return false;
        }
        let uploaded_at = *self
            .uploaded_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if uploaded_at + self.interval <= Instant::now() {
            return true;
        }
        std::fs::metadata(self.cache_dir.join(DOT_FILE))
            .map(|m| m.len() >= self.max_buffer_size)
            .unwrap_or(false)
    }

    fn spawn_upload(&self) {
        let Some(strong) = self.weak_self.upgrade() else {
            return;
        };
        // Only spawn when a runtime is present; a sync-only caller simply
        // keeps accumulating until an async caller comes around.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { strong.upload().await });
        }
    }

    /// Aggregates the on-disk log and uploads it to a monitor host.
    ///
    /// Normally invoked by the recorder itself; exposed so embedders can
    /// force a flush at shutdown.
    pub async fn upload(self: Arc<Self>) {
        if !is_dotting_enabled() || !is_dot_uploading_enabled() {
            return;
        }
        for attempt in 0..self.tries.max(1) {
            let Some(host) = self.selector.select_host() else {
                return;
            };
            match self.upload_once(&host).await {
                Ok(()) => return,
                Err(UploadOutcome::Skip) => return,
                Err(UploadOutcome::Failed(err)) => {
                    warn!(host = %host, attempt, error = %err, "telemetry upload attempt failed");
                    self.selector.punish_if_needed(&host, &err);
                    if !err.should_retry() {
                        return;
                    }
                }
            }
        }
    }

    async fn upload_once(&self, host: &str) -> Result<(), UploadOutcome> {
        // Lock for the whole attempt: aggregation and truncation must see a
        // stable file. Contention means another process is uploading.
        let lock = match self.try_lock_file() {
            Ok(Some(lock)) => lock,
            Ok(None) | Err(_) => return Err(UploadOutcome::Skip),
        };

        let dot_path = self.cache_dir.join(DOT_FILE);
        let records = match File::open(&dot_path) {
            Ok(file) => aggregate(BufReader::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                unlock_file(&lock);
                debug!(error = %e, "telemetry log unreadable");
                return Err(UploadOutcome::Skip);
            }
        };
        if records.is_empty() {
            unlock_file(&lock);
            return Err(UploadOutcome::Skip);
        }

        let url = format!("{host}/v1/stat");
        let token = self
            .signer
            .sign_upload_policy(&UploadPolicy::for_bucket(&self.bucket, UPLOAD_TOKEN_TTL_SECS));
        let started = Instant::now();
        let result = self
            .client
            .inner()
            .post(&url)
            .header(reqwest::header::AUTHORIZATION, format!("UpToken {token}"))
            .json(&RemoteDotRecords { logs: records })
            .send()
            .await;
        let elapsed = started.elapsed();

        let outcome = match result {
            Ok(response) if response.status().is_success() => {
                // Holding the lock, so this dot only lands in the buffer.
                let _ = self.dot(DotKind::Http, api::MONITOR_V1_STAT, true, elapsed);
                let truncated = OpenOptions::new()
                    .write(true)
                    .open(&dot_path)
                    .and_then(|f| f.set_len(0));
                if let Err(e) = truncated {
                    warn!(error = %e, "failed to truncate telemetry log");
                }
                *self
                    .uploaded_at
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Instant::now();
                Ok(())
            }
            Ok(response) => {
                let _ = self.dot(DotKind::Http, api::MONITOR_V1_STAT, false, elapsed);
                Err(UploadOutcome::Failed(ApiError::status(
                    &url,
                    response.status().as_u16(),
                )))
            }
            Err(e) => {
                let _ = self.dot(DotKind::Http, api::MONITOR_V1_STAT, false, elapsed);
                Err(UploadOutcome::Failed(ApiError::transport(&url, e)))
            }
        };

        unlock_file(&lock);
        outcome
    }

    /// Opens and try-locks the advisory lock file. `Ok(None)` means the lock
    /// is held elsewhere.
    fn try_lock_file(&self) -> Result<Option<File>, ApiError> {
        let lock_path = self.cache_dir.join(DOT_LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| ApiError::io(&lock_path, e))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(file)),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(ApiError::io(&lock_path, e)),
        }
    }
}

enum UploadOutcome {
    /// Nothing to do (contended lock or empty log). Not an error.
    Skip,
    /// The upload attempt failed; retry per the usual classification.
    Failed(ApiError),
}

fn unlock_file(file: &File) {
    if let Err(e) = FileExt::unlock(file) {
        warn!(error = %e, "failed to release telemetry lock");
    }
}

/// Groups log lines by `(kind, api)`, computing counts and running averages.
fn aggregate(reader: impl BufRead) -> Vec<RemoteDotRecord> {
    let mut groups: Vec<RemoteDotRecord> = Vec::new();
    for line in reader.lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let Ok(record) = serde_json::from_str::<LocalDotRecord>(&line) else {
            // A torn write at the tail ends the usable log.
            break;
        };
        let index = match groups
            .iter()
            .position(|g| g.kind == record.kind && g.api_name == record.api)
        {
            Some(index) => index,
            None => {
                groups.push(RemoteDotRecord {
                    kind: record.kind,
                    api_name: record.api.clone(),
                    success_count: 0,
                    success_avg_elapsed_duration: 0,
                    failed_count: 0,
                    failed_avg_elapsed_duration: 0,
                    punished_count: 0,
                });
                groups.len() - 1
            }
        };
        let group = &mut groups[index];
        if record.punished {
            group.punished_count += 1;
        } else if record.failed {
            let total = i128::from(group.failed_count)
                * i128::from(group.failed_avg_elapsed_duration)
                + i128::from(record.elapsed_ms);
            group.failed_count += 1;
            #[allow(clippy::cast_possible_truncation)]
            {
                group.failed_avg_elapsed_duration =
                    (total / i128::from(group.failed_count)) as i64;
            }
        } else {
            let total = i128::from(group.success_count)
                * i128::from(group.success_avg_elapsed_duration)
                + i128::from(record.elapsed_ms);
            group.success_count += 1;
            #[allow(clippy::cast_possible_truncation)]
            {
                group.success_avg_elapsed_duration =
                    (total / i128::from(group.success_count)) as i64;
            }
        }
    }
    groups
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Cursor;

    use tempfile::TempDir;
    use url::Url;

    #[derive(Debug)]
    struct FakeSigner;

    impl Signer for FakeSigner {
        fn sign_upload_policy(&self, _policy: &UploadPolicy) -> String {
            "fake-token".to_string()
        }

        fn authorization(&self, _m: &str, _u: &Url, _b: Option<&[u8]>) -> Option<String> {
            None
        }
    }

    fn dotter_in(dir: &TempDir) -> Arc<Dotter> {
        let config = Config {
            bucket: "bkt".to_string(),
            ak: "ak".to_string(),
            sk: "sk".to_string(),
            monitor_hosts: vec!["http://monitor.invalid".to_string()],
            dot_interval_s: 3600,
            ..Config::default()
        };
        Dotter::new(
            &config,
            HttpClient::control(&config),
            Arc::new(FakeSigner),
            dir.path(),
        )
        .unwrap()
    }

    fn line(kind: DotKind, api: &str, failed: bool, elapsed_ms: i64) -> String {
        serde_json::to_string(&LocalDotRecord {
            kind,
            api: api.to_string(),
            failed,
            elapsed_ms,
            punished: false,
        })
        .unwrap()
    }

    #[test]
    fn test_no_monitor_hosts_disables_dotter() {
        let config = Config {
            bucket: "bkt".to_string(),
            ..Config::default()
        };
        let dotter = Dotter::new(
            &config,
            HttpClient::control(&config),
            Arc::new(FakeSigner),
            Path::new("/tmp"),
        );
        assert!(dotter.is_none());
    }

    #[test]
    fn test_dot_appends_one_line_per_record() {
        let dir = TempDir::new().unwrap();
        let dotter = dotter_in(&dir);

        dotter
            .dot(DotKind::Http, api::STAT, true, Duration::from_millis(12))
            .unwrap();
        dotter
            .dot(DotKind::Http, api::STAT, false, Duration::from_millis(40))
            .unwrap();

        let contents = std::fs::read_to_string(dir.path().join(DOT_FILE)).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: LocalDotRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.api, api::STAT);
        assert!(!first.failed);
        assert_eq!(first.elapsed_ms, 12);
    }

    #[test]
    fn test_dot_buffers_when_lock_contended() {
        let dir = TempDir::new().unwrap();
        let dotter = dotter_in(&dir);

        // Hold the advisory lock from "another process".
        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .open(dir.path().join(DOT_LOCK_FILE))
            .unwrap();
        lock.try_lock_exclusive().unwrap();

        dotter
            .dot(DotKind::Http, api::STAT, true, Duration::from_millis(1))
            .unwrap();
        assert!(!dir.path().join(DOT_FILE).exists());

        FileExt::unlock(&lock).unwrap();

        // Next dot flushes both.
        dotter
            .dot(DotKind::Http, api::STAT, true, Duration::from_millis(2))
            .unwrap();
        let contents = std::fs::read_to_string(dir.path().join(DOT_FILE)).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn test_aggregate_identical_dots_yields_count_and_exact_average() {
        let input = (0..5)
            .map(|_| line(DotKind::Http, "upload_part", false, 250))
            .collect::<Vec<_>>()
            .join("\n");
        let groups = aggregate(Cursor::new(input));
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].success_count, 5);
        assert_eq!(groups[0].success_avg_elapsed_duration, 250);
        assert_eq!(groups[0].failed_count, 0);
    }

    #[test]
    fn test_aggregate_splits_success_and_failure_averages() {
        let input = [
            line(DotKind::Http, "stat", false, 10),
            line(DotKind::Http, "stat", false, 30),
            line(DotKind::Http, "stat", true, 100),
        ]
        .join("\n");
        let groups = aggregate(Cursor::new(input));
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].success_count, 2);
        assert_eq!(groups[0].success_avg_elapsed_duration, 20);
        assert_eq!(groups[0].failed_count, 1);
        assert_eq!(groups[0].failed_avg_elapsed_duration, 100);
    }

    #[test]
    fn test_aggregate_counts_punished_records() {
        let punished = serde_json::to_string(&LocalDotRecord {
            kind: DotKind::Sdk,
            api: String::new(),
            failed: false,
            elapsed_ms: 0,
            punished: true,
        })
        .unwrap();
        let groups = aggregate(Cursor::new(format!("{punished}\n{punished}")));
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].punished_count, 2);
        assert_eq!(groups[0].success_count, 0);
        assert_eq!(groups[0].failed_count, 0);
    }

    #[test]
    fn test_aggregate_stops_at_torn_tail() {
        let input = format!("{}\n{{\"t\":\"http\",\"a\":", line(DotKind::Http, "stat", false, 7));
        let groups = aggregate(Cursor::new(input));
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].success_count, 1);
    }

    #[test]
    fn test_disable_dotting_suppresses_recording() {
        let dir = TempDir::new().unwrap();
        let dotter = dotter_in(&dir);

        disable_dotting();
        dotter
            .dot(DotKind::Http, api::STAT, true, Duration::from_millis(1))
            .unwrap();
        enable_dotting();

        assert!(!dir.path().join(DOT_FILE).exists());
    }

    #[test]
    fn test_remote_record_wire_shape() {
        let record = RemoteDotRecord {
            kind: DotKind::Http,
            api_name: "stat".to_string(),
            success_count: 1,
            success_avg_elapsed_duration: 5,
            failed_count: 0,
            failed_avg_elapsed_duration: 0,
            punished_count: 0,
        };
        let json = serde_json::to_value(RemoteDotRecords {
            logs: vec![record],
        })
        .unwrap();
        assert_eq!(json["logs"][0]["type"], "http");
        assert_eq!(json["logs"][0]["api_name"], "stat");
        assert_eq!(json["logs"][0]["success_count"], 1);
    }
}
