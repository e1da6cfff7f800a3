//! Client configuration.
//!
//! [`Config`] is the single immutable input every component is constructed
//! from. It is deserializable with serde so callers can load it from JSON or
//! TOML with their loader of choice; this crate never reads config files
//! itself.

use std::time::Duration;

use serde::Deserialize;

/// Minimum part size accepted by the multipart protocol (4 MiB).
pub const MIN_PART_SIZE: u64 = 4 * 1024 * 1024;

/// Default number of attempts for retried requests.
pub const DEFAULT_RETRY: usize = 10;

/// Default dial (connect) timeout in milliseconds.
const DEFAULT_DIAL_TIMEOUT_MS: u64 = 1000;

/// Default host punishment duration in seconds.
const DEFAULT_PUNISH_TIME_S: u64 = 30;

/// Default telemetry upload interval in seconds.
const DEFAULT_DOT_INTERVAL_S: u64 = 10;

/// Default telemetry buffer cap in bytes (1 MiB).
const DEFAULT_MAX_DOT_BUFFER_SIZE: u64 = 1 << 20;

/// Default number of keys per batch-stat chunk.
const DEFAULT_BATCH_SIZE: usize = 1000;

/// Default number of batch-stat chunks in flight.
const DEFAULT_BATCH_CONCURRENCY: usize = 20;

/// Default number of concurrently uploaded parts.
const DEFAULT_UP_CONCURRENCY: usize = 3;

/// Immutable client configuration.
///
/// The five initial host lists seed the per-class selectors; when `uc_hosts`
/// is non-empty the discovery resolver refreshes the other classes from it.
/// All durations are plain integers in the unit their name carries, matching
/// the service's configuration format.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Config-discovery (uc) hosts.
    #[serde(default)]
    pub uc_hosts: Vec<String>,
    /// Upload (up) hosts.
    #[serde(default)]
    pub up_hosts: Vec<String>,
    /// Download (io) hosts.
    #[serde(default)]
    pub io_hosts: Vec<String>,
    /// Metadata (rs) hosts.
    #[serde(default)]
    pub rs_hosts: Vec<String>,
    /// Prefix-listing (rsf) hosts.
    #[serde(default)]
    pub rsf_hosts: Vec<String>,
    /// Telemetry (monitor) hosts. Empty disables telemetry upload.
    #[serde(default)]
    pub monitor_hosts: Vec<String>,

    /// Bucket all operations target.
    pub bucket: String,
    /// Access key.
    pub ak: String,
    /// Secret key. Only ever handed to the injected signer.
    pub sk: String,

    /// Part size in MiB. Values below 4 are clamped up to the protocol
    /// minimum.
    #[serde(default, rename = "part")]
    pub part_size_mib: u64,
    /// Number of parts uploaded in parallel.
    #[serde(default)]
    pub up_concurrency: usize,
    /// Attempts for retried requests. Zero means the default of 10.
    #[serde(default)]
    pub retry: usize,
    /// Connect timeout in milliseconds.
    #[serde(default)]
    pub dial_timeout_ms: u64,
    /// Host punishment duration in seconds.
    #[serde(default)]
    pub punish_time_s: u64,
    /// Telemetry upload interval in seconds.
    #[serde(default)]
    pub dot_interval_s: u64,
    /// Telemetry file size that forces an upload, in bytes.
    #[serde(default)]
    pub max_dot_buffer_size: u64,
    /// Keys per batch-stat chunk (capped at 1000 by the service).
    #[serde(default)]
    pub batch_size: usize,
    /// Batch-stat chunks in flight at once.
    #[serde(default)]
    pub batch_concurrency: usize,
}

impl Config {
    /// Part size in bytes, clamped to the 4 MiB protocol minimum.
    #[must_use]
    pub fn part_size(&self) -> u64 {
        (self.part_size_mib * 1024 * 1024).max(MIN_PART_SIZE)
    }

    /// Retry attempts, defaulting to [`DEFAULT_RETRY`].
    #[must_use]
    pub fn retry(&self) -> usize {
        if self.retry == 0 { DEFAULT_RETRY } else { self.retry }
    }

    /// Connect timeout as a [`Duration`].
    #[must_use]
    pub fn dial_timeout(&self) -> Duration {
        let ms = if self.dial_timeout_ms == 0 {
            DEFAULT_DIAL_TIMEOUT_MS
        } else {
            self.dial_timeout_ms
        };
        Duration::from_millis(ms)
    }

    /// Host punishment duration.
    #[must_use]
    pub fn punish_duration(&self) -> Duration {
        let s = if self.punish_time_s == 0 {
            DEFAULT_PUNISH_TIME_S
        } else {
            self.punish_time_s
        };
        Duration::from_secs(s)
    }

    /// Telemetry upload interval.
    #[must_use]
    pub fn dot_interval(&self) -> Duration {
        let s = if self.dot_interval_s == 0 {
            DEFAULT_DOT_INTERVAL_S
        } else {
            self.dot_interval_s
        };
        Duration::from_secs(s)
    }

    /// Telemetry file size that forces an upload.
    #[must_use]
    pub fn max_dot_buffer_size(&self) -> u64 {
        if self.max_dot_buffer_size == 0 {
            DEFAULT_MAX_DOT_BUFFER_SIZE
        } else {
            self.max_dot_buffer_size
        }
    }

    /// Keys per batch-stat chunk, capped at the service limit of 1000.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        let size = if self.batch_size == 0 {
            DEFAULT_BATCH_SIZE
        } else {
            self.batch_size
        };
        size.min(1000)
    }

    /// Batch-stat chunks in flight at once.
    #[must_use]
    pub fn batch_concurrency(&self) -> usize {
        if self.batch_concurrency == 0 {
            DEFAULT_BATCH_CONCURRENCY
        } else {
            self.batch_concurrency
        }
    }

    /// Parts uploaded in parallel.
    #[must_use]
    pub fn up_concurrency(&self) -> usize {
        if self.up_concurrency == 0 {
            DEFAULT_UP_CONCURRENCY
        } else {
            self.up_concurrency
        }
    }
}
