//! Metadata operations: stat, batch-stat, copy, move, delete and prefix
//! listing.
//!
//! Single-object mutations go to the rs class, prefix listing to the rsf
//! class. Every wire call is retried through the host pipeline; batch-stat
//! additionally fans its chunks out under a concurrency bound and aligns
//! per-key results back to the input order.

mod bucket;

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{instrument, warn};

pub use bucket::FileStat;
use bucket::Bucket;

use crate::auth::Signer;
use crate::client::HttpClient;
use crate::config::Config;
use crate::discovery::{DiscoveredHosts, Queryer, ServiceClass};
use crate::dot::{api, Dotter};
use crate::error::ApiError;
use crate::host::{HostSelector, HostSelectorOptions};
use crate::retry::{retry_with_hosts, with_sdk_dot};

/// Page size for prefix listing, fixed by the service.
const LIST_PAGE_LIMIT: usize = 1000;

/// Result of a batch stat: per-key results aligned to the input order.
///
/// A key belonging to a chunk whose request failed outright is `None`; a key
/// the service reported an individual failure for carries `size == -1`.
/// `first_error` is the first chunk-level failure, if any; the remaining
/// chunks still ran.
#[derive(Debug)]
pub struct BatchStats {
    pub stats: Vec<Option<FileStat>>,
    pub first_error: Option<ApiError>,
}

/// One page of a prefix listing plus its continuation marker.
#[derive(Debug, Clone)]
pub struct ListedPage {
    /// Keys on this page.
    pub keys: Vec<String>,
    /// Continuation marker; empty on the last page.
    pub marker: String,
}

/// Metadata client over the rs and rsf host pools.
#[derive(Debug)]
pub struct Lister {
    bucket: String,
    client: HttpClient,
    signer: Arc<dyn Signer>,
    rs_selector: Arc<HostSelector>,
    rsf_selector: Arc<HostSelector>,
    dotter: Option<Arc<Dotter>>,
    tries: usize,
    batch_size: usize,
    batch_concurrency: usize,
}

impl Lister {
    /// Creates a lister. With a [`Queryer`] attached, the rs and rsf pools
    /// refresh from discovery in the background.
    #[must_use]
    pub fn new(
        config: &Config,
        client: HttpClient,
        signer: Arc<dyn Signer>,
        queryer: Option<Arc<Queryer>>,
        dotter: Option<Arc<Dotter>>,
    ) -> Self {
        let rs_selector = HostSelector::new(
            "rs",
            config.rs_hosts.clone(),
            HostSelectorOptions {
                provider: queryer
                    .as_ref()
                    .map(|q| {
                        DiscoveredHosts::new(Arc::clone(q), ServiceClass::Rs, false)
                            as Arc<dyn crate::host::HostsProvider>
                    }),
                punish_duration: config.punish_duration(),
                ..HostSelectorOptions::default()
            },
        );
        let rsf_selector = HostSelector::new(
            "rsf",
            config.rsf_hosts.clone(),
            HostSelectorOptions {
                provider: queryer
                    .as_ref()
                    .map(|q| {
                        DiscoveredHosts::new(Arc::clone(q), ServiceClass::Rsf, false)
                            as Arc<dyn crate::host::HostsProvider>
                    }),
                punish_duration: config.punish_duration(),
                ..HostSelectorOptions::default()
            },
        );
        Self {
            bucket: config.bucket.clone(),
            client,
            signer,
            rs_selector,
            rsf_selector,
            dotter,
            tries: config.retry(),
            batch_size: config.batch_size(),
            batch_concurrency: config.batch_concurrency(),
        }
    }

    /// Fetches one object's metadata.
    ///
    /// # Errors
    ///
    /// Returns the final error of the last attempt; 612 (no such file) and
    /// other 4xx are terminal.
    #[instrument(skip(self))]
    pub async fn stat(&self, key: &str) -> Result<FileStat, ApiError> {
        with_sdk_dot(self.dotter.as_ref(), api::STAT, async {
            retry_with_hosts(
                &self.rs_selector,
                self.dotter.as_ref(),
                api::STAT,
                "rs",
                self.tries,
                |host| {
                    let bucket = self.bucket_on(host, String::new());
                    async move { bucket.stat(key).await }
                },
            )
            .await
        })
        .await
    }

    /// Deletes one object.
    ///
    /// # Errors
    ///
    /// Returns the final error of the last attempt.
    #[instrument(skip(self))]
    pub async fn delete(&self, key: &str) -> Result<(), ApiError> {
        with_sdk_dot(self.dotter.as_ref(), api::DELETE, async {
            retry_with_hosts(
                &self.rs_selector,
                self.dotter.as_ref(),
                api::DELETE,
                "rs",
                self.tries,
                |host| {
                    let bucket = self.bucket_on(host, String::new());
                    async move { bucket.delete(key).await }
                },
            )
            .await
        })
        .await
    }

    /// Copies an object within the bucket.
    ///
    /// # Errors
    ///
    /// Returns the final error of the last attempt.
    #[instrument(skip(self))]
    pub async fn copy(&self, from: &str, to: &str) -> Result<(), ApiError> {
        with_sdk_dot(self.dotter.as_ref(), api::COPY, async {
            retry_with_hosts(
                &self.rs_selector,
                self.dotter.as_ref(),
                api::COPY,
                "rs",
                self.tries,
                |host| {
                    let bucket = self.bucket_on(host, String::new());
                    let to_bucket = self.bucket.clone();
                    async move { bucket.copy(from, &to_bucket, to).await }
                },
            )
            .await
        })
        .await
    }

    /// Moves (renames) an object within the bucket.
    ///
    /// # Errors
    ///
    /// Returns the final error of the last attempt.
    #[instrument(skip(self))]
    pub async fn rename(&self, from: &str, to: &str) -> Result<(), ApiError> {
        let bucket = self.bucket.clone();
        self.move_to(from, &bucket, to).await
    }

    /// Moves an object into `to_bucket` under `to_key`.
    ///
    /// # Errors
    ///
    /// Returns the final error of the last attempt.
    #[instrument(skip(self))]
    pub async fn move_to(
        &self,
        from: &str,
        to_bucket: &str,
        to_key: &str,
    ) -> Result<(), ApiError> {
        with_sdk_dot(self.dotter.as_ref(), api::MOVE, async {
            retry_with_hosts(
                &self.rs_selector,
                self.dotter.as_ref(),
                api::MOVE,
                "rs",
                self.tries,
                |host| {
                    let bucket = self.bucket_on(host, String::new());
                    async move { bucket.move_entry(from, to_bucket, to_key).await }
                },
            )
            .await
        })
        .await
    }

    /// Stats many keys at once.
    ///
    /// Keys are split into chunks of at most the configured batch size
    /// (capped at 1000 by the service); chunks run concurrently under the
    /// configured bound, each retried independently. A failed chunk leaves
    /// `None` for its keys and contributes the first error, without stopping
    /// the other chunks.
    #[instrument(skip(self, keys), fields(keys = keys.len()))]
    pub async fn list_stat(&self, keys: &[String]) -> BatchStats {
        let started = std::time::Instant::now();
        let stats = Arc::new(Mutex::new(vec![None; keys.len()]));
        let first_error: Arc<Mutex<Option<ApiError>>> = Arc::new(Mutex::new(None));
        let semaphore = Arc::new(Semaphore::new(self.batch_concurrency));

        let mut workers = JoinSet::new();
        for (chunk_index, chunk) in keys.chunks(self.batch_size).enumerate() {
            let base = chunk_index * self.batch_size;
            let chunk: Vec<String> = chunk.to_vec();
            let bucket = self.bucket.clone();
            let client = self.client.clone();
            let signer = Arc::clone(&self.signer);
            let selector = Arc::clone(&self.rs_selector);
            let dotter = self.dotter.clone();
            let tries = self.tries;
            let stats = Arc::clone(&stats);
            let first_error = Arc::clone(&first_error);
            let semaphore = Arc::clone(&semaphore);

            workers.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                let result = retry_with_hosts(
                    &selector,
                    dotter.as_ref(),
                    api::BATCH_STAT,
                    "rs",
                    tries,
                    |host| {
                        let bucket =
                            Bucket::new(&bucket, host, String::new(), client.clone(), Arc::clone(&signer));
                        let chunk = chunk.clone();
                        async move { bucket.batch_stat(&chunk).await }
                    },
                )
                .await;

                match result {
                    Ok(items) => {
                        let mut stats = stats.lock().unwrap_or_else(PoisonError::into_inner);
                        for (offset, (key, item)) in chunk.iter().zip(items.iter()).enumerate() {
                            let size = if item.code == 200 {
                                item.data.as_ref().map_or(-1, |d| d.fsize)
                            } else {
                                warn!(key, code = item.code, "stat failed for key");
                                -1
                            };
                            stats[base + offset] = Some(FileStat {
                                name: key.clone(),
                                size,
                            });
                        }
                    }
                    Err(err) => {
                        let mut slot = first_error.lock().unwrap_or_else(PoisonError::into_inner);
                        if slot.is_none() {
                            *slot = Some(err);
                        }
                    }
                }
            });
        }
        while workers.join_next().await.is_some() {}

        let stats = Arc::try_unwrap(stats)
            .map(|m| m.into_inner().unwrap_or_else(PoisonError::into_inner))
            .unwrap_or_default();
        let first_error = Arc::try_unwrap(first_error)
            .map(|m| m.into_inner().unwrap_or_else(PoisonError::into_inner))
            .unwrap_or_default();

        if let Some(dotter) = &self.dotter {
            let _ = dotter.dot(
                crate::dot::DotKind::Sdk,
                api::BATCH_STAT,
                first_error.is_none(),
                started.elapsed(),
            );
        }
        BatchStats { stats, first_error }
    }

    /// Lists every key under `prefix`, following continuation markers until
    /// the service reports the end.
    ///
    /// A page fetch that fails terminally ends the walk early: whatever has
    /// been accumulated so far is returned as the listing.
    ///
    /// # Errors
    ///
    /// Currently infallible beyond the `Result` shape; kept for parity with
    /// the other operations.
    #[instrument(skip(self))]
    pub async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, ApiError> {
        with_sdk_dot(self.dotter.as_ref(), api::LIST, async {
            let mut keys = Vec::new();
            let mut marker = String::new();
            loop {
                let page = match self
                    .list_prefix_page(prefix, &marker, LIST_PAGE_LIMIT)
                    .await
                {
                    Ok(page) => page,
                    Err(err) => {
                        warn!(prefix, collected = keys.len(), error = %err, "listing cut short");
                        return Ok(keys);
                    }
                };
                keys.extend(page.keys);
                if page.marker.is_empty() {
                    return Ok(keys);
                }
                marker = page.marker;
            }
        })
        .await
    }

    /// Fetches one page of a prefix listing starting at `marker`.
    ///
    /// # Errors
    ///
    /// Returns the final error of the last attempt.
    #[instrument(skip(self))]
    pub async fn list_prefix_with_marker(
        &self,
        prefix: &str,
        marker: &str,
        limit: usize,
    ) -> Result<ListedPage, ApiError> {
        with_sdk_dot(self.dotter.as_ref(), api::LIST, async {
            self.list_prefix_page(prefix, marker, limit).await
        })
        .await
    }

    async fn list_prefix_page(
        &self,
        prefix: &str,
        marker: &str,
        limit: usize,
    ) -> Result<ListedPage, ApiError> {
        let page = retry_with_hosts(
            &self.rsf_selector,
            self.dotter.as_ref(),
            api::LIST,
            "rsf",
            self.tries,
            |host| {
                let bucket = self.bucket_on(String::new(), host);
                async move { bucket.list(prefix, marker, limit).await }
            },
        )
        .await?;
        Ok(ListedPage {
            keys: page.items.into_iter().map(|item| item.key).collect(),
            marker: page.marker.unwrap_or_default(),
        })
    }

    fn bucket_on(&self, rs_host: String, rsf_host: String) -> Bucket {
        Bucket::new(
            &self.bucket,
            rs_host,
            rsf_host,
            self.client.clone(),
            Arc::clone(&self.signer),
        )
    }
}
