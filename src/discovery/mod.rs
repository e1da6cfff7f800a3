//! Cached host discovery.
//!
//! The bootstrap (uc) service maps `(access key, bucket)` to the current
//! endpoint lists for the up/io/rs/rsf classes via `GET /v4/query`. Results
//! are cached process-wide with the TTL the service assigns, persisted to
//! `<cacheDir>/query-cache.json` so cold starts survive a discovery outage,
//! and refreshed asynchronously once stale: a hit past its expiry is served
//! immediately while a single-flight refresh runs in the background.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, PoisonError, RwLock, Weak};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::client::HttpClient;
use crate::config::Config;
use crate::dot::api;
use crate::error::ApiError;
use crate::host::{HostSelector, HostSelectorOptions, HostsProvider};
use crate::retry::retry_with_hosts;

/// Persisted cache file name inside the cache directory.
const CACHE_FILE: &str = "query-cache.json";

/// Process-wide cache: `"<bucket>:<ak>"` to the discovered hosts.
static CACHE: LazyLock<DashMap<String, CacheEntry>> = LazyLock::new(DashMap::new);

/// Directory holding `query-cache.json` (and the telemetry files).
static CACHE_DIR: LazyLock<RwLock<PathBuf>> =
    LazyLock::new(|| RwLock::new(std::env::temp_dir().join("objsync-cache")));

/// Serialises cache fills and refreshes (single-flight).
static REFRESH_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

/// At most one persist operation at a time; overlapping saves are dropped,
/// not queued, to avoid torn files.
static PERSISTING: AtomicBool = AtomicBool::new(false);

/// Domain list for one service class, as returned by the query endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceDomains {
    /// Bare domains or full URLs.
    #[serde(default)]
    pub domains: Vec<String>,
}

/// One host entry of a query response, with its TTL in seconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveredHostSet {
    #[serde(default)]
    pub ttl: i64,
    #[serde(default)]
    pub up: ServiceDomains,
    #[serde(default)]
    pub io: ServiceDomains,
    #[serde(default)]
    pub rs: ServiceDomains,
    #[serde(default)]
    pub rsf: ServiceDomains,
}

/// Body of `GET /v4/query`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    hosts: Vec<DiscoveredHostSet>,
}

/// One cached (and persisted) discovery result.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    hosts: QueryResponse,
    expired_at: DateTime<Utc>,
}

/// Resolver for the discovery service.
///
/// Cheap to clone through its `Arc`; all instances for the same
/// `(bucket, ak)` share the process-wide cache.
#[derive(Debug)]
pub struct Queryer {
    ak: String,
    bucket: String,
    tries: usize,
    uc_selector: Arc<HostSelector>,
    client: HttpClient,
    weak_self: Weak<Queryer>,
}

impl Queryer {
    /// Creates a resolver over the configured uc hosts.
    #[must_use]
    pub fn new(config: &Config, client: HttpClient) -> Arc<Self> {
        let uc_selector = HostSelector::new(
            "uc",
            config.uc_hosts.clone(),
            HostSelectorOptions {
                punish_duration: config.punish_duration(),
                ..HostSelectorOptions::default()
            },
        );
        Arc::new_cyclic(|weak| Self {
            ak: config.ak.clone(),
            bucket: config.bucket.clone(),
            tries: config.retry(),
            uc_selector,
            client,
            weak_self: weak.clone(),
        })
    }

    /// Current upload hosts as URLs, empty when discovery has nothing.
    pub async fn query_up_hosts(&self, https: bool) -> Vec<String> {
        self.query_domains(https, |set| &set.up).await
    }

    /// Current download hosts as URLs, empty when discovery has nothing.
    pub async fn query_io_hosts(&self, https: bool) -> Vec<String> {
        self.query_domains(https, |set| &set.io).await
    }

    /// Current metadata hosts as URLs, empty when discovery has nothing.
    pub async fn query_rs_hosts(&self, https: bool) -> Vec<String> {
        self.query_domains(https, |set| &set.rs).await
    }

    /// Current listing hosts as URLs, empty when discovery has nothing.
    pub async fn query_rsf_hosts(&self, https: bool) -> Vec<String> {
        self.query_domains(https, |set| &set.rsf).await
    }

    async fn query_domains(
        &self,
        https: bool,
        pick: fn(&DiscoveredHostSet) -> &ServiceDomains,
    ) -> Vec<String> {
        match self.query().await {
            Ok(entry) => entry
                .hosts
                .hosts
                .first()
                .map(|set| domains_to_urls(https, &pick(set).domains))
                .unwrap_or_default(),
            Err(err) => {
                debug!(error = %err, "host discovery unavailable");
                Vec::new()
            }
        }
    }

    /// Returns the cached entry, filling the cache on a miss. A stale hit is
    /// returned as-is with a background refresh kicked off.
    async fn query(&self) -> Result<CacheEntry, ApiError> {
        let key = self.cache_key();
        if let Some(entry) = CACHE.get(&key) {
            let entry = entry.clone();
            if entry.expired_at <= Utc::now() {
                self.spawn_refresh();
            }
            return Ok(entry);
        }

        let _guard = REFRESH_LOCK.lock().await;
        if let Some(entry) = CACHE.get(&key) {
            return Ok(entry.clone());
        }
        let entry = self.must_query().await?;
        CACHE.insert(key, entry.clone());
        if let Err(err) = save_cache() {
            warn!(error = %err, "failed to persist discovery cache");
        }
        Ok(entry)
    }

    fn spawn_refresh(&self) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        handle.spawn(async move {
            let _guard = REFRESH_LOCK.lock().await;
            let key = this.cache_key();
            let still_stale = CACHE
                .get(&key)
                .is_none_or(|entry| entry.expired_at <= Utc::now());
            if !still_stale {
                return;
            }
            match this.must_query().await {
                Ok(entry) => {
                    CACHE.insert(key, entry);
                    if let Err(err) = save_cache() {
                        warn!(error = %err, "failed to persist discovery cache");
                    }
                }
                Err(err) => warn!(error = %err, "discovery refresh failed"),
            }
        });
    }

    /// Queries the service, retried over the uc pool.
    async fn must_query(&self) -> Result<CacheEntry, ApiError> {
        let ak = self.ak.clone();
        let bucket = self.bucket.clone();
        let client = self.client.clone();
        retry_with_hosts(
            &self.uc_selector,
            None,
            api::UC_QUERY,
            "uc",
            self.tries,
            move |host| {
                let ak = ak.clone();
                let bucket = bucket.clone();
                let client = client.clone();
                async move {
                    let url = format!(
                        "{host}/v4/query?ak={}&bucket={}",
                        urlencoding::encode(&ak),
                        urlencoding::encode(&bucket)
                    );
                    let response = client
                        .inner()
                        .get(&url)
                        .send()
                        .await
                        .map_err(|e| ApiError::transport(&url, e))?;
                    if !response.status().is_success() {
                        return Err(ApiError::status(&url, response.status().as_u16()));
                    }
                    let hosts: QueryResponse = response
                        .json()
                        .await
                        .map_err(|e| ApiError::unexpected(&url, e.to_string()))?;
                    if hosts.hosts.is_empty() {
                        // Terminal: a well-formed empty answer will not
                        // improve on retry.
                        return Err(ApiError::unexpected(&url, "query returned no hosts"));
                    }
                    let min_ttl = hosts.hosts.iter().map(|set| set.ttl).min().unwrap_or(0);
                    Ok(CacheEntry {
                        hosts,
                        expired_at: Utc::now() + TimeDelta::seconds(min_ttl),
                    })
                }
            },
        )
        .await
    }

    fn cache_key(&self) -> String {
        format!("{}:{}", self.bucket, self.ak)
    }
}

/// Formats bare domains as URLs, passing full URLs through untouched.
fn domains_to_urls(https: bool, domains: &[String]) -> Vec<String> {
    domains
        .iter()
        .map(|domain| {
            if domain.contains("://") {
                domain.clone()
            } else if https {
                format!("https://{domain}")
            } else {
                format!("http://{domain}")
            }
        })
        .collect()
}

/// The directory holding the persisted cache and the telemetry files.
#[must_use]
pub fn cache_directory() -> PathBuf {
    CACHE_DIR
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Replaces the cache directory, clears the in-memory cache and reloads it
/// from the new location.
///
/// # Errors
///
/// Returns the IO error of an unreadable or undecodable cache file; a
/// missing file is not an error.
pub fn set_cache_directory_and_load(dir: impl Into<PathBuf>) -> std::io::Result<()> {
    *CACHE_DIR.write().unwrap_or_else(PoisonError::into_inner) = dir.into();
    CACHE.clear();
    load_cache()
}

fn cache_file_path() -> PathBuf {
    cache_directory().join(CACHE_FILE)
}

fn load_cache() -> std::io::Result<()> {
    let path = cache_file_path();
    let data = match std::fs::read(&path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    let map: HashMap<String, CacheEntry> =
        serde_json::from_slice(&data).map_err(std::io::Error::other)?;
    for (key, entry) in map {
        CACHE.insert(key, entry);
    }
    Ok(())
}

fn save_cache() -> std::io::Result<()> {
    let dir = cache_directory();
    std::fs::create_dir_all(&dir)?;

    if PERSISTING
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Ok(());
    }
    let result = write_cache_file(&dir);
    PERSISTING.store(false, Ordering::SeqCst);
    result
}

fn write_cache_file(dir: &Path) -> std::io::Result<()> {
    let map: HashMap<String, CacheEntry> = CACHE
        .iter()
        .map(|entry| (entry.key().clone(), entry.value().clone()))
        .collect();
    let bytes = serde_json::to_vec(&map).map_err(std::io::Error::other)?;
    std::fs::write(dir.join(CACHE_FILE), bytes)
}

/// Service classes a selector can be refreshed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceClass {
    Up,
    Io,
    Rs,
    Rsf,
}

/// Adapts a [`Queryer`] into the selector's refresh seam for one class.
#[derive(Debug)]
pub struct DiscoveredHosts {
    queryer: Arc<Queryer>,
    class: ServiceClass,
    https: bool,
}

impl DiscoveredHosts {
    #[must_use]
    pub fn new(queryer: Arc<Queryer>, class: ServiceClass, https: bool) -> Arc<Self> {
        Arc::new(Self {
            queryer,
            class,
            https,
        })
    }
}

#[async_trait]
impl HostsProvider for DiscoveredHosts {
    async fn fetch_hosts(&self) -> Option<Vec<String>> {
        let hosts = match self.class {
            ServiceClass::Up => self.queryer.query_up_hosts(self.https).await,
            ServiceClass::Io => self.queryer.query_io_hosts(self.https).await,
            ServiceClass::Rs => self.queryer.query_rs_hosts(self.https).await,
            ServiceClass::Rsf => self.queryer.query_rsf_hosts(self.https).await,
        };
        if hosts.is_empty() { None } else { Some(hosts) }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use tempfile::TempDir;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    // The cache is process-wide; tests touching it must not interleave.
    static CACHE_TEST_LOCK: Mutex<()> = Mutex::new(());

    fn config_with_uc(uc: Vec<String>, bucket: &str) -> Config {
        Config {
            uc_hosts: uc,
            bucket: bucket.to_string(),
            ak: "test-ak".to_string(),
            sk: "test-sk".to_string(),
            retry: 2,
            ..Config::default()
        }
    }

    fn query_body(ttl: i64) -> serde_json::Value {
        serde_json::json!({
            "hosts": [{
                "ttl": ttl,
                "up": {"domains": ["up1.example.com", "https://up2.example.com"]},
                "io": {"domains": ["io1.example.com"]},
                "rs": {"domains": ["rs1.example.com"]},
                "rsf": {"domains": ["rsf1.example.com"]}
            }]
        })
    }

    #[test]
    fn test_domains_to_urls_prefixes_scheme() {
        let urls = domains_to_urls(
            false,
            &[
                "up.example.com".to_string(),
                "https://cdn.example.com".to_string(),
            ],
        );
        assert_eq!(urls[0], "http://up.example.com");
        assert_eq!(urls[1], "https://cdn.example.com");

        let urls = domains_to_urls(true, &["up.example.com".to_string()]);
        assert_eq!(urls[0], "https://up.example.com");
    }

    #[tokio::test]
    async fn test_query_caches_and_formats_urls() {
        let _lock = CACHE_TEST_LOCK.lock().unwrap();
        let dir = TempDir::new().unwrap();
        set_cache_directory_and_load(dir.path()).unwrap();

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v4/query"))
            .and(query_param("ak", "test-ak"))
            .and(query_param("bucket", "bkt-cache"))
            .respond_with(ResponseTemplate::new(200).set_body_json(query_body(3600)))
            .expect(1)
            .mount(&server)
            .await;

        let config = config_with_uc(vec![server.uri()], "bkt-cache");
        let queryer = Queryer::new(&config, HttpClient::control(&config));

        let up = queryer.query_up_hosts(false).await;
        assert_eq!(
            up,
            vec![
                "http://up1.example.com".to_string(),
                "https://up2.example.com".to_string()
            ]
        );

        // Second call is served from cache (mock expects exactly one hit).
        let io = queryer.query_io_hosts(false).await;
        assert_eq!(io, vec!["http://io1.example.com".to_string()]);
    }

    #[tokio::test]
    async fn test_cache_survives_reload_from_disk() {
        let _lock = CACHE_TEST_LOCK.lock().unwrap();
        let dir = TempDir::new().unwrap();
        set_cache_directory_and_load(dir.path()).unwrap();

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v4/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(query_body(3600)))
            .expect(1)
            .mount(&server)
            .await;

        let config = config_with_uc(vec![server.uri()], "bkt-persist");
        let queryer = Queryer::new(&config, HttpClient::control(&config));
        let first = queryer.query_rs_hosts(false).await;
        assert!(!first.is_empty());
        assert!(dir.path().join(CACHE_FILE).exists());

        // Simulate a restart: clear memory, reload from the same directory.
        set_cache_directory_and_load(dir.path()).unwrap();

        // The server is gone now; the answer must come from the reloaded
        // cache.
        drop(server);
        let reloaded = queryer.query_rs_hosts(false).await;
        assert_eq!(reloaded, first);
    }

    #[tokio::test]
    async fn test_stale_entry_served_then_refreshed() {
        let _lock = CACHE_TEST_LOCK.lock().unwrap();
        let dir = TempDir::new().unwrap();
        set_cache_directory_and_load(dir.path()).unwrap();

        let server = MockServer::start().await;
        // TTL 0: immediately stale.
        Mock::given(method("GET"))
            .and(path("/v4/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(query_body(0)))
            .mount(&server)
            .await;

        let config = config_with_uc(vec![server.uri()], "bkt-stale");
        let queryer = Queryer::new(&config, HttpClient::control(&config));

        // Miss fills the cache; the stale hit afterwards still answers.
        assert!(!queryer.query_up_hosts(false).await.is_empty());
        assert!(!queryer.query_up_hosts(false).await.is_empty());

        // Give the background refresh a moment to land.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let requests = server.received_requests().await.unwrap();
        assert!(requests.len() >= 2, "stale hit should trigger a refresh");
    }

    #[tokio::test]
    async fn test_empty_host_answer_is_terminal() {
        let _lock = CACHE_TEST_LOCK.lock().unwrap();
        let dir = TempDir::new().unwrap();
        set_cache_directory_and_load(dir.path()).unwrap();

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v4/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"hosts": []})))
            .expect(1)
            .mount(&server)
            .await;

        let config = config_with_uc(vec![server.uri()], "bkt-empty");
        let queryer = Queryer::new(&config, HttpClient::control(&config));
        // One request only: the empty answer must not be retried.
        assert!(queryer.query_up_hosts(false).await.is_empty());
    }
}
