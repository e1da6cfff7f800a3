//! HTTP transport wrapper.
//!
//! A thin layer over `reqwest` that pins the connect and request timeouts
//! each API family needs. Components receive an [`HttpClient`] at
//! construction, so tests and embedders can swap in their own configuration;
//! the wrapper is created once and cloned freely (connection pool is shared).

use std::time::Duration;

use reqwest::Client;

use crate::config::Config;

/// Total request timeout for discovery and telemetry calls. These carry tiny
/// payloads and must fail fast so they never stall a data operation.
pub const CONTROL_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Total request timeout for data (upload/download) calls.
pub const DATA_REQUEST_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// HTTP client with pinned timeouts.
///
/// Cloning shares the underlying connection pool.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Creates a client with explicit connect and total timeouts.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails with the static
    /// configuration. This should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .gzip(true)
            .build()
            .expect("failed to build HTTP client with static configuration");
        Self { client }
    }

    /// Creates the fast-failing client used by discovery and telemetry.
    #[must_use]
    pub fn control(config: &Config) -> Self {
        Self::new(config.dial_timeout(), CONTROL_REQUEST_TIMEOUT)
    }

    /// Creates the long-deadline client used by data transfers.
    #[must_use]
    pub fn data(config: &Config) -> Self {
        Self::new(config.dial_timeout(), DATA_REQUEST_TIMEOUT)
    }

    /// Returns the underlying reqwest client.
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }
}
