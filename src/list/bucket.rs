//! Wire handle for the metadata (rs) and listing (rsf) endpoints.
//!
//! A [`Bucket`] is bound to one rs host and one rsf host for the duration of
//! a single attempt; the retrying caller builds a fresh handle per attempt
//! with freshly selected hosts.

use std::sync::Arc;

use serde::Deserialize;
use url::Url;

use crate::auth::Signer;
use crate::client::HttpClient;
use crate::encode::encode_entry;
use crate::error::ApiError;

/// Object metadata returned by stat operations.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileStat {
    /// Object key.
    #[serde(default)]
    pub name: String,
    /// Object size in bytes. `-1` marks a per-key failure in batch results.
    #[serde(rename = "fsize", default)]
    pub size: i64,
}

/// One entry of a batch response.
#[derive(Debug, Deserialize)]
pub(crate) struct BatchItem {
    pub code: u16,
    #[serde(default)]
    pub data: Option<BatchItemData>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct BatchItemData {
    #[serde(rename = "fsize", default)]
    pub fsize: i64,
}

/// One page of a prefix listing.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ListPage {
    /// Continuation marker; absent or empty on the last page.
    #[serde(default)]
    pub marker: Option<String>,
    #[serde(default)]
    pub items: Vec<ListPageItem>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListPageItem {
    pub key: String,
}

/// Single-attempt handle over one rs host (and optionally one rsf host).
#[derive(Debug)]
pub(crate) struct Bucket {
    bucket: String,
    rs_host: String,
    rsf_host: String,
    client: HttpClient,
    signer: Arc<dyn Signer>,
}

impl Bucket {
    pub(crate) fn new(
        bucket: &str,
        rs_host: String,
        rsf_host: String,
        client: HttpClient,
        signer: Arc<dyn Signer>,
    ) -> Self {
        Self {
            bucket: bucket.to_string(),
            rs_host,
            rsf_host,
            client,
            signer,
        }
    }

    pub(crate) async fn stat(&self, key: &str) -> Result<FileStat, ApiError> {
        let url = format!(
            "{}/stat/{}",
            self.rs_host,
            encode_entry(&self.bucket, key)
        );
        let mut stat: FileStat = self.call_json("GET", &url, None).await?;
        stat.name = key.to_string();
        Ok(stat)
    }

    pub(crate) async fn delete(&self, key: &str) -> Result<(), ApiError> {
        let url = format!(
            "{}/delete/{}",
            self.rs_host,
            encode_entry(&self.bucket, key)
        );
        self.call_empty("POST", &url, None).await
    }

    pub(crate) async fn copy(&self, from: &str, to_bucket: &str, to: &str) -> Result<(), ApiError> {
        let url = format!(
            "{}/copy/{}/{}",
            self.rs_host,
            encode_entry(&self.bucket, from),
            encode_entry(to_bucket, to)
        );
        self.call_empty("POST", &url, None).await
    }

    pub(crate) async fn move_entry(
        &self,
        from: &str,
        to_bucket: &str,
        to: &str,
    ) -> Result<(), ApiError> {
        let url = format!(
            "{}/move/{}/{}",
            self.rs_host,
            encode_entry(&self.bucket, from),
            encode_entry(to_bucket, to)
        );
        self.call_empty("POST", &url, None).await
    }

    pub(crate) async fn batch_stat(&self, keys: &[String]) -> Result<Vec<BatchItem>, ApiError> {
        let body = keys
            .iter()
            .map(|key| format!("op=/stat/{}", encode_entry(&self.bucket, key)))
            .collect::<Vec<_>>()
            .join("&");
        let url = format!("{}/batch", self.rs_host);
        let request_url = parse_url(&url)?;
        let mut request = self
            .client
            .inner()
            .post(&url)
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .body(body.clone());
        if let Some(authorization) =
            self.signer
                .authorization("POST", &request_url, Some(body.as_bytes()))
        {
            request = request.header(reqwest::header::AUTHORIZATION, authorization);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ApiError::transport(&url, e))?;
        // 298 flags partial failure but still carries the per-key array.
        if !response.status().is_success() {
            return Err(ApiError::status(&url, response.status().as_u16()));
        }
        response
            .json()
            .await
            .map_err(|e| ApiError::unexpected(&url, e.to_string()))
    }

    pub(crate) async fn list(
        &self,
        prefix: &str,
        marker: &str,
        limit: usize,
    ) -> Result<ListPage, ApiError> {
        let url = format!(
            "{}/list?bucket={}&prefix={}&marker={}&limit={limit}",
            self.rsf_host,
            urlencoding::encode(&self.bucket),
            urlencoding::encode(prefix),
            urlencoding::encode(marker)
        );
        self.call_json("GET", &url, None).await
    }

    async fn call_json<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        url: &str,
        body: Option<&[u8]>,
    ) -> Result<T, ApiError> {
        let response = self.send(method, url, body).await?;
        response
            .json()
            .await
            .map_err(|e| ApiError::unexpected(url, e.to_string()))
    }

    async fn call_empty(
        &self,
        method: &str,
        url: &str,
        body: Option<&[u8]>,
    ) -> Result<(), ApiError> {
        self.send(method, url, body).await.map(|_| ())
    }

    async fn send(
        &self,
        method: &str,
        url: &str,
        body: Option<&[u8]>,
    ) -> Result<reqwest::Response, ApiError> {
        let request_url = parse_url(url)?;
        let mut request = match method {
            "POST" => self.client.inner().post(url),
            _ => self.client.inner().get(url),
        };
        if let Some(bytes) = body {
            request = request.body(bytes.to_vec());
        }
        if let Some(authorization) = self.signer.authorization(method, &request_url, body) {
            request = request.header(reqwest::header::AUTHORIZATION, authorization);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ApiError::transport(url, e))?;
        if !response.status().is_success() {
            return Err(ApiError::status(url, response.status().as_u16()));
        }
        Ok(response)
    }
}

fn parse_url(url: &str) -> Result<Url, ApiError> {
    Url::parse(url).map_err(|_| ApiError::invalid_input(format!("invalid URL: {url}")))
}
