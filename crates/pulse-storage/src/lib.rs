//! HTTP fetch and warehouse persistence for Pulse.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

mod memory;
mod postgres;
mod warehouse;

pub use memory::MemoryWarehouse;
pub use postgres::{build_upsert, ColumnTypes, PgWarehouse, SqlStatement};
pub use warehouse::{normalize_text, UpsertOutcome, Warehouse, WarehouseError};

pub const CRATE_NAME: &str = "pulse-storage";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response from {url} is not valid JSON: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("unexpected payload from {url}: {reason}")]
    Malformed { url: String, reason: String },
}

/// A single GET against a JSON API.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JsonRequest {
    pub source_id: String,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub bearer_token: Option<String>,
}

impl JsonRequest {
    pub fn new(source_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_query(mut self, query: Vec<(String, String)>) -> Self {
        self.query = query;
        self
    }

    pub fn with_bearer(mut self, token: Option<String>) -> Self {
        self.bearer_token = token;
        self
    }
}

/// Seam between page sources and the network.
#[async_trait]
pub trait JsonTransport: Send + Sync {
    async fn get_json(&self, request: &JsonRequest) -> Result<JsonValue, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

/// reqwest-backed transport. One attempt per request; failures surface to the caller.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_bytes(&self, request: &JsonRequest) -> Result<(String, Vec<u8>), FetchError> {
        let mut builder = self.client.get(&request.url).query(&request.query);
        if let Some(token) = &request.bearer_token {
            builder = builder.bearer_auth(token);
        }

        let resp = builder
            .send()
            .await
            .map_err(|err| FetchError::Request(err.without_url()))?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: redact_query(&final_url),
            });
        }
        let body = resp
            .bytes()
            .await
            .map_err(|err| FetchError::Request(err.without_url()))?
            .to_vec();
        Ok((final_url, body))
    }
}

#[async_trait]
impl JsonTransport for HttpFetcher {
    async fn get_json(&self, request: &JsonRequest) -> Result<JsonValue, FetchError> {
        let span = info_span!("http_fetch", source_id = %request.source_id, url = %redact_query(&request.url));
        async {
            let (final_url, body) = self.fetch_bytes(request).await?;
            debug!(bytes = body.len(), "fetched page");

            // Lossy decode keeps one text encoding even when an API mixes in invalid bytes.
            let text = String::from_utf8_lossy(&body);
            serde_json::from_str(&text).map_err(|source| FetchError::Decode {
                url: redact_query(&final_url),
                source,
            })
        }
        .instrument(span)
        .await
    }
}

/// Drops the query string so access tokens never reach logs or error messages.
pub fn redact_query(url: &str) -> String {
    match url.split_once('?') {
        Some((base, _)) => format!("{base}?…"),
        None => url.to_string(),
    }
}
