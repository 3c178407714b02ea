// src/pipeline/fetch.rs
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};

use super::error::{FetchError, PipelineError};
use super::types::Thumbnail;

/// Turns a URL into a decoded thumbnail. Called from worker threads only.
pub trait Fetcher: Send + Sync {
    fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError>;

    fn decode(&self, bytes: &[u8]) -> Result<Thumbnail, FetchError> {
        Thumbnail::decode(bytes, None)
    }

    fn fetch(&self, url: &str) -> Result<Thumbnail, FetchError> {
        let bytes = self.fetch_bytes(url)?;
        self.decode(&bytes).map_err(|e| e.with_url(url))
    }
}

/// Blocking HTTP fetcher sharing one pooled client between both workers.
pub struct HttpFetcher {
    client: Client,
    max_width: Option<u32>,
}

impl HttpFetcher {
    pub fn new(
        user_agent: &str,
        timeout: Duration,
        max_width: Option<u32>,
    ) -> Result<Self, PipelineError> {
        let client = Client::builder()
            .user_agent(user_agent.to_string())
            .timeout(timeout)
            .pool_max_idle_per_host(4)
            .default_headers({
                let mut h = HeaderMap::new();
                h.insert(
                    ACCEPT,
                    HeaderValue::from_static("image/avif,image/webp,image/*;q=0.8,*/*;q=0.5"),
                );
                h
            })
            .build()?;
        Ok(Self { client, max_width })
    }

    pub fn from_config(cfg: &crate::config::AppConfig) -> Result<Self, PipelineError> {
        Self::new(
            &cfg.user_agent,
            Duration::from_secs(cfg.http_timeout_secs),
            cfg.max_thumbnail_width,
        )
    }
}

impl Fetcher for HttpFetcher {
    fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let resp = self
            .client
            .get(url)
            .send()
            .map_err(|e| FetchError::Transfer {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let body = resp.bytes().map_err(|e| FetchError::Transfer {
            url: url.to_string(),
            reason: format!("read body: {e}"),
        })?;
        if body.is_empty() {
            return Err(FetchError::EmptyBody {
                url: url.to_string(),
            });
        }
        Ok(body.to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Thumbnail, FetchError> {
        Thumbnail::decode(bytes, self.max_width)
    }
}
