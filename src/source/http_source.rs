use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use super::traits::{ContentRecord, ContentSource, ImageSource, PageResponse};

#[derive(Deserialize)]
struct RawPage {
    page: usize,
    results: Vec<ContentRecord>,
    total_results: usize,
    total_pages: usize,
}

/// JSON API client for the paged content listing.
pub struct ApiSource {
    client: Client,
    base_url: String,
    api_key: String,
}

impl ApiSource {
    pub fn new(base_url: String, api_key: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }
}

#[async_trait]
impl ContentSource for ApiSource {
    async fn fetch_page(&self, page: usize) -> Result<PageResponse> {
        let url = format!(
            "{}/popular?api_key={}&page={}",
            self.base_url, self.api_key, page
        );
        let resp = self.client.get(&url).send().await?;

        let status = resp.status();
        if !status.is_success() {
            warn!("page fetch failed status={} page={}", status.as_u16(), page);
            return Err(anyhow!("fetch_page failed: HTTP {}", status.as_u16()));
        }

        let raw: RawPage = resp.json().await?;
        debug!("page {} fetched, {} records", raw.page, raw.results.len());
        Ok(PageResponse {
            page: raw.page,
            records: raw.results,
            total_items: raw.total_results,
            total_pages: raw.total_pages,
        })
    }

    async fn fetch_details(&self, id: i64) -> Result<ContentRecord> {
        let url = format!("{}/{}?api_key={}", self.base_url, id, self.api_key);
        let resp = self.client.get(&url).send().await?;

        let status = resp.status();
        if !status.is_success() {
            warn!("details fetch failed status={} id={}", status.as_u16(), id);
            return Err(anyhow!("fetch_details failed: HTTP {}", status.as_u16()));
        }

        Ok(resp.json().await?)
    }
}

/// One-attempt image transport. Non-2xx statuses and connection errors are
/// equivalent failures; retry policy lives with the caller.
pub struct HttpImageSource {
    client: Client,
}

impl HttpImageSource {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ImageSource for HttpImageSource {
    async fn fetch_image(&self, url: &str) -> Result<Bytes> {
        let resp = self.client.get(url).send().await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("image fetch failed: HTTP {}", status.as_u16()));
        }

        Ok(resp.bytes().await?)
    }
}
