use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One content record as served by the upstream source. Two records may share
/// the same poster path; it is content-derived, not unique per index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentRecord {
    pub id: i64,
    pub title: String,
    pub poster_path: Option<String>,
    pub release_date: Option<String>,
    #[serde(default)]
    pub vote_average: f64,
    #[serde(default)]
    pub vote_count: i64,
}

impl ContentRecord {
    /// Key used for the result table and disk cache. Absent when the record
    /// has no poster.
    pub fn content_key(&self) -> Option<&str> {
        self.poster_path.as_deref()
    }

    pub fn image_url(&self, base: &str) -> Option<String> {
        self.poster_path
            .as_ref()
            .map(|path| format!("{}{}", base, path))
    }
}

/// One page of records plus the collection totals the pager needs.
#[derive(Debug, Clone)]
pub struct PageResponse {
    pub page: usize,
    pub records: Vec<ContentRecord>,
    pub total_items: usize,
    pub total_pages: usize,
}

#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn fetch_page(&self, page: usize) -> Result<PageResponse>;
    async fn fetch_details(&self, id: i64) -> Result<ContentRecord>;
}

/// Persistent fallback used when the network has nothing to offer.
#[async_trait]
pub trait OfflineStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<ContentRecord>>;
    async fn sync(&self, records: &[ContentRecord]) -> Result<()>;
}

/// Transport for image bytes. One attempt; any error is a failed fetch.
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn fetch_image(&self, url: &str) -> Result<Bytes>;
}
