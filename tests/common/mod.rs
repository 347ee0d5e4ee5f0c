// Shared fakes for the integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use image::{DynamicImage, Rgba, RgbaImage};
use tokio::sync::Semaphore;

use thumbgrid_engine::config::EngineConfig;
use thumbgrid_engine::source::traits::{
    ContentRecord, ContentSource, ImageSource, OfflineStore, PageResponse,
};

pub fn test_png() -> Bytes {
    let mut buf = Vec::new();
    test_thumb(200)
        .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
        .unwrap();
    Bytes::from(buf)
}

pub fn test_thumb(shade: u8) -> DynamicImage {
    DynamicImage::ImageRgba8(RgbaImage::from_pixel(8, 8, Rgba([shade, shade, shade, 255])))
}

pub fn test_config(cache_dir: &Path) -> EngineConfig {
    EngineConfig {
        cache_dir: cache_dir.to_string_lossy().into_owned(),
        batch_sleep_ms: 1,
        heartbeat_ms: 10,
        image_url_base: "http://images.test".to_string(),
        ..EngineConfig::default()
    }
}

pub fn test_record(index: usize) -> ContentRecord {
    ContentRecord {
        id: index as i64,
        title: format!("Item {index}"),
        poster_path: Some(format!("/poster_{index}.png")),
        release_date: None,
        vote_average: 7.0,
        vote_count: 100,
    }
}

/// Image transport that answers instantly, with a switchable failure mode.
pub struct StaticImageSource {
    png: Bytes,
    fail: AtomicBool,
}

impl StaticImageSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            png: test_png(),
            fail: AtomicBool::new(false),
        })
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }
}

#[async_trait]
impl ImageSource for StaticImageSource {
    async fn fetch_image(&self, _url: &str) -> Result<Bytes> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(anyhow!("image fetch failed: HTTP 500"));
        }
        Ok(self.png.clone())
    }
}

/// Image transport that holds every fetch until a permit is released.
pub struct GatedImageSource {
    png: Bytes,
    gate: Semaphore,
}

impl GatedImageSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            png: test_png(),
            gate: Semaphore::new(0),
        })
    }

    pub fn release(&self, count: usize) {
        self.gate.add_permits(count);
    }
}

#[async_trait]
impl ImageSource for GatedImageSource {
    async fn fetch_image(&self, _url: &str) -> Result<Bytes> {
        let permit = self.gate.acquire().await.map_err(|e| anyhow!("{}", e))?;
        permit.forget();
        Ok(self.png.clone())
    }
}

/// Paged source generating `total_items` records, `page_size` per page.
pub struct FakeContentSource {
    page_size: usize,
    total_items: usize,
    fail: AtomicBool,
    delay_ms: AtomicU64,
}

impl FakeContentSource {
    pub fn new(page_size: usize, total_items: usize) -> Arc<Self> {
        Arc::new(Self {
            page_size,
            total_items,
            fail: AtomicBool::new(false),
            delay_ms: AtomicU64::new(0),
        })
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::Relaxed);
    }
}

#[async_trait]
impl ContentSource for FakeContentSource {
    async fn fetch_page(&self, page: usize) -> Result<PageResponse> {
        let delay = self.delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail.load(Ordering::Relaxed) {
            return Err(anyhow!("network down"));
        }
        let total_pages = self.total_items.div_ceil(self.page_size);
        if page == 0 || page > total_pages {
            return Err(anyhow!("page {} out of range", page));
        }
        let start = (page - 1) * self.page_size;
        let end = (start + self.page_size).min(self.total_items);
        Ok(PageResponse {
            page,
            records: (start..end).map(test_record).collect(),
            total_items: self.total_items,
            total_pages,
        })
    }

    async fn fetch_details(&self, id: i64) -> Result<ContentRecord> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(anyhow!("network down"));
        }
        Ok(test_record(id as usize))
    }
}

/// In-memory offline store.
pub struct MemoryStore {
    records: Mutex<Vec<ContentRecord>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(Vec::new()),
        })
    }

    pub fn seed(&self, records: Vec<ContentRecord>) {
        *self.records.lock().unwrap() = records;
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

#[async_trait]
impl OfflineStore for MemoryStore {
    async fn load_all(&self) -> Result<Vec<ContentRecord>> {
        Ok(self.records.lock().unwrap().clone())
    }

    async fn sync(&self, records: &[ContentRecord]) -> Result<()> {
        let mut existing = self.records.lock().unwrap();
        for record in records {
            match existing.iter_mut().find(|r| r.id == record.id) {
                Some(slot) => *slot = record.clone(),
                None => existing.push(record.clone()),
            }
        }
        Ok(())
    }
}
