use std::sync::Arc;
use std::time::Duration;

use image::{DynamicImage, Rgba, RgbaImage};

use thumbgrid_engine::engine::cache::{ImageCache, KeyIndex};

fn thumb(shade: u8) -> DynamicImage {
    DynamicImage::ImageRgba8(RgbaImage::from_pixel(6, 6, Rgba([shade, shade, shade, 255])))
}

fn ki(key: &str, index: usize) -> KeyIndex {
    KeyIndex {
        key: key.to_string(),
        index,
    }
}

#[tokio::test]
async fn test_put_and_get_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(ImageCache::new("round", dir.path(), 64));

    cache.put(&thumb(10), "/a.png").await;

    let got = cache.get(&ki("/a.png", 0)).await.expect("cache hit");
    assert_eq!(got.to_rgba8().into_raw(), thumb(10).to_rgba8().into_raw());
    assert!(cache.get(&ki("/missing.png", 1)).await.is_none());
}

#[tokio::test]
async fn test_slots_are_allocated_densely() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(ImageCache::new("dense", dir.path(), 64));

    cache.put(&thumb(1), "/a.png").await;
    cache.put(&thumb(2), "/b.png").await;
    cache.put(&thumb(3), "/c.png").await;

    assert_eq!(cache.slot_for("/a.png"), Some(1));
    assert_eq!(cache.slot_for("/b.png"), Some(2));
    assert_eq!(cache.slot_for("/c.png"), Some(3));

    // Rewriting an existing key keeps its slot.
    cache.put(&thumb(9), "/b.png").await;
    assert_eq!(cache.slot_for("/b.png"), Some(2));
    assert_eq!(cache.entry_count(), 3);
}

#[tokio::test]
async fn test_batch_get_returns_only_hits() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(ImageCache::new("batch", dir.path(), 64));

    for i in 0..6usize {
        cache.put(&thumb(i as u8), &format!("/hit_{i}.png")).await;
    }

    let mut lookups: Vec<KeyIndex> = (0..6).map(|i| ki(&format!("/hit_{i}.png"), i)).collect();
    for i in 6..10 {
        lookups.push(ki(&format!("/miss_{i}.png"), i));
    }

    let found = cache.get_batch(&lookups).await;
    assert_eq!(found.len(), 6);
    for i in 0..6usize {
        let got = found.get(&i).expect("hit present");
        assert_eq!(
            got.to_rgba8().into_raw(),
            thumb(i as u8).to_rgba8().into_raw()
        );
    }
}

#[tokio::test]
async fn test_disabled_cache_reports_absence() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(ImageCache::new("off", dir.path(), 64));

    cache.put(&thumb(5), "/kept.png").await;
    cache.set_disabled(true);

    cache.put(&thumb(6), "/dropped.png").await;
    assert_eq!(cache.entry_count(), 1);
    assert!(cache.get(&ki("/kept.png", 0)).await.is_none());
    assert!(cache.get_batch(&[ki("/kept.png", 0)]).await.is_empty());

    cache.set_disabled(false);
    assert!(cache.get(&ki("/kept.png", 0)).await.is_some());
}

#[tokio::test]
async fn test_purge_empties_index() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(ImageCache::new("purge", dir.path(), 64));

    cache.put(&thumb(1), "/a.png").await;
    cache.put(&thumb(2), "/b.png").await;
    cache.purge().await;

    assert_eq!(cache.entry_count(), 0);
    assert!(cache.get(&ki("/a.png", 0)).await.is_none());

    // Freed slots are handed out again from the bottom.
    cache.put(&thumb(3), "/c.png").await;
    assert_eq!(cache.slot_for("/c.png"), Some(1));
}

#[tokio::test]
async fn test_index_persists_across_instances() {
    let dir = tempfile::tempdir().unwrap();
    {
        let cache = Arc::new(
            ImageCache::new("persist", dir.path(), 64)
                .with_save_cooldown(Duration::from_millis(10)),
        );
        cache.put(&thumb(1), "/a.png").await;
        cache.put(&thumb(2), "/b.png").await;
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let reloaded = Arc::new(ImageCache::new("persist", dir.path(), 64));
    assert_eq!(reloaded.entry_count(), 0);
    reloaded.load().await;
    assert_eq!(reloaded.entry_count(), 2);

    let got = reloaded.get(&ki("/b.png", 1)).await.expect("persisted hit");
    assert_eq!(got.to_rgba8().into_raw(), thumb(2).to_rgba8().into_raw());
}

#[tokio::test]
async fn test_save_bursts_coalesce_into_trailing_write() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(
        ImageCache::new("burst", dir.path(), 64).with_save_cooldown(Duration::from_millis(50)),
    );

    // The first put starts a save; the rest land during its cool-down and
    // must be captured by the single trailing save.
    for i in 0..4usize {
        cache.put(&thumb(i as u8), &format!("/k{i}.png")).await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    let reloaded = Arc::new(ImageCache::new("burst", dir.path(), 64));
    reloaded.load().await;
    assert_eq!(reloaded.entry_count(), 4);
}

#[tokio::test]
async fn test_capacity_overflow_rejects_write() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(ImageCache::new("full", dir.path(), 2));

    cache.put(&thumb(1), "/a.png").await;
    cache.put(&thumb(2), "/b.png").await;
    cache.put(&thumb(3), "/c.png").await;

    assert_eq!(cache.entry_count(), 2);
    assert!(cache.get(&ki("/c.png", 2)).await.is_none());
    assert!(cache.get(&ki("/a.png", 0)).await.is_some());
}

#[tokio::test]
async fn test_missing_index_file_is_an_empty_cache() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(ImageCache::new("fresh", dir.path(), 64));
    cache.load().await;
    assert_eq!(cache.entry_count(), 0);
}
