mod common;

use std::time::Duration;

use thumbgrid_engine::config::EngineConfig;
use thumbgrid_engine::engine::downloader::{DownloadEvent, Downloader, FetchItem};

use common::{GatedImageSource, StaticImageSource};

fn config(max_concurrent: usize) -> EngineConfig {
    EngineConfig {
        max_concurrent_downloads: max_concurrent,
        ..EngineConfig::default()
    }
}

fn item(index: usize) -> FetchItem {
    FetchItem {
        index,
        url: Some(format!("http://images.test/poster_{index}.png")),
    }
}

#[tokio::test]
async fn test_no_start_before_priority_is_set() {
    let source = GatedImageSource::new();
    let (downloader, mut events) = Downloader::new(source, &config(2));

    let items: Vec<FetchItem> = (0..5).map(item).collect();
    downloader.enqueue_batch(&items);
    downloader.start_if_needed();

    // Headroom exists, but nothing has a priority yet: nothing may start.
    assert_eq!(downloader.active_count(), 0);
    assert!(events.try_recv().is_err());

    downloader.set_priority_batch(&[(0, 1), (1, 1), (2, 1), (3, 1), (4, 1)]);
    downloader.start_if_needed();
    assert_eq!(downloader.active_count(), 2);
}

#[tokio::test]
async fn test_highest_priority_starts_first() {
    let source = GatedImageSource::new();
    let (downloader, mut events) = Downloader::new(source, &config(1));

    downloader.enqueue_batch(&[item(0), item(1), item(2)]);
    downloader.set_priority_batch(&[(0, 10), (1, 50), (2, 5)]);
    downloader.start_if_needed();

    assert!(matches!(
        events.try_recv(),
        Ok(DownloadEvent::Started { index: 1 })
    ));
    assert!(downloader.is_downloading_actively(1));
    assert!(!downloader.is_downloading_actively(0));
    assert!(!downloader.is_downloading_actively(2));
}

#[tokio::test]
async fn test_at_most_one_task_per_index() {
    let source = GatedImageSource::new();
    let (downloader, _events) = Downloader::new(source, &config(2));

    downloader.enqueue(&item(3));
    downloader.enqueue(&item(3));
    downloader.enqueue_batch(&[item(3)]);

    assert_eq!(downloader.task_indices(), vec![3]);
}

#[tokio::test]
async fn test_completion_reports_once_and_clears_task() {
    let source = GatedImageSource::new();
    let (downloader, mut events) = Downloader::new(source.clone(), &config(2));

    downloader.enqueue(&item(0));
    downloader.set_priority(0, 5);
    downloader.start_if_needed();
    assert!(downloader.is_downloading_actively(0));

    source.release(1);

    assert!(matches!(
        events.recv().await,
        Some(DownloadEvent::Started { index: 0 })
    ));
    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("download finished")
        .expect("event channel open");
    assert!(matches!(event, DownloadEvent::Succeeded { index: 0, .. }));

    // Success is terminal: the task no longer counts as downloading.
    assert!(!downloader.is_downloading(0));
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_invalidated_in_flight_swallows_result() {
    let source = GatedImageSource::new();
    let (downloader, mut events) = Downloader::new(source.clone(), &config(2));

    downloader.enqueue(&item(0));
    downloader.set_priority(0, 5);
    downloader.start_if_needed();
    assert!(matches!(
        events.try_recv(),
        Ok(DownloadEvent::Started { index: 0 })
    ));

    downloader.cancel_all();
    assert!(matches!(
        events.try_recv(),
        Ok(DownloadEvent::Canceled { index: 0 })
    ));

    // The in-flight fetch completes after cancellation; its outcome must be
    // dropped, not reported.
    source.release(1);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_cancel_outside_range_retains_window() {
    let source = GatedImageSource::new();
    let (downloader, _events) = Downloader::new(source, &config(2));

    let items: Vec<FetchItem> = (0..10).map(item).collect();
    downloader.enqueue_batch(&items);
    downloader.cancel_outside_range(3, 5);

    let mut kept = downloader.task_indices();
    kept.sort_unstable();
    assert_eq!(kept, vec![3, 4, 5]);
}

#[tokio::test]
async fn test_failed_fetch_reports_failure_once() {
    let source = StaticImageSource::new();
    source.set_fail(true);
    let (downloader, mut events) = Downloader::new(source, &config(2));

    downloader.enqueue(&item(7));
    downloader.set_priority(7, 1);
    downloader.start_if_needed();

    assert!(matches!(
        events.recv().await,
        Some(DownloadEvent::Started { index: 7 })
    ));
    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("failure reported")
        .expect("event channel open");
    assert!(matches!(event, DownloadEvent::Failed { index: 7 }));
    assert!(!downloader.is_downloading(7));
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_missing_url_is_a_failure() {
    let source = StaticImageSource::new();
    let (downloader, mut events) = Downloader::new(source, &config(2));

    downloader.enqueue(&FetchItem {
        index: 4,
        url: None,
    });
    downloader.set_priority(4, 1);
    downloader.start_if_needed();

    assert!(matches!(
        events.recv().await,
        Some(DownloadEvent::Started { index: 4 })
    ));
    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("failure reported")
        .expect("event channel open");
    assert!(matches!(event, DownloadEvent::Failed { index: 4 }));
}

#[tokio::test]
async fn test_force_restart_bypasses_priority_gate() {
    let source = StaticImageSource::new();
    let (downloader, mut events) = Downloader::new(source, &config(2));

    // No enqueue, no priority: the forced restart alone must fire the task.
    downloader.force_restart(&item(4)).await;

    assert!(matches!(
        events.try_recv(),
        Ok(DownloadEvent::Started { index: 4 })
    ));
    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("download finished")
        .expect("event channel open");
    assert!(matches!(event, DownloadEvent::Succeeded { index: 4, .. }));
}

#[tokio::test]
async fn test_blocked_downloader_refuses_work() {
    let source = GatedImageSource::new();
    let (downloader, mut events) = Downloader::new(source, &config(2));

    downloader.set_blocked(true);
    downloader.enqueue(&item(0));
    downloader.enqueue_batch(&[item(1), item(2)]);
    assert!(downloader.task_indices().is_empty());

    downloader.set_priority(0, 5);
    downloader.start_if_needed();
    assert_eq!(downloader.active_count(), 0);
    assert!(events.try_recv().is_err());
}
