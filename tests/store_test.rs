mod common;

use thumbgrid_engine::source::store::JsonFileStore;
use thumbgrid_engine::source::traits::OfflineStore;

use common::test_record;

#[tokio::test]
async fn test_missing_file_is_an_empty_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileStore::new(&dir.path().join("records.json"));
    assert!(store.load_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_sync_and_load_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("records.json");

    let store = JsonFileStore::new(&path);
    store
        .sync(&(0..3).map(test_record).collect::<Vec<_>>())
        .await
        .unwrap();

    let loaded = JsonFileStore::new(&path).load_all().await.unwrap();
    assert_eq!(loaded.len(), 3);
    assert_eq!(loaded[1].title, "Item 1");
}

#[tokio::test]
async fn test_sync_upserts_by_id() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileStore::new(&dir.path().join("records.json"));

    store.sync(&[test_record(0), test_record(1)]).await.unwrap();

    let mut updated = test_record(1);
    updated.title = "Renamed".to_string();
    store.sync(&[updated, test_record(2)]).await.unwrap();

    let loaded = store.load_all().await.unwrap();
    assert_eq!(loaded.len(), 3);
    let renamed = loaded.iter().find(|r| r.id == 1).unwrap();
    assert_eq!(renamed.title, "Renamed");
}
