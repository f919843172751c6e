use super::*;
use crate::sync::engine::EngineError;
use crate::sync::index::AvailableOfflineStatus;

#[tokio::test]
async fn refresh_file_merges_remote_metadata_with_local_state() {
    let h = Harness::new().await;
    h.remote.add_file(ACCOUNT, "/Docs/a.txt", 3, 100);
    h.refresh("/Docs/").await;
    h.download("/Docs/a.txt", b"abc").await;
    let a = h.record("/Docs/a.txt").await;
    h.engine.set_conflict(a.id, "etag-theirs").await.unwrap();
    h.remote.touch(ACCOUNT, "/Docs/a.txt", 500);

    let refreshed = h
        .engine
        .refresh_file("/Docs/a.txt", ACCOUNT, None)
        .await
        .unwrap();

    assert_eq!(refreshed.id, a.id);
    assert_eq!(refreshed.parent_id, a.parent_id);
    assert_eq!(refreshed.modification_timestamp, 500);
    assert_eq!(
        refreshed.etag,
        h.remote.get(ACCOUNT, "/Docs/a.txt").unwrap().etag
    );
    assert_eq!(refreshed.storage_path, a.storage_path);
    assert_eq!(refreshed.etag_in_conflict.as_deref(), Some("etag-theirs"));
}

#[tokio::test]
async fn refresh_file_inserts_unknown_file_under_known_parent() {
    let h = Harness::new().await;
    h.remote.add_folder(ACCOUNT, "/Docs/");
    h.refresh("/Docs/").await;
    let docs = h.record("/Docs/").await;
    h.engine
        .set_available_offline_status(docs.id, AvailableOfflineStatus::Available)
        .await
        .unwrap();
    h.remote.add_file(ACCOUNT, "/Docs/new.txt", 7, 300);

    let inserted = h
        .engine
        .refresh_file("/Docs/new.txt", ACCOUNT, None)
        .await
        .unwrap();

    assert_eq!(inserted.parent_id, docs.id);
    assert_eq!(inserted.length, 7);
    assert_eq!(
        inserted.available_offline_status,
        AvailableOfflineStatus::AvailableAsParent
    );
    assert_eq!(h.record("/Docs/new.txt").await, inserted);
}

#[tokio::test]
async fn refresh_file_of_missing_object_is_not_found() {
    let h = Harness::new().await;
    let err = h
        .engine
        .refresh_file("/missing.txt", ACCOUNT, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn create_folder_records_remote_folder() {
    let h = Harness::new().await;
    h.remote.add_folder(ACCOUNT, "/Docs/");
    h.refresh("/Docs/").await;
    let docs = h.record("/Docs/").await;

    let created = h.engine.create_folder("/Docs/New", &docs).await.unwrap();

    assert_eq!(created.remote_path, "/Docs/New/");
    assert_eq!(created.parent_id, docs.id);
    assert!(created.is_folder());
    assert_eq!(
        created.remote_id,
        h.remote.get(ACCOUNT, "/Docs/New/").unwrap().remote_id
    );

    let err = h.engine.create_folder("/Docs/New/", &docs).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(_)));
    let err = h
        .engine
        .create_folder("/Elsewhere/New/", &docs)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidOperation(_)));
}
