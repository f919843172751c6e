use super::*;
use crate::sync::engine::EngineError;
use crate::sync::index::AvailableOfflineStatus;
use crate::sync::operations::ItemOutcome;
use ocsync_core::{RemoteCall, RemoteError};

#[tokio::test]
async fn move_into_descendant_is_rejected_before_any_remote_call() {
    let h = Harness::new().await;
    h.remote.add_file(ACCOUNT, "/Docs/sub/deep.txt", 1, 100);
    h.refresh("/").await;
    h.refresh("/Docs/").await;
    let docs = h.record("/Docs/").await;
    let sub = h.record("/Docs/sub/").await;
    h.remote.clear_calls();

    let err = h.engine.move_files(&[docs.clone()], &sub).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidOperation(_)));
    let err = h.engine.move_files(&[docs.clone()], &docs).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidOperation(_)));

    assert!(h.remote.calls().is_empty());
    assert_eq!(h.reload(&docs).await, Some(docs));
    assert!(h.remote.get(ACCOUNT, "/Docs/").is_some());
}

#[tokio::test]
async fn move_validation_rejects_same_folder_other_space_and_empty_batch() {
    let h = Harness::new().await;
    h.remote.add_file(ACCOUNT, "/Docs/a.txt", 1, 100);
    h.refresh("/Docs/").await;
    let docs = h.record("/Docs/").await;
    let a = h.record("/Docs/a.txt").await;
    h.remote.clear_calls();

    let err = h.engine.move_files(&[a.clone()], &docs).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidOperation(_)));

    let mut elsewhere = docs.clone();
    elsewhere.space_id = Some("project".into());
    elsewhere.id += 100;
    let err = h.engine.move_files(&[a.clone()], &elsewhere).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidOperation(_)));

    let err = h.engine.move_files(&[], &docs).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidOperation(_)));
    assert!(h.remote.calls().is_empty());
}

#[tokio::test]
async fn move_with_vanished_target_cleans_target_and_keeps_source() {
    let h = Harness::new().await;
    h.remote.add_file(ACCOUNT, "/a.txt", 1, 100);
    h.remote.add_file(ACCOUNT, "/b.txt", 1, 100);
    h.remote.add_file(ACCOUNT, "/Gone/x.txt", 1, 100);
    h.refresh("/").await;
    h.refresh("/Gone/").await;
    let a = h.record("/a.txt").await;
    let b = h.record("/b.txt").await;
    let gone = h.record("/Gone/").await;
    let local_x = h.download("/Gone/x.txt", b"x").await;
    h.remote.remove(ACCOUNT, "/Gone/");

    let report = h.engine.move_files(&[a.clone(), b.clone()], &gone).await.unwrap();

    assert_eq!(report.total(), 2);
    assert_eq!(report.outcome_for("/a.txt"), Some(&ItemOutcome::TargetMissing));
    assert_eq!(report.outcome_for("/b.txt"), Some(&ItemOutcome::TargetMissing));
    assert!(h.find("/Gone/").await.is_none());
    assert!(h.find("/Gone/x.txt").await.is_none());
    assert!(!local_x.exists());
    assert_eq!(h.record("/a.txt").await.id, a.id);
    assert_eq!(h.record("/b.txt").await.id, b.id);
}

#[tokio::test]
async fn move_with_vanished_source_removes_it_and_continues() {
    let h = Harness::new().await;
    h.remote.add_file(ACCOUNT, "/a.txt", 1, 100);
    h.remote.add_file(ACCOUNT, "/b.txt", 1, 100);
    h.remote.add_folder(ACCOUNT, "/Docs/");
    h.refresh("/").await;
    let a = h.record("/a.txt").await;
    let b = h.record("/b.txt").await;
    let docs = h.record("/Docs/").await;
    h.remote.remove(ACCOUNT, "/a.txt");

    let report = h.engine.move_files(&[a, b.clone()], &docs).await.unwrap();

    assert_eq!(report.outcome_for("/a.txt"), Some(&ItemOutcome::SourceMissing));
    assert_eq!(report.outcome_for("/b.txt"), Some(&ItemOutcome::Done));
    assert_eq!(report.succeeded(), 1);
    assert!(h.find("/a.txt").await.is_none());
    let moved = h.record("/Docs/b.txt").await;
    assert_eq!(moved.id, b.id);
    assert_eq!(moved.parent_id, docs.id);
    assert!(h.remote.get(ACCOUNT, "/Docs/b.txt").is_some());
}

#[tokio::test]
async fn move_keeps_conflict_and_derives_offline_status() {
    let h = Harness::new().await;
    h.remote.add_file(ACCOUNT, "/a.txt", 3, 100);
    h.remote.add_folder(ACCOUNT, "/Old/");
    h.remote.add_file(ACCOUNT, "/Old/c.txt", 1, 100);
    h.remote.add_folder(ACCOUNT, "/Docs/");
    h.refresh("/").await;
    h.refresh("/Old/").await;
    let docs = h.record("/Docs/").await;
    h.engine
        .set_available_offline_status(docs.id, AvailableOfflineStatus::Available)
        .await
        .unwrap();
    let c = h.record("/Old/c.txt").await;
    h.engine.set_conflict(c.id, "etag-theirs").await.unwrap();
    let local_c = h.download("/Old/c.txt", b"ccc").await;
    let old = h.record("/Old/").await;
    assert!(old.etag_in_conflict.is_some());
    let c = h.record("/Old/c.txt").await;

    let report = h.engine.move_files(&[c.clone()], &docs).await.unwrap();

    assert_eq!(report.succeeded(), 1);
    let moved = h.record("/Docs/c.txt").await;
    assert_eq!(moved.id, c.id);
    assert_eq!(moved.parent_id, docs.id);
    assert_eq!(moved.etag_in_conflict.as_deref(), Some("etag-theirs"));
    assert_eq!(
        moved.available_offline_status,
        AvailableOfflineStatus::AvailableAsParent
    );
    assert!(h.record("/Docs/").await.etag_in_conflict.is_some());
    assert!(h.record("/Old/").await.etag_in_conflict.is_none());
    assert!(h.record("/").await.etag_in_conflict.is_some());
    assert_eq!(h.record("/Docs/").await.length, c.length);

    let new_local = h.storage.save_path_for(ACCOUNT, "/Docs/c.txt").unwrap();
    assert_eq!(
        moved.storage_path.as_deref(),
        Some(new_local.to_string_lossy().as_ref())
    );
    assert!(!local_c.exists());
    assert_eq!(tokio::fs::read(&new_local).await.unwrap(), b"ccc");
}

#[tokio::test]
async fn moved_folder_rewrites_descendants() {
    let h = Harness::new().await;
    h.remote.add_file(ACCOUNT, "/Docs/sub/deep.txt", 1, 100);
    h.remote.add_folder(ACCOUNT, "/Archive/");
    h.refresh("/").await;
    h.refresh("/Docs/").await;
    h.refresh("/Docs/sub/").await;
    let archive = h.record("/Archive/").await;
    h.engine
        .set_available_offline_status(archive.id, AvailableOfflineStatus::Available)
        .await
        .unwrap();
    let sub = h.record("/Docs/sub/").await;
    let deep = h.record("/Docs/sub/deep.txt").await;
    let local_deep = h.download("/Docs/sub/deep.txt", b"deep").await;

    h.engine.move_files(&[sub.clone()], &archive).await.unwrap();

    let moved_sub = h.record("/Archive/sub/").await;
    assert_eq!(moved_sub.id, sub.id);
    assert_eq!(moved_sub.parent_id, archive.id);
    let moved_deep = h.record("/Archive/sub/deep.txt").await;
    assert_eq!(moved_deep.id, deep.id);
    assert_eq!(moved_deep.parent_id, sub.id);
    for record in [&moved_sub, &moved_deep] {
        assert_eq!(
            record.available_offline_status,
            AvailableOfflineStatus::AvailableAsParent
        );
    }
    assert!(h.find("/Docs/sub/").await.is_none());
    assert!(!local_deep.exists());
    let new_local = h
        .storage
        .save_path_for(ACCOUNT, "/Archive/sub/deep.txt")
        .unwrap();
    assert_eq!(tokio::fs::read(&new_local).await.unwrap(), b"deep");
    assert_eq!(
        moved_deep.storage_path.as_deref(),
        Some(new_local.to_string_lossy().as_ref())
    );
}

#[tokio::test]
async fn move_onto_occupied_name_uses_available_path() {
    let h = Harness::new().await;
    h.remote.add_file(ACCOUNT, "/a.txt", 1, 100);
    h.remote.add_file(ACCOUNT, "/Docs/a.txt", 1, 100);
    h.refresh("/").await;
    h.refresh("/Docs/").await;
    let a = h.record("/a.txt").await;
    let docs = h.record("/Docs/").await;

    h.engine.move_files(&[a.clone()], &docs).await.unwrap();

    let moved = h.record("/Docs/a (2).txt").await;
    assert_eq!(moved.id, a.id);
    assert_eq!(moved.name, "a (2).txt");
    assert!(h.remote.calls().contains(&RemoteCall::Move {
        from: "/a.txt".into(),
        to: "/Docs/a (2).txt".into(),
    }));
}

#[tokio::test]
async fn batch_with_only_unknown_failures_is_an_error() {
    let h = Harness::new().await;
    h.remote.add_file(ACCOUNT, "/a.txt", 1, 100);
    h.remote.add_folder(ACCOUNT, "/Docs/");
    h.refresh("/").await;
    let a = h.record("/a.txt").await;
    let docs = h.record("/Docs/").await;
    h.remote
        .fail_next("/a.txt", RemoteError::Unknown("server exploded".into()));

    let err = h.engine.move_files(&[a.clone()], &docs).await.unwrap_err();

    assert!(matches!(err, EngineError::Unknown(m) if m == "server exploded"));
    assert_eq!(h.record("/a.txt").await.id, a.id);
}

#[tokio::test]
async fn copy_inserts_new_record_and_keeps_source() {
    let h = Harness::new().await;
    h.remote.add_file(ACCOUNT, "/a.txt", 5, 100);
    h.remote.add_folder(ACCOUNT, "/Docs/");
    h.refresh("/").await;
    let mut a = h.record("/a.txt").await;
    a.available_offline_status = AvailableOfflineStatus::Available;
    a.etag = "etag-local".into();
    h.engine.index.update_file(&a).await.unwrap();
    let docs = h.record("/Docs/").await;

    let report = h.engine.copy_files(&[a.clone()], &docs).await.unwrap();

    assert_eq!(report.succeeded(), 1);
    assert_eq!(h.reload(&a).await, Some(a.clone()));
    let copy = h.record("/Docs/a.txt").await;
    assert_ne!(copy.id, a.id);
    assert_eq!(copy.parent_id, docs.id);
    assert_eq!(copy.remote_id, h.remote.get(ACCOUNT, "/Docs/a.txt").unwrap().remote_id);
    assert_ne!(copy.remote_id, a.remote_id);
    assert_eq!(copy.available_offline_status, AvailableOfflineStatus::NotAvailable);
    assert!(copy.needs_to_update_thumbnail);
    assert_eq!(copy.etag, "");
    assert_eq!(copy.storage_path, None);
    assert_eq!(h.record("/Docs/").await.length, docs.length + 5);
}

#[tokio::test]
async fn copy_into_current_folder_gets_disambiguated_name() {
    let h = Harness::new().await;
    h.remote.add_file(ACCOUNT, "/Docs/a.txt", 5, 100);
    h.refresh("/Docs/").await;
    let a = h.record("/Docs/a.txt").await;
    let docs = h.record("/Docs/").await;

    h.engine.copy_files(&[a], &docs).await.unwrap();

    assert!(h.find("/Docs/a (2).txt").await.is_some());
    assert!(h.find("/Docs/a.txt").await.is_some());
}

#[tokio::test]
async fn rename_onto_existing_local_path_fails_without_remote_call() {
    let h = Harness::new().await;
    h.remote.add_file(ACCOUNT, "/Docs/a.txt", 1, 100);
    h.remote.add_file(ACCOUNT, "/Docs/b.txt", 1, 100);
    h.refresh("/Docs/").await;
    let a = h.record("/Docs/a.txt").await;
    h.remote.clear_calls();

    let err = h.engine.rename(&a, "b.txt").await.unwrap_err();

    assert!(matches!(err, EngineError::AlreadyExists(p) if p == "/Docs/b.txt"));
    assert_eq!(h.mutations(), 0);
    assert!(matches!(
        h.engine.rename(&a, "x/y").await,
        Err(EngineError::InvalidOperation(_))
    ));
}

#[tokio::test]
async fn rename_file_updates_record_and_local_copy() {
    let h = Harness::new().await;
    h.remote.add_file(ACCOUNT, "/Docs/a.txt", 1, 100);
    h.refresh("/Docs/").await;
    let a = h.record("/Docs/a.txt").await;
    let old_local = h.download("/Docs/a.txt", b"aaa").await;

    let renamed = h.engine.rename(&a, "notes.txt").await.unwrap();

    assert_eq!(renamed.id, a.id);
    assert_eq!(renamed.remote_path, "/Docs/notes.txt");
    assert_eq!(renamed.name, "notes.txt");
    assert!(h.remote.get(ACCOUNT, "/Docs/notes.txt").is_some());
    let new_local = h.storage.save_path_for(ACCOUNT, "/Docs/notes.txt").unwrap();
    assert!(!old_local.exists());
    assert_eq!(tokio::fs::read(&new_local).await.unwrap(), b"aaa");
}

#[tokio::test]
async fn rename_folder_rewrites_children() {
    let h = Harness::new().await;
    h.remote.add_file(ACCOUNT, "/Docs/sub/deep.txt", 1, 100);
    h.refresh("/Docs/").await;
    h.refresh("/Docs/sub/").await;
    let sub = h.record("/Docs/sub/").await;

    let renamed = h.engine.rename(&sub, "Other").await.unwrap();

    assert_eq!(renamed.remote_path, "/Docs/Other/");
    let deep = h.record("/Docs/Other/deep.txt").await;
    assert_eq!(deep.parent_id, sub.id);
    assert!(h.find("/Docs/sub/deep.txt").await.is_none());
}

#[tokio::test]
async fn delete_folder_removes_subtree_everywhere() {
    let h = Harness::new().await;
    h.remote.add_file(ACCOUNT, "/Docs/a.txt", 1, 100);
    h.remote.add_file(ACCOUNT, "/Docs/sub/deep.txt", 1, 100);
    h.refresh("/").await;
    h.refresh("/Docs/").await;
    h.refresh("/Docs/sub/").await;
    let docs = h.record("/Docs/").await;
    let sub = h.record("/Docs/sub/").await;
    let deep = h.record("/Docs/sub/deep.txt").await;
    h.engine.set_conflict(deep.id, "etag-theirs").await.unwrap();
    let local_a = h.download("/Docs/a.txt", b"a").await;

    let report = h.engine.delete_files(&[docs.clone()], false).await.unwrap();

    assert_eq!(report.succeeded(), 1);
    assert!(h.remote.get(ACCOUNT, "/Docs/").is_none());
    for path in ["/Docs/", "/Docs/a.txt", "/Docs/sub/", "/Docs/sub/deep.txt"] {
        assert!(h.find(path).await.is_none(), "{path} survived");
    }
    assert!(h.engine.index.get_folder_content(docs.id).await.unwrap().is_empty());
    assert!(h.engine.index.get_folder_content(sub.id).await.unwrap().is_empty());
    assert!(!local_a.exists());
    assert!(h.record("/").await.etag_in_conflict.is_none());
}

#[tokio::test]
async fn delete_tolerates_objects_already_gone_remotely() {
    let h = Harness::new().await;
    h.remote.add_file(ACCOUNT, "/a.txt", 1, 100);
    h.refresh("/").await;
    let a = h.record("/a.txt").await;
    h.remote.remove(ACCOUNT, "/a.txt");

    let report = h.engine.delete_files(&[a.clone()], false).await.unwrap();

    assert_eq!(report.outcome_for("/a.txt"), Some(&ItemOutcome::Done));
    assert!(h.find("/a.txt").await.is_none());

    let report = h.engine.delete_files(&[a], false).await.unwrap();
    assert_eq!(report.outcome_for("/a.txt"), Some(&ItemOutcome::SourceMissing));
}

#[tokio::test]
async fn local_only_delete_drops_copies_but_keeps_records() {
    let h = Harness::new().await;
    h.remote.add_file(ACCOUNT, "/Docs/a.txt", 1, 100);
    h.refresh("/Docs/").await;
    let docs = h.record("/Docs/").await;
    let a = h.record("/Docs/a.txt").await;
    let local_a = h.download("/Docs/a.txt", b"a").await;
    h.engine.set_conflict(a.id, "etag-theirs").await.unwrap();
    h.remote.clear_calls();

    let report = h.engine.delete_files(&[docs.clone()], true).await.unwrap();

    assert_eq!(report.succeeded(), 1);
    assert!(h.remote.calls().is_empty());
    assert!(!local_a.exists());
    let a = h.record("/Docs/a.txt").await;
    assert_eq!(a.storage_path, None);
    assert_eq!(a.etag_in_conflict, None);
    assert!(h.record("/Docs/").await.etag_in_conflict.is_none());
    assert!(h.remote.get(ACCOUNT, "/Docs/a.txt").is_some());
}

#[tokio::test]
async fn failed_remote_delete_keeps_local_state() {
    let h = Harness::new().await;
    h.remote.add_file(ACCOUNT, "/a.txt", 1, 100);
    h.remote.add_file(ACCOUNT, "/b.txt", 1, 100);
    h.refresh("/").await;
    let a = h.record("/a.txt").await;
    let b = h.record("/b.txt").await;
    h.remote
        .fail_next("/a.txt", RemoteError::Unknown("locked".into()));

    let report = h.engine.delete_files(&[a.clone(), b], false).await.unwrap();

    assert_eq!(
        report.outcome_for("/a.txt"),
        Some(&ItemOutcome::Failed("remote operation failed: locked".into()))
    );
    assert_eq!(report.outcome_for("/b.txt"), Some(&ItemOutcome::Done));
    assert_eq!(h.record("/a.txt").await.id, a.id);
}

#[tokio::test]
async fn overlapping_moves_of_one_file_keep_its_record() {
    let h = Harness::new().await;
    h.remote.add_file(ACCOUNT, "/a.txt", 1, 100);
    h.remote.add_folder(ACCOUNT, "/X/");
    h.remote.add_folder(ACCOUNT, "/Y/");
    h.refresh("/").await;
    let a = h.record("/a.txt").await;
    let x = h.record("/X/").await;
    let y = h.record("/Y/").await;

    let (first, second) = tokio::join!(
        h.engine.move_files(std::slice::from_ref(&a), &x),
        h.engine.move_files(std::slice::from_ref(&a), &y),
    );

    assert_eq!(first.unwrap().outcome_for("/a.txt"), Some(&ItemOutcome::Done));
    assert_eq!(second.unwrap().outcome_for("/a.txt"), Some(&ItemOutcome::Done));
    let moved = h.reload(&a).await.expect("record survives both moves");
    assert!(moved.remote_path == "/X/a.txt" || moved.remote_path == "/Y/a.txt");
    assert!(h.remote.get(ACCOUNT, &moved.remote_path).is_some());
    assert!(h.remote.get(ACCOUNT, "/a.txt").is_none());
}

#[tokio::test]
async fn delete_racing_a_rename_removes_the_file_wherever_it_ended() {
    let h = Harness::new().await;
    h.remote.add_file(ACCOUNT, "/Docs/a.txt", 1, 100);
    h.refresh("/Docs/").await;
    let a = h.record("/Docs/a.txt").await;

    let (renamed, deleted) = tokio::join!(
        h.engine.rename(&a, "b.txt"),
        h.engine.delete_files(std::slice::from_ref(&a), false),
    );

    match renamed {
        Ok(record) => assert_eq!(record.remote_path, "/Docs/b.txt"),
        Err(err) => assert!(matches!(err, EngineError::NotFound(_))),
    }
    let deleted = deleted.unwrap();
    assert_eq!(deleted.succeeded(), 1);
    assert!(h.reload(&a).await.is_none());
    assert!(h.remote.get(ACCOUNT, "/Docs/a.txt").is_none());
    assert!(h.remote.get(ACCOUNT, "/Docs/b.txt").is_none());
}
