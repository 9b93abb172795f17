use chrono::{Duration, Utc};
use freshd::error::StateError;
use freshd::state::RepoStateStore;
use tempfile::TempDir;
use uuid::Uuid;

mod test_utils;
use test_utils::register_repo;

#[tokio::test]
async fn records_survive_a_store_reopen() {
    let dir = TempDir::new().unwrap();
    let state_dir = dir.path().join("state");

    let store = RepoStateStore::open(&state_dir).await.unwrap();
    let repo = register_repo(&store, &dir, "repo-a").await;
    let synced_at = Utc::now();
    store
        .update(&repo.repo_id, |state| {
            state.last_synced_at = Some(synced_at);
            state.pending_enrichment_count = 12;
        })
        .await
        .unwrap();
    drop(store);

    let reopened = RepoStateStore::open(&state_dir).await.unwrap();
    let all = reopened.load_all().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].repo_id, repo.repo_id);
    assert_eq!(all[0].last_synced_at, Some(synced_at));
    assert_eq!(all[0].pending_enrichment_count, 12);
}

#[tokio::test]
async fn path_spelling_does_not_change_repo_identity() {
    let dir = TempDir::new().unwrap();
    let store = RepoStateStore::open(&dir.path().join("state")).await.unwrap();
    let repo = register_repo(&store, &dir, "repo-a").await;

    // The same directory reached through a dotted path canonicalizes to
    // the identity that is already registered.
    let dotted = dir.path().join("repo-a").join(".").join("..").join("repo-a");
    let err = store.register(&dotted, Utc::now()).await.unwrap_err();
    match err {
        StateError::AlreadyRegistered { repo_id, .. } => assert_eq!(repo_id, repo.repo_id),
        other => panic!("expected AlreadyRegistered, got {other}"),
    }
}

#[tokio::test]
async fn registering_a_file_is_rejected() {
    let dir = TempDir::new().unwrap();
    let store = RepoStateStore::open(&dir.path().join("state")).await.unwrap();

    let file = dir.path().join("not-a-dir");
    tokio::fs::write(&file, b"x").await.unwrap();

    let err = store.register(&file, Utc::now()).await.unwrap_err();
    assert!(matches!(err, StateError::InvalidRepoPath { .. }));
}

#[tokio::test]
async fn unregister_then_reregister_starts_fresh() {
    let dir = TempDir::new().unwrap();
    let store = RepoStateStore::open(&dir.path().join("state")).await.unwrap();
    let repo = register_repo(&store, &dir, "repo-a").await;
    store
        .update(&repo.repo_id, |state| {
            state.last_synced_at = Some(Utc::now());
            state.consecutive_failures = 3;
        })
        .await
        .unwrap();

    assert!(store.remove(&repo.repo_id).await.unwrap());
    assert!(!store.remove(&repo.repo_id).await.unwrap());
    assert!(store.get(&repo.repo_id).await.unwrap().is_none());

    // Same path, same identity, clean slate.
    let fresh = store
        .register(&dir.path().join("repo-a"), Utc::now())
        .await
        .unwrap();
    assert_eq!(fresh.repo_id, repo.repo_id);
    assert!(fresh.last_synced_at.is_none());
    assert_eq!(fresh.consecutive_failures, 0);
}

#[tokio::test]
async fn an_expired_lease_is_reclaimed_in_place() {
    let dir = TempDir::new().unwrap();
    let store = RepoStateStore::open(&dir.path().join("state")).await.unwrap();
    let repo = register_repo(&store, &dir, "repo-a").await;

    let past = Utc::now() - Duration::seconds(120);
    let old_owner = Uuid::new_v4();
    assert!(
        store
            .try_acquire_lease(&repo.repo_id, old_owner, Duration::seconds(60), past)
            .await
            .unwrap()
    );

    // The old lease has expired; a new worker takes over without any
    // explicit release.
    let new_owner = Uuid::new_v4();
    assert!(
        store
            .try_acquire_lease(&repo.repo_id, new_owner, Duration::seconds(60), Utc::now())
            .await
            .unwrap()
    );

    let state = store.get(&repo.repo_id).await.unwrap().unwrap();
    assert_eq!(state.lease_owner, Some(new_owner));

    // The displaced worker's release is a no-op, not a theft.
    store.release_lease(&repo.repo_id, old_owner).await.unwrap();
    let state = store.get(&repo.repo_id).await.unwrap().unwrap();
    assert_eq!(state.lease_owner, Some(new_owner));
}

#[tokio::test]
async fn updating_an_unknown_repo_errors() {
    let dir = TempDir::new().unwrap();
    let store = RepoStateStore::open(&dir.path().join("state")).await.unwrap();

    let err = store
        .update("missing", |state| state.idle_cycles = 1)
        .await
        .unwrap_err();
    assert!(matches!(err, StateError::UnknownRepo { .. }));
}
