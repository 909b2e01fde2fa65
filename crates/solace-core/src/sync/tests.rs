use std::sync::Arc;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;

use super::*;
use crate::db::MemoryStore;
use crate::testing::{
    session_for, Failure, FakeJournalApi, FakeProvider, PausingStore, RefreshOutcome,
};

struct Harness {
    engine: SyncEngine,
    session: Arc<SessionStore>,
    provider: Arc<FakeProvider>,
    api: Arc<FakeJournalApi>,
    store: Arc<MemoryStore>,
}

fn test_settings() -> SyncSettings {
    SyncSettings {
        freshness_window_secs: 60,
        max_retries: 3,
        backoff_base_ms: 60_000,
        backoff_max_ms: 120_000,
        request_timeout_secs: 2,
        ..SyncSettings::default()
    }
}

async fn harness() -> Harness {
    harness_with(test_settings()).await
}

async fn harness_with(settings: SyncSettings) -> Harness {
    let provider = FakeProvider::with_stored(session_for("alice", 3_600));
    let store = Arc::new(MemoryStore::new());
    build(settings, provider, store.clone(), store).await
}

/// `durable` backs the engine; `store` is the memory it ends up in.
async fn build(
    settings: SyncSettings,
    provider: FakeProvider,
    durable: Arc<dyn DurableStore>,
    store: Arc<MemoryStore>,
) -> Harness {
    let provider = Arc::new(provider);
    let session = Arc::new(SessionStore::new(provider.clone()));
    session.initialize().await;
    let api = Arc::new(FakeJournalApi::new());
    let engine = SyncEngine::new(session.clone(), durable, api.clone(), settings)
        .await
        .unwrap();
    Harness {
        engine,
        session,
        provider,
        api,
        store,
    }
}

async fn wait_for_rows(api: &FakeJournalApi, user_id: &str, count: usize) {
    for _ in 0..50 {
        if api.rows_for(user_id).len() == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn draft(content: &str) -> EntryDraft {
    EntryDraft::new(content, 5, 6, 4)
}

fn ids(result: &EntriesResult) -> Vec<EntryId> {
    result.entries.iter().map(|entry| entry.id.clone()).collect()
}

#[tokio::test]
async fn online_create_is_confirmed_and_cached() {
    let h = harness().await;

    let outcome = h
        .engine
        .create_entry(draft("Walked by the river"))
        .await
        .unwrap();
    assert!(!outcome.is_offline);
    assert!(!outcome.entry.id.is_temporary());

    let listed = h.engine.get_entries(false).await.unwrap();
    assert!(!listed.is_from_cache);
    assert_eq!(ids(&listed), vec![outcome.entry.id]);
    assert_eq!(h.engine.sync_state(), SyncState::Synced);
}

#[tokio::test]
async fn rough_day_offline_create_syncs_with_server_id() {
    let h = harness().await;
    h.api.set_offline(true);

    let outcome = h
        .engine
        .create_entry(EntryDraft::new("Rough day, shipped late", 3, 4, 8))
        .await
        .unwrap();
    assert!(outcome.is_offline);
    let temp_id = outcome.entry.id.clone();
    assert!(temp_id.is_temporary());

    let offline = h.engine.get_entries(false).await.unwrap();
    assert!(offline.is_from_cache);
    assert_eq!(ids(&offline), vec![temp_id.clone()]);
    assert_eq!(h.engine.sync_state(), SyncState::Offline);

    h.api.set_offline(false);
    let report = h.engine.retry_sync().await.unwrap();
    assert_eq!(report.succeeded.len(), 1);
    assert!(!report.succeeded[0].is_temporary());
    assert_eq!(report.still_queued, 0);

    let online = h.engine.get_entries(true).await.unwrap();
    assert!(!online.is_from_cache);
    assert_eq!(online.entries.len(), 1);
    let synced = &online.entries[0];
    assert_ne!(synced.id, temp_id);
    assert_eq!(report.succeeded, vec![synced.id.clone()]);
    assert_eq!(synced.content, "Rough day, shipped late");
    assert_eq!((synced.mood, synced.energy, synced.stress), (3, 4, 8));
}

#[tokio::test]
async fn offline_creates_reappear_exactly_once_despite_retries() {
    let h = harness().await;
    h.api.set_offline(true);
    let contents = ["First offline entry", "Second offline entry", "Third offline entry"];
    for content in contents {
        assert!(h.engine.create_entry(draft(content)).await.unwrap().is_offline);
    }

    // Still offline: every write is retried later
    let report = h.engine.retry_sync().await.unwrap();
    assert_eq!(report.still_queued, 3);
    assert!(report.failed.is_empty());

    // One acknowledgment is lost on the way back
    h.api.set_offline(false);
    h.api.drop_next_ack();
    let report = h.engine.retry_sync().await.unwrap();
    assert_eq!(report.succeeded.len(), 2);
    assert_eq!(report.still_queued, 1);

    let report = h.engine.retry_sync().await.unwrap();
    assert_eq!(report.succeeded.len(), 1);
    assert_eq!(report.still_queued, 0);

    let listed = h.engine.get_entries(true).await.unwrap();
    let mut listed_contents: Vec<&str> = listed
        .entries
        .iter()
        .map(|entry| entry.content.as_str())
        .collect();
    listed_contents.sort_unstable();
    assert_eq!(listed_contents, contents.to_vec());
    assert!(listed.entries.iter().all(|entry| !entry.id.is_temporary()));
    assert_eq!(h.api.rows_for("alice").len(), 3);
}

#[tokio::test]
async fn idempotency_key_is_reused_after_lost_acknowledgment() {
    let h = harness().await;
    h.api.drop_next_ack();

    let outcome = h
        .engine
        .create_entry(draft("Server saw this once"))
        .await
        .unwrap();
    assert!(outcome.is_offline);
    let queued = h.engine.pending_writes().await.unwrap();
    assert_eq!(queued.len(), 1);
    let key = queued[0].idempotency_key.clone();

    let report = h.engine.retry_sync().await.unwrap();
    assert_eq!(report.still_queued, 0);
    assert_eq!(h.api.seen_keys(), vec![key.clone(), key]);
    assert_eq!(h.api.rows_for("alice").len(), 1);

    let listed = h.engine.get_entries(true).await.unwrap();
    assert_eq!(listed.entries.len(), 1);
}

#[tokio::test]
async fn staleness_boundary_controls_remote_reads() {
    let h = harness().await;

    h.engine.get_entries(false).await.unwrap();
    assert_eq!(h.api.fetch_calls(), 1);

    let fresh = h.engine.get_entries(false).await.unwrap();
    assert!(fresh.is_from_cache);
    assert_eq!(h.api.fetch_calls(), 1);

    let stale = unix_millis_now() - 61_000;
    h.store
        .put("meta/alice/last_sync", &stale.to_string())
        .await
        .unwrap();
    let refreshed = h.engine.get_entries(false).await.unwrap();
    assert!(!refreshed.is_from_cache);
    assert_eq!(h.api.fetch_calls(), 2);

    h.engine.get_entries(true).await.unwrap();
    assert_eq!(h.api.fetch_calls(), 3);
}

#[tokio::test]
async fn pending_writes_make_cache_stale() {
    let h = harness().await;
    h.engine.get_entries(false).await.unwrap();
    h.api.set_offline(true);
    h.engine.create_entry(draft("Queued while away")).await.unwrap();

    h.engine.get_entries(false).await.unwrap();
    assert_eq!(h.api.fetch_calls(), 2);
}

#[tokio::test]
async fn offline_read_serves_cache_or_nothing() {
    let h = harness().await;
    h.api.set_offline(true);

    let empty = h.engine.get_entries(true).await.unwrap();
    assert!(empty.is_from_cache);
    assert!(empty.entries.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn response_for_previous_account_is_discarded() {
    let h = harness().await;
    h.api.seed(JournalEntry::from_draft(
        "alice",
        draft("Alice private entry"),
        1_000,
    ));
    let gate = h.api.gate_fetches();

    let engine = h.engine.clone();
    let pending = tokio::spawn(async move { engine.get_entries(true).await });
    h.api.wait_for_fetch().await;

    h.session.sign_out().await;
    h.session.sign_in("bob", "password").await.unwrap();
    gate.notify_one();

    let result = pending.await.unwrap().unwrap();
    assert!(result.is_from_cache);
    assert!(result.entries.is_empty());
    assert!(h
        .store
        .snapshot()
        .keys()
        .all(|key| !key.starts_with("cache/") && !key.starts_with("meta/")));
}

#[tokio::test]
async fn invalid_draft_leaves_storage_untouched() {
    let h = harness().await;
    h.api.set_offline(true);
    h.engine
        .create_entry(draft("Existing queued entry"))
        .await
        .unwrap();
    let before = h.store.snapshot();

    let error = h.engine.create_entry(draft("abc")).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::ValidationFailed);
    assert_eq!(h.store.snapshot(), before);
}

#[tokio::test]
async fn signed_out_writes_fail_with_auth_unavailable() {
    let h = harness().await;
    h.session.sign_out().await;

    let error = h
        .engine
        .create_entry(draft("Nobody to attribute this to"))
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::AuthUnavailable);
    assert!(h.store.snapshot().is_empty());

    let listed = h.engine.get_entries(false).await.unwrap();
    assert!(listed.is_from_cache);
    assert!(listed.entries.is_empty());
}

#[tokio::test]
async fn rejected_create_is_surfaced_and_not_queued() {
    let h = harness().await;
    h.api.fail_next(Failure::Rejected);

    let error = h
        .engine
        .create_entry(draft("Server says no to this"))
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::RemoteRejected);
    assert!(h.engine.pending_writes().await.unwrap().is_empty());
    assert!(h.store.snapshot().is_empty());
}

#[tokio::test]
async fn unauthorized_response_queues_write() {
    let h = harness().await;
    h.api.fail_next(Failure::Unauthorized);

    let outcome = h
        .engine
        .create_entry(draft("Token expired mid flight"))
        .await
        .unwrap();
    assert!(outcome.is_offline);
    assert_eq!(h.engine.pending_writes().await.unwrap().len(), 1);
}

#[tokio::test]
async fn update_behind_queued_create_syncs_in_order() {
    let h = harness().await;
    h.api.set_offline(true);
    let created = h
        .engine
        .create_entry(draft("Draft written on the train"))
        .await
        .unwrap();
    let updated = h
        .engine
        .update_entry(&created.entry.id, draft("Edited once I got home"))
        .await
        .unwrap();
    assert!(updated.is_offline);
    assert_eq!(updated.entry.id, created.entry.id);

    h.api.set_offline(false);
    let report = h.engine.retry_sync().await.unwrap();
    assert_eq!(report.succeeded.len(), 2);
    assert!(report.failed.is_empty());

    let rows = h.api.rows_for("alice");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].content, "Edited once I got home");

    let listed = h.engine.get_entries(true).await.unwrap();
    assert_eq!(ids(&listed), vec![rows[0].id.clone()]);
    assert_eq!(listed.entries[0].content, "Edited once I got home");
}

#[tokio::test]
async fn online_update_goes_straight_to_server() {
    let h = harness().await;
    let created = h
        .engine
        .create_entry(draft("Morning pages entry"))
        .await
        .unwrap();

    let updated = h
        .engine
        .update_entry(&created.entry.id, EntryDraft::new("Morning pages, revised", 7, 7, 2))
        .await
        .unwrap();
    assert!(!updated.is_offline);
    assert_eq!(h.api.rows_for("alice")[0].mood, 7);
}

#[tokio::test]
async fn update_of_unknown_entry_is_not_found() {
    let h = harness().await;
    let error = h
        .engine
        .update_entry(&EntryId::confirmed("missing"), draft("Nothing to update"))
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn deleting_unsynced_entry_drops_queue_and_record() {
    let h = harness().await;
    h.api.set_offline(true);
    let created = h
        .engine
        .create_entry(draft("Changed my mind about this"))
        .await
        .unwrap();

    h.engine.delete_entry(&created.entry.id).await.unwrap();
    assert!(h.store.snapshot().is_empty());

    h.api.set_offline(false);
    let report = h.engine.retry_sync().await.unwrap();
    assert_eq!(report, DrainReport::default());
    assert!(h.api.rows_for("alice").is_empty());
}

#[tokio::test]
async fn deleting_confirmed_entry_requires_server() {
    let h = harness().await;
    let created = h
        .engine
        .create_entry(draft("Entry that will be deleted"))
        .await
        .unwrap();

    h.api.set_offline(true);
    let error = h.engine.delete_entry(&created.entry.id).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::ConnectivityFailure);
    let cached = h.engine.get_entries(false).await.unwrap();
    assert_eq!(ids(&cached), vec![created.entry.id.clone()]);

    h.api.set_offline(false);
    h.engine.delete_entry(&created.entry.id).await.unwrap();
    assert!(h.api.rows_for("alice").is_empty());
    let listed = h.engine.get_entries(true).await.unwrap();
    assert!(listed.entries.is_empty());
}

#[tokio::test]
async fn exhausted_retries_surface_dead_letter() {
    let h = harness_with(SyncSettings {
        max_retries: 2,
        ..test_settings()
    })
    .await;
    h.api.set_offline(true);
    h.engine
        .create_entry(draft("Will never make it"))
        .await
        .unwrap();

    assert!(h.engine.retry_sync().await.unwrap().failed.is_empty());
    let report = h.engine.retry_sync().await.unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(h.engine.sync_state(), SyncState::Error);

    let dead = h.engine.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);

    assert_eq!(h.engine.requeue_failed().await.unwrap(), 1);
    h.api.set_offline(false);
    let report = h.engine.retry_sync().await.unwrap();
    assert_eq!(report.succeeded.len(), 1);
    assert_eq!(h.api.rows_for("alice").len(), 1);
}

#[tokio::test]
async fn rejected_queued_write_can_be_discarded() {
    let h = harness().await;
    h.api.set_offline(true);
    h.engine
        .create_entry(draft("Rejected later on sync"))
        .await
        .unwrap();

    h.api.set_offline(false);
    h.api.fail_next(Failure::Rejected);
    let report = h.engine.retry_sync().await.unwrap();
    assert_eq!(report.failed.len(), 1);
    assert!(report.failed[0].rejected);

    h.engine
        .discard_failed(report.failed[0].write.seq)
        .await
        .unwrap();
    assert!(h.engine.dead_letters().await.unwrap().is_empty());
    assert!(h.store.snapshot().keys().all(|key| !key.starts_with("cache/")));
}

#[tokio::test]
async fn scheduled_drain_waits_for_backoff() {
    let h = harness().await;
    h.api.set_offline(true);
    h.engine.create_entry(draft("Backing off politely")).await.unwrap();
    h.engine.retry_sync().await.unwrap();

    h.api.set_offline(false);
    let report = h.engine.drain().await.unwrap();
    assert!(report.succeeded.is_empty());
    assert_eq!(report.still_queued, 1);

    let report = h.engine.notify_connectivity_restored().await.unwrap();
    assert_eq!(report.succeeded.len(), 1);
}

#[tokio::test]
async fn slow_server_counts_as_offline() {
    let h = harness_with(SyncSettings {
        request_timeout_secs: 1,
        ..test_settings()
    })
    .await;
    h.api.set_write_delay(Duration::from_millis(1_500));

    let outcome = h
        .engine
        .create_entry(draft("Stuck behind a slow link"))
        .await
        .unwrap();
    assert!(outcome.is_offline);
}

#[tokio::test]
async fn sign_in_triggers_drain() {
    let h = harness().await;
    h.api.set_offline(true);
    h.engine
        .create_entry(draft("Waiting for the next session"))
        .await
        .unwrap();
    h.api.set_offline(false);

    h.engine.start();
    h.session.sign_out().await;
    h.session.sign_in("alice", "password").await.unwrap();

    wait_for_rows(&h.api, "alice", 1).await;
    assert_eq!(h.api.rows_for("alice").len(), 1);
    assert!(h.engine.pending_writes().await.unwrap().is_empty());
}

#[tokio::test]
async fn edit_read_before_promotion_lands_on_server_id() {
    let store = Arc::new(MemoryStore::new());
    let pausing = Arc::new(PausingStore::new(store.clone()));
    let provider = FakeProvider::with_stored(session_for("alice", 3_600));
    let h = build(test_settings(), provider, pausing.clone(), store).await;

    h.api.set_offline(true);
    let created = h
        .engine
        .create_entry(draft("Drafted on the night bus"))
        .await
        .unwrap();
    let temp_id = created.entry.id.clone();
    h.api.set_offline(false);

    // The edit reads the temporary record, then stalls while the create syncs
    let (reached, release) = pausing.pause_next_read(format!("cache/alice/{temp_id}"));
    let engine = h.engine.clone();
    let edit_target = temp_id.clone();
    let edit = tokio::spawn(async move {
        engine
            .update_entry(&edit_target, draft("Edited once I got home"))
            .await
    });
    reached.notified().await;

    let report = h.engine.retry_sync().await.unwrap();
    assert_eq!(report.succeeded.len(), 1);
    let server_id = report.succeeded[0].clone();
    assert!(!server_id.is_temporary());

    release.notify_one();
    let edited = edit.await.unwrap().unwrap();
    assert_eq!(edited.entry.id, server_id);
    assert!(h
        .store
        .snapshot()
        .keys()
        .all(|key| !key.contains(&temp_id.to_string())));
    let pending = h.engine.pending_writes().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].target(), &server_id);

    let report = h.engine.retry_sync().await.unwrap();
    assert_eq!(report.succeeded, vec![server_id.clone()]);
    let rows = h.api.rows_for("alice");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].content, "Edited once I got home");

    let listed = h.engine.get_entries(true).await.unwrap();
    assert_eq!(ids(&listed), vec![server_id]);
    assert_eq!(listed.entries[0].content, "Edited once I got home");
}

#[tokio::test]
async fn temporary_id_kept_after_sync_still_reaches_the_entry() {
    let h = harness().await;
    h.api.set_offline(true);
    let created = h
        .engine
        .create_entry(draft("Listed before the sync ran"))
        .await
        .unwrap();
    let temp_id = created.entry.id.clone();
    h.api.set_offline(false);
    let report = h.engine.retry_sync().await.unwrap();
    let server_id = report.succeeded[0].clone();

    let updated = h
        .engine
        .update_entry(&temp_id, draft("Updated through the old id"))
        .await
        .unwrap();
    assert!(!updated.is_offline);
    assert_eq!(updated.entry.id, server_id);
    assert_eq!(h.api.rows_for("alice")[0].content, "Updated through the old id");

    h.engine.delete_entry(&temp_id).await.unwrap();
    assert!(h.api.rows_for("alice").is_empty());
}

#[tokio::test]
async fn hanging_credential_refresh_is_bounded_by_request_timeout() {
    let provider = FakeProvider::with_stored(session_for("alice", -10))
        .with_refresh_delay(Duration::from_secs(5));
    let store = Arc::new(MemoryStore::new());
    let settings = SyncSettings {
        request_timeout_secs: 1,
        ..test_settings()
    };
    let h = build(settings, provider, store.clone(), store).await;

    let started = Instant::now();
    let created = h
        .engine
        .create_entry(draft("Written while auth hangs"))
        .await
        .unwrap();
    assert!(created.is_offline);

    let listed = h.engine.get_entries(false).await.unwrap();
    assert!(listed.is_from_cache);
    assert_eq!(ids(&listed), vec![created.entry.id.clone()]);
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(h.session.snapshot().phase, SessionPhase::Authenticated);
}

#[tokio::test]
async fn writes_for_different_entries_sync_concurrently() {
    let h = harness().await;
    h.api.set_offline(true);
    for content in ["Morning run felt easy", "Long call with an old friend"] {
        h.engine.create_entry(draft(content)).await.unwrap();
    }
    h.api.set_offline(false);
    h.api.set_write_delay(Duration::from_millis(200));

    let started = Instant::now();
    let report = h.engine.retry_sync().await.unwrap();

    assert_eq!(report.succeeded.len(), 2);
    // One after the other would take at least 400ms
    assert!(started.elapsed() < Duration::from_millis(380));
    assert_eq!(h.api.rows_for("alice").len(), 2);
}

#[tokio::test]
async fn credential_refresh_triggers_drain() {
    let provider = FakeProvider::with_stored(session_for("alice", -10))
        .with_refresh_outcome(RefreshOutcome::Offline);
    let store = Arc::new(MemoryStore::new());
    let h = build(test_settings(), provider, store.clone(), store).await;

    // Nothing queued yet, so the initial event drains nothing
    h.engine.start();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let created = h
        .engine
        .create_entry(draft("Saved while auth was down"))
        .await
        .unwrap();
    assert!(created.is_offline);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.api.rows_for("alice").is_empty());

    h.provider.set_refresh_outcome(RefreshOutcome::Succeed);
    h.session.current_credential().await.unwrap();

    wait_for_rows(&h.api, "alice", 1).await;
    assert_eq!(h.api.rows_for("alice").len(), 1);
    assert!(h.engine.pending_writes().await.unwrap().is_empty());
    assert_eq!(h.provider.refresh_calls(), 2);
}
