//! Offline-first sync engine.
//!
//! [`SyncEngine`] owns the read/write fallback policy: reads come from the
//! server when the cache is stale and fall back to the cache when offline;
//! writes go straight to the server when possible and are queued otherwise.
//! Queued writes are reconciled by drain passes triggered by session changes,
//! returning connectivity, or an explicit retry.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::cache::LocalCache;
use crate::config::SyncSettings;
use crate::db::DurableStore;
use crate::error::{Error, ErrorKind, Result};
use crate::models::{
    new_idempotency_key, CacheRecord, DeadLetter, EntryDraft, EntryId, JournalEntry, QueuedWrite,
    RecordSource, WriteKind,
};
use crate::queue::{Acknowledgment, DrainMode, DrainReport, PendingWriteQueue};
use crate::remote::JournalApi;
use crate::session::{
    Credential, SessionEvent, SessionPhase, SessionStore, SessionTransition, Subscription,
};
use crate::state::SyncState;
use crate::util::unix_millis_now;

/// Entries returned by [`SyncEngine::get_entries`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntriesResult {
    pub entries: Vec<JournalEntry>,
    /// True unless the entries were confirmed against the server in this call
    pub is_from_cache: bool,
}

/// Result of a create or update that did not fail outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOutcome {
    pub entry: JournalEntry,
    /// True when the write was saved locally and will sync later
    pub is_offline: bool,
}

struct EngineInner {
    session: Arc<SessionStore>,
    cache: LocalCache,
    queue: PendingWriteQueue,
    api: Arc<dyn JournalApi>,
    settings: SyncSettings,
    /// Set by a connectivity failure, cleared by the next successful remote call
    offline: AtomicBool,
    state: Mutex<SyncState>,
    subscription: Mutex<Option<Subscription>>,
}

#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub async fn new(
        session: Arc<SessionStore>,
        store: Arc<dyn DurableStore>,
        api: Arc<dyn JournalApi>,
        settings: SyncSettings,
    ) -> Result<Self> {
        let queue = PendingWriteQueue::open(store.clone(), &settings).await?;
        let cache = LocalCache::new(store, settings.cache_max_records_per_user);
        Ok(Self {
            inner: Arc::new(EngineInner {
                session,
                cache,
                queue,
                api,
                settings,
                offline: AtomicBool::new(false),
                state: Mutex::new(SyncState::Synced),
                subscription: Mutex::new(None),
            }),
        })
    }

    /// Drain the queue whenever the session signs in or refreshes.
    ///
    /// Must be called within a Tokio runtime. Calling it again replaces the
    /// previous subscription.
    pub fn start(&self) {
        let weak: Weak<EngineInner> = Arc::downgrade(&self.inner);
        let subscription = self.inner.session.subscribe(move |event: SessionEvent| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let engine = Self { inner };
            match event.transition {
                SessionTransition::SignedIn | SessionTransition::Refreshed => {
                    engine.spawn_drain(DrainMode::Scheduled);
                }
                SessionTransition::Current => {
                    if event.snapshot.phase == SessionPhase::Authenticated {
                        engine.spawn_drain(DrainMode::Scheduled);
                    }
                }
                SessionTransition::SignedOut => engine.set_state(SyncState::Offline),
            }
        });
        *lock(&self.inner.subscription) = Some(subscription);
    }

    pub fn session(&self) -> &Arc<SessionStore> {
        &self.inner.session
    }

    pub fn sync_state(&self) -> SyncState {
        *lock(&self.inner.state)
    }

    fn set_state(&self, state: SyncState) {
        *lock(&self.inner.state) = state;
    }

    /// User the cache and queue are scoped to, kept while a refresh is offline.
    fn identity(&self) -> Option<String> {
        self.inner.session.snapshot().user_id().map(str::to_string)
    }

    fn require_identity(&self) -> Result<String> {
        self.identity()
            .ok_or_else(|| Error::AuthUnavailable("sign in to write entries".to_string()))
    }

    /// Credential for `user_id`, with any refresh bounded by the request timeout.
    async fn credential_for(&self, user_id: &str) -> Result<Credential> {
        let timeout = self.inner.settings.request_timeout();
        let credential = tokio::time::timeout(timeout, self.inner.session.current_credential())
            .await
            .unwrap_or_else(|_| {
                Err(Error::Connectivity(format!(
                    "credential refresh timed out after {}s",
                    timeout.as_secs()
                )))
            })?;
        if credential.user_id == user_id {
            Ok(credential)
        } else {
            Err(Error::AuthUnavailable("session changed".to_string()))
        }
    }

    /// Run a remote call under the request timeout and track reachability.
    ///
    /// A success after a connectivity failure starts a drain unless
    /// `from_drain` is set.
    async fn remote<T>(&self, call: impl Future<Output = Result<T>>, from_drain: bool) -> Result<T> {
        let timeout = self.inner.settings.request_timeout();
        let result = tokio::time::timeout(timeout, call)
            .await
            .unwrap_or_else(|_| {
                Err(Error::Connectivity(format!(
                    "request timed out after {}s",
                    timeout.as_secs()
                )))
            });

        match &result {
            Ok(_) => {
                if self.inner.offline.swap(false, Ordering::SeqCst) {
                    tracing::info!("Connectivity restored");
                    if !from_drain {
                        self.spawn_drain(DrainMode::Manual);
                    }
                }
            }
            Err(error) if error.kind() == ErrorKind::ConnectivityFailure => {
                if !self.inner.offline.swap(true, Ordering::SeqCst) {
                    tracing::warn!("Remote store unreachable: {}", error);
                }
                self.set_state(SyncState::Offline);
            }
            Err(_) => {}
        }
        result
    }

    async fn cached(&self, user_id: Option<&str>) -> Result<EntriesResult> {
        let entries = match user_id {
            Some(user_id) => self
                .inner
                .cache
                .get_all(user_id)
                .await?
                .into_iter()
                .map(|record| record.entry)
                .collect(),
            None => Vec::new(),
        };
        Ok(EntriesResult {
            entries,
            is_from_cache: true,
        })
    }

    /// Entries for the signed-in user, most recent first.
    pub async fn get_entries(&self, force_refresh: bool) -> Result<EntriesResult> {
        let Some(user_id) = self.identity() else {
            return self.cached(None).await;
        };

        if !force_refresh && self.is_fresh(&user_id).await? {
            tracing::debug!("Serving entries for {} from fresh cache", user_id);
            return self.cached(Some(&user_id)).await;
        }

        let credential = match self.credential_for(&user_id).await {
            Ok(credential) => credential,
            Err(error) if error.is_offline_condition() => {
                tracing::debug!("No credential, serving cache: {}", error);
                return self.cached(Some(&user_id)).await;
            }
            Err(error) => return Err(error),
        };

        let requested_at = unix_millis_now();
        let fetched = self
            .remote(self.inner.api.fetch_entries(&user_id, &credential), false)
            .await;
        match fetched {
            Ok(entries) => {
                if !self.inner.session.is_current(credential.generation) {
                    tracing::info!("Session changed during fetch, discarding response");
                    return self.cached(self.identity().as_deref()).await;
                }
                self.inner
                    .cache
                    .apply_server_snapshot(&user_id, &entries, requested_at)
                    .await?;
                if !self.inner.queue.has_pending_for(&user_id).await? {
                    self.set_state(SyncState::Synced);
                }
                let mut result = self.cached(Some(&user_id)).await?;
                result.is_from_cache = false;
                Ok(result)
            }
            Err(error) if error.is_offline_condition() => {
                tracing::debug!("Fetch failed, serving cache: {}", error);
                self.cached(Some(&user_id)).await
            }
            Err(error) => Err(error),
        }
    }

    async fn is_fresh(&self, user_id: &str) -> Result<bool> {
        let Some(last_sync) = self.inner.cache.last_synced_at(user_id).await? else {
            return Ok(false);
        };
        let window = i64::try_from(self.inner.settings.freshness_window().as_millis())
            .unwrap_or(i64::MAX);
        let fresh = unix_millis_now().saturating_sub(last_sync) < window;
        Ok(fresh && !self.inner.queue.has_pending_for(user_id).await?)
    }

    /// Create an entry, queueing it when the server cannot be reached.
    pub async fn create_entry(&self, draft: EntryDraft) -> Result<CreateOutcome> {
        let draft = draft.validate()?;
        let user_id = self.require_identity()?;
        let now = unix_millis_now();
        let entry = JournalEntry::from_draft(&user_id, draft, now);
        let idempotency_key = new_idempotency_key();

        let credential = match self.credential_for(&user_id).await {
            Ok(credential) => credential,
            Err(error) if error.is_offline_condition() => {
                return self.queue_write(WriteKind::Create, entry, idempotency_key, &error).await;
            }
            Err(error) => return Err(error),
        };

        let created = self
            .remote(
                self.inner
                    .api
                    .create_entry(&entry, &idempotency_key, &credential),
                false,
            )
            .await;
        match created {
            Ok(confirmed) => {
                self.inner
                    .cache
                    .put(&confirmed, RecordSource::Server, unix_millis_now())
                    .await?;
                Ok(CreateOutcome {
                    entry: confirmed,
                    is_offline: false,
                })
            }
            Err(error) if error.is_offline_condition() => {
                self.queue_write(WriteKind::Create, entry, idempotency_key, &error).await
            }
            Err(error) => Err(error),
        }
    }

    /// Apply `draft` to an existing entry.
    ///
    /// Entries with writes already queued are updated behind them.
    pub async fn update_entry(&self, entry_id: &EntryId, draft: EntryDraft) -> Result<CreateOutcome> {
        let draft = draft.validate()?;
        let user_id = self.require_identity()?;
        let entry_id = &self.resolve_id(entry_id);
        let current = self
            .inner
            .cache
            .get(&user_id, entry_id)
            .await?
            .ok_or_else(|| Error::NotFound(entry_id.to_string()))?;
        let updated = current.entry.with_draft(draft, unix_millis_now());
        let idempotency_key = new_idempotency_key();

        if entry_id.is_temporary() || self.has_queued_writes(&user_id, entry_id).await? {
            return self
                .queue_write(
                    WriteKind::Update,
                    updated,
                    idempotency_key,
                    &"earlier writes are still queued",
                )
                .await;
        }

        let credential = match self.credential_for(&user_id).await {
            Ok(credential) => credential,
            Err(error) if error.is_offline_condition() => {
                return self.queue_write(WriteKind::Update, updated, idempotency_key, &error).await;
            }
            Err(error) => return Err(error),
        };

        let result = self
            .remote(
                self.inner
                    .api
                    .update_entry(&updated, &idempotency_key, &credential),
                false,
            )
            .await;
        match result {
            Ok(confirmed) => {
                self.inner
                    .cache
                    .put(&confirmed, RecordSource::Server, unix_millis_now())
                    .await?;
                Ok(CreateOutcome {
                    entry: confirmed,
                    is_offline: false,
                })
            }
            Err(error) if error.is_offline_condition() => {
                self.queue_write(WriteKind::Update, updated, idempotency_key, &error).await
            }
            Err(error) => Err(error),
        }
    }

    /// Server id for a temporary id whose create was already acknowledged.
    fn resolve_id(&self, entry_id: &EntryId) -> EntryId {
        self.inner
            .queue
            .promoted_id(entry_id)
            .unwrap_or_else(|| entry_id.clone())
    }

    async fn has_queued_writes(&self, user_id: &str, entry_id: &EntryId) -> Result<bool> {
        Ok(self
            .inner
            .queue
            .pending(user_id)
            .await?
            .iter()
            .any(|write| write.target() == entry_id))
    }

    /// Persist the optimistic record and the queued write in one batch.
    async fn queue_write(
        &self,
        kind: WriteKind,
        entry: JournalEntry,
        idempotency_key: String,
        reason: &(dyn fmt::Display + Sync),
    ) -> Result<CreateOutcome> {
        let now = unix_millis_now();
        let write = match kind {
            WriteKind::Create => QueuedWrite::create(entry, Some(idempotency_key), now),
            WriteKind::Update => QueuedWrite::update(entry, Some(idempotency_key), now),
        };
        let cache = &self.inner.cache;
        let write = self
            .inner
            .queue
            .enqueue_with(write, |write| Ok(vec![cache.optimistic_op(&write.entry, now)?]))
            .await?;
        tracing::info!("Saved {} offline ({})", write.target(), reason);
        self.set_state(SyncState::Offline);
        Ok(CreateOutcome {
            entry: write.entry,
            is_offline: true,
        })
    }

    /// Delete an entry.
    ///
    /// Confirmed entries are deleted only once the server acknowledges it.
    /// Entries that never reached the server are dropped locally together with
    /// their queued writes.
    pub async fn delete_entry(&self, entry_id: &EntryId) -> Result<()> {
        let user_id = self.require_identity()?;
        let entry_id = &self.resolve_id(entry_id);
        let remove_record = self.inner.cache.remove_op(&user_id, entry_id);

        let Some(server_id) = entry_id.server_id() else {
            let known = self.inner.cache.get(&user_id, entry_id).await?.is_some()
                || self.has_queued_writes(&user_id, entry_id).await?;
            if !known {
                return Err(Error::NotFound(entry_id.to_string()));
            }
            let removed = self
                .inner
                .queue
                .discard_for_entry(&user_id, entry_id, vec![remove_record])
                .await?;
            tracing::info!("Deleted unsynced entry {} ({} queued writes)", entry_id, removed);
            return Ok(());
        };

        let credential = self.credential_for(&user_id).await?;
        self.remote(self.inner.api.delete_entry(server_id, &credential), false)
            .await?;
        self.inner
            .queue
            .discard_for_entry(&user_id, entry_id, vec![remove_record])
            .await?;
        tracing::info!("Deleted entry {}", entry_id);
        Ok(())
    }

    /// Send due queued writes, respecting backoff.
    pub async fn drain(&self) -> Result<DrainReport> {
        self.drain_with(DrainMode::Scheduled).await
    }

    /// Send every queued write now, ignoring backoff.
    pub async fn retry_sync(&self) -> Result<DrainReport> {
        self.drain_with(DrainMode::Manual).await
    }

    /// Signal from the platform that the network is back.
    pub async fn notify_connectivity_restored(&self) -> Result<DrainReport> {
        self.inner.offline.store(false, Ordering::SeqCst);
        self.drain_with(DrainMode::Manual).await
    }

    fn spawn_drain(&self, mode: DrainMode) {
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(error) = engine.drain_with(mode).await {
                tracing::warn!("Background sync failed: {}", error);
            }
        });
    }

    async fn drain_with(&self, mode: DrainMode) -> Result<DrainReport> {
        let Some(user_id) = self.identity() else {
            return Ok(DrainReport::default());
        };
        if !self.inner.queue.has_pending_for(&user_id).await? {
            return Ok(DrainReport::default());
        }

        self.set_state(SyncState::Syncing);
        let engine = self.clone();
        let result = self
            .inner
            .queue
            .drain(&user_id, mode, move |write| {
                let engine = engine.clone();
                async move { engine.send_queued(write).await }
            })
            .await;

        self.set_state(match &result {
            Ok(report) if !report.failed.is_empty() => SyncState::Error,
            Ok(report) if report.still_queued == 0 => SyncState::Synced,
            Ok(_) => SyncState::Offline,
            Err(_) => SyncState::Error,
        });
        result
    }

    /// Send one queued write and describe how to record its acknowledgment.
    async fn send_queued(&self, write: QueuedWrite) -> Result<Acknowledgment> {
        let credential = self.credential_for(&write.user_id).await?;
        let api = &self.inner.api;
        match write.kind {
            WriteKind::Create => {
                let confirmed = self
                    .remote(
                        api.create_entry(&write.entry, &write.idempotency_key, &credential),
                        true,
                    )
                    .await?;
                self.ensure_current(&credential)?;
                Ok(self.reconcile_create(&write, confirmed))
            }
            WriteKind::Update => {
                if write.entry.id.is_temporary() {
                    return Err(Error::RemoteRejected(format!(
                        "{} was never created on the server",
                        write.entry.id
                    )));
                }
                let confirmed = self
                    .remote(
                        api.update_entry(&write.entry, &write.idempotency_key, &credential),
                        true,
                    )
                    .await?;
                self.ensure_current(&credential)?;

                let engine = self.clone();
                let (seq, target) = (write.seq, write.target().clone());
                Ok(Acknowledgment::new(confirmed.id.clone(), move |pending: &[QueuedWrite]| {
                    if pending
                        .iter()
                        .any(|later| later.seq > seq && later.target() == &target)
                    {
                        // A newer local edit stays visible until it syncs
                        return Ok(Vec::new());
                    }
                    Ok(vec![engine
                        .inner
                        .cache
                        .confirmed_op(&confirmed, unix_millis_now())?])
                }))
            }
        }
    }

    /// A response that arrives after the session changed is not merged; the
    /// write stays queued and its idempotency key makes the resend harmless.
    fn ensure_current(&self, credential: &Credential) -> Result<()> {
        if self.inner.session.is_current(credential.generation) {
            Ok(())
        } else {
            Err(Error::AuthUnavailable(
                "session changed during sync".to_string(),
            ))
        }
    }

    /// Replace the temporary entry with its confirmed version and retarget
    /// later writes. Built against the writes queued at commit time.
    fn reconcile_create(&self, write: &QueuedWrite, confirmed: JournalEntry) -> Acknowledgment {
        let engine = self.clone();
        let user_id = write.user_id.clone();
        let temp_id = write.target().clone();
        Acknowledgment::new(confirmed.id.clone(), move |pending: &[QueuedWrite]| {
            let cache = &engine.inner.cache;
            let now = unix_millis_now();
            let latest_update = pending
                .iter()
                .filter(|later| later.kind == WriteKind::Update && later.target() == &temp_id)
                .last();

            let mut ops = match latest_update {
                Some(update) => {
                    // Keep showing the newer local edit until its update syncs
                    let edited = JournalEntry {
                        id: confirmed.id.clone(),
                        ..update.entry.clone()
                    };
                    vec![
                        cache.remove_op(&user_id, &temp_id),
                        cache.optimistic_op(&edited, now)?,
                    ]
                }
                None => cache.promotion_ops(&user_id, &temp_id, &confirmed, now)?,
            };
            ops.extend(PendingWriteQueue::retarget_ops(
                pending,
                &temp_id,
                &confirmed.id,
            )?);
            tracing::debug!("Reconciled {} as {}", temp_id, confirmed.id);
            Ok(ops)
        })
    }

    pub async fn pending_writes(&self) -> Result<Vec<QueuedWrite>> {
        match self.identity() {
            Some(user_id) => self.inner.queue.pending(&user_id).await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        match self.identity() {
            Some(user_id) => self.inner.queue.dead_letters(&user_id).await,
            None => Ok(Vec::new()),
        }
    }

    /// Move every dead letter back into the queue. Returns how many moved.
    pub async fn requeue_failed(&self) -> Result<usize> {
        let user_id = self.require_identity()?;
        let dead = self.inner.queue.dead_letters(&user_id).await?;
        for letter in &dead {
            self.inner
                .queue
                .requeue_dead_letter(&user_id, letter.write.seq)
                .await?;
        }
        Ok(dead.len())
    }

    /// Drop the dead letter with sequence `seq`.
    ///
    /// A never-synced entry disappears locally along with its other writes; a
    /// confirmed entry falls back to the server's version on the next read.
    pub async fn discard_failed(&self, seq: u64) -> Result<()> {
        let user_id = self.require_identity()?;
        let letter = self
            .inner
            .queue
            .dead_letters(&user_id)
            .await?
            .into_iter()
            .find(|letter| letter.write.seq == seq)
            .ok_or_else(|| Error::NotFound(format!("failed write {seq}")))?;
        let target = letter.write.target().clone();

        if target.is_temporary() {
            let remove_record = self.inner.cache.remove_op(&user_id, &target);
            self.inner
                .queue
                .discard_for_entry(&user_id, &target, vec![remove_record])
                .await?;
        } else {
            self.inner.queue.discard_dead_letter(&user_id, seq).await?;
            let record: Option<CacheRecord> = self.inner.cache.get(&user_id, &target).await?;
            if record.is_some_and(|record| !record.is_server()) {
                self.inner.cache.remove(&user_id, &target).await?;
                self.inner.cache.invalidate(&user_id).await?;
            }
        }
        tracing::info!("Discarded failed write {} for {}", seq, target);
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests;
