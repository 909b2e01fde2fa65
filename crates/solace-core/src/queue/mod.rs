//! Durable FIFO of unacknowledged writes.
//!
//! Writes live under `queue/{user}/{seq}` until the server acknowledges them;
//! writes that will not be retried move to `dead/{user}/{seq}`. The sequence
//! number is zero-padded so key order is FIFO order.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::join_all;
use rand::Rng;

use crate::config::SyncSettings;
use crate::db::{DurableStore, StorageOp};
use crate::error::{Error, ErrorKind, Result};
use crate::models::{new_idempotency_key, DeadLetter, EntryId, QueuedWrite, WriteKind};
use crate::util::unix_millis_now;

fn queue_prefix(user_id: &str) -> String {
    format!("queue/{user_id}/")
}

fn queue_key(user_id: &str, seq: u64) -> String {
    format!("queue/{user_id}/{seq:020}")
}

fn dead_prefix(user_id: &str) -> String {
    format!("dead/{user_id}/")
}

fn dead_key(user_id: &str, seq: u64) -> String {
    format!("dead/{user_id}/{seq:020}")
}

fn seq_from_key(key: &str) -> Option<u64> {
    key.rsplit('/').next()?.parse().ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainMode {
    /// Writes still waiting out their backoff are skipped
    Scheduled,
    /// Every queued write is attempted now
    Manual,
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Server ids of entries whose writes were acknowledged in this pass
    pub succeeded: Vec<EntryId>,
    /// Writes dead-lettered in this pass
    pub failed: Vec<DeadLetter>,
    /// Writes left in the queue afterwards
    pub still_queued: usize,
}

/// Exponential retry delay with jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base_ms: u64,
    max_ms: u64,
}

impl Backoff {
    pub const fn new(base_ms: u64, max_ms: u64) -> Self {
        Self { base_ms, max_ms }
    }

    pub const fn from_settings(settings: &SyncSettings) -> Self {
        Self::new(settings.backoff_base_ms, settings.backoff_max_ms)
    }

    /// Upper bound of the delay after `attempts` failures.
    pub fn ceiling_ms(&self, attempts: u32) -> u64 {
        let exponent = attempts.saturating_sub(1).min(32);
        self.base_ms
            .saturating_mul(1_u64 << exponent)
            .min(self.max_ms)
    }

    /// Delay after `attempts` failures, between half and all of the ceiling.
    pub fn delay_ms(&self, attempts: u32) -> u64 {
        let ceiling = self.ceiling_ms(attempts);
        if ceiling == 0 {
            return 0;
        }
        rand::thread_rng().gen_range(ceiling / 2..=ceiling)
    }
}

type RecordAck = Box<dyn FnOnce(&[QueuedWrite]) -> Result<Vec<StorageOp>> + Send>;

/// A queued write the server accepted.
pub struct Acknowledgment {
    /// Id the server knows the entry by
    pub confirmed_id: EntryId,
    record: RecordAck,
}

impl Acknowledgment {
    /// `record` builds the ops recording the acknowledgment from the writes
    /// still queued for the user. It runs while the queue is locked, so no
    /// write can be enqueued between the read and the commit.
    pub fn new(
        confirmed_id: EntryId,
        record: impl FnOnce(&[QueuedWrite]) -> Result<Vec<StorageOp>> + Send + 'static,
    ) -> Self {
        Self {
            confirmed_id,
            record: Box::new(record),
        }
    }

    pub fn with_ops(confirmed_id: EntryId, ops: Vec<StorageOp>) -> Self {
        Self::new(confirmed_id, move |_| Ok(ops))
    }
}

impl fmt::Debug for Acknowledgment {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Acknowledgment")
            .field("confirmed_id", &self.confirmed_id)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct DrainShared {
    /// Completed passes, used by waiters to detect that a pass ran while they waited
    passes: u64,
    last: Option<(String, std::result::Result<DrainReport, String>)>,
}

pub struct PendingWriteQueue {
    store: Arc<dyn DurableStore>,
    next_seq: AtomicU64,
    /// Serializes structural changes (enqueue, write-back, removal)
    mutation: tokio::sync::Mutex<()>,
    drain_gate: tokio::sync::Mutex<()>,
    drain_shared: Mutex<DrainShared>,
    /// Temporary ids acknowledged by this process, mapped to their server ids
    promoted: Mutex<HashMap<EntryId, EntryId>>,
    max_retries: u32,
    backoff: Backoff,
}

/// What a failed send means for the rest of the pass.
enum AfterFailure {
    /// No usable credential; stop every group
    HaltPass,
    /// Retryable failure; later writes for the entry wait behind it
    StopGroup(Option<DeadLetter>),
    /// Terminal failure; the write left the queue
    Continue(Option<DeadLetter>),
}

#[derive(Default)]
struct GroupOutcome {
    succeeded: Vec<EntryId>,
    failed: Vec<DeadLetter>,
}

impl PendingWriteQueue {
    /// Open the queue over `store`, continuing the persisted sequence.
    pub async fn open(store: Arc<dyn DurableStore>, settings: &SyncSettings) -> Result<Self> {
        let mut max_seq = 0;
        for prefix in ["queue/", "dead/"] {
            for (key, _) in store.scan_prefix(prefix).await? {
                if let Some(seq) = seq_from_key(&key) {
                    max_seq = max_seq.max(seq);
                }
            }
        }

        Ok(Self {
            store,
            next_seq: AtomicU64::new(max_seq + 1),
            mutation: tokio::sync::Mutex::new(()),
            drain_gate: tokio::sync::Mutex::new(()),
            drain_shared: Mutex::new(DrainShared::default()),
            promoted: Mutex::new(HashMap::new()),
            max_retries: settings.max_retries.max(1),
            backoff: Backoff::from_settings(settings),
        })
    }

    pub async fn enqueue(&self, write: QueuedWrite) -> Result<QueuedWrite> {
        self.enqueue_with(write, |_| Ok(Vec::new())).await
    }

    /// Append `write`, persisting it atomically with the ops `extra_ops`
    /// builds for the write as finally queued.
    ///
    /// Assigns the FIFO sequence and, when empty, a fresh idempotency key. An
    /// update for a temporary entry whose create was already acknowledged is
    /// pointed at the server id first.
    pub async fn enqueue_with<F>(&self, mut write: QueuedWrite, extra_ops: F) -> Result<QueuedWrite>
    where
        F: FnOnce(&QueuedWrite) -> Result<Vec<StorageOp>>,
    {
        let _guard = self.mutation.lock().await;
        if write.kind == WriteKind::Update && write.target().is_temporary() {
            self.follow_promotion(&mut write).await?;
        }
        write.seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        if write.idempotency_key.is_empty() {
            write.idempotency_key = new_idempotency_key();
        }

        let mut batch = vec![StorageOp::put(
            queue_key(&write.user_id, write.seq),
            serde_json::to_string(&write)?,
        )];
        batch.extend(extra_ops(&write)?);
        self.store.apply(batch).await?;
        tracing::debug!(
            "Queued {:?} for {} (seq {})",
            write.kind,
            write.target(),
            write.seq
        );
        Ok(write)
    }

    async fn follow_promotion(&self, write: &mut QueuedWrite) -> Result<()> {
        if let Some(confirmed_id) = self.promoted_id(write.target()) {
            tracing::debug!("{} is now {}, redirecting update", write.target(), confirmed_id);
            write.entry.id = confirmed_id;
            return Ok(());
        }

        let target = write.target();
        let is_create =
            |queued: &QueuedWrite| queued.kind == WriteKind::Create && queued.target() == target;
        let known = self.pending(&write.user_id).await?.iter().any(is_create)
            || self
                .dead_letters(&write.user_id)
                .await?
                .iter()
                .any(|dead| is_create(&dead.write));
        if known {
            Ok(())
        } else {
            Err(Error::NotFound(target.to_string()))
        }
    }

    /// Server id of a temporary entry acknowledged by this queue.
    pub fn promoted_id(&self, temp_id: &EntryId) -> Option<EntryId> {
        self.promoted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(temp_id)
            .cloned()
    }

    /// Queued writes for `user_id` in FIFO order.
    pub async fn pending(&self, user_id: &str) -> Result<Vec<QueuedWrite>> {
        self.load_all(&queue_prefix(user_id)).await
    }

    pub async fn pending_count(&self, user_id: &str) -> Result<usize> {
        Ok(self.store.scan_prefix(&queue_prefix(user_id)).await?.len())
    }

    pub async fn has_pending_for(&self, user_id: &str) -> Result<bool> {
        Ok(self.pending_count(user_id).await? > 0)
    }

    pub async fn dead_letters(&self, user_id: &str) -> Result<Vec<DeadLetter>> {
        self.load_all(&dead_prefix(user_id)).await
    }

    async fn load_all<T: serde::de::DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>> {
        self.store
            .scan_prefix(prefix)
            .await?
            .into_iter()
            .map(|(_, raw)| serde_json::from_str(&raw).map_err(Into::into))
            .collect()
    }

    async fn load_write(&self, user_id: &str, seq: u64) -> Result<Option<QueuedWrite>> {
        self.store
            .get(&queue_key(user_id, seq))
            .await?
            .map(|raw| serde_json::from_str(&raw).map_err(Into::into))
            .transpose()
    }

    /// Ops pointing the updates in `pending` for `temp_id` at `confirmed_id`.
    pub fn retarget_ops(
        pending: &[QueuedWrite],
        temp_id: &EntryId,
        confirmed_id: &EntryId,
    ) -> Result<Vec<StorageOp>> {
        let mut ops = Vec::new();
        for write in pending {
            if write.target() != temp_id || write.kind == WriteKind::Create {
                continue;
            }
            let mut write = write.clone();
            write.entry.id = confirmed_id.clone();
            ops.push(StorageOp::put(
                queue_key(&write.user_id, write.seq),
                serde_json::to_string(&write)?,
            ));
        }
        Ok(ops)
    }

    /// Move a dead letter back into the queue with a fresh attempt budget.
    /// The idempotency key and FIFO position are kept.
    pub async fn requeue_dead_letter(&self, user_id: &str, seq: u64) -> Result<QueuedWrite> {
        let _guard = self.mutation.lock().await;
        let raw = self
            .store
            .get(&dead_key(user_id, seq))
            .await?
            .ok_or_else(|| Error::NotFound(format!("dead letter {seq}")))?;
        let dead: DeadLetter = serde_json::from_str(&raw)?;

        let mut write = dead.write;
        write.attempts = 0;
        write.last_error = None;
        write.next_attempt_at = 0;
        self.store
            .apply(vec![
                StorageOp::delete(dead_key(user_id, seq)),
                StorageOp::put(queue_key(user_id, seq), serde_json::to_string(&write)?),
            ])
            .await?;
        tracing::info!("Requeued failed write {} for {}", seq, write.target());
        Ok(write)
    }

    pub async fn discard_dead_letter(&self, user_id: &str, seq: u64) -> Result<()> {
        let _guard = self.mutation.lock().await;
        let key = dead_key(user_id, seq);
        if self.store.get(&key).await?.is_none() {
            return Err(Error::NotFound(format!("dead letter {seq}")));
        }
        self.store.delete(&key).await
    }

    /// Remove every queued and dead-lettered write for `entry_id`, atomically
    /// with `extra_ops`. Returns how many writes were removed.
    pub async fn discard_for_entry(
        &self,
        user_id: &str,
        entry_id: &EntryId,
        extra_ops: Vec<StorageOp>,
    ) -> Result<usize> {
        let _guard = self.mutation.lock().await;
        let mut batch = Vec::new();
        for write in self.pending(user_id).await? {
            if write.target() == entry_id {
                batch.push(StorageOp::delete(queue_key(user_id, write.seq)));
            }
        }
        for dead in self.dead_letters(user_id).await? {
            if dead.write.target() == entry_id {
                batch.push(StorageOp::delete(dead_key(user_id, dead.write.seq)));
            }
        }
        let removed = batch.len();
        batch.extend(extra_ops);
        self.store.apply(batch).await?;
        Ok(removed)
    }

    /// Send queued writes for `user_id` through `send`.
    ///
    /// `send` returns the [`Acknowledgment`] of a write; its ops are applied
    /// atomically with removal of the write. At most one pass runs at
    /// a time: a call made while a pass for the same user is running waits for
    /// it and returns its report.
    pub async fn drain<F, Fut>(&self, user_id: &str, mode: DrainMode, send: F) -> Result<DrainReport>
    where
        F: Fn(QueuedWrite) -> Fut + Send + Sync,
        Fut: Future<Output = Result<Acknowledgment>> + Send,
    {
        let seen_passes = self.shared().passes;
        let _gate = self.drain_gate.lock().await;
        {
            let shared = self.shared();
            if shared.passes != seen_passes {
                if let Some((user, result)) = &shared.last {
                    if user == user_id {
                        tracing::debug!("Joining drain pass that finished while waiting");
                        return result.clone().map_err(Error::Storage);
                    }
                }
            }
        }

        let result = self.run_pass(user_id, mode, &send).await;

        let mut shared = self.shared();
        shared.passes += 1;
        shared.last = Some((
            user_id.to_string(),
            result.as_ref().cloned().map_err(ToString::to_string),
        ));
        result
    }

    fn shared(&self) -> std::sync::MutexGuard<'_, DrainShared> {
        self.drain_shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_pass<F, Fut>(&self, user_id: &str, mode: DrainMode, send: &F) -> Result<DrainReport>
    where
        F: Fn(QueuedWrite) -> Fut + Send + Sync,
        Fut: Future<Output = Result<Acknowledgment>> + Send,
    {
        let pending = self.pending(user_id).await?;
        if pending.is_empty() {
            return Ok(DrainReport::default());
        }

        let mut groups: BTreeMap<String, Vec<u64>> = BTreeMap::new();
        for write in &pending {
            groups
                .entry(write.target().as_key())
                .or_default()
                .push(write.seq);
        }
        tracing::info!(
            "Draining {} queued writes across {} entries",
            pending.len(),
            groups.len()
        );

        let halted = AtomicBool::new(false);
        let now = unix_millis_now();
        let outcomes = join_all(
            groups
                .into_values()
                .map(|seqs| self.drain_group(user_id, seqs, mode, now, send, &halted)),
        )
        .await;

        let mut report = DrainReport::default();
        let mut first_error = None;
        for outcome in outcomes {
            match outcome {
                Ok(group) => {
                    report.succeeded.extend(group.succeeded);
                    report.failed.extend(group.failed);
                }
                Err(error) => {
                    first_error.get_or_insert(error);
                }
            }
        }
        if let Some(error) = first_error {
            return Err(error);
        }

        report.still_queued = self.pending_count(user_id).await?;
        tracing::info!(
            "Drain finished: {} synced, {} failed, {} still queued",
            report.succeeded.len(),
            report.failed.len(),
            report.still_queued
        );
        Ok(report)
    }

    async fn drain_group<F, Fut>(
        &self,
        user_id: &str,
        seqs: Vec<u64>,
        mode: DrainMode,
        now: i64,
        send: &F,
        halted: &AtomicBool,
    ) -> Result<GroupOutcome>
    where
        F: Fn(QueuedWrite) -> Fut + Send + Sync,
        Fut: Future<Output = Result<Acknowledgment>> + Send,
    {
        let mut outcome = GroupOutcome::default();
        for seq in seqs {
            if halted.load(Ordering::SeqCst) {
                break;
            }
            // Re-read: an earlier acknowledgment may have retargeted this write
            let Some(write) = self.load_write(user_id, seq).await? else {
                continue;
            };
            if mode == DrainMode::Scheduled && !write.is_due(now) {
                tracing::debug!("Write {} is backing off", seq);
                break;
            }

            match send(write.clone()).await {
                Ok(ack) => {
                    let confirmed_id = ack.confirmed_id.clone();
                    if self.acknowledge(&write, ack).await? {
                        outcome.succeeded.push(confirmed_id);
                    }
                }
                Err(error) => match self.record_failure(write, &error).await? {
                    AfterFailure::HaltPass => {
                        halted.store(true, Ordering::SeqCst);
                        break;
                    }
                    AfterFailure::StopGroup(dead) => {
                        outcome.failed.extend(dead);
                        break;
                    }
                    AfterFailure::Continue(dead) => outcome.failed.extend(dead),
                },
            }
        }
        Ok(outcome)
    }

    /// Record the acknowledgment and drop the write. Returns false when the
    /// write was discarded while it was in flight.
    async fn acknowledge(&self, write: &QueuedWrite, ack: Acknowledgment) -> Result<bool> {
        let _guard = self.mutation.lock().await;
        let key = queue_key(&write.user_id, write.seq);
        if self.store.get(&key).await?.is_none() {
            tracing::warn!(
                "Write {} for {} was discarded while in flight",
                write.seq,
                write.target()
            );
            return Ok(false);
        }
        let pending = self.pending(&write.user_id).await?;
        let mut batch = (ack.record)(&pending)?;
        batch.push(StorageOp::delete(key));
        self.store.apply(batch).await?;
        if write.kind == WriteKind::Create && write.target() != &ack.confirmed_id {
            self.promoted
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(write.target().clone(), ack.confirmed_id);
        }
        Ok(true)
    }

    async fn record_failure(&self, mut write: QueuedWrite, error: &Error) -> Result<AfterFailure> {
        let now = unix_millis_now();
        match error.kind() {
            ErrorKind::AuthUnavailable => {
                tracing::info!("Drain paused, no usable credential: {}", error);
                Ok(AfterFailure::HaltPass)
            }
            ErrorKind::StorageFailure => Err(Error::Storage(error.to_string())),
            ErrorKind::ConnectivityFailure => {
                write.attempts += 1;
                write.last_error = Some(error.to_string());
                if write.attempts >= self.max_retries {
                    tracing::warn!(
                        "Write {} for {} exhausted {} attempts",
                        write.seq,
                        write.target(),
                        write.attempts
                    );
                    let dead = self.dead_letter(write, error.to_string(), false, now).await?;
                    Ok(AfterFailure::StopGroup(dead))
                } else {
                    let delay = self.backoff.delay_ms(write.attempts);
                    write.next_attempt_at = now + i64::try_from(delay).unwrap_or(i64::MAX / 2);
                    tracing::debug!(
                        "Write {} failed (attempt {}), retrying in {}ms",
                        write.seq,
                        write.attempts,
                        delay
                    );
                    self.write_back(&write).await?;
                    Ok(AfterFailure::StopGroup(None))
                }
            }
            ErrorKind::ValidationFailed | ErrorKind::RemoteRejected | ErrorKind::NotFound => {
                tracing::warn!("Write {} for {} rejected: {}", write.seq, write.target(), error);
                write.last_error = Some(error.to_string());
                let dead = self.dead_letter(write, error.to_string(), true, now).await?;
                Ok(AfterFailure::Continue(dead))
            }
        }
    }

    async fn write_back(&self, write: &QueuedWrite) -> Result<()> {
        let _guard = self.mutation.lock().await;
        let key = queue_key(&write.user_id, write.seq);
        if self.store.get(&key).await?.is_none() {
            return Ok(());
        }
        self.store.put(&key, &serde_json::to_string(write)?).await
    }

    async fn dead_letter(
        &self,
        write: QueuedWrite,
        reason: String,
        rejected: bool,
        now: i64,
    ) -> Result<Option<DeadLetter>> {
        let _guard = self.mutation.lock().await;
        let key = queue_key(&write.user_id, write.seq);
        if self.store.get(&key).await?.is_none() {
            return Ok(None);
        }
        let user_id = write.user_id.clone();
        let seq = write.seq;
        let dead = DeadLetter {
            write,
            failed_at: now,
            reason,
            rejected,
        };
        self.store
            .apply(vec![
                StorageOp::delete(key),
                StorageOp::put(dead_key(&user_id, seq), serde_json::to_string(&dead)?),
            ])
            .await?;
        Ok(Some(dead))
    }
}
