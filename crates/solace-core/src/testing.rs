//! In-process fakes for the auth and journal collaborators.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::auth::{AuthError, AuthResult, AuthSession, AuthUser, CredentialProvider};
use crate::db::{DurableStore, MemoryStore, StorageOp};
use crate::error::{Error, Result};
use crate::models::{EntryId, JournalEntry};
use crate::remote::JournalApi;
use crate::session::Credential;
use crate::util::unix_timestamp_now;

static TOKEN_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Session for `user_id` expiring `expires_in_secs` from now.
pub fn session_for(user_id: &str, expires_in_secs: i64) -> AuthSession {
    let token = TOKEN_COUNTER.fetch_add(1, Ordering::Relaxed);
    AuthSession {
        access_token: format!("access-{user_id}-{token}"),
        refresh_token: format!("refresh-{user_id}-{token}"),
        expires_at: unix_timestamp_now() + expires_in_secs,
        user: AuthUser {
            id: user_id.to_string(),
            email: Some(format!("{user_id}@example.com")),
        },
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RefreshOutcome {
    #[default]
    Succeed,
    /// Auth server unreachable
    Offline,
    /// Refresh token revoked
    Reject,
}

#[derive(Default)]
pub struct FakeProvider {
    stored: Mutex<Option<AuthSession>>,
    refresh_delay: Duration,
    refresh_outcome: Mutex<RefreshOutcome>,
    refresh_calls: AtomicUsize,
}

impl FakeProvider {
    pub fn with_stored(session: AuthSession) -> Self {
        Self {
            stored: Mutex::new(Some(session)),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_refresh_delay(mut self, delay: Duration) -> Self {
        self.refresh_delay = delay;
        self
    }

    #[must_use]
    pub fn with_refresh_outcome(self, outcome: RefreshOutcome) -> Self {
        self.set_refresh_outcome(outcome);
        self
    }

    pub fn set_refresh_outcome(&self, outcome: RefreshOutcome) {
        *lock(&self.refresh_outcome) = outcome;
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn stored(&self) -> Option<AuthSession> {
        lock(&self.stored).clone()
    }
}

#[async_trait]
impl CredentialProvider for FakeProvider {
    async fn restore_session(&self) -> AuthResult<Option<AuthSession>> {
        Ok(self.stored())
    }

    async fn sign_in(&self, email: &str, password: &str) -> AuthResult<AuthSession> {
        if password.is_empty() {
            return Err(AuthError::Api {
                status: Some(400),
                message: "Invalid login credentials".to_string(),
            });
        }
        let session = session_for(email, 3_600);
        *lock(&self.stored) = Some(session.clone());
        Ok(session)
    }

    async fn refresh(&self, session: &AuthSession) -> AuthResult<AuthSession> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if !self.refresh_delay.is_zero() {
            tokio::time::sleep(self.refresh_delay).await;
        }
        let outcome = *lock(&self.refresh_outcome);
        match outcome {
            RefreshOutcome::Succeed => {
                let refreshed = session_for(&session.user.id, 3_600);
                *lock(&self.stored) = Some(refreshed.clone());
                Ok(refreshed)
            }
            RefreshOutcome::Offline => Err(AuthError::Api {
                status: Some(503),
                message: "auth server unavailable".to_string(),
            }),
            RefreshOutcome::Reject => {
                *lock(&self.stored) = None;
                Err(AuthError::Api {
                    status: Some(400),
                    message: "Invalid Refresh Token".to_string(),
                })
            }
        }
    }

    async fn sign_out(&self, _session: &AuthSession) -> AuthResult<()> {
        *lock(&self.stored) = None;
        Ok(())
    }
}

/// [`MemoryStore`] that can hold one read of a key after the value was read,
/// leaving the reader with a stale copy while other tasks run.
pub struct PausingStore {
    inner: Arc<MemoryStore>,
    pause: Mutex<Option<(String, Arc<Notify>, Arc<Notify>)>>,
}

impl PausingStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            pause: Mutex::new(None),
        }
    }

    /// Hold the next read of `key`. Returns `(reached, release)`: `reached`
    /// fires once the value was read, `release` lets the read return.
    pub fn pause_next_read(&self, key: impl Into<String>) -> (Arc<Notify>, Arc<Notify>) {
        let reached = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *lock(&self.pause) = Some((key.into(), reached.clone(), release.clone()));
        (reached, release)
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.inner.snapshot()
    }
}

#[async_trait]
impl DurableStore for PausingStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value = self.inner.get(key).await?;
        let armed = {
            let mut pause = lock(&self.pause);
            match pause.as_ref() {
                Some((paused, _, _)) if paused == key => pause.take(),
                _ => None,
            }
        };
        if let Some((_, reached, release)) = armed {
            reached.notify_one();
            release.notified().await;
        }
        Ok(value)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        self.inner.scan_prefix(prefix).await
    }

    async fn apply(&self, batch: Vec<StorageOp>) -> Result<()> {
        self.inner.apply(batch).await
    }
}

/// Scripted failure for the next journal call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Unauthorized,
    Rejected,
}

impl Failure {
    fn into_error(self) -> Error {
        match self {
            Self::Unauthorized => Error::AuthUnavailable("JWT expired (401)".to_string()),
            Self::Rejected => Error::RemoteRejected("check constraint violated (400)".to_string()),
        }
    }
}

#[derive(Default)]
struct ServerState {
    rows: Vec<JournalEntry>,
    /// idempotency key -> server id
    keys: HashMap<String, String>,
    next_id: usize,
    failures: VecDeque<Failure>,
    seen_keys: Vec<String>,
    fetch_gate: Option<Arc<Notify>>,
}

/// In-memory journal server with idempotent creates and scripted failures.
#[derive(Default)]
pub struct FakeJournalApi {
    state: Mutex<ServerState>,
    offline: AtomicBool,
    drop_next_ack: AtomicBool,
    fetch_calls: AtomicUsize,
    write_delay_ms: AtomicU64,
    fetch_started: Notify,
}

impl FakeJournalApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn fail_next(&self, failure: Failure) {
        lock(&self.state).failures.push_back(failure);
    }

    /// Apply the next create but lose the response, as if the network dropped.
    pub fn drop_next_ack(&self) {
        self.drop_next_ack.store(true, Ordering::SeqCst);
    }

    pub fn set_write_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.write_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Hold fetches until the returned handle is notified.
    pub fn gate_fetches(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        lock(&self.state).fetch_gate = Some(gate.clone());
        gate
    }

    pub async fn wait_for_fetch(&self) {
        self.fetch_started.notified().await;
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn rows_for(&self, user_id: &str) -> Vec<JournalEntry> {
        lock(&self.state)
            .rows
            .iter()
            .filter(|row| row.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn seen_keys(&self) -> Vec<String> {
        lock(&self.state).seen_keys.clone()
    }

    /// Insert a row directly, as if another device had written it.
    pub fn seed(&self, entry: JournalEntry) -> JournalEntry {
        let mut state = lock(&self.state);
        state.next_id += 1;
        let stored = JournalEntry {
            id: EntryId::confirmed(format!("srv-{}", state.next_id)),
            ..entry
        };
        state.rows.push(stored.clone());
        stored
    }

    fn check_reachable(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Connectivity("network unreachable".to_string()));
        }
        if let Some(failure) = lock(&self.state).failures.pop_front() {
            return Err(failure.into_error());
        }
        Ok(())
    }

    async fn write_delay(&self) {
        let millis = self.write_delay_ms.load(Ordering::SeqCst);
        if millis > 0 {
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }
    }
}

fn check_owner(user_id: &str, credential: &Credential) -> Result<()> {
    if user_id == credential.user_id {
        Ok(())
    } else {
        Err(Error::RemoteRejected("row level security (403)".to_string()))
    }
}

#[async_trait]
impl JournalApi for FakeJournalApi {
    async fn fetch_entries(
        &self,
        user_id: &str,
        credential: &Credential,
    ) -> Result<Vec<JournalEntry>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        check_owner(user_id, credential)?;

        let gate = lock(&self.state).fetch_gate.take();
        let rows = self.rows_for(user_id);
        if let Some(gate) = gate {
            self.fetch_started.notify_one();
            gate.notified().await;
        }

        let mut rows = rows;
        rows.sort_by(|left, right| right.created_at.cmp(&left.created_at));
        Ok(rows)
    }

    async fn create_entry(
        &self,
        entry: &JournalEntry,
        idempotency_key: &str,
        credential: &Credential,
    ) -> Result<JournalEntry> {
        self.write_delay().await;
        self.check_reachable()?;
        check_owner(&entry.user_id, credential)?;

        let stored = {
            let mut state = lock(&self.state);
            state.seen_keys.push(idempotency_key.to_string());
            let existing = state.keys.get(idempotency_key).cloned();
            match existing {
                Some(server_id) => state
                    .rows
                    .iter()
                    .find(|row| row.id.server_id() == Some(server_id.as_str()))
                    .cloned()
                    .ok_or_else(|| Error::RemoteRejected("row vanished".to_string()))?,
                None => {
                    state.next_id += 1;
                    let server_id = format!("srv-{}", state.next_id);
                    let stored = JournalEntry {
                        id: EntryId::confirmed(server_id.clone()),
                        ..entry.clone()
                    };
                    state.rows.push(stored.clone());
                    state.keys.insert(idempotency_key.to_string(), server_id);
                    stored
                }
            }
        };

        if self.drop_next_ack.swap(false, Ordering::SeqCst) {
            return Err(Error::Connectivity("connection reset".to_string()));
        }
        Ok(stored)
    }

    async fn update_entry(
        &self,
        entry: &JournalEntry,
        idempotency_key: &str,
        credential: &Credential,
    ) -> Result<JournalEntry> {
        self.write_delay().await;
        self.check_reachable()?;
        check_owner(&entry.user_id, credential)?;

        let mut state = lock(&self.state);
        state.seen_keys.push(idempotency_key.to_string());
        let row = state
            .rows
            .iter_mut()
            .find(|row| row.id == entry.id)
            .ok_or_else(|| Error::RemoteRejected("no such row (404)".to_string()))?;
        *row = JournalEntry {
            ai_insight: row.ai_insight.clone(),
            ..entry.clone()
        };
        Ok(row.clone())
    }

    async fn delete_entry(&self, entry_id: &str, credential: &Credential) -> Result<()> {
        self.check_reachable()?;
        let mut state = lock(&self.state);
        state.rows.retain(|row| {
            row.id.server_id() != Some(entry_id) || row.user_id != credential.user_id
        });
        Ok(())
    }
}
