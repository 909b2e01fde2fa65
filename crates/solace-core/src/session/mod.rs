//! Authenticated-session lifecycle.
//!
//! [`SessionStore`] is the single source of truth for who is signed in. It hands
//! out credentials tagged with the session generation, refreshes expired
//! credentials (one in-flight refresh shared by all callers), and notifies
//! subscribers of every transition on a per-subscriber task.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::auth::{AuthSession, AuthUser, CredentialProvider};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Uninitialized,
    Checking,
    Authenticated,
    Refreshing,
    Anonymous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTransition {
    /// Delivered once, on subscribe
    Current,
    SignedIn,
    SignedOut,
    Refreshed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    pub user: Option<AuthUser>,
    pub generation: u64,
    /// Credential expiry (Unix seconds)
    pub expires_at: Option<i64>,
}

impl SessionSnapshot {
    pub fn user_id(&self) -> Option<&str> {
        self.user.as_ref().map(|user| user.id.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub transition: SessionTransition,
    pub snapshot: SessionSnapshot,
}

/// Access credential tagged with the generation it was issued under.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub expires_at: i64,
    pub user_id: String,
    pub generation: u64,
}

impl fmt::Debug for Credential {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Credential")
            .field("access_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("user_id", &self.user_id)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Handle returned by [`SessionStore::subscribe`]. Dropping it stops delivery.
#[must_use = "dropping the subscription stops delivery"]
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct SessionInner {
    phase: SessionPhase,
    session: Option<AuthSession>,
    generation: u64,
    /// Bumped whenever a refresh attempt finishes, successful or not
    refresh_epoch: u64,
    last_refresh_error: Option<String>,
    listeners: Vec<mpsc::UnboundedSender<SessionEvent>>,
}

impl SessionInner {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            phase: self.phase,
            user: self.session.as_ref().map(|session| session.user.clone()),
            generation: self.generation,
            expires_at: self.session.as_ref().map(|session| session.expires_at),
        }
    }

    fn credential(&self) -> Option<Credential> {
        self.session.as_ref().map(|session| Credential {
            access_token: session.access_token.clone(),
            expires_at: session.expires_at,
            user_id: session.user.id.clone(),
            generation: self.generation,
        })
    }

    fn transition(&mut self, transition: SessionTransition) {
        self.generation += 1;
        let event = SessionEvent {
            transition,
            snapshot: self.snapshot(),
        };
        tracing::info!(
            "Session {:?} (generation {})",
            transition,
            event.snapshot.generation
        );
        self.listeners
            .retain(|listener| listener.send(event.clone()).is_ok());
    }
}

/// Puts the phase back when a caller stops waiting on a refresh, e.g. on a
/// timeout. The next caller starts a new attempt.
struct RefreshInFlight<'a> {
    store: &'a SessionStore,
    generation: u64,
    finished: bool,
}

impl Drop for RefreshInFlight<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut inner = self.store.lock();
        if inner.generation == self.generation && inner.phase == SessionPhase::Refreshing {
            tracing::debug!("Credential refresh abandoned");
            inner.phase = SessionPhase::Authenticated;
        }
    }
}

pub struct SessionStore {
    provider: Arc<dyn CredentialProvider>,
    inner: Mutex<SessionInner>,
    refresh_gate: tokio::sync::Mutex<()>,
    subscriber_count: AtomicU64,
}

impl SessionStore {
    pub fn new(provider: Arc<dyn CredentialProvider>) -> Self {
        Self {
            provider,
            inner: Mutex::new(SessionInner {
                phase: SessionPhase::Uninitialized,
                session: None,
                generation: 0,
                refresh_epoch: 0,
                last_refresh_error: None,
                listeners: Vec::new(),
            }),
            refresh_gate: tokio::sync::Mutex::new(()),
            subscriber_count: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Restore the persisted session, moving out of `Uninitialized`.
    ///
    /// Calling this again after the first check is a no-op.
    pub async fn initialize(&self) -> SessionSnapshot {
        {
            let mut inner = self.lock();
            if inner.phase != SessionPhase::Uninitialized {
                return inner.snapshot();
            }
            inner.phase = SessionPhase::Checking;
        }

        let restored = self.provider.restore_session().await;

        let mut inner = self.lock();
        if inner.phase != SessionPhase::Checking {
            // A sign-in or sign-out raced the check and wins
            return inner.snapshot();
        }
        match restored {
            Ok(Some(session)) => {
                inner.session = Some(session);
                inner.phase = SessionPhase::Authenticated;
                inner.transition(SessionTransition::SignedIn);
            }
            Ok(None) => {
                inner.phase = SessionPhase::Anonymous;
                inner.transition(SessionTransition::SignedOut);
            }
            Err(error) => {
                tracing::warn!("Failed to restore session: {}", error);
                inner.phase = SessionPhase::Anonymous;
                inner.transition(SessionTransition::SignedOut);
            }
        }
        inner.snapshot()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.lock().snapshot()
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Whether results of a call started under `generation` may still be merged.
    pub fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    /// Return a usable credential, refreshing once if the held one expired.
    pub async fn current_credential(&self) -> Result<Credential> {
        let (stale, epoch, generation) = {
            let inner = self.lock();
            match &inner.session {
                None => {
                    return Err(Error::AuthUnavailable("no active session".to_string()));
                }
                Some(session) if !session.is_expired() => {
                    if let Some(credential) = inner.credential() {
                        return Ok(credential);
                    }
                    return Err(Error::AuthUnavailable("no active session".to_string()));
                }
                Some(session) => (session.clone(), inner.refresh_epoch, inner.generation),
            }
        };

        let _gate = self.refresh_gate.lock().await;

        {
            let mut inner = self.lock();
            if inner.refresh_epoch != epoch || inner.generation != generation {
                // Another caller refreshed (or the identity changed) while we waited
                return match &inner.session {
                    Some(session) if !session.is_expired() => inner
                        .credential()
                        .ok_or_else(|| Error::AuthUnavailable("no active session".to_string())),
                    Some(_) => Err(Error::AuthUnavailable(
                        inner
                            .last_refresh_error
                            .clone()
                            .unwrap_or_else(|| "credential refresh failed".to_string()),
                    )),
                    None => Err(Error::AuthUnavailable("no active session".to_string())),
                };
            }
            inner.phase = SessionPhase::Refreshing;
        }

        tracing::debug!("Refreshing expired credential");
        let mut in_flight = RefreshInFlight {
            store: self,
            generation,
            finished: false,
        };
        let result = self.provider.refresh(&stale).await;
        in_flight.finished = true;

        let mut inner = self.lock();
        inner.refresh_epoch += 1;
        if inner.generation != generation {
            // Signed out or switched accounts mid-refresh; drop the result
            return Err(Error::AuthUnavailable(
                "session changed during refresh".to_string(),
            ));
        }

        match result {
            Ok(session) => {
                inner.session = Some(session);
                inner.phase = SessionPhase::Authenticated;
                inner.last_refresh_error = None;
                inner.transition(SessionTransition::Refreshed);
                inner
                    .credential()
                    .ok_or_else(|| Error::AuthUnavailable("no active session".to_string()))
            }
            Err(error) if error.is_connectivity() => {
                tracing::warn!("Credential refresh failed, keeping identity: {}", error);
                inner.phase = SessionPhase::Authenticated;
                inner.last_refresh_error = Some(error.to_string());
                Err(Error::AuthUnavailable(error.to_string()))
            }
            Err(error) => {
                tracing::warn!("Credential refresh rejected, signing out: {}", error);
                inner.session = None;
                inner.phase = SessionPhase::Anonymous;
                inner.last_refresh_error = Some(error.to_string());
                inner.transition(SessionTransition::SignedOut);
                Err(Error::AuthUnavailable(error.to_string()))
            }
        }
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<SessionSnapshot> {
        let session = self.provider.sign_in(email, password).await?;
        let mut inner = self.lock();
        inner.session = Some(session);
        inner.phase = SessionPhase::Authenticated;
        inner.last_refresh_error = None;
        inner.transition(SessionTransition::SignedIn);
        Ok(inner.snapshot())
    }

    /// Clear the credential locally, then revoke it remotely.
    ///
    /// Local sign-out always succeeds; a failed remote revocation is logged.
    pub async fn sign_out(&self) {
        let previous = {
            let mut inner = self.lock();
            let previous = inner.session.take();
            inner.phase = SessionPhase::Anonymous;
            inner.last_refresh_error = None;
            inner.transition(SessionTransition::SignedOut);
            previous
        };

        if let Some(session) = previous {
            if let Err(error) = self.provider.sign_out(&session).await {
                tracing::warn!("Remote sign-out failed: {}", error);
            }
        }
    }

    /// Feed a session change observed by the credential provider itself.
    pub fn apply_provider_session(&self, session: Option<AuthSession>) {
        let mut inner = self.lock();
        match session {
            Some(session) => {
                let same_user = inner
                    .session
                    .as_ref()
                    .is_some_and(|current| current.user.id == session.user.id);
                inner.session = Some(session);
                inner.phase = SessionPhase::Authenticated;
                inner.transition(if same_user {
                    SessionTransition::Refreshed
                } else {
                    SessionTransition::SignedIn
                });
            }
            None => {
                if inner.session.take().is_some() {
                    inner.phase = SessionPhase::Anonymous;
                    inner.transition(SessionTransition::SignedOut);
                }
            }
        }
    }

    /// Deliver the current state now and every later transition, in order, on
    /// a dedicated task. Must be called within a Tokio runtime.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(SessionEvent) + Send + Sync + 'static,
    {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        {
            let mut inner = self.lock();
            let current = SessionEvent {
                transition: SessionTransition::Current,
                snapshot: inner.snapshot(),
            };
            if sender.send(current).is_ok() {
                inner.listeners.push(sender);
            }
        }

        let id = self.subscriber_count.fetch_add(1, Ordering::Relaxed);
        let task = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                listener(event);
            }
            tracing::trace!("Session subscriber {} finished", id);
        });
        Subscription { task }
    }
}
