//! Session-exclusive consumption: per-session stores, session locks, and the
//! engine that owns the set of sessions for one entity.
//!
//! A session groups all messages sharing a session id and exposes them to at
//! most one consumer at a time. The session lock is a capability with its own
//! expiry, independent of any message lock held by the same consumer: losing
//! the session fails every message-level operation, even when the presented
//! message token would still be valid.

use crate::clock::Clock;
use crate::engine::{QueueConsumer, QueueProducer};
use crate::error::BrokerError;
use crate::hooks::{BrokerEvent, EventHeader, HookRegistry};
use crate::message::{
    Envelope, LockToken, QueueName, ReceiveMode, ReceivedMessage, SessionId, StoreConfig,
};
use crate::sequence::SequenceGenerator;
use crate::store::MessageStore;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;

// ============================================================================
// SessionLock
// ============================================================================

/// Capability proving exclusive access to one session.
///
/// At most one valid (non-expired) lock exists per session at any time. The
/// handle is cheap to clone so a renewal task can share it with the consumer.
#[derive(Debug, Clone)]
pub struct SessionLock {
    session_id: SessionId,
    token: LockToken,
}

impl SessionLock {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }
}

/// The currently granted session lock, tracked store-side
#[derive(Debug)]
struct HeldLock {
    token: LockToken,
    locked_until: Instant,
}

#[derive(Debug, Default)]
struct SessionState {
    holder: Option<HeldLock>,
    state_blob: Option<Bytes>,
}

// ============================================================================
// SessionStore
// ============================================================================

/// One session's sub-queue plus its session-level lock and state blob.
///
/// Message-level operations each require a currently-valid [`SessionLock`];
/// a stale or superseded lock fails the whole operation with
/// [`BrokerError::SessionLockLost`] before any message state is touched.
#[derive(Debug)]
pub struct SessionStore {
    session_id: SessionId,
    store: MessageStore,
    session: Mutex<SessionState>,
    clock: Arc<dyn Clock>,
    session_lock_duration: Duration,
    hooks: Arc<HookRegistry>,
}

impl SessionStore {
    pub(crate) fn new(
        queue: QueueName,
        session_id: SessionId,
        config: &StoreConfig,
        clock: Arc<dyn Clock>,
        sequence: Arc<SequenceGenerator>,
        hooks: Arc<HookRegistry>,
    ) -> Self {
        let store = MessageStore::for_session(
            queue,
            session_id.clone(),
            config,
            Arc::clone(&clock),
            sequence,
            Arc::clone(&hooks),
        );
        Self {
            session_id,
            store,
            session: Mutex::new(SessionState::default()),
            clock,
            session_lock_duration: config.session_lock_duration,
            hooks,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Attempt to take the session lock.
    ///
    /// Fails when a valid lock is already held. With `allow_empty` false it
    /// also fails when the session has no active messages, which keeps the
    /// next-available scan from parking on sessions with no work.
    pub fn try_lock(&self, allow_empty: bool) -> Option<SessionLock> {
        // Advisory admission check, taken before the session mutex so the
        // store mutex is never acquired under it. Only a lock holder can
        // drain the store, so a non-empty result cannot be invalidated by
        // a racing consumer.
        if !allow_empty && self.store.active_count() == 0 {
            return None;
        }

        let mut session = self.lock_session();
        let now = self.clock.now();

        if let Some(held) = &session.holder {
            if now < held.locked_until {
                return None;
            }
            trace!(session_id = %self.session_id, "superseding expired session lock");
        }

        let token = LockToken::generate();
        session.holder = Some(HeldLock {
            token: token.clone(),
            locked_until: now + self.session_lock_duration,
        });
        drop(session);

        debug!(session_id = %self.session_id, "session lock acquired");
        self.hooks.dispatch(&BrokerEvent::SessionAcquired {
            header: self.header(),
        });
        Some(SessionLock {
            session_id: self.session_id.clone(),
            token,
        })
    }

    /// Release the session lock. A stale or superseded handle is a no-op.
    pub fn release(&self, lock: &SessionLock) {
        let released = {
            let mut session = self.lock_session();
            match &session.holder {
                Some(held) if held.token == lock.token => {
                    session.holder = None;
                    true
                }
                _ => false,
            }
        };

        if released {
            debug!(session_id = %self.session_id, "session lock released");
            self.hooks.dispatch(&BrokerEvent::SessionReleased {
                header: self.header(),
            });
        } else {
            trace!(session_id = %self.session_id, "release of stale session lock ignored");
        }
    }

    /// Extend the session lock to a full duration from now. Returns `false`
    /// for an expired or superseded handle.
    pub fn renew(&self, lock: &SessionLock) -> bool {
        let mut session = self.lock_session();
        let now = self.clock.now();
        match &mut session.holder {
            Some(held) if held.token == lock.token && now < held.locked_until => {
                held.locked_until = now + self.session_lock_duration;
                true
            }
            _ => false,
        }
    }

    /// Read the opaque session state blob.
    pub fn get_state(&self, lock: &SessionLock) -> Result<Option<Bytes>, BrokerError> {
        let session = self.lock_session();
        self.ensure_held(&session, lock)?;
        Ok(session.state_blob.clone())
    }

    /// Replace the opaque session state blob.
    pub fn set_state(&self, lock: &SessionLock, blob: Bytes) -> Result<(), BrokerError> {
        let size = blob.len();
        {
            let mut session = self.lock_session();
            self.ensure_held(&session, lock)?;
            session.state_blob = Some(blob);
        }

        self.hooks.dispatch(&BrokerEvent::SessionStateChanged {
            header: self.header(),
            size,
        });
        Ok(())
    }

    /// Receive from this session's sub-queue, gated on the session lock.
    ///
    /// The gate holds across the whole blocking window, not just at entry:
    /// the wait is sliced so it never outsleeps the current lock expiry,
    /// and a batch is handed out only if the lock is still valid once the
    /// inner receive produced it. On loss the call fails with
    /// [`BrokerError::SessionLockLost`] and any peek-locked items go back
    /// to the retry queue for the next holder.
    pub async fn receive(
        &self,
        lock: &SessionLock,
        max_count: usize,
        max_wait: Duration,
        mode: ReceiveMode,
        cancel: &CancellationToken,
    ) -> Result<Vec<ReceivedMessage>, BrokerError> {
        self.check_lock(lock)?;
        if max_count == 0 || max_wait.is_zero() {
            // Let the store report the precondition failure.
            return self.store.receive(max_count, max_wait, mode, cancel).await;
        }

        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            let validity = self.lock_remaining(lock)?;
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }

            let batch = self
                .store
                .receive(max_count, remaining.min(validity), mode, cancel)
                .await?;
            if let Err(lost) = self.check_lock(lock) {
                // Never hand out messages under a lost session. Peek-locked
                // items return to the retry queue; delete-on-receive items
                // were already removed and are not restored.
                for message in &batch {
                    if let Some(token) = &message.lock_token {
                        self.store.abandon(token);
                    }
                }
                return Err(lost);
            }
            if !batch.is_empty() {
                return Ok(batch);
            }
        }
    }

    /// Complete a message delivery, gated on the session lock.
    pub fn complete(&self, lock: &SessionLock, token: &LockToken) -> Result<bool, BrokerError> {
        self.check_lock(lock)?;
        Ok(self.store.complete(token))
    }

    /// Abandon a message delivery, gated on the session lock.
    ///
    /// Unlike `complete`, a stale message token is a fault here:
    /// [`BrokerError::MessageLockLost`].
    pub fn abandon(&self, lock: &SessionLock, token: &LockToken) -> Result<(), BrokerError> {
        self.check_lock(lock)?;
        if self.store.abandon(token) {
            Ok(())
        } else {
            Err(BrokerError::MessageLockLost {
                token: token.to_string(),
            })
        }
    }

    /// Renew a message lock, gated on the session lock.
    pub fn renew_message_lock(
        &self,
        lock: &SessionLock,
        token: &LockToken,
    ) -> Result<bool, BrokerError> {
        self.check_lock(lock)?;
        Ok(self.store.renew_lock(token))
    }

    pub fn active_count(&self) -> usize {
        self.store.active_count()
    }

    pub fn total_count(&self) -> usize {
        self.store.total_count()
    }

    pub(crate) fn enqueue(&self, envelope: Envelope) {
        self.store.enqueue(envelope);
    }

    pub(crate) fn enqueue_batch(&self, envelopes: Vec<Envelope>) {
        self.store.enqueue_batch(envelopes);
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn lock_session(&self) -> MutexGuard<'_, SessionState> {
        self.session.lock().expect("session state poisoned")
    }

    /// Validate the handle against current lock state, then act.
    fn check_lock(&self, lock: &SessionLock) -> Result<(), BrokerError> {
        let session = self.lock_session();
        self.ensure_held(&session, lock)
    }

    /// How long the presented lock stays valid from now, barring renewal.
    fn lock_remaining(&self, lock: &SessionLock) -> Result<Duration, BrokerError> {
        let session = self.lock_session();
        let now = self.clock.now();
        match &session.holder {
            Some(held) if held.token == lock.token && now < held.locked_until => {
                Ok(held.locked_until - now)
            }
            _ => Err(BrokerError::SessionLockLost {
                session_id: self.session_id.to_string(),
            }),
        }
    }

    fn ensure_held(
        &self,
        session: &SessionState,
        lock: &SessionLock,
    ) -> Result<(), BrokerError> {
        let now = self.clock.now();
        match &session.holder {
            Some(held) if held.token == lock.token && now < held.locked_until => Ok(()),
            _ => Err(BrokerError::SessionLockLost {
                session_id: self.session_id.to_string(),
            }),
        }
    }

    fn header(&self) -> EventHeader {
        EventHeader::new(self.store.queue_name().clone(), Some(self.session_id.clone()))
    }
}

// ============================================================================
// AcquiredSession
// ============================================================================

/// A session handle bundling the store with its lock, so callers do not
/// re-present the lock on every operation.
#[derive(Debug)]
pub struct AcquiredSession {
    store: Arc<SessionStore>,
    lock: SessionLock,
}

impl AcquiredSession {
    fn new(store: Arc<SessionStore>, lock: SessionLock) -> Self {
        Self { store, lock }
    }

    pub fn session_id(&self) -> &SessionId {
        self.lock.session_id()
    }

    pub fn lock(&self) -> &SessionLock {
        &self.lock
    }

    pub async fn receive(
        &self,
        max_count: usize,
        max_wait: Duration,
        mode: ReceiveMode,
        cancel: &CancellationToken,
    ) -> Result<Vec<ReceivedMessage>, BrokerError> {
        self.store
            .receive(&self.lock, max_count, max_wait, mode, cancel)
            .await
    }

    pub fn complete(&self, token: &LockToken) -> Result<bool, BrokerError> {
        self.store.complete(&self.lock, token)
    }

    pub fn abandon(&self, token: &LockToken) -> Result<(), BrokerError> {
        self.store.abandon(&self.lock, token)
    }

    pub fn renew_message_lock(&self, token: &LockToken) -> Result<bool, BrokerError> {
        self.store.renew_message_lock(&self.lock, token)
    }

    /// Extend the session lock. Returns `false` once the lock is lost.
    pub fn renew_session_lock(&self) -> bool {
        self.store.renew(&self.lock)
    }

    pub fn get_state(&self) -> Result<Option<Bytes>, BrokerError> {
        self.store.get_state(&self.lock)
    }

    pub fn set_state(&self, blob: Bytes) -> Result<(), BrokerError> {
        self.store.set_state(&self.lock, blob)
    }

    pub fn active_count(&self) -> usize {
        self.store.active_count()
    }

    /// Release the session lock, consuming the handle.
    pub fn release(self) {
        self.store.release(&self.lock);
    }
}

#[async_trait]
impl QueueConsumer for AcquiredSession {
    async fn receive(
        &self,
        max_count: usize,
        max_wait: Duration,
        mode: ReceiveMode,
        cancel: &CancellationToken,
    ) -> Result<Vec<ReceivedMessage>, BrokerError> {
        AcquiredSession::receive(self, max_count, max_wait, mode, cancel).await
    }

    fn complete(&self, token: &LockToken) -> Result<bool, BrokerError> {
        AcquiredSession::complete(self, token)
    }

    fn abandon(&self, token: &LockToken) -> Result<(), BrokerError> {
        AcquiredSession::abandon(self, token)
    }

    fn renew_lock(&self, token: &LockToken) -> Result<bool, BrokerError> {
        AcquiredSession::renew_message_lock(self, token)
    }
}

// ============================================================================
// SessionEngine
// ============================================================================

/// Owner of the session set for a session-enabled entity.
///
/// Sessions are created lazily on first message or first explicit
/// acquisition attempt, and never destroyed within the engine's lifetime.
/// All sessions share one sequence generator, so sequence numbers stay
/// globally monotonic across the entity.
///
/// # Example
///
/// ```rust
/// use queue_emulator::{Envelope, QueueName, ReceiveMode, SessionEngine, SessionId, StoreConfig};
/// use bytes::Bytes;
/// use std::time::Duration;
/// use tokio_util::sync::CancellationToken;
///
/// # tokio_test::block_on(async {
/// let engine = SessionEngine::new(QueueName::new("orders").unwrap(), StoreConfig::default());
/// let key = SessionId::new("user-42").unwrap();
/// engine
///     .add_message(Envelope::new(Bytes::from("hello")).with_session_id(key.clone()))
///     .unwrap();
///
/// let session = engine.try_acquire(&key, false).unwrap();
/// let batch = session
///     .receive(1, Duration::from_secs(1), ReceiveMode::PeekLock, &CancellationToken::new())
///     .await
///     .unwrap();
/// let token = batch[0].lock_token.clone().unwrap();
/// assert!(session.complete(&token).unwrap());
/// session.release();
/// # });
/// ```
#[derive(Debug)]
pub struct SessionEngine {
    queue: QueueName,
    config: StoreConfig,
    clock: Arc<dyn Clock>,
    sequence: Arc<SequenceGenerator>,
    hooks: Arc<HookRegistry>,
    sessions: RwLock<HashMap<SessionId, Arc<SessionStore>>>,
}

impl SessionEngine {
    pub fn new(queue: QueueName, config: StoreConfig) -> Self {
        Self::with_parts(
            queue,
            config,
            Arc::new(crate::clock::SystemClock),
            Arc::new(HookRegistry::new()),
        )
    }

    /// Create an engine with an injected clock and hook registry.
    pub fn with_parts(
        queue: QueueName,
        config: StoreConfig,
        clock: Arc<dyn Clock>,
        hooks: Arc<HookRegistry>,
    ) -> Self {
        Self {
            queue,
            config,
            clock,
            sequence: Arc::new(SequenceGenerator::new()),
            hooks,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Route one message to its session, creating the session on demand.
    ///
    /// # Errors
    ///
    /// [`BrokerError::SessionIdMissing`] when the envelope carries no
    /// session id; session-enabled entities validate this at enqueue time.
    pub fn add_message(&self, envelope: Envelope) -> Result<(), BrokerError> {
        let session_id = self.require_session_id(&envelope)?.clone();
        self.session(&session_id).enqueue(envelope);
        Ok(())
    }

    /// Route a batch, validating every envelope before enqueuing any.
    pub fn add_message_batch(&self, envelopes: Vec<Envelope>) -> Result<(), BrokerError> {
        for envelope in &envelopes {
            self.require_session_id(envelope)?;
        }

        // Group per session, preserving arrival order within each.
        let mut grouped: Vec<(SessionId, Vec<Envelope>)> = Vec::new();
        for envelope in envelopes {
            let session_id = envelope
                .session_id
                .clone()
                .expect("validated above");
            match grouped.iter_mut().find(|(id, _)| *id == session_id) {
                Some((_, batch)) => batch.push(envelope),
                None => grouped.push((session_id, vec![envelope])),
            }
        }
        for (session_id, batch) in grouped {
            self.session(&session_id).enqueue_batch(batch);
        }
        Ok(())
    }

    /// One direct attempt at the named session, creating it if absent.
    ///
    /// Explicit acquisition may reserve an empty session (`allow_empty`)
    /// and wait for work to arrive.
    pub fn try_acquire(&self, session_id: &SessionId, allow_empty: bool) -> Option<AcquiredSession> {
        let store = self.session(session_id);
        let lock = store.try_lock(allow_empty)?;
        Some(AcquiredSession::new(store, lock))
    }

    /// Scan for any unlocked session with active messages, sleeping between
    /// full sweeps, until one is acquired or `max_wait` elapses.
    ///
    /// `Ok(None)` on exhaustion is the normal no-session-available outcome;
    /// cancellation yields [`BrokerError::Cancelled`]. Scan order across
    /// sessions is unspecified.
    pub async fn acquire_next_available(
        &self,
        max_wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<AcquiredSession>, BrokerError> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            let snapshot: Vec<Arc<SessionStore>> = {
                let sessions = self.sessions.read().expect("session map poisoned");
                sessions.values().cloned().collect()
            };
            // Automatic acquisition never parks on an empty session.
            for store in snapshot {
                if let Some(lock) = store.try_lock(false) {
                    return Ok(Some(AcquiredSession::new(store, lock)));
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                trace!(queue = %self.queue, "no session available within max_wait");
                return Ok(None);
            }
            let next_sweep = deadline.min(now + self.config.scan_interval);
            tokio::select! {
                _ = tokio::time::sleep_until(next_sweep) => {}
                _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
            }
        }
    }

    /// Number of sessions created so far.
    pub fn session_count(&self) -> usize {
        self.sessions.read().expect("session map poisoned").len()
    }

    pub fn queue_name(&self) -> &QueueName {
        &self.queue
    }

    /// Look up or create the store for a session key. Creation is
    /// double-checked so concurrent callers never construct two stores for
    /// the same key.
    fn session(&self, session_id: &SessionId) -> Arc<SessionStore> {
        {
            let sessions = self.sessions.read().expect("session map poisoned");
            if let Some(store) = sessions.get(session_id) {
                return Arc::clone(store);
            }
        }

        let mut sessions = self.sessions.write().expect("session map poisoned");
        Arc::clone(sessions.entry(session_id.clone()).or_insert_with(|| {
            debug!(queue = %self.queue, %session_id, "created session");
            Arc::new(SessionStore::new(
                self.queue.clone(),
                session_id.clone(),
                &self.config,
                Arc::clone(&self.clock),
                Arc::clone(&self.sequence),
                Arc::clone(&self.hooks),
            ))
        }))
    }

    fn require_session_id<'a>(
        &self,
        envelope: &'a Envelope,
    ) -> Result<&'a SessionId, BrokerError> {
        envelope
            .session_id
            .as_ref()
            .ok_or_else(|| BrokerError::SessionIdMissing {
                queue: self.queue.to_string(),
            })
    }
}

impl QueueProducer for SessionEngine {
    fn queue_name(&self) -> &QueueName {
        &self.queue
    }

    fn enqueue(&self, envelope: Envelope) -> Result<(), BrokerError> {
        self.add_message(envelope)
    }

    fn enqueue_batch(&self, envelopes: Vec<Envelope>) -> Result<(), BrokerError> {
        self.add_message_batch(envelopes)
    }

    fn active_count(&self) -> usize {
        let sessions = self.sessions.read().expect("session map poisoned");
        sessions.values().map(|s| s.active_count()).sum()
    }

    fn total_count(&self) -> usize {
        let sessions = self.sessions.read().expect("session map poisoned");
        sessions.values().map(|s| s.total_count()).sum()
    }
}
