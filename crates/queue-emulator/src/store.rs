//! The per-entity message delivery engine.
//!
//! A [`MessageStore`] holds one unordered collection of pending messages (a
//! whole queue, or one session's sub-queue) and implements enqueue, blocking
//! receive, complete, abandon, lock renewal, and lazy reclamation of expired
//! locks. Reclaimed and abandoned messages are redelivered ahead of fresh
//! ones: the retry queue is always drained before the fresh queue, trading
//! strict global FIFO for lower retry latency.
//!
//! Reclamation is lazy by contract. It runs under the store mutex at the
//! start of every mutating operation, never on a background timer, so an
//! idle store holds expired locks until it is next touched.

use crate::clock::Clock;
use crate::error::{BrokerError, ValidationError};
use crate::hooks::{BrokerEvent, EventHeader, HookRegistry};
use crate::message::{
    Envelope, LockToken, MessageId, QueueName, ReceiveMode, ReceivedMessage, SessionId,
    StoreConfig, Timestamp,
};
use crate::sequence::SequenceGenerator;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// A pending message with its broker-assigned bookkeeping
#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: MessageId,
    sequence_number: u64,
    body: Bytes,
    properties: HashMap<String, String>,
    session_id: Option<SessionId>,
    enqueued_at: Timestamp,
    delivery_count: u32,
    /// TTL deadline on the monotonic clock, if the envelope carried one
    expires_at: Option<Instant>,
}

impl StoredMessage {
    fn from_envelope(envelope: Envelope, sequence_number: u64, now: Instant) -> Self {
        let expires_at = envelope.time_to_live.map(|ttl| now + ttl);
        Self {
            message_id: MessageId::new(),
            sequence_number,
            body: envelope.body,
            properties: envelope.properties,
            session_id: envelope.session_id,
            enqueued_at: Timestamp::now(),
            delivery_count: 0,
            expires_at,
        }
    }

    fn is_ttl_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }

    fn received(&self, lock: Option<(LockToken, Instant)>) -> ReceivedMessage {
        let (lock_token, locked_until) = match lock {
            Some((token, until)) => (Some(token), Some(until)),
            None => (None, None),
        };
        ReceivedMessage {
            message_id: self.message_id.clone(),
            sequence_number: self.sequence_number,
            body: self.body.clone(),
            properties: self.properties.clone(),
            session_id: self.session_id.clone(),
            enqueued_at: self.enqueued_at.clone(),
            delivery_count: self.delivery_count,
            lock_token,
            locked_until,
        }
    }
}

/// A delivered message held under a peek-lock
#[derive(Debug)]
struct LockedEntry {
    message: StoredMessage,
    locked_until: Instant,
}

/// Queue and lock state, guarded by one mutex for its full critical section
#[derive(Debug, Default)]
struct StoreState {
    /// Fresh messages in arrival order
    fresh: VecDeque<StoredMessage>,
    /// Reclaimed and abandoned messages, drained before `fresh`
    retry: VecDeque<StoredMessage>,
    /// Peek-locked deliveries awaiting settlement, keyed by lock token
    locked: HashMap<LockToken, LockedEntry>,
}

impl StoreState {
    /// Move every expired lock back into the retry queue. Returns the
    /// sequence numbers reclaimed, oldest first.
    fn reclaim_expired(&mut self, now: Instant) -> Vec<u64> {
        if self.locked.is_empty() {
            return Vec::new();
        }

        let expired: Vec<LockToken> = self
            .locked
            .iter()
            .filter(|(_, entry)| now >= entry.locked_until)
            .map(|(token, _)| token.clone())
            .collect();

        let mut reclaimed: Vec<StoredMessage> = expired
            .into_iter()
            .filter_map(|token| self.locked.remove(&token))
            .map(|entry| entry.message)
            .collect();
        // Deterministic redelivery order for locks expiring together.
        reclaimed.sort_by_key(|message| message.sequence_number);

        let sequences = reclaimed.iter().map(|m| m.sequence_number).collect();
        self.retry.extend(reclaimed);
        sequences
    }

    /// Drop messages whose TTL elapsed before delivery. Returns how many
    /// were discarded.
    fn discard_ttl_expired(&mut self, now: Instant) -> usize {
        let before = self.retry.len() + self.fresh.len();
        self.retry.retain(|message| !message.is_ttl_expired(now));
        self.fresh.retain(|message| !message.is_ttl_expired(now));
        before - (self.retry.len() + self.fresh.len())
    }

    /// Dequeue up to `max_count` messages, retry queue first.
    fn take_available(&mut self, max_count: usize) -> Vec<StoredMessage> {
        let mut taken = Vec::new();
        while taken.len() < max_count {
            match self.retry.pop_front().or_else(|| self.fresh.pop_front()) {
                Some(message) => taken.push(message),
                None => break,
            }
        }
        taken
    }

    fn has_available(&self) -> bool {
        !self.retry.is_empty() || !self.fresh.is_empty()
    }
}

// ============================================================================
// MessageStore
// ============================================================================

/// Delivery engine for one unordered collection of messages.
///
/// Thread-safe; all operations take `&self`. Only [`MessageStore::receive`]
/// suspends, waiting on an internal notification primitive gated by the wait
/// deadline and the caller's cancellation token.
#[derive(Debug)]
pub struct MessageStore {
    queue: QueueName,
    session_id: Option<SessionId>,
    state: Mutex<StoreState>,
    /// Fires whenever new work becomes available (fresh enqueue,
    /// abandon, or reclamation)
    signal: Notify,
    sequence: Arc<SequenceGenerator>,
    clock: Arc<dyn Clock>,
    lock_duration: Duration,
    hooks: Arc<HookRegistry>,
}

impl MessageStore {
    /// Create a store for a session-disabled entity.
    pub fn new(
        queue: QueueName,
        config: &StoreConfig,
        clock: Arc<dyn Clock>,
        sequence: Arc<SequenceGenerator>,
        hooks: Arc<HookRegistry>,
    ) -> Self {
        Self::build(queue, None, config, clock, sequence, hooks)
    }

    /// Create the sub-queue store for one session.
    pub(crate) fn for_session(
        queue: QueueName,
        session_id: SessionId,
        config: &StoreConfig,
        clock: Arc<dyn Clock>,
        sequence: Arc<SequenceGenerator>,
        hooks: Arc<HookRegistry>,
    ) -> Self {
        Self::build(queue, Some(session_id), config, clock, sequence, hooks)
    }

    fn build(
        queue: QueueName,
        session_id: Option<SessionId>,
        config: &StoreConfig,
        clock: Arc<dyn Clock>,
        sequence: Arc<SequenceGenerator>,
        hooks: Arc<HookRegistry>,
    ) -> Self {
        Self {
            queue,
            session_id,
            state: Mutex::new(StoreState::default()),
            signal: Notify::new(),
            sequence,
            clock,
            lock_duration: config.lock_duration,
            hooks,
        }
    }

    /// Append one message to the fresh queue and wake a waiting receiver.
    pub fn enqueue(&self, envelope: Envelope) {
        self.enqueue_batch(vec![envelope]);
    }

    /// Append a batch, assigning contiguous sequence numbers, and wake
    /// waiting receivers.
    pub fn enqueue_batch(&self, envelopes: Vec<Envelope>) {
        if envelopes.is_empty() {
            return;
        }

        let count = envelopes.len();
        let first_sequence = self.sequence.next(count as u64);
        {
            let mut state = self.lock_state();
            let now = self.clock.now();
            for (offset, envelope) in envelopes.into_iter().enumerate() {
                state.fresh.push_back(StoredMessage::from_envelope(
                    envelope,
                    first_sequence + offset as u64,
                    now,
                ));
            }
        }
        // A single permit suffices: each woken receiver cascades another
        // notify_one whenever it leaves work behind.
        self.signal.notify_one();

        debug!(queue = %self.queue, count, first_sequence, "enqueued messages");
        self.hooks.dispatch(&BrokerEvent::Enqueued {
            header: self.header(),
            count,
            first_sequence,
        });
    }

    /// Receive up to `max_count` messages, blocking up to `max_wait`.
    ///
    /// Returns as soon as at least one message is available, even if fewer
    /// than `max_count` were taken. An empty vec after `max_wait` is a
    /// normal outcome; cancellation yields [`BrokerError::Cancelled`].
    ///
    /// # Errors
    ///
    /// `max_count` of zero or a zero `max_wait` is a precondition failure
    /// ([`ValidationError::OutOfRange`]), not silently clamped.
    pub async fn receive(
        &self,
        max_count: usize,
        max_wait: Duration,
        mode: ReceiveMode,
        cancel: &CancellationToken,
    ) -> Result<Vec<ReceivedMessage>, BrokerError> {
        if max_count == 0 {
            return Err(ValidationError::OutOfRange {
                field: "max_count".to_string(),
                message: "must be at least 1".to_string(),
            }
            .into());
        }
        if max_wait.is_zero() {
            return Err(ValidationError::OutOfRange {
                field: "max_wait".to_string(),
                message: "must be greater than zero".to_string(),
            }
            .into());
        }

        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            let wait = {
                let mut state = self.lock_state();
                let now = self.clock.now();
                let reclaimed = state.reclaim_expired(now);
                let discarded = state.discard_ttl_expired(now);
                let taken = state.take_available(max_count);

                let delivered = if taken.is_empty() {
                    None
                } else {
                    let batch = self.admit(&mut state, taken, mode, now);
                    if state.has_available() {
                        // Cascade the wakeup to the next waiter.
                        self.signal.notify_one();
                    }
                    Some(batch)
                };
                drop(state);

                self.publish_housekeeping(&reclaimed, discarded);
                match delivered {
                    Some(batch) => {
                        debug!(queue = %self.queue, count = batch.len(), ?mode, "delivered messages");
                        self.hooks.dispatch(&BrokerEvent::Delivered {
                            header: self.header(),
                            count: batch.len(),
                            mode,
                        });
                        return Ok(batch);
                    }
                    // Nothing available: register for a wakeup. A permit
                    // stored by an enqueue racing this gap is consumed on
                    // first poll, so no arrival is missed.
                    None => self.signal.notified(),
                }
            };

            tokio::select! {
                _ = wait => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
                _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
            }
        }
    }

    /// Settle a peek-lock delivery.
    ///
    /// Returns `false` when the token is unknown or its lock already
    /// expired. That is an expected outcome callers branch on, not a fault.
    pub fn complete(&self, token: &LockToken) -> bool {
        let (reclaimed, removed) = {
            let mut state = self.lock_state();
            let now = self.clock.now();
            let reclaimed = state.reclaim_expired(now);
            (reclaimed, state.locked.remove(token).is_some())
        };
        self.publish_housekeeping(&reclaimed, 0);

        if removed {
            debug!(queue = %self.queue, %token, "completed message");
            self.hooks.dispatch(&BrokerEvent::Completed {
                header: self.header(),
                token: token.clone(),
            });
        } else {
            trace!(queue = %self.queue, %token, "complete on unknown or expired token");
        }
        removed
    }

    /// Return a peek-locked message to the retry queue with a fresh enqueue
    /// timestamp. Returns `false`, without touching any state, when the
    /// token is unknown or expired.
    pub fn abandon(&self, token: &LockToken) -> bool {
        let (reclaimed, abandoned) = {
            let mut state = self.lock_state();
            let now = self.clock.now();
            let reclaimed = state.reclaim_expired(now);
            let abandoned = match state.locked.remove(token) {
                Some(entry) => {
                    let mut message = entry.message;
                    message.enqueued_at = Timestamp::now();
                    state.retry.push_back(message);
                    true
                }
                None => false,
            };
            (reclaimed, abandoned)
        };
        self.publish_housekeeping(&reclaimed, 0);

        if abandoned {
            self.signal.notify_one();
            debug!(queue = %self.queue, %token, "abandoned message");
            self.hooks.dispatch(&BrokerEvent::Abandoned {
                header: self.header(),
                token: token.clone(),
            });
        } else {
            trace!(queue = %self.queue, %token, "abandon on unknown or expired token");
        }
        abandoned
    }

    /// Extend a message lock to a full lock duration from now. Returns
    /// `false` when the token is unknown or already expired.
    pub fn renew_lock(&self, token: &LockToken) -> bool {
        let (reclaimed, renewed) = {
            let mut state = self.lock_state();
            let now = self.clock.now();
            let reclaimed = state.reclaim_expired(now);
            let renewed = match state.locked.get_mut(token) {
                Some(entry) => {
                    entry.locked_until = now + self.lock_duration;
                    true
                }
                None => false,
            };
            (reclaimed, renewed)
        };
        self.publish_housekeeping(&reclaimed, 0);

        if renewed {
            debug!(queue = %self.queue, %token, "renewed message lock");
            self.hooks.dispatch(&BrokerEvent::LockRenewed {
                header: self.header(),
                token: token.clone(),
            });
        }
        renewed
    }

    /// Messages currently deliverable (fresh + retry), after reclaiming
    /// expired locks.
    pub fn active_count(&self) -> usize {
        let (reclaimed, discarded, count) = {
            let mut state = self.lock_state();
            let now = self.clock.now();
            let reclaimed = state.reclaim_expired(now);
            let discarded = state.discard_ttl_expired(now);
            (reclaimed, discarded, state.fresh.len() + state.retry.len())
        };
        self.publish_housekeeping(&reclaimed, discarded);
        count
    }

    /// All messages the store still owns (fresh + retry + locked), after
    /// reclaiming expired locks.
    pub fn total_count(&self) -> usize {
        let (reclaimed, discarded, count) = {
            let mut state = self.lock_state();
            let now = self.clock.now();
            let reclaimed = state.reclaim_expired(now);
            let discarded = state.discard_ttl_expired(now);
            (
                reclaimed,
                discarded,
                state.fresh.len() + state.retry.len() + state.locked.len(),
            )
        };
        self.publish_housekeeping(&reclaimed, discarded);
        count
    }

    pub fn queue_name(&self) -> &QueueName {
        &self.queue
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn lock_state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().expect("message store state poisoned")
    }

    fn header(&self) -> EventHeader {
        EventHeader::new(self.queue.clone(), self.session_id.clone())
    }

    /// Turn dequeued messages into deliveries, locking them in peek-lock
    /// mode. Runs under the store mutex.
    fn admit(
        &self,
        state: &mut StoreState,
        taken: Vec<StoredMessage>,
        mode: ReceiveMode,
        now: Instant,
    ) -> Vec<ReceivedMessage> {
        taken
            .into_iter()
            .map(|mut message| {
                message.delivery_count += 1;
                match mode {
                    ReceiveMode::DeleteOnReceive => message.received(None),
                    ReceiveMode::PeekLock => {
                        let token = LockToken::generate();
                        let locked_until = now + self.lock_duration;
                        let delivery = message.received(Some((token.clone(), locked_until)));
                        state.locked.insert(
                            token,
                            LockedEntry {
                                message,
                                locked_until,
                            },
                        );
                        delivery
                    }
                }
            })
            .collect()
    }

    /// Report reclamation and TTL discards after the mutex is released, and
    /// wake a receiver if reclamation produced deliverable work.
    fn publish_housekeeping(&self, reclaimed: &[u64], discarded: usize) {
        for sequence_number in reclaimed {
            warn!(
                queue = %self.queue,
                sequence_number,
                "message lock expired; redelivering"
            );
            self.hooks.dispatch(&BrokerEvent::LockExpired {
                header: self.header(),
                sequence_number: *sequence_number,
            });
        }
        if !reclaimed.is_empty() {
            self.signal.notify_one();
        }
        if discarded > 0 {
            trace!(queue = %self.queue, discarded, "discarded expired messages");
        }
    }
}
