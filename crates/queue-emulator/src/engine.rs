//! Sessionless entity engine and the shared entity-facing traits.
//!
//! Session-enabled and session-disabled entities present the same contract
//! to the surrounding client-wrapper layer: [`QueueProducer`] carries the
//! producer surface, [`QueueConsumer`] the consumer surface. A sessionless
//! entity implements both directly; a session-enabled entity produces
//! through [`crate::session::SessionEngine`] and consumes through an
//! acquired session.

use crate::clock::{Clock, SystemClock};
use crate::error::BrokerError;
use crate::hooks::HookRegistry;
use crate::message::{
    Envelope, LockToken, QueueName, ReceiveMode, ReceivedMessage, StoreConfig,
};
use crate::sequence::SequenceGenerator;
use crate::store::MessageStore;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;

/// Producer-facing surface of a broker entity
pub trait QueueProducer: Send + Sync {
    fn queue_name(&self) -> &QueueName;

    /// Enqueue one envelope
    fn enqueue(&self, envelope: Envelope) -> Result<(), BrokerError>;

    /// Enqueue a batch; validation failures reject the whole batch before
    /// any message is stored
    fn enqueue_batch(&self, envelopes: Vec<Envelope>) -> Result<(), BrokerError>;

    /// Deliverable messages, reclaiming expired locks as a side effect
    fn active_count(&self) -> usize;

    /// All owned messages including locked ones, reclaiming expired locks
    /// as a side effect
    fn total_count(&self) -> usize;
}

/// Consumer-facing surface of a broker entity or acquired session
#[async_trait]
pub trait QueueConsumer: Send + Sync {
    /// Receive up to `max_count` messages, blocking up to `max_wait`
    async fn receive(
        &self,
        max_count: usize,
        max_wait: Duration,
        mode: ReceiveMode,
        cancel: &CancellationToken,
    ) -> Result<Vec<ReceivedMessage>, BrokerError>;

    /// Settle a peek-lock delivery; `Ok(false)` for an unknown or expired
    /// token
    fn complete(&self, token: &LockToken) -> Result<bool, BrokerError>;

    /// Return a peek-locked message for redelivery; a stale token is a
    /// fault ([`BrokerError::MessageLockLost`]), unlike `complete`
    fn abandon(&self, token: &LockToken) -> Result<(), BrokerError>;

    /// Extend a message lock; `Ok(false)` for an unknown or expired token
    fn renew_lock(&self, token: &LockToken) -> Result<bool, BrokerError>;
}

// ============================================================================
// SessionlessEngine
// ============================================================================

/// Thin adapter exposing a single [`MessageStore`] through the shared
/// entity-facing contract, for entities without session affinity.
///
/// # Example
///
/// ```rust
/// use queue_emulator::{Envelope, QueueName, ReceiveMode, SessionlessEngine, StoreConfig};
/// use bytes::Bytes;
/// use std::time::Duration;
/// use tokio_util::sync::CancellationToken;
///
/// # tokio_test::block_on(async {
/// let engine = SessionlessEngine::new(QueueName::new("jobs").unwrap(), StoreConfig::default());
/// engine.enqueue(Envelope::new(Bytes::from("hello")));
///
/// let batch = engine
///     .receive(1, Duration::from_secs(1), ReceiveMode::PeekLock, &CancellationToken::new())
///     .await
///     .unwrap();
/// let token = batch[0].lock_token.clone().unwrap();
/// assert!(engine.complete(&token));
/// # });
/// ```
#[derive(Debug)]
pub struct SessionlessEngine {
    store: MessageStore,
    queue: QueueName,
}

impl SessionlessEngine {
    pub fn new(queue: QueueName, config: StoreConfig) -> Self {
        Self::with_parts(
            queue,
            config,
            Arc::new(SystemClock),
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
        let store = MessageStore::new(
            queue.clone(),
            &config,
            clock,
            Arc::new(SequenceGenerator::new()),
            hooks,
        );
        Self { store, queue }
    }

    pub async fn receive(
        &self,
        max_count: usize,
        max_wait: Duration,
        mode: ReceiveMode,
        cancel: &CancellationToken,
    ) -> Result<Vec<ReceivedMessage>, BrokerError> {
        self.store.receive(max_count, max_wait, mode, cancel).await
    }

    pub fn complete(&self, token: &LockToken) -> bool {
        self.store.complete(token)
    }

    pub fn abandon(&self, token: &LockToken) -> bool {
        self.store.abandon(token)
    }

    pub fn renew_lock(&self, token: &LockToken) -> bool {
        self.store.renew_lock(token)
    }

    pub fn enqueue(&self, envelope: Envelope) {
        self.store.enqueue(envelope)
    }

    pub fn enqueue_batch(&self, envelopes: Vec<Envelope>) {
        self.store.enqueue_batch(envelopes)
    }

    pub fn active_count(&self) -> usize {
        self.store.active_count()
    }

    pub fn total_count(&self) -> usize {
        self.store.total_count()
    }
}

impl QueueProducer for SessionlessEngine {
    fn queue_name(&self) -> &QueueName {
        &self.queue
    }

    fn enqueue(&self, envelope: Envelope) -> Result<(), BrokerError> {
        SessionlessEngine::enqueue(self, envelope);
        Ok(())
    }

    fn enqueue_batch(&self, envelopes: Vec<Envelope>) -> Result<(), BrokerError> {
        SessionlessEngine::enqueue_batch(self, envelopes);
        Ok(())
    }

    fn active_count(&self) -> usize {
        SessionlessEngine::active_count(self)
    }

    fn total_count(&self) -> usize {
        SessionlessEngine::total_count(self)
    }
}

#[async_trait]
impl QueueConsumer for SessionlessEngine {
    async fn receive(
        &self,
        max_count: usize,
        max_wait: Duration,
        mode: ReceiveMode,
        cancel: &CancellationToken,
    ) -> Result<Vec<ReceivedMessage>, BrokerError> {
        self.store.receive(max_count, max_wait, mode, cancel).await
    }

    fn complete(&self, token: &LockToken) -> Result<bool, BrokerError> {
        Ok(SessionlessEngine::complete(self, token))
    }

    fn abandon(&self, token: &LockToken) -> Result<(), BrokerError> {
        if SessionlessEngine::abandon(self, token) {
            Ok(())
        } else {
            Err(BrokerError::MessageLockLost {
                token: token.to_string(),
            })
        }
    }

    fn renew_lock(&self, token: &LockToken) -> Result<bool, BrokerError> {
        Ok(SessionlessEngine::renew_lock(self, token))
    }
}
