//! Structured broker events with predicate-based hook dispatch.
//!
//! The emulator surfaces operation metadata as tagged variants rather than a
//! class hierarchy: one [`BrokerEvent`] case per operation kind, each
//! carrying a common [`EventHeader`] plus operation-specific fields. Hooks
//! subscribe with an [`EventFilter`], a predicate object over the tagged
//! union, and fire synchronously after the operation commits (never under a
//! store mutex).

use crate::message::{LockToken, QueueName, ReceiveMode, SessionId, Timestamp};
use std::sync::RwLock;

/// Metadata common to every broker event
#[derive(Debug, Clone)]
pub struct EventHeader {
    pub queue: QueueName,
    pub session_id: Option<SessionId>,
    pub at: Timestamp,
}

impl EventHeader {
    pub(crate) fn new(queue: QueueName, session_id: Option<SessionId>) -> Self {
        Self {
            queue,
            session_id,
            at: Timestamp::now(),
        }
    }
}

/// One case per broker operation kind
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// Messages were appended to the fresh queue
    Enqueued {
        header: EventHeader,
        count: usize,
        first_sequence: u64,
    },
    /// Messages were handed to a consumer
    Delivered {
        header: EventHeader,
        count: usize,
        mode: ReceiveMode,
    },
    /// A peek-lock delivery was settled successfully
    Completed {
        header: EventHeader,
        token: LockToken,
    },
    /// A peek-lock delivery was abandoned back to the retry queue
    Abandoned {
        header: EventHeader,
        token: LockToken,
    },
    /// A message lock expiry was extended
    LockRenewed {
        header: EventHeader,
        token: LockToken,
    },
    /// An expired message lock was reclaimed into the retry queue
    LockExpired {
        header: EventHeader,
        sequence_number: u64,
    },
    /// A session lock was granted
    SessionAcquired { header: EventHeader },
    /// A session lock was released
    SessionReleased { header: EventHeader },
    /// The session state blob was replaced
    SessionStateChanged { header: EventHeader, size: usize },
}

/// Discriminant for filtering events by operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Enqueued,
    Delivered,
    Completed,
    Abandoned,
    LockRenewed,
    LockExpired,
    SessionAcquired,
    SessionReleased,
    SessionStateChanged,
}

impl BrokerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Enqueued { .. } => EventKind::Enqueued,
            Self::Delivered { .. } => EventKind::Delivered,
            Self::Completed { .. } => EventKind::Completed,
            Self::Abandoned { .. } => EventKind::Abandoned,
            Self::LockRenewed { .. } => EventKind::LockRenewed,
            Self::LockExpired { .. } => EventKind::LockExpired,
            Self::SessionAcquired { .. } => EventKind::SessionAcquired,
            Self::SessionReleased { .. } => EventKind::SessionReleased,
            Self::SessionStateChanged { .. } => EventKind::SessionStateChanged,
        }
    }

    pub fn header(&self) -> &EventHeader {
        match self {
            Self::Enqueued { header, .. }
            | Self::Delivered { header, .. }
            | Self::Completed { header, .. }
            | Self::Abandoned { header, .. }
            | Self::LockRenewed { header, .. }
            | Self::LockExpired { header, .. }
            | Self::SessionAcquired { header }
            | Self::SessionReleased { header }
            | Self::SessionStateChanged { header, .. } => header,
        }
    }
}

// ============================================================================
// Filters
// ============================================================================

/// Predicate over [`BrokerEvent`]s; all configured conditions must match.
///
/// An empty filter matches every event.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    kind: Option<EventKind>,
    queue: Option<QueueName>,
    session_id: Option<SessionId>,
}

impl EventFilter {
    /// Filter matching every event
    pub fn any() -> Self {
        Self::default()
    }

    /// Restrict to one operation kind
    pub fn with_kind(mut self, kind: EventKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Restrict to one queue
    pub fn with_queue(mut self, queue: QueueName) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Restrict to one session
    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn matches(&self, event: &BrokerEvent) -> bool {
        if let Some(kind) = self.kind {
            if event.kind() != kind {
                return false;
            }
        }

        let header = event.header();
        if let Some(ref queue) = self.queue {
            if header.queue != *queue {
                return false;
            }
        }
        if let Some(ref session_id) = self.session_id {
            if header.session_id.as_ref() != Some(session_id) {
                return false;
            }
        }

        true
    }
}

// ============================================================================
// Registry
// ============================================================================

type HookCallback = Box<dyn Fn(&BrokerEvent) + Send + Sync>;

struct Hook {
    filter: EventFilter,
    callback: HookCallback,
}

/// Registered `(filter, callback)` pairs, shared across the engines of one
/// emulator instance.
#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<Vec<Hook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for events matching `filter`.
    pub fn register<F>(&self, filter: EventFilter, callback: F)
    where
        F: Fn(&BrokerEvent) + Send + Sync + 'static,
    {
        let mut hooks = self.hooks.write().expect("hook registry poisoned");
        hooks.push(Hook {
            filter,
            callback: Box::new(callback),
        });
    }

    /// Invoke every matching hook, in registration order.
    pub(crate) fn dispatch(&self, event: &BrokerEvent) {
        let hooks = self.hooks.read().expect("hook registry poisoned");
        for hook in hooks.iter() {
            if hook.filter.matches(event) {
                (hook.callback)(event);
            }
        }
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.hooks.read().map(|h| h.len()).unwrap_or(0);
        f.debug_struct("HookRegistry").field("hooks", &count).finish()
    }
}

#[cfg(test)]
#[path = "hooks_tests.rs"]
mod tests;
