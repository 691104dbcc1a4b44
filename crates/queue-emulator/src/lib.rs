//! # Queue Emulator
//!
//! In-process, in-memory emulation of cloud message broker semantics, so
//! application code can be tested without a live backend.
//!
//! The crate implements the lock-based broker core: pending messages are
//! stored per entity, handed out under exclusive time-boxed locks
//! ("visibility timeout"), tracked per session for exclusive consumption,
//! and reclaimed lazily when a lock expires. Receive calls block with
//! timeout and cooperative cancellation.
//!
//! This library provides:
//! - Peek-lock and delete-on-receive delivery modes
//! - At-least-once delivery with redelivery on abandon or lock expiry
//! - Session-exclusive consumption with an opaque per-session state blob
//! - Globally monotonic sequence number assignment
//! - An injectable clock for deterministic timing tests
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for all broker operations
//! - [`clock`] - Monotonic clock abstraction
//! - [`message`] - Envelope, message, and identifier types
//! - [`sequence`] - Atomic sequence number generation
//! - [`store`] - The per-entity message delivery engine
//! - [`session`] - Session stores, session locks, and the session engine
//! - [`engine`] - Sessionless engine and the shared entity-facing traits
//! - [`hooks`] - Tagged broker events with predicate-based hook dispatch

// Module declarations
pub mod clock;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod message;
pub mod sequence;
pub mod session;
pub mod store;

// Re-export commonly used types at crate root for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{QueueConsumer, QueueProducer, SessionlessEngine};
pub use error::{BrokerError, ValidationError};
pub use hooks::{BrokerEvent, EventFilter, EventHeader, EventKind, HookRegistry};
pub use message::{
    Envelope, LockToken, MessageId, QueueName, ReceiveMode, ReceivedMessage, SessionId,
    StoreConfig, Timestamp,
};
pub use sequence::SequenceGenerator;
pub use session::{AcquiredSession, SessionEngine, SessionLock, SessionStore};
pub use store::MessageStore;
