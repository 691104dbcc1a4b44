//! Tests for session stores, session locks, and the session engine.

use super::*;
use crate::clock::ManualClock;

fn cancel_token() -> CancellationToken {
    CancellationToken::new()
}

fn sid(s: &str) -> SessionId {
    SessionId::new(s).unwrap()
}

fn envelope_for(session: &str, body: &str) -> Envelope {
    Envelope::new(Bytes::copy_from_slice(body.as_bytes())).with_session_id(sid(session))
}

/// Engine with a manual clock and a short session lock duration.
fn test_engine(session_lock_duration: Duration) -> (SessionEngine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let config = StoreConfig {
        lock_duration: Duration::from_secs(60),
        session_lock_duration,
        scan_interval: Duration::from_millis(10),
    };
    let engine = SessionEngine::with_parts(
        QueueName::new("orders").unwrap(),
        config,
        Arc::clone(&clock) as Arc<dyn Clock>,
        Arc::new(HookRegistry::new()),
    );
    (engine, clock)
}

const WAIT: Duration = Duration::from_secs(1);

// ============================================================================
// Session Lock Exclusivity
// ============================================================================

mod exclusivity {
    use super::*;

    #[test]
    fn test_locked_session_rejects_second_acquisition() {
        let (engine, _clock) = test_engine(Duration::from_secs(60));
        engine.add_message(envelope_for("s1", "a")).unwrap();
        engine.add_message(envelope_for("s2", "b")).unwrap();

        let first = engine.try_acquire(&sid("s1"), false);
        assert!(first.is_some());

        // A second consumer cannot take s1, but s2 is free.
        assert!(engine.try_acquire(&sid("s1"), false).is_none());
        assert!(engine.try_acquire(&sid("s2"), false).is_some());
    }

    #[test]
    fn test_release_allows_reacquisition() {
        let (engine, _clock) = test_engine(Duration::from_secs(60));
        engine.add_message(envelope_for("s1", "a")).unwrap();

        let session = engine.try_acquire(&sid("s1"), false).unwrap();
        session.release();

        assert!(engine.try_acquire(&sid("s1"), false).is_some());
    }

    #[test]
    fn test_stale_release_does_not_disturb_new_holder() {
        let (engine, clock) = test_engine(Duration::from_millis(50));
        engine.add_message(envelope_for("s1", "a")).unwrap();

        let stale = engine.try_acquire(&sid("s1"), false).unwrap();
        clock.advance(Duration::from_millis(60));
        let fresh = engine.try_acquire(&sid("s1"), false).unwrap();

        // Releasing the superseded handle must not free the new lock.
        stale.release();
        assert!(engine.try_acquire(&sid("s1"), false).is_none());
        assert!(fresh.renew_session_lock());
    }

    #[test]
    fn test_keyed_acquisition_may_reserve_empty_session() {
        let (engine, _clock) = test_engine(Duration::from_secs(60));

        // Explicit acquisition may park on an empty session...
        assert!(engine.try_acquire(&sid("s1"), true).is_some());
        // ...but a non-empty-only attempt on an empty session fails.
        assert!(engine.try_acquire(&sid("s2"), false).is_none());
    }
}

// ============================================================================
// Session Lock Expiry
// ============================================================================

mod lock_expiry {
    use super::*;

    #[test]
    fn test_expired_lock_fails_state_access() {
        let (engine, clock) = test_engine(Duration::from_millis(50));
        engine.add_message(envelope_for("s1", "a")).unwrap();
        let session = engine.try_acquire(&sid("s1"), false).unwrap();

        clock.advance(Duration::from_millis(60));

        assert!(matches!(
            session.get_state(),
            Err(BrokerError::SessionLockLost { .. })
        ));
        assert!(!session.renew_session_lock());
    }

    #[test]
    fn test_expired_lock_can_be_superseded() {
        let (engine, clock) = test_engine(Duration::from_millis(50));
        engine.add_message(envelope_for("s1", "a")).unwrap();
        let _stale = engine.try_acquire(&sid("s1"), false).unwrap();

        clock.advance(Duration::from_millis(60));

        assert!(engine.try_acquire(&sid("s1"), false).is_some());
    }

    #[test]
    fn test_renewal_keeps_lock_alive() {
        let (engine, clock) = test_engine(Duration::from_millis(50));
        engine.add_message(envelope_for("s1", "a")).unwrap();
        let session = engine.try_acquire(&sid("s1"), false).unwrap();

        clock.advance(Duration::from_millis(40));
        assert!(session.renew_session_lock());
        clock.advance(Duration::from_millis(40));

        // 80ms since acquisition, 40ms since renewal.
        assert!(session.get_state().is_ok());
    }

    #[tokio::test]
    async fn test_lost_session_lock_fails_message_operations() {
        let (engine, clock) = test_engine(Duration::from_millis(50));
        engine.add_message(envelope_for("s1", "a")).unwrap();
        let session = engine.try_acquire(&sid("s1"), false).unwrap();

        let batch = session
            .receive(1, WAIT, ReceiveMode::PeekLock, &cancel_token())
            .await
            .unwrap();
        let token = batch[0].lock_token.clone().unwrap();

        // Message lock runs 60s, session lock only 50ms: losing the session
        // fails the whole operation even though the message token is valid.
        clock.advance(Duration::from_millis(60));

        assert!(matches!(
            session.complete(&token),
            Err(BrokerError::SessionLockLost { .. })
        ));
        assert!(matches!(
            session.abandon(&token),
            Err(BrokerError::SessionLockLost { .. })
        ));
        assert!(matches!(
            session.renew_message_lock(&token),
            Err(BrokerError::SessionLockLost { .. })
        ));
        assert!(matches!(
            session
                .receive(1, WAIT, ReceiveMode::PeekLock, &cancel_token())
                .await,
            Err(BrokerError::SessionLockLost { .. })
        ));
    }

    /// A consumer parked in receive must not be handed messages after its
    /// session lock expired and a second consumer took over the session.
    #[tokio::test(start_paused = true)]
    async fn test_lock_lost_while_parked_keeps_messages_for_new_holder() {
        let (engine, clock) = test_engine(Duration::from_millis(50));
        let engine = Arc::new(engine);
        let first = engine.try_acquire(&sid("s1"), true).unwrap();

        let waiter = tokio::spawn(async move {
            first
                .receive(1, Duration::from_secs(5), ReceiveMode::PeekLock, &cancel_token())
                .await
        });
        // Let the first consumer park before the takeover.
        tokio::time::sleep(Duration::from_millis(5)).await;

        clock.advance(Duration::from_millis(60));
        let second = engine.try_acquire(&sid("s1"), true).unwrap();
        engine.add_message(envelope_for("s1", "m")).unwrap();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(BrokerError::SessionLockLost { .. })));

        // The message stays with the session for the new holder.
        let batch = second
            .receive(1, WAIT, ReceiveMode::PeekLock, &cancel_token())
            .await
            .unwrap();
        assert_eq!(batch[0].body.as_ref(), b"m");
    }

    #[tokio::test(start_paused = true)]
    async fn test_parked_receive_notices_lock_expiry() {
        let (engine, clock) = test_engine(Duration::from_millis(50));
        let engine = Arc::new(engine);
        let session = engine.try_acquire(&sid("s1"), true).unwrap();

        // No messages ever arrive; the wait must still end with the lock.
        let waiter = tokio::spawn(async move {
            session
                .receive(1, Duration::from_secs(5), ReceiveMode::PeekLock, &cancel_token())
                .await
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        clock.advance(Duration::from_millis(60));

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(BrokerError::SessionLockLost { .. })));
    }

    #[test]
    fn test_abandon_with_stale_message_token_is_a_fault() {
        let (engine, _clock) = test_engine(Duration::from_secs(60));
        engine.add_message(envelope_for("s1", "a")).unwrap();
        let session = engine.try_acquire(&sid("s1"), false).unwrap();

        // Session lock is valid; the message token is not.
        assert!(matches!(
            session.abandon(&LockToken::generate()),
            Err(BrokerError::MessageLockLost { .. })
        ));
    }
}

// ============================================================================
// Session State Blob
// ============================================================================

mod session_state {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        let (engine, _clock) = test_engine(Duration::from_secs(60));
        let session = engine.try_acquire(&sid("s1"), true).unwrap();

        assert_eq!(session.get_state().unwrap(), None);

        session.set_state(Bytes::from("checkpoint-7")).unwrap();
        assert_eq!(
            session.get_state().unwrap(),
            Some(Bytes::from("checkpoint-7"))
        );
    }

    #[test]
    fn test_state_survives_lock_turnover() {
        let (engine, _clock) = test_engine(Duration::from_secs(60));

        let first = engine.try_acquire(&sid("s1"), true).unwrap();
        first.set_state(Bytes::from("checkpoint-7")).unwrap();
        first.release();

        let second = engine.try_acquire(&sid("s1"), true).unwrap();
        assert_eq!(
            second.get_state().unwrap(),
            Some(Bytes::from("checkpoint-7"))
        );
    }
}

// ============================================================================
// Routing and Ordering
// ============================================================================

mod routing {
    use super::*;

    #[test]
    fn test_enqueue_without_session_id_is_rejected() {
        let (engine, _clock) = test_engine(Duration::from_secs(60));

        let result = engine.add_message(Envelope::new(Bytes::from("a")));

        assert!(matches!(result, Err(BrokerError::SessionIdMissing { .. })));
        assert_eq!(engine.session_count(), 0);
    }

    #[test]
    fn test_batch_validation_rejects_whole_batch() {
        let (engine, _clock) = test_engine(Duration::from_secs(60));

        let result = engine.add_message_batch(vec![
            envelope_for("s1", "a"),
            Envelope::new(Bytes::from("no-session")),
        ]);

        assert!(matches!(result, Err(BrokerError::SessionIdMissing { .. })));
        // Validation happens before any message is stored.
        assert_eq!(QueueProducer::total_count(&engine), 0);
    }

    #[tokio::test]
    async fn test_messages_route_to_their_session() {
        let (engine, _clock) = test_engine(Duration::from_secs(60));
        engine.add_message(envelope_for("s1", "a")).unwrap();
        engine.add_message(envelope_for("s2", "b")).unwrap();
        engine.add_message(envelope_for("s1", "c")).unwrap();

        let session = engine.try_acquire(&sid("s1"), false).unwrap();
        let batch = session
            .receive(10, WAIT, ReceiveMode::DeleteOnReceive, &cancel_token())
            .await
            .unwrap();

        let bodies: Vec<&[u8]> = batch.iter().map(|m| m.body.as_ref()).collect();
        assert_eq!(bodies, vec![b"a".as_ref(), b"c".as_ref()]);
    }

    #[tokio::test]
    async fn test_sequence_numbers_are_monotonic_across_sessions() {
        let (engine, _clock) = test_engine(Duration::from_secs(60));
        engine
            .add_message_batch(vec![
                envelope_for("s1", "a"),
                envelope_for("s2", "b"),
                envelope_for("s1", "c"),
            ])
            .unwrap();

        let mut sequences = Vec::new();
        for key in ["s1", "s2"] {
            let session = engine.try_acquire(&sid(key), false).unwrap();
            let batch = session
                .receive(10, WAIT, ReceiveMode::DeleteOnReceive, &cancel_token())
                .await
                .unwrap();
            sequences.extend(batch.iter().map(|m| m.sequence_number));
        }
        sequences.sort_unstable();
        assert_eq!(sequences, vec![0, 1, 2]);
    }
}

// ============================================================================
// Next-Available Acquisition
// ============================================================================

mod next_available {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_scan_finds_session_with_work() {
        let (engine, _clock) = test_engine(Duration::from_secs(60));
        engine.add_message(envelope_for("s1", "a")).unwrap();

        let session = engine
            .acquire_next_available(WAIT, &cancel_token())
            .await
            .unwrap()
            .expect("one session has work");

        assert_eq!(session.session_id(), &sid("s1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_skips_empty_sessions() {
        let (engine, _clock) = test_engine(Duration::from_secs(60));
        // s1 exists but is empty; automatic acquisition must not park on it.
        engine.try_acquire(&sid("s1"), true).unwrap().release();
        engine.add_message(envelope_for("s2", "b")).unwrap();

        let session = engine
            .acquire_next_available(WAIT, &cancel_token())
            .await
            .unwrap()
            .expect("s2 has work");

        assert_eq!(session.session_id(), &sid("s2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_scan_returns_none() {
        let (engine, _clock) = test_engine(Duration::from_secs(60));
        engine.try_acquire(&sid("s1"), true).unwrap().release();

        let started = tokio::time::Instant::now();
        let outcome = engine
            .acquire_next_available(Duration::from_millis(200), &cancel_token())
            .await
            .unwrap();

        assert!(outcome.is_none());
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_picks_up_work_enqueued_mid_wait() {
        let (engine, _clock) = test_engine(Duration::from_secs(60));
        let engine = Arc::new(engine);

        let producer = Arc::clone(&engine);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            producer.add_message(envelope_for("s1", "late")).unwrap();
        });

        let session = engine
            .acquire_next_available(Duration::from_secs(5), &cancel_token())
            .await
            .unwrap()
            .expect("work arrives mid-scan");

        assert_eq!(session.session_id(), &sid("s1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_honors_cancellation() {
        let (engine, _clock) = test_engine(Duration::from_secs(60));
        let cancel = cancel_token();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let result = engine
            .acquire_next_available(Duration::from_secs(5), &cancel)
            .await;

        assert!(matches!(result, Err(BrokerError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_scanners_take_distinct_sessions() {
        let (engine, _clock) = test_engine(Duration::from_secs(60));
        engine.add_message(envelope_for("s1", "a")).unwrap();
        engine.add_message(envelope_for("s2", "b")).unwrap();

        let first = engine
            .acquire_next_available(WAIT, &cancel_token())
            .await
            .unwrap()
            .unwrap();
        let second = engine
            .acquire_next_available(WAIT, &cancel_token())
            .await
            .unwrap()
            .unwrap();

        assert_ne!(first.session_id(), second.session_id());
    }
}

// ============================================================================
// Engine Counts
// ============================================================================

mod counts {
    use super::*;

    #[tokio::test]
    async fn test_counts_aggregate_across_sessions() {
        let (engine, _clock) = test_engine(Duration::from_secs(60));
        engine.add_message(envelope_for("s1", "a")).unwrap();
        engine.add_message(envelope_for("s2", "b")).unwrap();

        assert_eq!(QueueProducer::active_count(&engine), 2);
        assert_eq!(QueueProducer::total_count(&engine), 2);

        let session = engine.try_acquire(&sid("s1"), false).unwrap();
        let _ = session
            .receive(1, WAIT, ReceiveMode::PeekLock, &cancel_token())
            .await
            .unwrap();

        // A locked message leaves the active count but not the total.
        assert_eq!(QueueProducer::active_count(&engine), 1);
        assert_eq!(QueueProducer::total_count(&engine), 2);
    }
}
