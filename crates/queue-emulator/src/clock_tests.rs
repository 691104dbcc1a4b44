//! Tests for the clock abstraction.

use super::*;

#[test]
fn test_system_clock_is_monotonic() {
    let clock = SystemClock;
    let first = clock.now();
    let second = clock.now();
    assert!(second >= first);
}

#[test]
fn test_manual_clock_starts_frozen() {
    let clock = ManualClock::new();
    assert_eq!(clock.now(), clock.now());
}

#[test]
fn test_manual_clock_advance_moves_time() {
    let clock = ManualClock::new();
    let before = clock.now();

    clock.advance(Duration::from_millis(250));

    assert_eq!(clock.now() - before, Duration::from_millis(250));
}

#[test]
fn test_manual_clock_advances_accumulate() {
    let clock = ManualClock::new();
    let before = clock.now();

    clock.advance(Duration::from_secs(1));
    clock.advance(Duration::from_secs(2));

    assert_eq!(clock.now() - before, Duration::from_secs(3));
}
