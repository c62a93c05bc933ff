//! Unit tests for the streaming message accumulator.

use std::time::Duration;

use chrono::Utc;

use acp_orchestrator::models::message::MessageRole;
use acp_orchestrator::orchestrator::streaming::StreamTracker;
use acp_orchestrator::AppError;

#[test]
fn chunks_concatenate_in_arrival_order() {
    let mut tracker = StreamTracker::default();
    tracker.start_stream("m1", "s1");

    tracker.add_chunk("m1", "hel").expect("chunk");
    tracker.add_chunk("m1", "lo ").expect("chunk");
    tracker.add_chunk("m1", "world").expect("chunk");

    let state = tracker.get_state("m1").expect("tracked");
    assert_eq!(state.content, "hello world");
    assert_eq!(state.role, MessageRole::Agent);
    assert_eq!(tracker.complete_stream("m1").expect("complete"), "hello world");
    assert!(!tracker.is_active("m1"), "completed stream is removed");
}

#[test]
fn chunk_for_untracked_message_is_not_found() {
    let mut tracker = StreamTracker::default();

    let err = tracker.add_chunk("ghost", "x").expect_err("untracked");

    assert!(matches!(err, AppError::NotFound(ref msg) if msg.contains("ghost")));
    assert!(matches!(
        tracker.complete_stream("ghost"),
        Err(AppError::NotFound(_))
    ));
}

#[test]
fn second_start_keeps_accumulated_text() {
    let mut tracker = StreamTracker::default();
    tracker.start_stream("m1", "s1");
    tracker.add_chunk("m1", "partial").expect("chunk");

    tracker.start_stream("m1", "s1");

    assert_eq!(tracker.get_state("m1").expect("tracked").content, "partial");
    assert_eq!(tracker.get_active_count(), 1);
}

#[test]
fn touch_refreshes_only_the_named_session() {
    let mut tracker = StreamTracker::default();
    tracker.start_stream("m1", "s1");
    tracker.start_stream("m2", "s2");
    let started = tracker.get_state("m2").expect("m2").last_chunk_at;
    std::thread::sleep(Duration::from_millis(10));

    tracker.touch_stream("s1");

    assert!(tracker.get_state("m1").expect("m1").last_chunk_at > started);
    assert_eq!(tracker.get_state("m2").expect("m2").last_chunk_at, started);
}

#[test]
fn cleanup_removes_only_streams_past_timeout() {
    let mut tracker = StreamTracker::new(Duration::from_secs(60));
    tracker.start_stream("stale", "s1");
    let mark = Utc::now();
    std::thread::sleep(Duration::from_millis(20));
    tracker.start_stream("fresh", "s2");

    // 60s after `mark`, plus a margin smaller than the gap between the two.
    let removed = tracker.cleanup_timed_out_streams_at(mark + chrono::Duration::milliseconds(60_010));

    assert_eq!(removed, vec!["stale".to_owned()]);
    assert!(tracker.is_active("fresh"));
    assert!(!tracker.is_active("stale"));
}

#[test]
fn cancel_discards_text_and_ignores_unknown_ids() {
    let mut tracker = StreamTracker::default();
    tracker.start_stream("m1", "s1");
    tracker.add_chunk("m1", "dropped").expect("chunk");

    tracker.cancel_stream("m1");
    tracker.cancel_stream("never-started");

    assert_eq!(tracker.get_active_count(), 0);
    assert!(tracker.get_active_streams().is_empty());
}
