//! Unit tests for the observer registry behind the fan-out channel.

use std::time::Duration;

use chrono::Utc;
use serde_json::Value;

use acp_orchestrator::models::event::ServerEvent;
use acp_orchestrator::models::session::SessionStatus;
use acp_orchestrator::realtime::{Outbound, RealtimeHub};

fn frame_type(outbound: Outbound) -> String {
    match outbound {
        Outbound::Text(text) => {
            let value: Value = serde_json::from_str(&text).expect("frame is JSON");
            value["type"].as_str().expect("type field").to_owned()
        }
        Outbound::Close => "<close>".into(),
    }
}

#[test]
fn new_observer_receives_initial_pong() {
    let hub = RealtimeHub::new(Duration::from_secs(60));

    let (client_id, mut rx) = hub.register();

    assert!(client_id.starts_with("ws-"));
    assert_eq!(frame_type(rx.try_recv().expect("pong queued")), "pong");
    assert_eq!(hub.client_count(), 1);
}

#[test]
fn broadcast_reaches_every_observer() {
    let hub = RealtimeHub::new(Duration::from_secs(60));
    let (_a, mut rx_a) = hub.register();
    let (_b, mut rx_b) = hub.register();
    let _ = rx_a.try_recv();
    let _ = rx_b.try_recv();

    let delivered = hub.broadcast(&ServerEvent::session_status("s1", SessionStatus::Cancelled));

    assert_eq!(delivered, 2);
    assert_eq!(frame_type(rx_a.try_recv().expect("a")), "session.status");
    assert_eq!(frame_type(rx_b.try_recv().expect("b")), "session.status");
}

#[test]
fn dead_observer_is_dropped_without_blocking_others() {
    let hub = RealtimeHub::new(Duration::from_secs(60));
    let (_dead, rx_dead) = hub.register();
    let (_live, mut rx_live) = hub.register();
    drop(rx_dead);
    let _ = rx_live.try_recv();

    let delivered = hub.broadcast(&ServerEvent::pong());

    assert_eq!(delivered, 1);
    assert_eq!(hub.client_count(), 1);
    assert_eq!(frame_type(rx_live.try_recv().expect("live")), "pong");
}

#[test]
fn ping_is_answered_and_other_frames_ignored() {
    let hub = RealtimeHub::new(Duration::from_secs(60));
    let (id, mut rx) = hub.register();
    let _ = rx.try_recv();

    hub.handle_client_message(&id, r#"{"type":"session.created","payload":{}}"#);
    hub.handle_client_message(&id, "not json");
    assert!(rx.try_recv().is_err(), "non-ping frames get no reply");

    hub.handle_client_message(&id, r#"{"type":"ping"}"#);
    assert_eq!(frame_type(rx.try_recv().expect("pong")), "pong");
}

#[test]
fn silent_observer_is_swept_and_closed() {
    let hub = RealtimeHub::new(Duration::from_secs(60));
    let (stale, mut rx_stale) = hub.register();
    let _ = rx_stale.try_recv();
    let mark = Utc::now();
    std::thread::sleep(Duration::from_millis(20));
    let (_fresh, _rx_fresh) = hub.register();

    // 60s after `mark`, plus a margin smaller than the gap between the two.
    let removed = hub.sweep_stale_at(mark + chrono::Duration::milliseconds(60_010));

    assert_eq!(removed, vec![stale]);
    assert_eq!(rx_stale.try_recv().expect("close"), Outbound::Close);
    assert_eq!(hub.client_count(), 1);
}

#[test]
fn ping_postpones_the_sweep() {
    let hub = RealtimeHub::new(Duration::from_secs(60));
    let (id, mut rx) = hub.register();
    let _ = rx.try_recv();
    let mark = Utc::now();
    std::thread::sleep(Duration::from_millis(20));

    hub.handle_client_message(&id, r#"{"type":"ping"}"#);

    assert!(hub.sweep_stale_at(mark + chrono::Duration::milliseconds(60_010)).is_empty());
    assert_eq!(hub.client_count(), 1);
}

#[test]
fn shutdown_closes_everyone() {
    let hub = RealtimeHub::new(Duration::from_secs(60));
    let (_id, mut rx) = hub.register();
    let _ = rx.try_recv();

    hub.shutdown();

    assert!(hub.is_shut_down());
    assert_eq!(hub.client_count(), 0);
    assert_eq!(rx.try_recv().expect("close"), Outbound::Close);
}
