mod common;

use common::{MockProvider, runtime};
use parlance::channels::InboundMessage;
use parlance::config::{Config, RateLimitScope};
use parlance::errors::RuntimeError;
use parlance::session::Session;
use std::time::Duration;

fn limited(max_requests: u32, window_ms: u64) -> Config {
    let mut config = Config::default();
    config.rate_limit.max_requests = max_requests;
    config.rate_limit.window_ms = window_ms;
    config
}

fn is_denial(reply: Option<&str>) -> bool {
    reply.is_some_and(|r| r.starts_with("You're sending messages too quickly"))
}

async fn send(
    rt: &common::TestRuntime,
    session: &mut Session,
    participant: &str,
) -> Option<String> {
    let msg = InboundMessage::new(session.id.clone(), participant, "cli", "ping");
    rt.orchestrator.handle_message(&msg, session).await.unwrap()
}

#[tokio::test]
async fn test_admits_exactly_max_requests_per_window() {
    let rt = runtime(MockProvider::with_responses(vec![]), limited(3, 60_000)).await;
    let mut session = Session::new("s", "alice", "cli");

    for _ in 0..3 {
        let reply = send(&rt, &mut session, "alice").await;
        assert!(!is_denial(reply.as_deref()));
    }
    let denied = send(&rt, &mut session, "alice").await;
    assert!(is_denial(denied.as_deref()));

    // denied messages never reach the model or the transcript
    assert_eq!(rt.provider.call_count(), 3);
    assert_eq!(session.turns.len(), 6);
}

#[tokio::test]
async fn test_window_reset_admits_again() {
    let rt = runtime(MockProvider::with_responses(vec![]), limited(1, 150)).await;
    let mut session = Session::new("s", "alice", "cli");

    assert!(!is_denial(send(&rt, &mut session, "alice").await.as_deref()));
    assert!(is_denial(send(&rt, &mut session, "alice").await.as_deref()));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!is_denial(send(&rt, &mut session, "alice").await.as_deref()));
}

#[tokio::test]
async fn test_participants_are_counted_separately() {
    let rt = runtime(MockProvider::with_responses(vec![]), limited(1, 60_000)).await;
    let mut alice = Session::new("a", "alice", "cli");
    let mut bob = Session::new("b", "bob", "cli");

    assert!(!is_denial(send(&rt, &mut alice, "alice").await.as_deref()));
    assert!(!is_denial(send(&rt, &mut bob, "bob").await.as_deref()));
    assert!(is_denial(send(&rt, &mut alice, "alice").await.as_deref()));
}

#[tokio::test]
async fn test_global_scope_shares_one_budget() {
    let mut config = limited(1, 60_000);
    config.rate_limit.scope = RateLimitScope::Global;
    let rt = runtime(MockProvider::with_responses(vec![]), config).await;
    let mut alice = Session::new("a", "alice", "cli");
    let mut bob = Session::new("b", "bob", "cli");

    assert!(!is_denial(send(&rt, &mut alice, "alice").await.as_deref()));
    assert!(is_denial(send(&rt, &mut bob, "bob").await.as_deref()));
}

#[tokio::test]
async fn test_reload_keeps_counts_and_applies_new_limit() {
    let rt = runtime(MockProvider::with_responses(vec![]), limited(2, 60_000)).await;
    let mut session = Session::new("s", "alice", "cli");
    send(&rt, &mut session, "alice").await;
    send(&rt, &mut session, "alice").await;
    assert!(is_denial(send(&rt, &mut session, "alice").await.as_deref()));

    rt.orchestrator.reload_config(limited(3, 60_000)).unwrap();
    // two already counted in this window, one more fits
    assert!(!is_denial(send(&rt, &mut session, "alice").await.as_deref()));
    assert!(is_denial(send(&rt, &mut session, "alice").await.as_deref()));
    assert_eq!(rt.orchestrator.config().rate_limit.max_requests, 3);
}

#[tokio::test]
async fn test_reload_with_identical_config_is_noop() {
    let rt = runtime(MockProvider::with_responses(vec![]), limited(2, 60_000)).await;
    let err = rt.orchestrator.reload_config(limited(2, 60_000)).unwrap_err();
    assert!(matches!(err, RuntimeError::ConfigReloadNoop));
}

#[tokio::test]
async fn test_invalid_reload_keeps_running_config() {
    let rt = runtime(MockProvider::with_responses(vec![]), limited(2, 60_000)).await;
    let mut bad = limited(5, 60_000);
    bad.context.reserve_tokens = bad.context.max_tokens;

    let err = rt.orchestrator.reload_config(bad).unwrap_err();
    assert!(matches!(err, RuntimeError::Config(_)));
    assert_eq!(rt.orchestrator.config().rate_limit.max_requests, 2);
}
