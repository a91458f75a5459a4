use super::*;
use proptest::prelude::*;

fn config(window_ms: u64, max_requests: u32) -> RateLimitConfig {
    RateLimitConfig {
        enabled: true,
        scope: RateLimitScope::Participant,
        window_ms,
        max_requests,
        sweep_interval_secs: 60,
    }
}

#[tokio::test]
async fn test_allows_up_to_max_then_denies_then_recovers() {
    let limiter = RateLimiter::new(&config(80, 3));

    for expected_remaining in [2, 1, 0] {
        let d = limiter.check("alice");
        assert!(d.allowed);
        assert_eq!(d.remaining, expected_remaining);
    }

    let denied = limiter.check("alice");
    assert!(!denied.allowed);
    assert_eq!(denied.remaining, 0);
    assert!(denied.reset_in > Duration::ZERO);

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(limiter.check("alice").allowed);
}

#[test]
fn test_keys_are_independent() {
    let limiter = RateLimiter::new(&config(60_000, 1));
    assert!(limiter.check("alice").allowed);
    assert!(!limiter.check("alice").allowed);
    assert!(limiter.check("bob").allowed);
}

#[test]
fn test_global_scope_shares_one_key() {
    let mut cfg = config(60_000, 1);
    cfg.scope = RateLimitScope::Global;
    let limiter = RateLimiter::new(&cfg);
    let a = limiter.key_for("alice");
    let b = limiter.key_for("bob");
    assert_eq!(a, b);
    assert!(limiter.check(&a).allowed);
    assert!(!limiter.check(&b).allowed);
}

#[test]
fn test_disabled_always_allows() {
    let mut cfg = config(60_000, 1);
    cfg.enabled = false;
    let limiter = RateLimiter::new(&cfg);
    for _ in 0..10 {
        assert!(limiter.check("alice").allowed);
    }
    assert_eq!(limiter.tracked_keys(), 0);
}

#[test]
fn test_reload_keeps_open_window_counts() {
    let limiter = RateLimiter::new(&config(60_000, 2));
    assert!(limiter.check("alice").allowed);
    assert!(limiter.check("alice").allowed);
    assert!(!limiter.check("alice").allowed);

    assert!(limiter.update_limits(&config(60_000, 4)));
    // two already counted, so exactly two more fit
    assert!(limiter.check("alice").allowed);
    let last = limiter.check("alice");
    assert!(last.allowed);
    assert_eq!(last.remaining, 0);
    assert!(!limiter.check("alice").allowed);
}

#[test]
fn test_reload_with_same_limits_reports_no_change() {
    let limiter = RateLimiter::new(&config(1000, 5));
    assert!(!limiter.update_limits(&config(1000, 5)));
}

#[tokio::test]
async fn test_sweep_evicts_only_expired_windows() {
    let limiter = RateLimiter::new(&config(50, 5));
    limiter.check("old");
    tokio::time::sleep(Duration::from_millis(80)).await;
    limiter.check("fresh");

    assert_eq!(limiter.sweep(), 1);
    assert_eq!(limiter.tracked_keys(), 1);
}

#[tokio::test]
async fn test_sweeper_task_runs_periodically() {
    let limiter = Arc::new(RateLimiter::new(&config(10, 5)));
    limiter.check("alice");
    let handle = limiter.spawn_sweeper(Duration::from_millis(20));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(limiter.tracked_keys(), 0);
    handle.abort();
}

proptest! {
    #[test]
    fn exactly_max_requests_admitted(max in 1u32..50, extra in 1u32..10) {
        let limiter = RateLimiter::new(&config(60_000, max));
        let admitted = (0..max + extra).filter(|_| limiter.check("k").allowed).count();
        prop_assert_eq!(admitted, max as usize);
    }
}
