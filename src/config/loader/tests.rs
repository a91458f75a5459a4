use super::*;

#[test]
fn test_load_config_missing_file_returns_default() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.json");
    let config = load_config(Some(&path)).unwrap();
    assert_eq!(config.agent.model, Config::default().agent.model);
}

#[test]
fn test_load_config_minimal_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(
        &path,
        r#"{"agent": {"model": "claude-sonnet-4-5"}, "rateLimit": {"maxRequests": 2}}"#,
    )
    .unwrap();

    let config = load_config(Some(&path)).unwrap();
    assert_eq!(config.agent.model, "claude-sonnet-4-5");
    assert_eq!(config.rate_limit.max_requests, 2);
    assert_eq!(config.rate_limit.window_ms, 60_000);
}

#[test]
fn test_load_config_rejects_invalid_values() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, r#"{"context": {"maxTokens": 100, "reserveTokens": 200}}"#).unwrap();

    let err = load_config(Some(&path)).unwrap_err();
    assert!(format!("{:#}", err).contains("reserveTokens"));
}

#[test]
fn test_load_config_rejects_malformed_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, "{not json").unwrap();
    assert!(load_config(Some(&path)).is_err());
}

#[test]
fn test_save_then_load_preserves_changes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("config.json");

    let mut config = Config::default();
    config.subagents.max_turns = 7;
    config.streaming.flush_interval_ms = 250;
    save_config(&config, Some(&path)).unwrap();

    let loaded = load_config(Some(&path)).unwrap();
    assert_eq!(loaded.subagents.max_turns, 7);
    assert_eq!(loaded.streaming.flush_interval_ms, 250);

    let raw = std::fs::read_to_string(&path).unwrap();
    assert!(raw.contains("flushIntervalMs"));
}
