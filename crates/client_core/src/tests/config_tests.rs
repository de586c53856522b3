use super::*;

use std::{
    collections::HashMap,
    time::{SystemTime, UNIX_EPOCH},
};

#[test]
fn defaults_match_client_conventions() {
    let settings = ClientSettings::default();
    assert_eq!(settings.page_size, 30);
    assert_eq!(settings.request_timeout, Duration::from_secs(12));
    assert_eq!(settings.reconnect_delay, Duration::from_millis(3000));
    assert_eq!(settings.websocket_url(), "http://localhost:5000");
}

#[test]
fn file_values_override_defaults() {
    let mut settings = ClientSettings::default();
    apply_file_overrides(
        &mut settings,
        r#"
            api_base_url = "https://chat.example.com"
            ws_url = "wss://chat.example.com/ws"
            page_size = 50
            request_timeout_secs = 5
            reconnect_delay_ms = 750
        "#,
    );

    assert_eq!(settings.api_base_url, "https://chat.example.com");
    assert_eq!(settings.websocket_url(), "wss://chat.example.com/ws");
    assert_eq!(settings.page_size, 50);
    assert_eq!(settings.request_timeout, Duration::from_secs(5));
    assert_eq!(settings.reconnect_delay, Duration::from_millis(750));
}

#[test]
fn malformed_file_is_ignored() {
    let mut settings = ClientSettings::default();
    apply_file_overrides(&mut settings, "page_size = [");
    assert_eq!(settings, ClientSettings::default());
}

#[test]
fn prefixed_env_wins_over_plain_env() {
    let env: HashMap<&str, &str> = HashMap::from([
        ("API_BASE_URL", "http://plain:5000"),
        ("APP__API_BASE_URL", "http://prefixed:5000"),
        ("APP__PAGE_SIZE", "10"),
        ("APP__RECONNECT_DELAY_MS", "not-a-number"),
    ]);
    let mut settings = ClientSettings::default();

    apply_env_overrides(&mut settings, |key| env.get(key).map(|v| v.to_string()));

    assert_eq!(settings.api_base_url, "http://prefixed:5000");
    assert_eq!(settings.page_size, 10);
    assert_eq!(settings.reconnect_delay, DEFAULT_RECONNECT_DELAY);
}

#[test]
fn normalizes_plain_file_path_to_sqlite_url() {
    assert_eq!(
        normalize_database_url("./data/cache.db"),
        "sqlite://./data/cache.db"
    );
    assert_eq!(
        normalize_database_url("sqlite:data\\cache.db"),
        "sqlite://data/cache.db"
    );
    assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
    assert_eq!(
        normalize_database_url("  "),
        ClientSettings::default().cache_database_url
    );
}

#[test]
fn loads_settings_file_from_path() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = std::env::temp_dir().join(format!("chat_client_settings_{suffix}"));
    fs::create_dir_all(&temp_root).expect("temp root");
    let path = temp_root.join("client.toml");
    fs::write(&path, "cache_database_url = \"./cache/chat.db\"\n").expect("write settings");

    let settings = load_settings_from(&path);

    if std::env::var("CACHE_DATABASE_URL").is_err()
        && std::env::var("APP__CACHE_DATABASE_URL").is_err()
    {
        assert_eq!(settings.cache_database_url, "sqlite://./cache/chat.db");
    }
    fs::remove_dir_all(temp_root).expect("cleanup");
}
