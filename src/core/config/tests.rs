use super::data::{AuthConfig, Config, ConnectionConfig, TransportPreference};
use super::io::ConfigError;
use crate::mcp::retry::BackoffOverride;
use tempfile::TempDir;

#[test]
fn test_load_nonexistent_config() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config_path = temp_dir.path().join("nonexistent_config.toml");

    let config = Config::load_from_path(&config_path).expect("Failed to load config");

    assert!(config.connections.is_empty());
    assert_eq!(config.retry.connection, None);
}

#[test]
fn connection_defaults_apply_when_fields_are_omitted() {
    let config: Config = toml::from_str(
        r#"
        [[connections]]
        id = "demo"
        url = "https://mcp.example.com/mcp"
        "#,
    )
    .expect("parse config");

    let connection = config.find_connection("DEMO").expect("case-insensitive lookup");
    assert_eq!(connection.transport, TransportPreference::Auto);
    assert_eq!(connection.timeout_ms, 30_000);
    assert_eq!(connection.retry_attempts, 3);
    assert_eq!(connection.auth, AuthConfig::None);
    assert_eq!(connection.label(), "demo");
}

#[test]
fn auth_modes_parse_from_toml() {
    let config: Config = toml::from_str(
        r#"
        [[connections]]
        id = "bearer"
        url = "https://a.example.com/mcp"
        transport = "sse"
        auth = { mode = "bearer", token = "t0k" }

        [[connections]]
        id = "key"
        url = "wss://b.example.com/ws"
        transport = "ws"
        auth = { mode = "apiKey", key = "k3y" }

        [[connections]]
        id = "basic"
        url = "https://c.example.com/mcp"
        auth = { mode = "basic", username = "ada", password = "hunter2" }
        headers = { "X-Tenant" = "blue" }

        [retry.tool_call]
        base_delay_ms = 100
        max_delay_ms = 800
        "#,
    )
    .expect("parse config");

    assert_eq!(
        config.connections[0].auth,
        AuthConfig::Bearer {
            token: "t0k".to_string()
        }
    );
    assert_eq!(config.connections[0].transport, TransportPreference::Sse);
    assert_eq!(config.connections[1].transport, TransportPreference::WebSocket);
    assert_eq!(
        config.connections[1].auth,
        AuthConfig::ApiKey {
            key: "k3y".to_string()
        }
    );
    assert_eq!(
        config.connections[2].headers.get("X-Tenant").map(String::as_str),
        Some("blue")
    );
    assert_eq!(
        config.retry.tool_call,
        Some(BackoffOverride {
            base_delay_ms: 100,
            max_delay_ms: 800,
            jitter_ms: 0,
        })
    );
}

#[test]
fn auth_debug_output_redacts_secrets() {
    let auth = AuthConfig::Basic {
        username: "ada".to_string(),
        password: "hunter2".to_string(),
    };
    let rendered = format!("{auth:?}");
    assert!(rendered.contains("ada"));
    assert!(!rendered.contains("hunter2"));
}

#[test]
fn test_config_persistence_lifecycle() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config_path = temp_dir.path().join("nested").join("config.toml");

    let mut config = Config::default();
    config.upsert_connection(
        ConnectionConfig::new("alpha", "https://alpha.example.com/mcp")
            .with_transport(TransportPreference::Http)
            .with_auth(AuthConfig::Bearer {
                token: "secret".to_string(),
            }),
    );
    config.save_to_path(&config_path).expect("save failed");

    let mut loaded = Config::load_from_path(&config_path).expect("load failed");
    assert_eq!(loaded, config);

    loaded.upsert_connection(
        ConnectionConfig::new("ALPHA", "https://alpha.example.com/v2").with_timeout_ms(5_000),
    );
    assert_eq!(loaded.connections.len(), 1);
    assert_eq!(loaded.connections[0].timeout_ms, 5_000);

    assert!(loaded.remove_connection("alpha"));
    assert!(!loaded.remove_connection("alpha"));
    loaded.save_to_path(&config_path).expect("second save failed");

    let reloaded = Config::load_from_path(&config_path).expect("reload failed");
    assert!(reloaded.connections.is_empty());
}

#[test]
fn invalid_toml_reports_parse_error() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config_path = temp_dir.path().join("config.toml");
    std::fs::write(&config_path, "connections = 7").expect("write fixture");

    let err = Config::load_from_path(&config_path).expect_err("parse should fail");
    assert!(matches!(err, ConfigError::Parse { .. }));
    assert!(err.to_string().starts_with("Failed to parse config at"));
}

#[test]
fn transport_preference_parses_cli_spellings() {
    assert_eq!(
        "WS".parse::<TransportPreference>(),
        Ok(TransportPreference::WebSocket)
    );
    assert_eq!(
        "streamable-http".parse::<TransportPreference>(),
        Ok(TransportPreference::Http)
    );
    assert!("stdio".parse::<TransportPreference>().is_err());
}
