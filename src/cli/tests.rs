use super::*;
use clap::CommandFactory;

fn parse_args(argv: &[&str]) -> Args {
    Args::try_parse_from(argv)
        .unwrap_or_else(|err| panic!("argv={argv:?} should parse successfully: {err}"))
}

fn config_with(connections: Vec<ConnectionConfig>) -> Config {
    Config {
        connections,
        ..Config::default()
    }
}

#[test]
fn command_definition_is_consistent() {
    Args::command().debug_assert();
}

#[test]
fn call_accepts_arguments_and_target_flags() {
    let argv = [
        "mcpeek",
        "--config",
        "/tmp/mcpeek.toml",
        "call",
        "https://mcp.example.com/mcp",
        "search",
        "--args",
        r#"{"q":"rust"}"#,
        "--transport",
        "sse",
        "--bearer",
        "secret",
        "--timeout-ms",
        "1500",
    ];
    let args = parse_args(&argv);
    assert_eq!(args.config, Some(PathBuf::from("/tmp/mcpeek.toml")));
    match args.command {
        Commands::Call {
            target,
            tool,
            args,
            options,
        } => {
            assert_eq!(target, "https://mcp.example.com/mcp");
            assert_eq!(tool, "search");
            assert_eq!(args.as_deref(), Some(r#"{"q":"rust"}"#));
            assert_eq!(options.transport, Some(TransportPreference::Sse));
            assert_eq!(options.bearer.as_deref(), Some("secret"));
            assert_eq!(options.timeout_ms, Some(1500));
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn global_flags_are_accepted_after_the_subcommand() {
    let args = parse_args(&["mcpeek", "test", "alpha", "--log", "/tmp/mcpeek.log"]);
    assert_eq!(args.log, Some(PathBuf::from("/tmp/mcpeek.log")));
    assert!(matches!(args.command, Commands::Test { ref target, .. } if target == "alpha"));
}

#[test]
fn transport_flag_accepts_aliases_and_rejects_unknown_values() {
    let args = parse_args(&["mcpeek", "inspect", "x", "--transport", "ws"]);
    assert!(matches!(
        args.command,
        Commands::Inspect { ref options, .. } if options.transport == Some(TransportPreference::WebSocket)
    ));
    assert!(Args::try_parse_from(["mcpeek", "inspect", "x", "--transport", "stdio"]).is_err());
}

#[test]
fn bearer_and_api_key_conflict() {
    let result = Args::try_parse_from([
        "mcpeek", "test", "x", "--bearer", "a", "--api-key", "b",
    ]);
    assert!(result.is_err());
}

#[test]
fn resolve_target_prefers_configured_connections() {
    let config = config_with(vec![ConnectionConfig::new(
        "Alpha",
        "https://alpha.example.com/mcp",
    )]);
    let options = TargetOptions {
        api_key: Some("k-1".to_string()),
        retries: Some(5),
        ..TargetOptions::default()
    };

    let connection = resolve_target(&config, "alpha", &options).expect("target should resolve");
    assert_eq!(connection.id, "Alpha");
    assert_eq!(connection.url, "https://alpha.example.com/mcp");
    assert_eq!(
        connection.auth,
        AuthConfig::ApiKey {
            key: "k-1".to_string()
        }
    );
    assert_eq!(connection.retry_attempts, 5);
}

#[test]
fn resolve_target_builds_ad_hoc_connections_from_urls() {
    let options = TargetOptions {
        transport: Some(TransportPreference::Http),
        ..TargetOptions::default()
    };
    let connection = resolve_target(&Config::default(), "ws://localhost:9000", &options)
        .expect("url should resolve");
    assert_eq!(connection.id, AD_HOC_CONNECTION_ID);
    assert_eq!(connection.transport, TransportPreference::Http);
    assert_eq!(connection.auth, AuthConfig::None);
}

#[test]
fn resolve_target_rejects_unknown_ids() {
    let err = resolve_target(&Config::default(), "missing", &TargetOptions::default())
        .expect_err("unknown id should fail");
    assert!(err.to_string().contains("missing"));
}

#[test]
fn tool_args_must_be_json_objects() {
    assert_eq!(parse_tool_args(None).expect("no args"), None);
    assert_eq!(parse_tool_args(Some("  ")).expect("blank args"), None);

    let args = parse_tool_args(Some(r#"{"city":"Oslo","days":3}"#))
        .expect("object should parse")
        .expect("object expected");
    assert_eq!(args.get("days"), Some(&Value::from(3)));

    assert!(parse_tool_args(Some("[1,2]")).is_err());
    assert!(parse_tool_args(Some("{not json")).is_err());
}

#[test]
fn options_leave_unset_fields_alone() {
    let original = ConnectionConfig::new("beta", "https://beta.example.com/sse")
        .with_auth(AuthConfig::Bearer {
            token: "keep".to_string(),
        })
        .with_timeout_ms(750);
    let applied = TargetOptions::default().apply(original.clone());
    assert_eq!(applied, original);
}
