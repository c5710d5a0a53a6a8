//! Command-line interface parsing and handling
//!
//! This module parses command-line arguments, sets up logging, and runs one
//! client operation per invocation.

use std::error::Error;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use clap::{Args as ClapArgs, Parser, Subcommand};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::core::config::data::path_display;
use crate::core::config::{AuthConfig, Config, ConnectionConfig, TransportPreference};
use crate::mcp::client::McpClient;

const LOG_ENV: &str = "MCPEEK_LOG";
const DEFAULT_LOG_FILTER: &str = "warn";
const AD_HOC_CONNECTION_ID: &str = "ad-hoc";
const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("VERGEN_GIT_SHA"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = "mcpeek")]
#[command(version = VERSION)]
#[command(about = "Probe and drive Model Context Protocol servers")]
#[command(
    long_about = "mcpeek connects to MCP servers over HTTP, SSE sessions or WebSocket, \
runs the initialize handshake, lists tools and resources, calls tools and reads resources.\n\n\
Targets:\n\
  A target is either the id of a connection in the config file or a URL.\n\
  URLs with ws:// or wss:// use WebSocket, paths containing /sse use an SSE session,\n\
  everything else uses plain HTTP POST. Use --transport to override.\n\n\
Environment Variables:\n\
  MCPEEK_LOG        Log filter (falls back to RUST_LOG, defaults to warn)\n\n\
Press Ctrl+C to cancel the operation in flight."
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the config file (defaults to the platform config directory)
    #[arg(short = 'c', long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Write logs to the specified file instead of stderr
    #[arg(short = 'l', long, global = true, value_name = "PATH")]
    pub log: Option<PathBuf>,
}

/// Per-invocation overrides applied on top of the resolved connection.
#[derive(ClapArgs, Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetOptions {
    /// Transport to use: auto, http, sse or websocket
    #[arg(short = 't', long)]
    pub transport: Option<TransportPreference>,

    /// Bearer token sent as `Authorization: Bearer <token>`
    #[arg(long, conflicts_with = "api_key")]
    pub bearer: Option<String>,

    /// API key sent as `X-API-Key`
    #[arg(long)]
    pub api_key: Option<String>,

    /// Per-request timeout in milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Attempts for connection and tool retries
    #[arg(long)]
    pub retries: Option<u32>,
}

impl TargetOptions {
    pub fn apply(&self, mut connection: ConnectionConfig) -> ConnectionConfig {
        if let Some(transport) = self.transport {
            connection.transport = transport;
        }
        if let Some(token) = self.bearer.as_ref() {
            connection.auth = AuthConfig::Bearer {
                token: token.clone(),
            };
        } else if let Some(key) = self.api_key.as_ref() {
            connection.auth = AuthConfig::ApiKey { key: key.clone() };
        }
        if let Some(timeout_ms) = self.timeout_ms {
            connection.timeout_ms = timeout_ms;
        }
        if let Some(retries) = self.retries {
            connection.retry_attempts = retries;
        }
        connection
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check that a server answers the initialize handshake
    Test {
        /// Connection id or server URL
        target: String,
        #[command(flatten)]
        options: TargetOptions,
    },
    /// Connect and list server info, capabilities, tools and resources
    Inspect {
        target: String,
        #[command(flatten)]
        options: TargetOptions,
    },
    /// Call a tool and print the execution record
    Call {
        target: String,
        /// Tool name
        tool: String,
        /// Tool arguments as a JSON object
        #[arg(short = 'a', long, value_name = "JSON")]
        args: Option<String>,
        #[command(flatten)]
        options: TargetOptions,
    },
    /// Read a resource by URI
    Read {
        target: String,
        uri: String,
        #[command(flatten)]
        options: TargetOptions,
    },
    /// List configured connections
    List,
    /// Add or replace a configured connection
    Add {
        id: String,
        url: String,
        /// Name shown in listings
        #[arg(long)]
        name: Option<String>,
        #[command(flatten)]
        options: TargetOptions,
    },
    /// Remove a configured connection
    Remove { id: String },
}

pub fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_tracing(args.log.as_deref())?;

    let runtime = tokio::runtime::Runtime::new()?;
    match runtime.block_on(async_main(args)) {
        Ok(0) => Ok(()),
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("❌ {err}");
            std::process::exit(1);
        }
    }
}

fn log_filter() -> EnvFilter {
    let directives = std::env::var(LOG_ENV)
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_string());
    EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

fn init_tracing(log_path: Option<&Path>) -> Result<(), Box<dyn Error>> {
    let builder = tracing_subscriber::fmt().with_env_filter(log_filter());
    let result = match log_path {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            builder
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .try_init()
        }
        None => builder.with_writer(std::io::stderr).try_init(),
    };
    result.map_err(|err| err as Box<dyn Error>)
}

async fn async_main(args: Args) -> Result<i32, Box<dyn Error>> {
    let config_path = match args.config {
        Some(path) => path,
        None => Config::default_config_path()?,
    };
    let mut config = Config::load_from_path(&config_path)?;
    debug!(path = %path_display(&config_path), connections = config.connections.len(), "Loaded config");

    let (target, options) = match args.command {
        Commands::List => {
            print_connections(&config);
            return Ok(0);
        }
        Commands::Add {
            id,
            url,
            name,
            options,
        } => {
            let mut connection = options.apply(ConnectionConfig::new(id.clone(), url));
            connection.display_name = name;
            config.upsert_connection(connection);
            config.save_to_path(&config_path)?;
            println!("✅ Saved connection '{id}' to {}", path_display(&config_path));
            return Ok(0);
        }
        Commands::Remove { id } => {
            if !config.remove_connection(&id) {
                eprintln!("⚠️  No connection named '{id}'");
                return Ok(1);
            }
            config.save_to_path(&config_path)?;
            println!("✅ Removed connection '{id}'");
            return Ok(0);
        }
        Commands::Test {
            ref target,
            ref options,
        }
        | Commands::Inspect {
            ref target,
            ref options,
        }
        | Commands::Call {
            ref target,
            ref options,
            ..
        }
        | Commands::Read {
            ref target,
            ref options,
            ..
        } => (target.clone(), options.clone()),
    };

    let connection = resolve_target(&config, &target, &options)?;
    let client = McpClient::new()?.with_retry_settings(config.retry.clone());
    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let outcome = run_command(&client, &connection, args.command, &cancel).await;
    client.cleanup_all().await;
    outcome
}

async fn run_command(
    client: &McpClient,
    connection: &ConnectionConfig,
    command: Commands,
    cancel: &CancellationToken,
) -> Result<i32, Box<dyn Error>> {
    match command {
        Commands::Test { .. } => {
            if client
                .test_connection_with_cancel(connection, Some(cancel))
                .await
            {
                println!("ok");
                Ok(0)
            } else {
                println!("failed");
                Ok(1)
            }
        }
        Commands::Inspect { .. } => {
            let report = client
                .connect_and_introspect_with_cancel(connection, Some(cancel))
                .await?;
            print_json(&report)?;
            Ok(0)
        }
        Commands::Call { tool, args, .. } => {
            let arguments = parse_tool_args(args.as_deref())?;
            let record = client
                .execute_tool_with_cancel(connection, &tool, arguments, Some(cancel))
                .await;
            print_json(&record)?;
            Ok(if record.is_success() { 0 } else { 1 })
        }
        Commands::Read { uri, .. } => {
            let value = client
                .read_resource_with_cancel(connection, &uri, Some(cancel))
                .await?;
            print_json(&value)?;
            Ok(0)
        }
        Commands::List | Commands::Add { .. } | Commands::Remove { .. } => Ok(0),
    }
}

/// Resolves a connection id (case-insensitive) or a URL into a connection.
pub fn resolve_target(
    config: &Config,
    target: &str,
    options: &TargetOptions,
) -> Result<ConnectionConfig, Box<dyn Error>> {
    if let Some(connection) = config.find_connection(target) {
        return Ok(options.apply(connection.clone()));
    }
    if target.contains("://") {
        return Ok(options.apply(ConnectionConfig::new(AD_HOC_CONNECTION_ID, target)));
    }
    Err(format!("Unknown connection '{target}'. Use a configured id or a URL.").into())
}

/// Parses `--args`; only JSON objects are valid tool arguments.
pub fn parse_tool_args(raw: Option<&str>) -> Result<Option<Map<String, Value>>, Box<dyn Error>> {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return Ok(None);
    };
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(map) => Ok(Some(map)),
        _ => Err("Tool arguments must be a JSON object".into()),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_connections(config: &Config) {
    if config.connections.is_empty() {
        println!("No connections configured. Add one with `mcpeek add <id> <url>`.");
        return;
    }
    for connection in &config.connections {
        println!(
            "{:<16} {:<10} {} ({})",
            connection.id,
            connection.transport.as_str(),
            connection.url,
            connection.label()
        );
    }
}

#[cfg(test)]
mod tests;
