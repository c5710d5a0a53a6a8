//! mcpeek is a Model Context Protocol client for probing and driving MCP servers.
//!
//! The crate is organized around a small set of layers:
//! - [`mcp`] speaks the protocol: JSON-RPC envelopes, the HTTP, SSE-session and
//!   WebSocket transports, request correlation, retries, and the
//!   [`mcp::McpClient`] that ties them together.
//! - [`core`] owns configuration: connection definitions and their TOML persistence.
//! - [`cli`] parses command-line arguments and runs one client operation per call.
//!
//! The binary (`src/main.rs`) routes through [`crate::cli::main`].

pub mod cli;
pub mod core;
pub mod mcp;
