//! Model Context Protocol client: JSON-RPC envelopes, transports, sessions and retries.

pub mod client;
pub mod correlator;
pub mod error;
pub mod protocol;
pub mod retry;
pub mod transport;

pub use client::{IntrospectionReport, McpClient};
pub use error::McpError;
