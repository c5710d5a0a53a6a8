pub mod data;
pub mod io;

pub use data::{AuthConfig, Config, ConnectionConfig, TransportPreference};
pub use io::ConfigError;

#[cfg(test)]
pub mod tests;
