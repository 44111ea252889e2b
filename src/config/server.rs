//! WebSocket server configuration

use serde::Deserialize;
use std::net::SocketAddr;

use super::error::ValidationError;

/// Listener configuration for the design-session WebSocket endpoint.
///
/// The broker is a local companion process, so the default bind address is
/// loopback-only. Exposing it on another interface is possible but the
/// socket carries no authentication.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Rust log filter directive
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Maximum inbound WebSocket message size in bytes.
    ///
    /// Large by default because design clients inline image and document
    /// data in event payloads.
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

impl ServerConfig {
    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> SocketAddr {
        format!("{}:{}", self.host, self.port)
            .parse()
            .expect("Invalid socket address")
    }

    /// Check whether the configured bind address is loopback-only.
    pub fn is_loopback(&self) -> bool {
        self.socket_addr().ip().is_loopback()
    }

    /// Validate server configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        if self.max_message_bytes == 0 {
            return Err(ValidationError::InvalidMessageSize);
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3055
}

fn default_log_level() -> String {
    "info,canvas_bridge=debug".to_string()
}

fn default_max_message_bytes() -> usize {
    100 * 1024 * 1024
}
