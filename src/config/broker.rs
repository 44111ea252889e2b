//! Connection broker configuration

use serde::Deserialize;
use std::time::Duration;

use super::error::ValidationError;

/// Tuning knobs for the connection broker: buffer capacities, payload caps,
/// and the three timer intervals (identification deadline, request timeout,
/// reconnection grace period).
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Capacity of each client's console/log buffer
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,

    /// Capacity of each client's document-change buffer
    #[serde(default = "default_document_change_capacity")]
    pub document_change_capacity: usize,

    /// Seconds a new socket may remain unidentified before it is closed
    #[serde(default = "default_identification_timeout_secs")]
    pub identification_timeout_secs: u64,

    /// Default per-command timeout in milliseconds (overridable per call)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Milliseconds a named client's state survives after transport loss
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    /// Stored sample cap for changed node ids per document-change event
    #[serde(default = "default_changed_ids_max")]
    pub changed_ids_max: usize,

    /// Stored cap for nodes per selection snapshot
    #[serde(default = "default_selection_nodes_max")]
    pub selection_nodes_max: usize,

    /// Captured log messages are truncated to this many characters
    #[serde(default = "default_log_message_max_chars")]
    pub log_message_max_chars: usize,

    /// Stored cap for structured args per captured log line
    #[serde(default = "default_log_args_max")]
    pub log_args_max: usize,
}

impl BrokerConfig {
    /// Identification deadline for pending sockets.
    pub fn identification_timeout(&self) -> Duration {
        Duration::from_secs(self.identification_timeout_secs)
    }

    /// Default command timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Reconnection grace period for named clients.
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// Validate broker configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.log_capacity == 0 {
            return Err(ValidationError::InvalidCapacity("log_capacity"));
        }
        if self.document_change_capacity == 0 {
            return Err(ValidationError::InvalidCapacity("document_change_capacity"));
        }
        if self.identification_timeout_secs == 0 {
            return Err(ValidationError::InvalidTimeout("identification_timeout_secs"));
        }
        if self.request_timeout_ms == 0 {
            return Err(ValidationError::InvalidTimeout("request_timeout_ms"));
        }
        if self.grace_period_ms == 0 {
            return Err(ValidationError::InvalidTimeout("grace_period_ms"));
        }
        Ok(())
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            log_capacity: default_log_capacity(),
            document_change_capacity: default_document_change_capacity(),
            identification_timeout_secs: default_identification_timeout_secs(),
            request_timeout_ms: default_request_timeout_ms(),
            grace_period_ms: default_grace_period_ms(),
            changed_ids_max: default_changed_ids_max(),
            selection_nodes_max: default_selection_nodes_max(),
            log_message_max_chars: default_log_message_max_chars(),
            log_args_max: default_log_args_max(),
        }
    }
}

fn default_log_capacity() -> usize {
    1000
}

fn default_document_change_capacity() -> usize {
    200
}

fn default_identification_timeout_secs() -> u64 {
    30
}

fn default_request_timeout_ms() -> u64 {
    15_000
}

fn default_grace_period_ms() -> u64 {
    5_000
}

fn default_changed_ids_max() -> usize {
    50
}

fn default_selection_nodes_max() -> usize {
    50
}

fn default_log_message_max_chars() -> usize {
    2000
}

fn default_log_args_max() -> usize {
    16
}
