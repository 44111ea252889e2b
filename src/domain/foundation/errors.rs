//! Error types for the broker domain.

use thiserror::Error;

use super::FileKey;

/// Failures surfaced to the command-dispatch layer.
///
/// Every failed command rejects with exactly one of these; no partial results
/// are ever returned. `Remote` carries the error string reported by the
/// design client verbatim and is treated as authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// No client is elected active and the caller gave no explicit target.
    /// Raised synchronously, before any I/O or timer is created.
    #[error("No active design file; connect a client or pass an explicit file key")]
    NoActiveFile,

    /// The resolved target exists but its transport is not open
    /// (or no client is known for the key at all).
    #[error("Design file '{key}' is not connected")]
    NotConnected { key: FileKey },

    /// No response arrived within the per-command deadline.
    #[error("Command '{method}' timed out after {elapsed_ms} ms")]
    CommandTimeout { method: String, elapsed_ms: u64 },

    /// The design client answered with an error payload.
    #[error("{0}")]
    Remote(String),

    /// The target client was destroyed (grace period expired or the socket
    /// re-identified as a different file) with this request outstanding.
    #[error("Design file '{key}' disconnected before responding")]
    ClientDisconnected { key: FileKey },

    /// The broker is stopping; all outstanding work is rejected.
    #[error("Broker is shutting down")]
    ShutdownInProgress,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_file_key() {
        let err = BrokerError::NotConnected {
            key: FileKey::new("abc123"),
        };
        assert!(err.to_string().contains("abc123"));

        let err = BrokerError::ClientDisconnected {
            key: FileKey::new("abc123"),
        };
        assert!(err.to_string().contains("abc123"));
    }

    #[test]
    fn timeout_message_names_method_and_elapsed() {
        let err = BrokerError::CommandTimeout {
            method: "get_document_info".to_string(),
            elapsed_ms: 15_000,
        };
        let text = err.to_string();
        assert!(text.contains("get_document_info"));
        assert!(text.contains("15000"));
    }

    #[test]
    fn remote_error_is_verbatim() {
        let err = BrokerError::Remote("node not found: 12:7".to_string());
        assert_eq!(err.to_string(), "node not found: 12:7");
    }
}
