//! CommandGateway port - Interface the AI-tool dispatch layer drives.
//!
//! The dispatch layer registers tool schemas and translates tool calls into
//! commands; everything it needs from the broker goes through this port so it
//! can be unit-tested against an in-memory double.
//!
//! Commands route to the elected *active* file unless an explicit target key
//! is given, which is how one AI session can address several simultaneously
//! open design files.

use async_trait::async_trait;
use std::time::Duration;

use crate::domain::foundation::{BrokerError, FileKey};
use crate::domain::session::{
    ChangeQuery, ClientInfo, DocumentChange, FileInfo, LogEntry, LogQuery, SelectionSnapshot,
};

/// Port for issuing commands to, and reading buffered state from, connected
/// design-file sessions.
#[async_trait]
pub trait CommandGateway: Send + Sync {
    /// Send a command and await its correlated response.
    ///
    /// Routes to `target` if given, otherwise to the active file. Fails
    /// synchronously with [`BrokerError::NoActiveFile`] or
    /// [`BrokerError::NotConnected`] when no open target resolves — no
    /// timer is created and nothing is written to any socket.
    ///
    /// `timeout: None` uses the configured default.
    async fn send_command(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Option<Duration>,
        target: Option<&FileKey>,
    ) -> Result<serde_json::Value, BrokerError>;

    /// Every open named client, with its `is_active` election flag.
    fn connected_files(&self) -> Vec<FileInfo>;

    /// Override the active file. Succeeds only if the target's transport is
    /// currently open; returns whether the override took effect.
    fn set_active_file(&self, key: &FileKey) -> bool;

    /// The file key currently receiving unscoped commands, if any.
    fn active_file_key(&self) -> Option<FileKey>;

    /// Buffered console lines for the active or specified file.
    fn logs(&self, query: &LogQuery) -> Result<Vec<LogEntry>, BrokerError>;

    /// Empty the log buffer, returning the number of removed entries.
    fn clear_logs(&self, file: Option<&FileKey>) -> Result<usize, BrokerError>;

    /// Buffered document changes for the active or specified file.
    fn document_changes(&self, query: &ChangeQuery) -> Result<Vec<DocumentChange>, BrokerError>;

    /// Empty the document-change buffer, returning the removed count.
    fn clear_document_changes(&self, file: Option<&FileKey>) -> Result<usize, BrokerError>;

    /// Latest selection snapshot for the active or specified file.
    fn selection(&self, file: Option<&FileKey>) -> Result<Option<SelectionSnapshot>, BrokerError>;

    /// Metadata for the active or specified client.
    fn client_info(&self, file: Option<&FileKey>) -> Result<ClientInfo, BrokerError>;

    /// Whether at least one named client has an open transport.
    fn is_any_client_connected(&self) -> bool;
}
