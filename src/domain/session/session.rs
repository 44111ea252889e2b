//! Per-file session state and read-accessor option types.

use serde::Serialize;

use crate::domain::foundation::{FileKey, Timestamp};

use super::buffers::BoundedBuffer;
use super::events::{DocumentChange, LogEntry, LogLevel, SelectionSnapshot};

/// Everything the broker retains for one identified design file.
///
/// Survives transport rebinds: when the same key reconnects, the new socket
/// is attached to this record and every buffer keeps its contents.
#[derive(Debug, Clone)]
pub struct FileSession {
    pub key: FileKey,
    pub name: String,
    pub current_page: Option<String>,
    /// Latest selection, replaced (never appended) on each selection event.
    pub selection: Option<SelectionSnapshot>,
    pub document_changes: BoundedBuffer<DocumentChange>,
    pub logs: BoundedBuffer<LogEntry>,
    pub connected_at: Timestamp,
    pub last_activity: Timestamp,
}

impl FileSession {
    pub fn new(
        key: FileKey,
        name: String,
        current_page: Option<String>,
        log_capacity: usize,
        document_change_capacity: usize,
    ) -> Self {
        let now = Timestamp::now();
        Self {
            key,
            name,
            current_page,
            selection: None,
            document_changes: BoundedBuffer::new(document_change_capacity),
            logs: BoundedBuffer::new(log_capacity),
            connected_at: now,
            last_activity: now,
        }
    }

    /// Record activity on this session.
    pub fn touch(&mut self) {
        self.last_activity = Timestamp::now();
    }

    /// Logs matching the query, oldest-first.
    pub fn query_logs(&self, query: &LogQuery) -> Vec<LogEntry> {
        let mut out: Vec<LogEntry> = self
            .logs
            .iter()
            .filter(|entry| query.since.map_or(true, |since| entry.timestamp.is_after(&since)))
            .filter(|entry| query.level.map_or(true, |level| entry.level == level))
            .cloned()
            .collect();
        if let Some(limit) = query.limit {
            if out.len() > limit {
                out.drain(..out.len() - limit);
            }
        }
        out
    }

    /// Document changes matching the query, oldest-first.
    pub fn query_document_changes(&self, query: &ChangeQuery) -> Vec<DocumentChange> {
        let mut out: Vec<DocumentChange> = self
            .document_changes
            .iter()
            .filter(|change| query.since.map_or(true, |since| change.timestamp.is_after(&since)))
            .cloned()
            .collect();
        if let Some(limit) = query.limit {
            if out.len() > limit {
                out.drain(..out.len() - limit);
            }
        }
        out
    }
}

/// Options for log reads. `file: None` targets the active file;
/// `level: None` means all levels.
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    pub file: Option<FileKey>,
    pub since: Option<Timestamp>,
    pub limit: Option<usize>,
    pub level: Option<LogLevel>,
}

/// Options for document-change reads. `file: None` targets the active file.
#[derive(Debug, Clone, Default)]
pub struct ChangeQuery {
    pub file: Option<FileKey>,
    pub since: Option<Timestamp>,
    pub limit: Option<usize>,
}

/// One entry of `get_connected_files()`: an open named client plus whether
/// it is the current election winner.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub key: FileKey,
    pub name: String,
    pub current_page: Option<String>,
    pub is_active: bool,
}

/// Metadata snapshot for one named client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub key: FileKey,
    pub name: String,
    pub current_page: Option<String>,
    /// False while the client is inside its reconnection grace window.
    pub connected: bool,
    pub connected_at: Timestamp,
    pub last_activity: Timestamp,
}
