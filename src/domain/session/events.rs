//! Records produced by unsolicited client events.
//!
//! These are the stored shapes: payload caps (changed-id sampling, selection
//! node limits, log truncation) are applied before construction, so a record
//! in a buffer is already bounded.

use serde::{Deserialize, Serialize};

use crate::domain::foundation::{FileKey, Timestamp};

/// Console log severity as reported by the design client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Log,
    Info,
    Warn,
    Error,
    Debug,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Log => "log",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Debug => "debug",
        }
    }
}

/// One captured console line from a design client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: Timestamp,
    pub level: LogLevel,
    /// Truncated to the configured character limit on ingestion.
    pub message: String,
    /// Structured arguments, capped on ingestion.
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    /// File key of the client that emitted the line.
    pub source: FileKey,
}

/// One document-edit notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentChange {
    pub style_changed: bool,
    pub node_changed: bool,
    /// Sampled ids of changed nodes, capped on ingestion. `change_count`
    /// reflects the full change, not the sample size.
    #[serde(default)]
    pub changed_ids: Vec<String>,
    pub change_count: u64,
    pub timestamp: Timestamp,
}

/// One node in a selection snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionNode {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
}

/// The client's current selection. Replaced wholesale on every
/// SELECTION_CHANGE event; never appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionSnapshot {
    /// Selected nodes, capped on ingestion.
    #[serde(default)]
    pub nodes: Vec<SelectionNode>,
    /// Full selection size, independent of the node cap.
    pub count: u64,
    #[serde(default)]
    pub page: Option<String>,
    pub timestamp: Timestamp,
}
