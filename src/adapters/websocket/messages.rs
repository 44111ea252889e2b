//! Wire message types for the design-client socket protocol.
//!
//! All frames are JSON text. Three shapes travel on one socket:
//! - Server → Client command: `{id, method, params}`
//! - Client → Server response: `{id, result?, error?}`
//! - Client → Server unsolicited event: `{type, data}`
//!
//! Inbound frames are classified by shape: events carry a `type` tag,
//! responses carry a correlation `id` and no `type`.

use serde::{Deserialize, Serialize};

use crate::domain::session::SelectionNode;

// ============================================
// Server → Client
// ============================================

/// Outbound command carrying a process-unique correlation id.
#[derive(Debug, Clone, Serialize)]
pub struct CommandFrame {
    pub id: String,
    pub method: String,
    pub params: serde_json::Value,
}

// ============================================
// Client → Server
// ============================================

/// Response to an earlier command, matched by `id`. Exactly one of `result`
/// and `error` is expected; `error` wins when both are present.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Unsolicited event pushed by a design client.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EventFrame {
    #[serde(rename = "IDENTIFY")]
    Identify(IdentifyPayload),

    #[serde(rename = "DOCUMENT_CHANGE")]
    DocumentChange(DocumentChangePayload),

    #[serde(rename = "SELECTION_CHANGE")]
    SelectionChange(SelectionChangePayload),

    #[serde(rename = "PAGE_CHANGE")]
    PageChange(PageChangePayload),

    #[serde(rename = "LOG_CAPTURE")]
    LogCapture(LogCapturePayload),
}

/// Identity message promoting a pending socket to a named client.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyPayload {
    pub name: String,
    pub key: String,
    #[serde(default)]
    pub current_page: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentChangePayload {
    pub has_style_changes: bool,
    pub has_node_changes: bool,
    #[serde(default)]
    pub changed_ids: Vec<String>,
    pub change_count: u64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionChangePayload {
    #[serde(default)]
    pub nodes: Vec<SelectionNode>,
    pub count: u64,
    #[serde(default)]
    pub page: Option<String>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageChangePayload {
    pub page: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogCapturePayload {
    pub level: crate::domain::session::LogLevel,
    pub message: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    pub timestamp: i64,
}

// ============================================
// Inbound classification
// ============================================

/// A parsed inbound frame: either an unsolicited event or a command response.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    Event(EventFrame),
    Response(ResponseFrame),
}

/// Classify and parse one inbound text frame.
///
/// Malformed frames are the caller's problem to log and drop; they must
/// never take the broker down.
pub fn parse_inbound(text: &str) -> Result<InboundFrame, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    if value.get("type").is_some() {
        Ok(InboundFrame::Event(serde_json::from_value(value)?))
    } else {
        Ok(InboundFrame::Response(serde_json::from_value(value)?))
    }
}
