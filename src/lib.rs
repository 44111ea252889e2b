//! Connection broker between AI-tool sessions and live design files.
//!
//! Design clients connect over WebSocket, identify the file they serve, and
//! stream unsolicited events (document changes, selection, page switches,
//! captured console logs) into per-file bounded buffers. An AI-tool layer
//! drives the [`ports::CommandGateway`] port to send request/response
//! commands to the elected active file and to read the buffered state back.
//!
//! Layout follows ports-and-adapters:
//! - [`domain`] — value objects and per-file session state
//! - [`ports`] — the gateway interface the tool layer consumes
//! - [`adapters::websocket`] — the broker core and the axum listener
//! - [`config`] — environment-driven configuration

pub mod adapters;
pub mod config;
pub mod domain;
pub mod ports;
