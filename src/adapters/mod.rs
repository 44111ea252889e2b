//! Adapters: transport-facing implementations of the ports.

pub mod websocket;
