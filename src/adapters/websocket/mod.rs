//! WebSocket adapter: the broker core plus the axum listener around it.

mod broker;
mod messages;
mod server;

pub use broker::{BridgeEvent, Broker, TransportId};
pub use messages::{CommandFrame, EventFrame, InboundFrame, ResponseFrame};
pub use server::{BridgeServer, ServerError};
