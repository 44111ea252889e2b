//! Domain layer: value objects and session state, free of transport concerns.

pub mod foundation;
pub mod session;
