//! Ports: interfaces between the broker core and its collaborators.

mod command_gateway;

pub use command_gateway::CommandGateway;
