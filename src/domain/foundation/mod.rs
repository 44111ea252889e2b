//! Foundation value objects shared across the domain.

mod errors;
mod ids;
mod timestamp;

pub use errors::BrokerError;
pub use ids::FileKey;
pub use timestamp::Timestamp;
