//! Session aggregate: per-file state, event records, bounded buffers.

mod buffers;
mod events;
#[allow(clippy::module_inception)]
mod session;

pub use buffers::BoundedBuffer;
pub use events::{DocumentChange, LogEntry, LogLevel, SelectionNode, SelectionSnapshot};
pub use session::{ChangeQuery, ClientInfo, FileInfo, FileSession, LogQuery};
