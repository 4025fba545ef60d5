//! Workspace memory: durable notes, conversation history, and compaction.

pub mod compact;
pub mod store;

pub use compact::Compactor;
pub use store::{HistoryStats, HistoryTurn, LastDocument, MemoryStore, NoteStats, Role};
