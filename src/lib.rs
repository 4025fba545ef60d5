//! Nimbus - personal assistant core
//!
//! Bridges a messaging front end to an LLM backend while owning the durable
//! state around it:
//! - Per-workspace note logs and conversation history
//! - One-shot reminders that survive process restarts
//! - Token/cost accounting per workspace
//! - Scheduled background jobs (heartbeat, note compaction, daily digest)
//!
//! The chat transport itself, search, and voice/document ingestion live
//! outside this crate and connect through the collaborator traits in
//! [`llm`], [`delivery`], and [`digest`].

pub mod config;
pub mod delivery;
pub mod digest;
pub mod llm;
pub mod memory;
pub mod reminders;
pub mod scheduler;
pub mod usage;
pub mod workspace;

pub use config::Config;
pub use memory::{Compactor, MemoryStore};
pub use reminders::{Reminder, ReminderStore};
pub use scheduler::Scheduler;
pub use usage::UsageLedger;
pub use workspace::WorkspaceManager;

/// Result type for Nimbus operations
pub type Result<T> = std::result::Result<T, NimbusError>;

/// Errors that can occur in Nimbus
#[derive(Debug, thiserror::Error)]
pub enum NimbusError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("LLM request error: {0}")]
    Llm(String),

    #[error("Scheduling error: {0}")]
    Schedule(String),

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Weather fetch error: {0}")]
    Weather(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
