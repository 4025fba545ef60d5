//! Outbound message delivery contract
//!
//! The chat transport lives outside this crate; reminders and digests send
//! through this seam so failures can be caught per recipient.

use crate::Result;
use async_trait::async_trait;
use tracing::info;

/// Sends a text message to a chat target.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn send(&self, chat_id: i64, text: &str) -> Result<()>;
}

/// Logs outbound messages instead of sending them. Used by the binary when
/// no transport is wired up.
pub struct LogDelivery;

#[async_trait]
impl Delivery for LogDelivery {
    async fn send(&self, chat_id: i64, text: &str) -> Result<()> {
        info!("outbound message to {chat_id}:\n{text}");
        Ok(())
    }
}
