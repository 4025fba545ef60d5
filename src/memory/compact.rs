//! Note log compaction
//!
//! Rewrites a workspace's note log into a condensed form via the LLM
//! collaborator. Write safety is strict: the previous content is backed up
//! before the overwrite, and a failed write restores it. A failed or empty
//! LLM response leaves the log untouched.

use crate::llm::{ChatModel, ChatTurn, UsageSink};
use crate::memory::MemoryStore;
use crate::Result;
use std::sync::Arc;
use tracing::{error, info};

/// Note logs smaller than this are not worth an LLM round-trip.
const MIN_COMPACT_BYTES: usize = 500;
const COMPACT_MAX_TOKENS: u32 = 4096;

const COMPACT_SYSTEM_PROMPT: &str = "You are a precise text processing assistant. Your only job is to consolidate and clean up memory logs. Output only the processed content, nothing else.";

const COMPACT_PROMPT: &str = r#"You are consolidating a long-term memory log.

INSTRUCTIONS:
1. Remove duplicate information
2. Organize entries by topic or theme
3. Drop stale items that are no longer relevant
4. Keep it concise but complete - do not lose important information
5. Maintain a clean markdown format with headers and sections
6. When dates matter, keep the most recent ones
7. Preserve persistent facts, preferences, and important context

CURRENT MEMORY LOG:
---
{notes}
---

Return ONLY the consolidated memory content in markdown format. Do not include any preamble or explanation."#;

/// LLM-backed note log compactor.
pub struct Compactor {
    model: Arc<dyn ChatModel>,
    usage: Arc<dyn UsageSink>,
}

impl Compactor {
    pub fn new(model: Arc<dyn ChatModel>, usage: Arc<dyn UsageSink>) -> Self {
        Self { model, usage }
    }

    /// Compact a workspace's note log.
    ///
    /// With `dry_run` the condensed text and size delta are returned as a
    /// preview and nothing is persisted. Otherwise the sequence is
    /// backup, write, restore-on-write-failure; success is reported only
    /// when all steps went through.
    pub async fn compact(&self, store: &MemoryStore, dry_run: bool) -> (bool, String) {
        let current = store.read_notes().await;
        if current.trim().is_empty() {
            return (false, "No notes to compact".to_string());
        }
        if current.trim().len() < MIN_COMPACT_BYTES {
            return (false, "Note log too small to compact".to_string());
        }

        let compacted = match self.generate(&current).await {
            Ok(text) if text.is_empty() => {
                return (false, "Compaction returned an empty result".to_string())
            }
            Ok(text) => text,
            Err(e) => {
                error!("compaction LLM call failed: {e}");
                return (false, format!("Compaction failed: {e}"));
            }
        };

        let reduction = (1.0 - compacted.len() as f64 / current.len() as f64) * 100.0;

        if dry_run {
            return (
                true,
                format!(
                    "Original: {} chars -> compacted: {} chars ({reduction:.1}% reduction)\n\n---\n\n{compacted}",
                    current.len(),
                    compacted.len(),
                ),
            );
        }

        if !store.backup_notes().await {
            return (false, "Failed to back up the note log".to_string());
        }
        if !store.overwrite_notes(&compacted).await {
            store.restore_notes_from_backup().await;
            return (
                false,
                "Failed to write compacted notes; previous content restored".to_string(),
            );
        }

        info!(
            "note log compacted: {} -> {} bytes ({reduction:.1}% reduction)",
            current.len(),
            compacted.len()
        );
        (
            true,
            format!("Notes compacted ({reduction:.1}% reduction); backup kept next to the log"),
        )
    }

    /// Preview compaction without applying it.
    pub async fn preview(&self, store: &MemoryStore) -> (bool, String) {
        self.compact(store, true).await
    }

    async fn generate(&self, notes: &str) -> Result<String> {
        let prompt = COMPACT_PROMPT.replace("{notes}", notes);
        let messages = vec![ChatTurn::user(prompt)];
        let reply = self
            .model
            .chat(
                COMPACT_SYSTEM_PROMPT,
                &messages,
                Some(COMPACT_MAX_TOKENS),
                self.usage.as_ref(),
            )
            .await?;
        Ok(reply.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::NullUsage;
    use crate::NimbusError;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct FixedModel(String);

    #[async_trait]
    impl ChatModel for FixedModel {
        async fn chat(
            &self,
            _system: &str,
            _messages: &[ChatTurn],
            _max_tokens: Option<u32>,
            usage: &dyn UsageSink,
        ) -> Result<String> {
            usage.record("mock-model", 100, 20).await;
            Ok(self.0.clone())
        }
    }

    struct FailingModel;

    #[async_trait]
    impl ChatModel for FailingModel {
        async fn chat(
            &self,
            _system: &str,
            _messages: &[ChatTurn],
            _max_tokens: Option<u32>,
            _usage: &dyn UsageSink,
        ) -> Result<String> {
            Err(NimbusError::Llm("API error 500".to_string()))
        }
    }

    async fn seeded_store(dir: &TempDir) -> MemoryStore {
        let store = MemoryStore::open(dir.path().join("ws"), 20).await.unwrap();
        for i in 0..12 {
            store
                .append_note(&format!("Entry {i}: a fact worth keeping around for a while"))
                .await;
        }
        store
    }

    fn compactor(model: impl ChatModel + 'static) -> Compactor {
        Compactor::new(Arc::new(model), Arc::new(NullUsage))
    }

    #[tokio::test]
    async fn test_compact_success_keeps_backup() {
        let dir = TempDir::new().unwrap();
        let store = seeded_store(&dir).await;
        let original = store.read_notes().await;

        let (ok, message) = compactor(FixedModel("# Consolidated\n\n- facts".to_string()))
            .compact(&store, false)
            .await;
        assert!(ok, "{message}");
        assert_eq!(store.read_notes().await, "# Consolidated\n\n- facts");

        // The backup holds the exact pre-compaction content.
        assert!(store.restore_notes_from_backup().await);
        assert_eq!(store.read_notes().await, original);
    }

    #[tokio::test]
    async fn test_dry_run_does_not_persist() {
        let dir = TempDir::new().unwrap();
        let store = seeded_store(&dir).await;
        let original = store.read_notes().await;

        let (ok, preview) = compactor(FixedModel("short".to_string()))
            .compact(&store, true)
            .await;
        assert!(ok);
        assert!(preview.contains("% reduction"));
        assert!(preview.contains("short"));
        assert_eq!(store.read_notes().await, original);
        assert!(!dir.path().join("ws/MEMORY.md.bak").exists());
    }

    #[tokio::test]
    async fn test_too_small_rejected_untouched() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::open(dir.path().join("ws"), 20).await.unwrap();
        store.append_note("tiny").await;
        let original = store.read_notes().await;

        let (ok, message) = compactor(FixedModel("anything".to_string()))
            .compact(&store, false)
            .await;
        assert!(!ok);
        assert!(message.contains("too small"));
        assert_eq!(store.read_notes().await, original);
    }

    #[tokio::test]
    async fn test_empty_log_rejected() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::open(dir.path().join("ws"), 20).await.unwrap();
        let (ok, message) = compactor(FixedModel("anything".to_string()))
            .compact(&store, false)
            .await;
        assert!(!ok);
        assert!(message.contains("No notes"));
    }

    #[tokio::test]
    async fn test_llm_failure_surfaces_message_leaves_log() {
        let dir = TempDir::new().unwrap();
        let store = seeded_store(&dir).await;
        let original = store.read_notes().await;

        let (ok, message) = compactor(FailingModel).compact(&store, false).await;
        assert!(!ok);
        assert!(message.contains("Compaction failed"));
        assert_eq!(store.read_notes().await, original);
    }

    #[tokio::test]
    async fn test_empty_llm_reply_rejected() {
        let dir = TempDir::new().unwrap();
        let store = seeded_store(&dir).await;
        let (ok, message) = compactor(FixedModel("   ".to_string()))
            .compact(&store, false)
            .await;
        assert!(!ok);
        assert!(message.contains("empty result"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_write_failure_preserves_content() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let store = seeded_store(&dir).await;
        let original = store.read_notes().await;

        // Make the live file unwritable: backup still succeeds (reads the
        // live file, writes the sibling), the overwrite then fails.
        let note_path = dir.path().join("ws/MEMORY.md");
        let mut perms = std::fs::metadata(&note_path).unwrap().permissions();
        perms.set_mode(0o444);
        std::fs::set_permissions(&note_path, perms).unwrap();

        // Root ignores file modes; nothing to simulate in that case.
        if std::fs::OpenOptions::new()
            .write(true)
            .open(&note_path)
            .is_ok()
        {
            return;
        }

        let (ok, message) = compactor(FixedModel("replacement".to_string()))
            .compact(&store, false)
            .await;
        assert!(!ok);
        assert!(message.contains("previous content restored"), "{message}");
        assert_eq!(store.read_notes().await, original);

        let mut perms = std::fs::metadata(&note_path).unwrap().permissions();
        perms.set_mode(0o644);
        std::fs::set_permissions(&note_path, perms).unwrap();
    }
}
