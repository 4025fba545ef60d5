//! Durable note and history storage for a workspace
//!
//! Three kinds of state live in the workspace directory:
//! - `MEMORY.md` — the long-term note log, timestamped `## ` sections,
//!   append-only except for compaction (which is backup-guarded via
//!   `MEMORY.md.bak`)
//! - `history.jsonl` / `history_{user}.jsonl` — conversation turns, one
//!   JSON record per line; unparseable lines are skipped, never fatal
//! - `last_document.json` — single slot for the most recent ingested
//!   document
//!
//! Operations that can fail degrade to `false`/empty after logging; callers
//! treat those as the normal empty state. Every mutation is a single
//! open-write-close sequence so interleaved handlers can only reorder whole
//! operations, never tear one.

use crate::{NimbusError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

const NOTE_FILE: &str = "MEMORY.md";
const NOTE_BACKUP_FILE: &str = "MEMORY.md.bak";
const HISTORY_FILE: &str = "history.jsonl";
const LAST_DOCUMENT_FILE: &str = "last_document.json";

/// Speaker of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One conversation turn as persisted on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: Role,
    pub content: String,
    pub ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
}

/// The most recent ingested document, one slot per workspace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastDocument {
    pub filename: String,
    pub text: String,
    pub user_id: i64,
    pub ts: DateTime<Utc>,
}

/// Note log statistics for status displays
#[derive(Debug, Clone, Default)]
pub struct NoteStats {
    pub exists: bool,
    pub size_bytes: u64,
    pub lines: usize,
    pub sections: usize,
}

/// History log statistics for status displays
#[derive(Debug, Clone, Default)]
pub struct HistoryStats {
    pub turns: usize,
    pub size_bytes: u64,
}

/// Per-workspace store for notes, history, and the last-document slot.
pub struct MemoryStore {
    workspace_dir: PathBuf,
    history_limit: usize,
    skipped_lines: AtomicU64,
}

impl MemoryStore {
    /// Open the store, materializing the workspace directory if needed.
    pub async fn open(workspace_dir: PathBuf, history_limit: usize) -> Result<Self> {
        fs::create_dir_all(&workspace_dir).await?;
        Ok(Self {
            workspace_dir,
            history_limit,
            skipped_lines: AtomicU64::new(0),
        })
    }

    pub fn workspace_dir(&self) -> &Path {
        &self.workspace_dir
    }

    /// Count of history lines skipped as unparseable since this store was
    /// opened. Corruption stays non-fatal but observable.
    pub fn skipped_lines(&self) -> u64 {
        self.skipped_lines.load(Ordering::Relaxed)
    }

    /// Join a file name onto the workspace directory, rejecting anything
    /// that could land outside it. Runs on every write path.
    fn file_path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
            return Err(NimbusError::Workspace(format!("unsafe file name: {name}")));
        }
        let path = self.workspace_dir.join(name);
        if !path.starts_with(&self.workspace_dir) {
            return Err(NimbusError::Workspace(format!(
                "path escapes workspace: {name}"
            )));
        }
        Ok(path)
    }

    fn history_file_name(user_id: Option<i64>) -> String {
        match user_id {
            Some(id) => format!("history_{id}.jsonl"),
            None => HISTORY_FILE.to_string(),
        }
    }

    // ─── Note log ───────────────────────────────────────────────────

    /// Append a timestamped section to the note log.
    pub async fn append_note(&self, text: &str) -> bool {
        match self.try_append_note(text).await {
            Ok(()) => true,
            Err(e) => {
                warn!("failed to append note: {e}");
                false
            }
        }
    }

    async fn try_append_note(&self, text: &str) -> Result<()> {
        let path = self.file_path(NOTE_FILE)?;
        let timestamp = Utc::now().format("%Y-%m-%d %H:%M UTC");
        let entry = format!("\n## {}\n\n{}\n\n---\n", timestamp, text.trim());
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(entry.as_bytes()).await?;
        Ok(())
    }

    /// Full note log content; empty string when no notes exist yet.
    pub async fn read_notes(&self) -> String {
        let Ok(path) = self.file_path(NOTE_FILE) else {
            return String::new();
        };
        fs::read_to_string(&path).await.unwrap_or_default()
    }

    /// Copy the note log to its `.bak` sibling.
    pub async fn backup_notes(&self) -> bool {
        let (Ok(live), Ok(backup)) = (self.file_path(NOTE_FILE), self.file_path(NOTE_BACKUP_FILE))
        else {
            return false;
        };
        match fs::copy(&live, &backup).await {
            Ok(_) => true,
            Err(e) => {
                warn!("failed to back up note log: {e}");
                false
            }
        }
    }

    /// Copy the last backup over the live note log.
    pub async fn restore_notes_from_backup(&self) -> bool {
        let (Ok(live), Ok(backup)) = (self.file_path(NOTE_FILE), self.file_path(NOTE_BACKUP_FILE))
        else {
            return false;
        };
        match fs::copy(&backup, &live).await {
            Ok(_) => true,
            Err(e) => {
                warn!("failed to restore note log from backup: {e}");
                false
            }
        }
    }

    /// Replace the note log wholesale. Callers are expected to have taken a
    /// backup first; the compactor enforces that sequence.
    pub async fn overwrite_notes(&self, content: &str) -> bool {
        match self.try_overwrite_notes(content).await {
            Ok(()) => true,
            Err(e) => {
                warn!("failed to overwrite note log: {e}");
                false
            }
        }
    }

    async fn try_overwrite_notes(&self, content: &str) -> Result<()> {
        let path = self.file_path(NOTE_FILE)?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    pub async fn note_stats(&self) -> NoteStats {
        let Ok(path) = self.file_path(NOTE_FILE) else {
            return NoteStats::default();
        };
        let Ok(content) = fs::read_to_string(&path).await else {
            return NoteStats::default();
        };
        let size_bytes = fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
        NoteStats {
            exists: true,
            size_bytes,
            lines: content.lines().count(),
            sections: content.matches("## ").count(),
        }
    }

    // ─── History log ────────────────────────────────────────────────

    /// Append a conversation turn. `role` must be `user` or `assistant`;
    /// anything else is rejected with `false`. Routes to the per-user log
    /// when `user_id` is given.
    pub async fn append_turn(&self, role: &str, content: &str, user_id: Option<i64>) -> bool {
        let role = match role {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            other => {
                warn!("rejecting history turn with unknown role '{other}'");
                return false;
            }
        };
        match self.try_append_turn(role, content, user_id).await {
            Ok(()) => true,
            Err(e) => {
                warn!("failed to append history turn: {e}");
                false
            }
        }
    }

    async fn try_append_turn(&self, role: Role, content: &str, user_id: Option<i64>) -> Result<()> {
        let path = self.file_path(&Self::history_file_name(user_id))?;
        let turn = HistoryTurn {
            role,
            content: content.to_string(),
            ts: Utc::now(),
            user_id,
        };
        let mut line = serde_json::to_string(&turn)?;
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    async fn read_turns(&self, path: &Path) -> Vec<HistoryTurn> {
        let Ok(content) = fs::read_to_string(path).await else {
            return Vec::new();
        };
        let mut turns = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<HistoryTurn>(line) {
                Ok(turn) => turns.push(turn),
                Err(e) => {
                    self.skipped_lines.fetch_add(1, Ordering::Relaxed);
                    warn!("skipping unparseable history line: {e}");
                }
            }
        }
        turns
    }

    /// Load the most recent turns in chronological order. `None` uses the
    /// configured workspace limit; `Some(0)` means unlimited.
    pub async fn load_history(&self, limit: Option<usize>, user_id: Option<i64>) -> Vec<HistoryTurn> {
        let Ok(path) = self.file_path(&Self::history_file_name(user_id)) else {
            return Vec::new();
        };
        let turns = self.read_turns(&path).await;
        let limit = limit.unwrap_or(self.history_limit);
        if limit == 0 {
            return turns;
        }
        let start = turns.len().saturating_sub(limit);
        turns[start..].to_vec()
    }

    /// Delete the history log. Idempotent: an absent log is a success.
    pub async fn clear_history(&self, user_id: Option<i64>) -> bool {
        let Ok(path) = self.file_path(&Self::history_file_name(user_id)) else {
            return false;
        };
        match fs::remove_file(&path).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => {
                warn!("failed to clear history: {e}");
                false
            }
        }
    }

    pub async fn history_stats(&self, user_id: Option<i64>) -> HistoryStats {
        let Ok(path) = self.file_path(&Self::history_file_name(user_id)) else {
            return HistoryStats::default();
        };
        let Ok(content) = fs::read_to_string(&path).await else {
            return HistoryStats::default();
        };
        let size_bytes = fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
        HistoryStats {
            turns: content.lines().filter(|l| !l.trim().is_empty()).count(),
            size_bytes,
        }
    }

    // ─── Shared-mode catch-up ───────────────────────────────────────

    /// Merge the history of every authorized user except `exclude_user_id`,
    /// sorted by timestamp, truncated to the last `limit` entries. Read-only
    /// over the other users' logs.
    pub async fn load_other_users_history(
        &self,
        exclude_user_id: i64,
        authorized_users: &[i64],
        limit: usize,
    ) -> Vec<HistoryTurn> {
        let mut all_turns = Vec::new();
        for &user_id in authorized_users {
            if user_id == exclude_user_id {
                continue;
            }
            let Ok(path) = self.file_path(&Self::history_file_name(Some(user_id))) else {
                continue;
            };
            for mut turn in self.read_turns(&path).await {
                turn.user_id.get_or_insert(user_id);
                all_turns.push(turn);
            }
        }
        all_turns.sort_by_key(|t| t.ts);
        if limit > 0 {
            let start = all_turns.len().saturating_sub(limit);
            all_turns.drain(..start);
        }
        all_turns
    }

    /// User ids that have a per-user history log in this workspace.
    pub async fn list_user_history_ids(&self) -> Vec<i64> {
        let mut ids = Vec::new();
        let Ok(mut entries) = fs::read_dir(&self.workspace_dir).await else {
            return ids;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(id) = name
                    .strip_prefix("history_")
                    .and_then(|rest| rest.strip_suffix(".jsonl"))
                {
                    if let Ok(id) = id.parse::<i64>() {
                        ids.push(id);
                    }
                }
            }
        }
        ids.sort_unstable();
        ids
    }

    /// Build the summarization request for a cross-user catch-up digest.
    pub fn catchup_prompt(turns: &[HistoryTurn], user_names: &HashMap<i64, String>) -> String {
        if turns.is_empty() {
            return String::new();
        }
        let mut lines = vec!["Recent conversations from other workspace members:\n".to_string()];
        for turn in turns {
            let date = turn.ts.format("%Y-%m-%d");
            let content: String = turn.content.chars().take(500).collect();
            match turn.role {
                Role::User => {
                    let label = turn
                        .user_id
                        .and_then(|id| user_names.get(&id).cloned())
                        .or_else(|| turn.user_id.map(|id| format!("User {id}")))
                        .unwrap_or_else(|| "User".to_string());
                    lines.push(format!("[{date}] {label}: {content}"));
                }
                Role::Assistant => lines.push(format!("[{date}] Nimbus: {content}")),
            }
        }
        lines.push("\n---".to_string());
        lines.push("Please provide a concise summary of what others discussed recently.".to_string());
        lines.join("\n")
    }

    // ─── Last-document slot ─────────────────────────────────────────

    /// Overwrite the single last-document slot.
    pub async fn save_last_document(&self, filename: &str, text: &str, user_id: i64) -> bool {
        let record = LastDocument {
            filename: filename.to_string(),
            text: text.to_string(),
            user_id,
            ts: Utc::now(),
        };
        match self.try_save_last_document(&record).await {
            Ok(()) => true,
            Err(e) => {
                warn!("failed to save last document: {e}");
                false
            }
        }
    }

    async fn try_save_last_document(&self, record: &LastDocument) -> Result<()> {
        let path = self.file_path(LAST_DOCUMENT_FILE)?;
        let content = serde_json::to_string(record)?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Read the last-document slot. With a `user_id` filter, a record owned
    /// by someone else reads as absent.
    pub async fn get_last_document(&self, user_id: Option<i64>) -> Option<LastDocument> {
        let path = self.file_path(LAST_DOCUMENT_FILE).ok()?;
        let content = fs::read_to_string(&path).await.ok()?;
        let record: LastDocument = match serde_json::from_str(&content) {
            Ok(record) => record,
            Err(e) => {
                debug!("unreadable last-document slot: {e}");
                return None;
            }
        };
        if let Some(user_id) = user_id {
            if record.user_id != user_id {
                return None;
            }
        }
        Some(record)
    }
}
