//! One-shot reminders, durable across restarts
//!
//! Each reminder is parsed from a natural-language time expression,
//! persisted to `reminders.json` in the workspace directory, and armed as a
//! one-shot timer against the process scheduler. A reminder fires at most
//! once: delivery failure still removes the record, and a record already
//! gone at fire time makes the timer a no-op. On startup the persisted set
//! is reconciled — anything past due is dropped without firing, the rest is
//! re-armed — before any new reminder can be created.

pub mod timeparse;

use crate::delivery::Delivery;
use crate::scheduler::Scheduler;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const REMINDERS_FILE: &str = "reminders.json";

/// A scheduled one-shot notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reminder {
    pub id: String,
    pub user_id: i64,
    pub chat_id: i64,
    pub message: String,
    pub trigger_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub workspace: String,
}

/// Durable reminder set bound to the process scheduler.
pub struct ReminderStore {
    path: PathBuf,
    scheduler: Arc<Scheduler>,
    delivery: Arc<dyn Delivery>,
    reminders: Mutex<HashMap<String, Reminder>>,
    /// Handle to ourselves for timer callbacks; set at construction.
    self_handle: Weak<Self>,
}

impl ReminderStore {
    /// Load the persisted set, drop anything whose trigger time has already
    /// passed, persist the pruned set, and re-arm the remainder.
    pub async fn open(
        workspace_dir: &Path,
        scheduler: Arc<Scheduler>,
        delivery: Arc<dyn Delivery>,
    ) -> Result<Arc<Self>> {
        fs::create_dir_all(workspace_dir).await?;
        let path = workspace_dir.join(REMINDERS_FILE);

        let mut loaded: Vec<Reminder> = match fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("unreadable reminder file, starting empty: {e}");
                Vec::new()
            }),
            Err(_) => Vec::new(),
        };

        let now = Utc::now();
        let before = loaded.len();
        loaded.retain(|r| r.trigger_time > now);
        let expired = before - loaded.len();
        if expired > 0 {
            info!("dropped {expired} expired reminder(s) at startup");
        }

        let store = Arc::new_cyclic(|weak| Self {
            path,
            scheduler,
            delivery,
            reminders: Mutex::new(loaded.iter().map(|r| (r.id.clone(), r.clone())).collect()),
            self_handle: weak.clone(),
        });
        store.save().await?;

        for reminder in &loaded {
            store.arm(reminder);
        }
        if !loaded.is_empty() {
            info!("re-armed {} pending reminder(s)", loaded.len());
        }

        Ok(store)
    }

    /// Create a reminder from a natural-language time expression.
    ///
    /// Returns `None` when the expression does not parse or resolves to a
    /// time that is not in the future; the persisted set is untouched in
    /// that case.
    pub async fn create(
        &self,
        user_id: i64,
        chat_id: i64,
        time_text: &str,
        message: &str,
        workspace: &str,
    ) -> Option<Reminder> {
        let trigger_time = match timeparse::parse_future(time_text, Utc::now()) {
            Some(t) => t,
            None => {
                debug!("rejected reminder time expression: {time_text:?}");
                return None;
            }
        };

        let id: String = Uuid::new_v4().simple().to_string()[..8].to_string();
        let reminder = Reminder {
            id: id.clone(),
            user_id,
            chat_id,
            message: message.to_string(),
            trigger_time,
            created_at: Utc::now(),
            workspace: workspace.to_string(),
        };

        self.reminders
            .lock()
            .await
            .insert(id.clone(), reminder.clone());
        if let Err(e) = self.save().await {
            error!("failed to persist reminder {id}: {e}");
        }
        self.arm(&reminder);

        info!("reminder {id} scheduled for {trigger_time}");
        Some(reminder)
    }

    /// Pending reminders, optionally filtered, soonest first. Anything
    /// already past due is excluded.
    pub async fn list(&self, user_id: Option<i64>, workspace: Option<&str>) -> Vec<Reminder> {
        let now = Utc::now();
        let mut pending: Vec<Reminder> = self
            .reminders
            .lock()
            .await
            .values()
            .filter(|r| user_id.map_or(true, |u| r.user_id == u))
            .filter(|r| workspace.map_or(true, |w| r.workspace == w))
            .filter(|r| r.trigger_time > now)
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.trigger_time);
        pending
    }

    /// Cancel a pending reminder. Unknown ids return false.
    pub async fn cancel(&self, id: &str) -> bool {
        if self.reminders.lock().await.remove(id).is_none() {
            return false;
        }
        // Scheduler entry may already be gone; absence is not an error.
        self.scheduler.cancel(&job_id(id));
        if let Err(e) = self.save().await {
            error!("failed to persist reminder set after cancelling {id}: {e}");
        }
        true
    }

    /// Timer entry point. Looks up the reminder (no-op when already gone,
    /// which makes a cancel/fire race safe), delivers best-effort, and
    /// removes the record regardless of delivery outcome.
    pub async fn fire(&self, id: &str) {
        let reminder = self.reminders.lock().await.get(id).cloned();
        let Some(reminder) = reminder else {
            debug!("reminder {id} already gone at fire time");
            return;
        };

        let text = format!("**Reminder**\n\n{}", reminder.message);
        if let Err(e) = self.delivery.send(reminder.chat_id, &text).await {
            error!("failed to deliver reminder {id}: {e}");
        }

        self.reminders.lock().await.remove(id);
        if let Err(e) = self.save().await {
            error!("failed to persist reminder set after firing {id}: {e}");
        }
    }

    fn arm(&self, reminder: &Reminder) {
        let weak = self.self_handle.clone();
        let id = reminder.id.clone();
        self.scheduler
            .schedule_at(&job_id(&reminder.id), reminder.trigger_time, async move {
                // A dropped store means shutdown; nothing to fire.
                if let Some(store) = weak.upgrade() {
                    store.fire(&id).await;
                }
            });
    }

    /// Rewrite the whole set as one JSON array snapshot. Write volume is
    /// low enough that this beats an incremental journal.
    async fn save(&self) -> Result<()> {
        let snapshot: Vec<Reminder> = {
            let guard = self.reminders.lock().await;
            let mut all: Vec<Reminder> = guard.values().cloned().collect();
            all.sort_by_key(|r| r.trigger_time);
            all
        };
        let content = serde_json::to_string_pretty(&snapshot)?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

fn job_id(id: &str) -> String {
    format!("reminder_{id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NimbusError;
    use async_trait::async_trait;
    use chrono::Duration;
    use tempfile::TempDir;

    /// Delivery double that records sends and can fail on demand.
    struct RecordingDelivery {
        sent: Mutex<Vec<(i64, String)>>,
        fail_for: Option<i64>,
    }

    impl RecordingDelivery {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                fail_for: None,
            })
        }

        fn failing_for(chat_id: i64) -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                fail_for: Some(chat_id),
            })
        }

        async fn sent(&self) -> Vec<(i64, String)> {
            self.sent.lock().await.clone()
        }
    }

    #[async_trait]
    impl Delivery for RecordingDelivery {
        async fn send(&self, chat_id: i64, text: &str) -> crate::Result<()> {
            if self.fail_for == Some(chat_id) {
                return Err(NimbusError::Delivery(format!("chat {chat_id} unreachable")));
            }
            self.sent.lock().await.push((chat_id, text.to_string()));
            Ok(())
        }
    }

    async fn open_store(
        dir: &TempDir,
        delivery: Arc<RecordingDelivery>,
    ) -> Arc<ReminderStore> {
        ReminderStore::open(dir.path(), Arc::new(Scheduler::new()), delivery)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_and_list() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, RecordingDelivery::new()).await;

        let reminder = store
            .create(1, 10, "in 2 hours", "Test", "main")
            .await
            .unwrap();
        assert_eq!(reminder.id.len(), 8);
        let window_low = Utc::now() + Duration::minutes(119);
        let window_high = Utc::now() + Duration::minutes(121);
        assert!(reminder.trigger_time > window_low && reminder.trigger_time < window_high);

        let listed = store.list(None, None).await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].message, "Test");
    }

    #[tokio::test]
    async fn test_past_expression_rejected_set_unchanged() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, RecordingDelivery::new()).await;
        store.create(1, 10, "in 1 hour", "keep me", "main").await.unwrap();
        let persisted_before = tokio::fs::read_to_string(dir.path().join("reminders.json"))
            .await
            .unwrap();

        assert!(store.create(1, 10, "yesterday", "nope", "main").await.is_none());
        assert!(store.create(1, 10, "gibberish", "nope", "main").await.is_none());

        let persisted_after = tokio::fs::read_to_string(dir.path().join("reminders.json"))
            .await
            .unwrap();
        assert_eq!(persisted_before, persisted_after);
        assert_eq!(store.list(None, None).await.len(), 1);
    }

    #[tokio::test]
    async fn test_list_filters() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, RecordingDelivery::new()).await;
        store.create(1, 10, "in 1 hour", "a", "main").await.unwrap();
        store.create(2, 10, "in 2 hours", "b", "main").await.unwrap();
        store.create(1, 10, "in 3 hours", "c", "work").await.unwrap();

        assert_eq!(store.list(Some(1), None).await.len(), 2);
        assert_eq!(store.list(None, Some("work")).await.len(), 1);
        assert_eq!(store.list(Some(2), Some("work")).await.len(), 0);

        // Soonest first.
        let all = store.list(None, None).await;
        let messages: Vec<&str> = all.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_fire_delivers_and_removes() {
        let dir = TempDir::new().unwrap();
        let delivery = RecordingDelivery::new();
        let store = open_store(&dir, Arc::clone(&delivery)).await;

        let reminder = store
            .create(1, 42, "in 2 hours", "Test", "main")
            .await
            .unwrap();
        store.fire(&reminder.id).await;

        let sent = delivery.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 42);
        assert!(sent[0].1.contains("Test"));
        assert!(store.list(None, None).await.is_empty());

        // Firing again is a no-op.
        store.fire(&reminder.id).await;
        assert_eq!(delivery.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn test_delivery_failure_still_removes() {
        let dir = TempDir::new().unwrap();
        let delivery = RecordingDelivery::failing_for(42);
        let store = open_store(&dir, Arc::clone(&delivery)).await;

        let reminder = store
            .create(1, 42, "in 1 hour", "doomed", "main")
            .await
            .unwrap();
        store.fire(&reminder.id).await;

        assert!(delivery.sent().await.is_empty());
        assert!(store.list(None, None).await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, RecordingDelivery::new()).await;
        let reminder = store
            .create(1, 10, "in 1 hour", "to cancel", "main")
            .await
            .unwrap();

        assert!(store.cancel(&reminder.id).await);
        assert!(store.list(None, None).await.is_empty());
        assert!(!store.cancel(&reminder.id).await);
        assert!(!store.cancel("unknown1").await);
    }

    #[tokio::test]
    async fn test_restart_durability() {
        let dir = TempDir::new().unwrap();
        let first = open_store(&dir, RecordingDelivery::new()).await;
        let created = first
            .create(1, 10, "in 2 hours", "survive me", "main")
            .await
            .unwrap();
        drop(first);

        let second = open_store(&dir, RecordingDelivery::new()).await;
        let listed = second.list(None, None).await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, created.id);
        assert_eq!(listed[0].message, "survive me");
        assert_eq!(listed[0].trigger_time, created.trigger_time);
    }

    #[tokio::test]
    async fn test_startup_reconciliation_drops_expired() {
        let dir = TempDir::new().unwrap();
        let past = Reminder {
            id: "expired1".to_string(),
            user_id: 1,
            chat_id: 10,
            message: "too late".to_string(),
            trigger_time: Utc::now() - Duration::hours(1),
            created_at: Utc::now() - Duration::hours(2),
            workspace: "main".to_string(),
        };
        let future = Reminder {
            id: "pending1".to_string(),
            trigger_time: Utc::now() + Duration::hours(1),
            message: "still on".to_string(),
            ..past.clone()
        };
        tokio::fs::write(
            dir.path().join("reminders.json"),
            serde_json::to_string(&vec![&past, &future]).unwrap(),
        )
        .await
        .unwrap();

        let delivery = RecordingDelivery::new();
        let store = open_store(&dir, Arc::clone(&delivery)).await;

        let listed = store.list(None, None).await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "pending1");
        // Expired entry was dropped without delivery...
        assert!(delivery.sent().await.is_empty());
        // ...and the pruned set was re-persisted immediately.
        let persisted = tokio::fs::read_to_string(dir.path().join("reminders.json"))
            .await
            .unwrap();
        assert!(persisted.contains("pending1"));
        assert!(!persisted.contains("expired1"));
    }

    #[tokio::test]
    async fn test_corrupt_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("reminders.json"), "{not json")
            .await
            .unwrap();
        let store = open_store(&dir, RecordingDelivery::new()).await;
        assert!(store.list(None, None).await.is_empty());
    }

    #[tokio::test]
    async fn test_armed_timer_fires_end_to_end() {
        let dir = TempDir::new().unwrap();
        let delivery = RecordingDelivery::new();
        let scheduler = Arc::new(Scheduler::new());
        let store = ReminderStore::open(dir.path(), scheduler, delivery.clone())
            .await
            .unwrap();

        // Inject a near-future reminder directly and arm it the way the
        // startup path does.
        let soon = Reminder {
            id: "quick1".to_string(),
            user_id: 1,
            chat_id: 7,
            message: "now-ish".to_string(),
            trigger_time: Utc::now() + Duration::milliseconds(40),
            created_at: Utc::now(),
            workspace: "main".to_string(),
        };
        store
            .reminders
            .lock()
            .await
            .insert(soon.id.clone(), soon.clone());
        store.arm(&soon);

        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        let sent = delivery.sent().await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("now-ish"));
        assert!(store.list(None, None).await.is_empty());
    }
}
