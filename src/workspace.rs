//! Workspace resolution and context assembly
//!
//! A workspace is a named directory under the workspace root holding the
//! note log, history logs, and settings files for one isolated context.
//! The manager answers who may use a workspace, which model it runs, and
//! builds the LLM system prompt from its on-disk context files. Names
//! starting with `_` are reserved (`_global` holds shared identity files).

use crate::config::{ListenPolicy, WorkspaceMode, WorkspaceSettings};
use crate::memory::MemoryStore;
use crate::{NimbusError, Result};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use tokio::fs;

const GLOBAL_DIR: &str = "_global";
const FALLBACK_PERSONA: &str = "You are Nimbus, a helpful personal assistant.";

/// Resolves workspace identity, authorization, and per-workspace settings.
pub struct WorkspaceManager {
    base_path: PathBuf,
    current: String,
    history_limit: usize,
    configs: HashMap<String, WorkspaceSettings>,
    group_index: HashMap<i64, String>,
}

/// Summary of one workspace for status displays.
#[derive(Debug, Clone)]
pub struct WorkspaceInfo {
    pub name: String,
    pub mode: WorkspaceMode,
    pub model: Option<String>,
    pub has_soul: bool,
    pub has_memory: bool,
    pub has_tools: bool,
    pub has_heartbeat: bool,
}

impl WorkspaceManager {
    /// Create a manager rooted at `base_path`.
    ///
    /// Materializes the default workspace and `_global` directories; failure
    /// to do so is unrecoverable and surfaces as an error.
    pub async fn new(
        base_path: PathBuf,
        default_workspace: &str,
        history_limit: usize,
        configs: HashMap<String, WorkspaceSettings>,
    ) -> Result<Self> {
        let group_index = configs
            .iter()
            .filter(|(_, settings)| settings.mode == WorkspaceMode::Group)
            .filter_map(|(name, settings)| settings.group_id.map(|id| (id, name.clone())))
            .collect();

        let manager = Self {
            base_path,
            current: default_workspace.to_string(),
            history_limit,
            configs,
            group_index,
        };

        fs::create_dir_all(manager.safe_path(default_workspace)?).await?;
        fs::create_dir_all(manager.base_path.join(GLOBAL_DIR)).await?;

        Ok(manager)
    }

    /// Resolve a relative path and verify it stays inside the workspace root.
    ///
    /// Purely lexical so it also covers files that do not exist yet; any
    /// absolute path, parent component, or prefix is rejected.
    pub fn safe_path(&self, relative: &str) -> Result<PathBuf> {
        let rel = Path::new(relative);
        let mut resolved = self.base_path.clone();
        for component in rel.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(NimbusError::Workspace(format!(
                        "path escapes workspace root: {relative}"
                    )))
                }
            }
        }
        if resolved == self.base_path {
            return Err(NimbusError::Workspace(format!(
                "empty workspace path: {relative}"
            )));
        }
        Ok(resolved)
    }

    async fn read_file_safe(&self, relative: &str) -> Option<String> {
        let path = self.safe_path(relative).ok()?;
        fs::read_to_string(&path).await.ok()
    }

    fn settings(&self, workspace: &str) -> WorkspaceSettings {
        self.configs.get(workspace).cloned().unwrap_or_default()
    }

    // ─── Mode & authorization ───────────────────────────────────────

    pub fn mode(&self, workspace: &str) -> WorkspaceMode {
        self.settings(workspace).mode
    }

    /// Model override for a workspace, if configured.
    ///
    /// The caller derives a per-request client from this; the shared client
    /// is never mutated.
    pub fn model_for(&self, workspace: &str) -> Option<String> {
        self.settings(workspace).model
    }

    pub fn listen_policy(&self, workspace: &str) -> ListenPolicy {
        self.settings(workspace).listen
    }

    pub fn is_user_authorized(&self, workspace: &str, user_id: i64) -> bool {
        let settings = self.settings(workspace);
        match settings.mode {
            WorkspaceMode::Single | WorkspaceMode::Group => true,
            WorkspaceMode::Shared => settings.authorized_users.contains(&user_id),
        }
    }

    /// Authorized user set of a shared workspace; empty for other modes.
    pub fn authorized_users(&self, workspace: &str) -> Vec<i64> {
        let settings = self.settings(workspace);
        match settings.mode {
            WorkspaceMode::Shared => settings.authorized_users,
            _ => Vec::new(),
        }
    }

    /// Workspace bound to an external group conversation, if any.
    pub fn workspace_for_group(&self, group_id: i64) -> Option<&str> {
        self.group_index.get(&group_id).map(String::as_str)
    }

    /// Workspaces a user may enter directly (single-user plus shared ones
    /// that list them; group workspaces are entered via the group itself).
    pub async fn authorized_workspaces(&self, user_id: i64) -> Vec<String> {
        let mut authorized = Vec::new();
        for name in self.list_workspaces().await {
            match self.settings(&name).mode {
                WorkspaceMode::Single => authorized.push(name),
                WorkspaceMode::Shared => {
                    if self.settings(&name).authorized_users.contains(&user_id) {
                        authorized.push(name);
                    }
                }
                WorkspaceMode::Group => {}
            }
        }
        authorized
    }

    // ─── Workspace lifecycle ────────────────────────────────────────

    pub fn current(&self) -> &str {
        &self.current
    }

    /// List workspace directories, excluding reserved `_`-prefixed names.
    pub async fn list_workspaces(&self) -> Vec<String> {
        let mut names = Vec::new();
        let Ok(mut entries) = fs::read_dir(&self.base_path).await else {
            return names;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('_') {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        names
    }

    pub async fn workspace_exists(&self, name: &str) -> bool {
        if name.starts_with('_') {
            return false;
        }
        let Ok(path) = self.safe_path(name) else {
            return false;
        };
        fs::metadata(&path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    /// Switch the active workspace; fails for unknown or reserved names.
    pub async fn switch(&mut self, name: &str) -> bool {
        if self.workspace_exists(name).await {
            self.current = name.to_string();
            true
        } else {
            false
        }
    }

    /// Memory store for a workspace, materializing its directory lazily.
    pub async fn store(&self, workspace: &str) -> Result<MemoryStore> {
        if workspace.starts_with('_') {
            return Err(NimbusError::Workspace(format!(
                "reserved workspace name: {workspace}"
            )));
        }
        let dir = self.safe_path(workspace)?;
        MemoryStore::open(dir, self.history_limit).await
    }

    pub async fn workspace_info(&self, name: Option<&str>) -> WorkspaceInfo {
        let ws = name.unwrap_or(&self.current).to_string();
        let settings = self.settings(&ws);
        WorkspaceInfo {
            mode: settings.mode,
            model: settings.model,
            has_soul: self.read_file_safe(&format!("{ws}/SOUL.md")).await.is_some(),
            has_memory: self
                .read_file_safe(&format!("{ws}/MEMORY.md"))
                .await
                .is_some(),
            has_tools: self
                .read_file_safe(&format!("{ws}/TOOLS.md"))
                .await
                .is_some(),
            has_heartbeat: self
                .read_file_safe(&format!("{ws}/HEARTBEAT.md"))
                .await
                .is_some(),
            name: ws,
        }
    }

    // ─── Prompt assembly ────────────────────────────────────────────

    /// Build the LLM system prompt for the current workspace from the
    /// global identity files plus the workspace's own context files.
    pub async fn load_context(&self) -> String {
        let ws = self.current.clone();
        let mut parts = Vec::new();

        if let Some(identity) = self.read_file_safe("_global/IDENTITY.md").await {
            parts.push(format!("# Identity\n\n{identity}"));
        }
        if let Some(user) = self.read_file_safe("_global/USER.md").await {
            parts.push(format!("# About the User\n\n{user}"));
        }
        if let Some(soul) = self.read_file_safe(&format!("{ws}/SOUL.md")).await {
            parts.push(format!("# Workspace Context: {ws}\n\n{soul}"));
        }
        if let Some(memory) = self.read_file_safe(&format!("{ws}/MEMORY.md")).await {
            parts.push(format!("# Memory\n\n{memory}"));
        }
        if let Some(tools) = self.read_file_safe(&format!("{ws}/TOOLS.md")).await {
            parts.push(format!("# Tools & References\n\n{tools}"));
        }

        if parts.is_empty() {
            return FALLBACK_PERSONA.to_string();
        }
        parts.join("\n\n---\n\n")
    }

    /// Heartbeat checklist of the current workspace, if one exists.
    pub async fn load_heartbeat_prompt(&self) -> Option<String> {
        let ws = self.current.clone();
        self.read_file_safe(&format!("{ws}/HEARTBEAT.md")).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn manager_with(configs: HashMap<String, WorkspaceSettings>) -> (TempDir, WorkspaceManager) {
        let dir = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(dir.path().to_path_buf(), "main", 20, configs)
            .await
            .unwrap();
        (dir, manager)
    }

    fn shared(users: Vec<i64>) -> WorkspaceSettings {
        WorkspaceSettings {
            mode: WorkspaceMode::Shared,
            authorized_users: users,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_creates_default_and_global_dirs() {
        let (dir, _manager) = manager_with(HashMap::new()).await;
        assert!(dir.path().join("main").is_dir());
        assert!(dir.path().join("_global").is_dir());
    }

    #[tokio::test]
    async fn test_safe_path_rejects_traversal() {
        let (_dir, manager) = manager_with(HashMap::new()).await;
        assert!(manager.safe_path("../../etc/passwd").is_err());
        assert!(manager.safe_path("/etc/passwd").is_err());
        assert!(manager.safe_path("main/../../outside").is_err());
        assert!(manager.safe_path("main/MEMORY.md").is_ok());
    }

    #[tokio::test]
    async fn test_reserved_prefix_hidden() {
        let (_dir, manager) = manager_with(HashMap::new()).await;
        let names = manager.list_workspaces().await;
        assert_eq!(names, vec!["main".to_string()]);
        assert!(!manager.workspace_exists("_global").await);
        assert!(manager.store("_global").await.is_err());
    }

    #[tokio::test]
    async fn test_switch_requires_existing_workspace() {
        let (dir, mut manager) = manager_with(HashMap::new()).await;
        assert!(!manager.switch("side").await);
        tokio::fs::create_dir_all(dir.path().join("side"))
            .await
            .unwrap();
        assert!(manager.switch("side").await);
        assert_eq!(manager.current(), "side");
    }

    #[tokio::test]
    async fn test_shared_mode_authorization() {
        let mut configs = HashMap::new();
        configs.insert("family".to_string(), shared(vec![100, 200]));
        let (_dir, manager) = manager_with(configs).await;

        assert!(manager.is_user_authorized("family", 100));
        assert!(!manager.is_user_authorized("family", 999));
        assert_eq!(manager.authorized_users("family"), vec![100, 200]);
        // Single-mode workspaces admit anyone and expose no user set.
        assert!(manager.is_user_authorized("main", 999));
        assert!(manager.authorized_users("main").is_empty());
    }

    #[tokio::test]
    async fn test_group_reverse_lookup() {
        let mut configs = HashMap::new();
        configs.insert(
            "standup".to_string(),
            WorkspaceSettings {
                mode: WorkspaceMode::Group,
                group_id: Some(-42),
                ..Default::default()
            },
        );
        let (_dir, manager) = manager_with(configs).await;
        assert_eq!(manager.workspace_for_group(-42), Some("standup"));
        assert_eq!(manager.workspace_for_group(7), None);
        assert_eq!(manager.mode("standup"), WorkspaceMode::Group);
        assert_eq!(manager.listen_policy("standup"), ListenPolicy::All);
        assert_eq!(manager.mode("unconfigured"), WorkspaceMode::Single);
    }

    #[tokio::test]
    async fn test_authorized_workspaces_by_mode() {
        let mut configs = HashMap::new();
        configs.insert("family".to_string(), shared(vec![100]));
        let (dir, manager) = manager_with(configs).await;
        tokio::fs::create_dir_all(dir.path().join("family"))
            .await
            .unwrap();

        let for_member = manager.authorized_workspaces(100).await;
        assert!(for_member.contains(&"family".to_string()));
        assert!(for_member.contains(&"main".to_string()));

        let for_outsider = manager.authorized_workspaces(999).await;
        assert!(!for_outsider.contains(&"family".to_string()));
        assert!(for_outsider.contains(&"main".to_string()));
    }

    #[tokio::test]
    async fn test_context_fallback_when_no_files() {
        let (_dir, manager) = manager_with(HashMap::new()).await;
        assert_eq!(manager.load_context().await, FALLBACK_PERSONA);
    }

    #[tokio::test]
    async fn test_context_composition_order() {
        let (dir, manager) = manager_with(HashMap::new()).await;
        tokio::fs::write(dir.path().join("_global/IDENTITY.md"), "I am Nimbus.")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("main/SOUL.md"), "Be concise.")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("main/MEMORY.md"), "User likes tea.")
            .await
            .unwrap();

        let context = manager.load_context().await;
        let identity_pos = context.find("I am Nimbus.").unwrap();
        let soul_pos = context.find("Be concise.").unwrap();
        let memory_pos = context.find("User likes tea.").unwrap();
        assert!(identity_pos < soul_pos && soul_pos < memory_pos);
        assert!(context.contains("# Workspace Context: main"));
    }

    #[tokio::test]
    async fn test_heartbeat_prompt() {
        let (dir, manager) = manager_with(HashMap::new()).await;
        assert!(manager.load_heartbeat_prompt().await.is_none());
        tokio::fs::write(dir.path().join("main/HEARTBEAT.md"), "- check inbox")
            .await
            .unwrap();
        assert_eq!(
            manager.load_heartbeat_prompt().await.as_deref(),
            Some("- check inbox")
        );
    }

    #[tokio::test]
    async fn test_workspace_info() {
        let (dir, manager) = manager_with(HashMap::new()).await;
        tokio::fs::write(dir.path().join("main/SOUL.md"), "x")
            .await
            .unwrap();
        let info = manager.workspace_info(None).await;
        assert_eq!(info.name, "main");
        assert_eq!(info.mode, WorkspaceMode::Single);
        assert!(info.has_soul);
        assert!(!info.has_memory);
    }
}
