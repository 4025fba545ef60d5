//! Configuration loading
//!
//! Reads `nimbus.toml` (or the file named by `NIMBUS_CONFIG` / `--config`).
//! A missing or unparseable config file stops startup; every section other
//! than the API credentials has working defaults.

use crate::{NimbusError, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

/// Top-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub workspaces: WorkspacesConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub digest: DigestConfig,
}

/// LLM API credentials and defaults
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// API key; `ANTHROPIC_API_KEY` in the environment takes precedence
    pub key: String,

    /// Default model for workspaces without an override
    pub model: String,

    /// Default completion budget per request
    pub max_tokens: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            key: String::new(),
            model: default_model(),
            max_tokens: default_max_tokens(),
        }
    }
}

/// Workspace root and per-workspace settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkspacesConfig {
    /// Root directory holding one subdirectory per workspace.
    /// Defaults to `~/.nimbus/workspaces`.
    pub root: Option<PathBuf>,

    /// Workspace used when an event resolves to nothing more specific
    pub default: String,

    /// How many recent turns a prompt includes by default
    pub history_limit: usize,

    /// Per-workspace entries keyed by workspace name
    pub configs: HashMap<String, WorkspaceSettings>,
}

impl Default for WorkspacesConfig {
    fn default() -> Self {
        Self {
            root: None,
            default: "main".to_string(),
            history_limit: 20,
            configs: HashMap::new(),
        }
    }
}

/// Settings for a single workspace
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WorkspaceSettings {
    pub mode: WorkspaceMode,

    /// Users allowed into a `shared` workspace
    pub authorized_users: Vec<i64>,

    /// Chat id of the bound group conversation (`group` mode only)
    pub group_id: Option<i64>,

    /// When to respond in a group conversation
    pub listen: ListenPolicy,

    /// Model override for this workspace
    pub model: Option<String>,
}

/// How a workspace is shared
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceMode {
    /// One owner, private conversation
    #[default]
    Single,
    /// Several authorized users, each with an independent history log
    Shared,
    /// Bound to one external group conversation
    Group,
}

/// Listen policy for group-mode workspaces
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenPolicy {
    #[default]
    All,
    Mentions,
}

/// Heartbeat and compaction scheduling
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    pub interval_minutes: u64,
    pub compact_enabled: bool,
    /// 5-field cron expression for the nightly compaction pass
    pub compact_cron: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: 30,
            compact_enabled: false,
            compact_cron: "0 3 * * *".to_string(),
        }
    }
}

/// Daily digest settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DigestConfig {
    pub enabled: bool,
    /// Delivery time as `HH:MM` (UTC)
    pub time: String,
    /// Location for the weather block; empty disables it
    pub location: String,
    pub weather_api_key: String,
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            time: "08:00".to_string(),
            location: String::new(),
            weather_api_key: String::new(),
        }
    }
}

impl Config {
    /// Load configuration from disk.
    ///
    /// Resolution order: explicit `path`, the `NIMBUS_CONFIG` environment
    /// variable, then `nimbus.toml` in the working directory.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match std::env::var("NIMBUS_CONFIG") {
                Ok(p) if !p.trim().is_empty() => PathBuf::from(p),
                _ => PathBuf::from("nimbus.toml"),
            },
        };

        if !path.exists() {
            return Err(NimbusError::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }

        let content = std::fs::read_to_string(&path)?;
        let mut config = Self::parse(&content)?;

        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            if !key.trim().is_empty() {
                config.api.key = key;
            }
        }

        if config.api.key.trim().is_empty() {
            return Err(NimbusError::Config(
                "no API key configured: set [api].key or ANTHROPIC_API_KEY".to_string(),
            ));
        }

        Ok(config)
    }

    /// Parse a config document without touching the filesystem or env.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| NimbusError::Config(e.to_string()))
    }

    /// Root directory for workspace storage.
    pub fn workspace_root(&self) -> PathBuf {
        self.workspaces.root.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".nimbus")
                .join("workspaces")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_for_absent_sections() {
        let config = Config::parse("[api]\nkey = \"sk-test\"\n").unwrap();
        assert_eq!(config.api.model, "claude-sonnet-4-20250514");
        assert_eq!(config.api.max_tokens, 4096);
        assert_eq!(config.workspaces.default, "main");
        assert_eq!(config.workspaces.history_limit, 20);
        assert!(!config.heartbeat.enabled);
        assert_eq!(config.heartbeat.compact_cron, "0 3 * * *");
        assert_eq!(config.digest.time, "08:00");
    }

    #[test]
    fn test_workspace_entries_parsed() {
        let doc = r#"
[api]
key = "sk-test"

[workspaces]
default = "home"
history_limit = 40

[workspaces.configs.family]
mode = "shared"
authorized_users = [100, 200]

[workspaces.configs.standup]
mode = "group"
group_id = -42
listen = "mentions"
model = "claude-3-5-haiku-20241022"
"#;
        let config = Config::parse(doc).unwrap();
        assert_eq!(config.workspaces.default, "home");
        assert_eq!(config.workspaces.history_limit, 40);

        let family = &config.workspaces.configs["family"];
        assert_eq!(family.mode, WorkspaceMode::Shared);
        assert_eq!(family.authorized_users, vec![100, 200]);
        assert_eq!(family.listen, ListenPolicy::All);

        let standup = &config.workspaces.configs["standup"];
        assert_eq!(standup.mode, WorkspaceMode::Group);
        assert_eq!(standup.group_id, Some(-42));
        assert_eq!(standup.listen, ListenPolicy::Mentions);
        assert_eq!(standup.model.as_deref(), Some("claude-3-5-haiku-20241022"));
    }

    #[test]
    fn test_invalid_toml_rejected() {
        assert!(Config::parse("not = [valid").is_err());
    }
}
