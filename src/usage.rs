//! Token usage and cost accounting
//!
//! Aggregate counters plus a per-model breakdown, persisted as one JSON
//! snapshot after every recorded exchange. The aggregate totals always
//! equal the sum of the per-model entries; costs are recomputed from the
//! price table on demand rather than cached.

use crate::llm::UsageSink;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

const USAGE_FILE: &str = "usage.json";

/// Price per million tokens, (input, output), as of early 2025.
const MODEL_PRICING: &[(&str, f64, f64)] = &[
    ("claude-sonnet-4-20250514", 3.0, 15.0),
    ("claude-opus-4-20250514", 15.0, 75.0),
    ("claude-3-5-sonnet-20241022", 3.0, 15.0),
    ("claude-3-5-haiku-20241022", 1.0, 5.0),
];

/// Fallback tier for models missing from the table.
const DEFAULT_PRICING: (f64, f64) = (3.0, 15.0);

/// Counters for a single model
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub requests: u64,
}

/// Aggregate usage statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageStats {
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_requests: u64,
    #[serde(default)]
    pub by_model: HashMap<String, ModelUsage>,
    pub first_request: Option<DateTime<Utc>>,
    pub last_request: Option<DateTime<Utc>>,
}

/// Per-workspace usage ledger persisted to `usage.json`.
pub struct UsageLedger {
    path: PathBuf,
    stats: Mutex<UsageStats>,
}

impl UsageLedger {
    /// Open the ledger, loading the existing snapshot if one exists.
    pub async fn open(workspace_dir: &Path) -> Result<Self> {
        fs::create_dir_all(workspace_dir).await?;
        let path = workspace_dir.join(USAGE_FILE);
        let stats = match fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("unreadable usage snapshot, starting from zero: {e}");
                UsageStats::default()
            }),
            Err(_) => UsageStats::default(),
        };
        Ok(Self {
            path,
            stats: Mutex::new(stats),
        })
    }

    /// Record one completed exchange and persist the snapshot. The whole
    /// read-modify-write-persist runs under the lock so concurrent calls
    /// serialize instead of clobbering each other.
    pub async fn record(&self, model: &str, input_tokens: u64, output_tokens: u64) {
        let mut stats = self.stats.lock().await;
        let now = Utc::now();

        stats.total_input_tokens += input_tokens;
        stats.total_output_tokens += output_tokens;
        stats.total_requests += 1;
        stats.first_request.get_or_insert(now);
        stats.last_request = Some(now);

        let entry = stats.by_model.entry(model.to_string()).or_default();
        entry.input_tokens += input_tokens;
        entry.output_tokens += output_tokens;
        entry.requests += 1;

        if let Err(e) = self.persist(&stats).await {
            warn!("failed to persist usage snapshot: {e}");
        }
    }

    /// Cost of a single exchange per the static price table.
    pub fn cost(model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        let (input_price, output_price) = MODEL_PRICING
            .iter()
            .find(|(name, _, _)| *name == model)
            .map(|(_, input, output)| (*input, *output))
            .unwrap_or(DEFAULT_PRICING);
        (input_tokens as f64 / 1_000_000.0) * input_price
            + (output_tokens as f64 / 1_000_000.0) * output_price
    }

    /// Total estimated cost across the recorded breakdown.
    pub async fn total_cost(&self) -> f64 {
        let stats = self.stats.lock().await;
        stats
            .by_model
            .iter()
            .map(|(model, usage)| Self::cost(model, usage.input_tokens, usage.output_tokens))
            .sum()
    }

    pub async fn stats(&self) -> UsageStats {
        self.stats.lock().await.clone()
    }

    /// Zero all counters and persist immediately.
    pub async fn reset(&self) {
        let mut stats = self.stats.lock().await;
        *stats = UsageStats::default();
        if let Err(e) = self.persist(&stats).await {
            warn!("failed to persist usage snapshot after reset: {e}");
        }
    }

    /// Render the ledger for a status display.
    pub async fn format_stats(&self) -> String {
        let stats = self.stats.lock().await.clone();
        if stats.total_requests == 0 {
            return "**Usage statistics**\n\nNo usage recorded yet.".to_string();
        }

        let total_tokens = stats.total_input_tokens + stats.total_output_tokens;
        let mut lines = vec![
            "**Usage statistics**".to_string(),
            String::new(),
            format!("Total requests: {}", stats.total_requests),
            format!(
                "Total tokens: {total_tokens} (input {}, output {})",
                stats.total_input_tokens, stats.total_output_tokens
            ),
            format!("Estimated cost: ${:.4}", {
                stats
                    .by_model
                    .iter()
                    .map(|(m, u)| Self::cost(m, u.input_tokens, u.output_tokens))
                    .sum::<f64>()
            }),
        ];

        if !stats.by_model.is_empty() {
            lines.push(String::new());
            lines.push("By model:".to_string());
            let mut models: Vec<_> = stats.by_model.iter().collect();
            models.sort_by(|a, b| a.0.cmp(b.0));
            for (model, usage) in models {
                let cost = Self::cost(model, usage.input_tokens, usage.output_tokens);
                lines.push(format!(
                    "  - {model}: {} request(s), {} tokens, ${cost:.4}",
                    usage.requests,
                    usage.input_tokens + usage.output_tokens
                ));
            }
        }

        if let (Some(first), Some(last)) = (stats.first_request, stats.last_request) {
            lines.push(String::new());
            lines.push(format!(
                "Period: {} to {}",
                first.format("%Y-%m-%d"),
                last.format("%Y-%m-%d")
            ));
        }

        lines.join("\n")
    }

    async fn persist(&self, stats: &UsageStats) -> Result<()> {
        let content = serde_json::to_string_pretty(stats)?;
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

#[async_trait]
impl UsageSink for UsageLedger {
    async fn record(&self, model: &str, input_tokens: u64, output_tokens: u64) {
        UsageLedger::record(self, model, input_tokens, output_tokens).await;
    }
}
