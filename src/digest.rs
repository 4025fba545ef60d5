//! Periodic digest composition and delivery
//!
//! Concatenates, in fixed order: a date header, an optional weather block,
//! the soonest pending reminders, and the most recent note section. Every
//! optional block degrades to absence on failure; an empty digest gets a
//! filler line instead. Delivery iterates the recipient set independently
//! so one unreachable chat never blocks the rest. The recipient set lives
//! for the process only — it is not persisted.

use crate::delivery::Delivery;
use crate::memory::MemoryStore;
use crate::reminders::ReminderStore;
use crate::{NimbusError, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

const MAX_DIGEST_REMINDERS: usize = 5;
const MEMORY_HIGHLIGHT_CHARS: usize = 200;
const REMINDER_PREVIEW_CHARS: usize = 40;
const FILLER_LINE: &str = "Nothing specific to report. Have a great day.";

/// Structured weather for the digest's optional block.
#[derive(Debug, Clone)]
pub struct WeatherReport {
    pub description: String,
    pub temperature_f: f64,
    pub feels_like_f: f64,
    pub humidity: u8,
}

/// Weather collaborator consumed by the digest.
#[async_trait]
pub trait WeatherProvider: Send + Sync {
    async fn fetch(&self, location: &str) -> Result<WeatherReport>;
}

// ─── OpenWeatherMap provider ────────────────────────────────────────

const WEATHER_API: &str = "https://api.openweathermap.org/data/2.5/weather";

#[derive(Debug, Deserialize)]
struct OwmResponse {
    main: OwmMain,
    weather: Vec<OwmCondition>,
}

#[derive(Debug, Deserialize)]
struct OwmMain {
    temp: f64,
    feels_like: f64,
    humidity: u8,
}

#[derive(Debug, Deserialize)]
struct OwmCondition {
    description: String,
}

/// OpenWeatherMap-backed weather provider (free tier, imperial units).
pub struct OpenWeather {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenWeather {
    pub fn new(api_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.to_string(),
            base_url: WEATHER_API.to_string(),
        }
    }
}

#[async_trait]
impl WeatherProvider for OpenWeather {
    async fn fetch(&self, location: &str) -> Result<WeatherReport> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("q", location),
                ("appid", self.api_key.as_str()),
                ("units", "imperial"),
            ])
            .send()
            .await
            .map_err(|e| NimbusError::Weather(e.to_string()))?;

        if !response.status().is_success() {
            return Err(NimbusError::Weather(format!(
                "weather API returned {}",
                response.status()
            )));
        }

        let data: OwmResponse = response
            .json()
            .await
            .map_err(|e| NimbusError::Weather(e.to_string()))?;
        let description = data
            .weather
            .first()
            .map(|c| title_case(&c.description))
            .unwrap_or_else(|| "Unknown".to_string());

        Ok(WeatherReport {
            description,
            temperature_f: data.main.temp,
            feels_like_f: data.main.feels_like,
            humidity: data.main.humidity,
        })
    }
}

fn title_case(text: &str) -> String {
    text.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

// ─── Digest generator ───────────────────────────────────────────────

/// Builds and delivers the periodic multi-source summary.
pub struct DigestGenerator {
    reminders: Arc<ReminderStore>,
    store: Arc<MemoryStore>,
    delivery: Arc<dyn Delivery>,
    weather: Option<(Arc<dyn WeatherProvider>, String)>,
    recipients: Mutex<Vec<i64>>,
}

impl DigestGenerator {
    pub fn new(
        reminders: Arc<ReminderStore>,
        store: Arc<MemoryStore>,
        delivery: Arc<dyn Delivery>,
    ) -> Self {
        Self {
            reminders,
            store,
            delivery,
            weather: None,
            recipients: Mutex::new(Vec::new()),
        }
    }

    /// Enable the weather block. An empty location leaves it disabled.
    pub fn with_weather(mut self, provider: Arc<dyn WeatherProvider>, location: &str) -> Self {
        if !location.trim().is_empty() {
            self.weather = Some((provider, location.to_string()));
        }
        self
    }

    pub async fn add_recipient(&self, chat_id: i64) {
        let mut recipients = self.recipients.lock().await;
        if !recipients.contains(&chat_id) {
            recipients.push(chat_id);
        }
    }

    pub async fn remove_recipient(&self, chat_id: i64) {
        self.recipients.lock().await.retain(|id| *id != chat_id);
    }

    pub async fn recipients(&self) -> Vec<i64> {
        self.recipients.lock().await.clone()
    }

    /// Compose the digest text.
    pub async fn build_digest(&self) -> String {
        let now = Utc::now();
        let mut parts = vec![format!(
            "**Good morning.**\n_{}_",
            now.format("%A, %B %-d, %Y")
        )];

        if let Some(block) = self.weather_block().await {
            parts.push(block);
        }
        if let Some(block) = self.reminders_block().await {
            parts.push(block);
        }
        if let Some(block) = self.memory_block().await {
            parts.push(block);
        }

        if parts.len() == 1 {
            parts.push(FILLER_LINE.to_string());
        }
        parts.join("\n\n")
    }

    async fn weather_block(&self) -> Option<String> {
        let (provider, location) = self.weather.as_ref()?;
        match provider.fetch(location).await {
            Ok(report) => Some(format!(
                "**Weather in {location}**\n  {}, {:.0}F (feels like {:.0}F)\n  Humidity: {}%",
                report.description, report.temperature_f, report.feels_like_f, report.humidity
            )),
            Err(e) => {
                warn!("weather fetch failed, skipping block: {e}");
                None
            }
        }
    }

    async fn reminders_block(&self) -> Option<String> {
        let pending = self.reminders.list(None, None).await;
        if pending.is_empty() {
            return None;
        }

        let mut lines = vec![format!("**{} pending reminder(s)**", pending.len())];
        for reminder in pending.iter().take(MAX_DIGEST_REMINDERS) {
            let preview: String = reminder.message.chars().take(REMINDER_PREVIEW_CHARS).collect();
            lines.push(format!(
                "  - {}: {preview}",
                reminder.trigger_time.format("%H:%M")
            ));
        }
        if pending.len() > MAX_DIGEST_REMINDERS {
            lines.push(format!(
                "  ... and {} more",
                pending.len() - MAX_DIGEST_REMINDERS
            ));
        }
        Some(lines.join("\n"))
    }

    async fn memory_block(&self) -> Option<String> {
        let notes = self.store.read_notes().await;
        let mut sections = notes.split("## ");
        // First fragment is whatever precedes the first marker; a log with
        // no sections has nothing to highlight.
        sections.next()?;
        let latest = sections.last()?;

        let mut highlight: String = latest.trim().chars().take(MEMORY_HIGHLIGHT_CHARS).collect();
        if latest.trim().chars().count() > MEMORY_HIGHLIGHT_CHARS {
            highlight.push_str("...");
        }
        Some(format!("**Recent memory**\n  {highlight}"))
    }

    /// Build once and send to every registered recipient independently.
    pub async fn deliver(&self) {
        let recipients = self.recipients.lock().await.clone();
        if recipients.is_empty() {
            info!("no digest recipients registered");
            return;
        }

        let digest = self.build_digest().await;
        let mut delivered = 0;
        for chat_id in &recipients {
            match self.delivery.send(*chat_id, &digest).await {
                Ok(()) => delivered += 1,
                Err(e) => error!("failed to send digest to {chat_id}: {e}"),
            }
        }
        info!("digest delivered to {delivered}/{} recipient(s)", recipients.len());
    }

    /// Immediate composition for a manual trigger.
    pub async fn send_now(&self) -> String {
        self.build_digest().await
    }
}

/// Cron expression for a daily `HH:MM` delivery time; malformed input falls
/// back to 08:00.
pub fn daily_cron(time: &str) -> String {
    let parsed = time.split_once(':').and_then(|(h, m)| {
        let hour: u32 = h.trim().parse().ok()?;
        let minute: u32 = m.trim().parse().ok()?;
        (hour < 24 && minute < 60).then_some((hour, minute))
    });
    let (hour, minute) = parsed.unwrap_or_else(|| {
        warn!("invalid digest time '{time}', using 08:00");
        (8, 0)
    });
    format!("{minute} {hour} * * *")
}
