//! Background job scheduling
//!
//! Thin binding over tokio tasks: one-shot jobs at an absolute time,
//! fixed-interval jobs, and cron-expression jobs. Jobs are keyed by string
//! id; scheduling an id that already exists replaces the previous job, and
//! cancellation aborts the task immediately. Repeating jobs take a factory
//! so each tick gets a fresh future.

use crate::{NimbusError, Result};
use chrono::{DateTime, Utc};
use cron::Schedule;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Job registry driving one-shot, interval, and cron schedules.
pub struct Scheduler {
    jobs: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Run `task` once at an absolute UTC time. A time already in the past
    /// runs immediately.
    pub fn schedule_at<F>(&self, id: &str, when: DateTime<Utc>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let delay = (when - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(delay).await;
            task.await;
        });
        self.install(id, handle);
    }

    /// Run the factory's future repeatedly at a fixed period, starting one
    /// period from now.
    pub fn schedule_every<F>(&self, id: &str, period: Duration, factory: F)
    where
        F: Fn() -> BoxFuture<'static, ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                factory().await;
            }
        });
        self.install(id, handle);
    }

    /// Run the factory's future on a 5-field cron expression
    /// (minute hour day-of-month month day-of-week), evaluated in UTC.
    pub fn schedule_cron<F>(&self, id: &str, expr: &str, factory: F) -> Result<()>
    where
        F: Fn() -> BoxFuture<'static, ()> + Send + 'static,
    {
        let schedule = parse_cron(expr)?;
        let handle = tokio::spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(Utc).next() else {
                    break;
                };
                let delay = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::time::sleep(delay).await;
                factory().await;
            }
        });
        self.install(id, handle);
        Ok(())
    }

    /// Remove a job, aborting it if still pending. Unknown ids return false.
    pub fn cancel(&self, id: &str) -> bool {
        let removed = self.jobs.lock().expect("scheduler lock poisoned").remove(id);
        match removed {
            Some(handle) => {
                handle.abort();
                debug!("cancelled job '{id}'");
                true
            }
            None => false,
        }
    }

    /// Whether a job with this id is currently registered and not finished.
    pub fn contains(&self, id: &str) -> bool {
        self.jobs
            .lock()
            .expect("scheduler lock poisoned")
            .get(id)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    fn install(&self, id: &str, handle: JoinHandle<()>) {
        let mut jobs = self.jobs.lock().expect("scheduler lock poisoned");
        jobs.retain(|_, existing| !existing.is_finished());
        if let Some(previous) = jobs.insert(id.to_string(), handle) {
            previous.abort();
            debug!("replaced job '{id}'");
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for (_, handle) in self.jobs.lock().expect("scheduler lock poisoned").drain() {
            handle.abort();
        }
    }
}

/// Parse a 5-field cron expression, tolerating 6/7-field forms with an
/// explicit seconds (and year) field.
fn parse_cron(expr: &str) -> Result<Schedule> {
    let fields = expr.split_whitespace().count();
    let full = match fields {
        5 => format!("0 {expr}"),
        6 | 7 => expr.to_string(),
        _ => {
            return Err(NimbusError::Schedule(format!(
                "invalid cron expression '{expr}': expected 5 fields"
            )))
        }
    };
    Schedule::from_str(&full)
        .map_err(|e| NimbusError::Schedule(format!("invalid cron expression '{expr}': {e}")))
}
