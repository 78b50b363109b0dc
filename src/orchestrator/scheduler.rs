//! Timer registry keyed by schedule id.
//!
//! Each active schedule owns one tokio task ticking at its interval. A tick spawns the
//! job body as its own task, so a slow run never delays the next tick and runs of the
//! same schedule may overlap.

use crate::error::{Error, Result};
use crate::model::ScheduleDescriptor;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

/// Callback invoked on every timer fire.
#[async_trait]
pub trait ScheduledJob: Send + Sync + 'static {
    async fn fire(&self, schedule_id: &str);
}

struct Timer {
    interval: Duration,
    handle: JoinHandle<()>,
}

/// Outcome of a [`Scheduler::sync`] pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

pub struct Scheduler {
    job: Arc<dyn ScheduledJob>,
    timers: Mutex<HashMap<String, Timer>>,
}

impl Scheduler {
    pub fn new(job: Arc<dyn ScheduledJob>) -> Self {
        Self {
            job,
            timers: Mutex::new(HashMap::new()),
        }
    }

    fn timers(&self) -> MutexGuard<'_, HashMap<String, Timer>> {
        self.timers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Install a timer for `id`, replacing any existing one.
    ///
    /// Must be called from within a tokio runtime. The first fire happens one
    /// `interval` from now.
    pub fn upsert(&self, id: &str, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(Error::InvalidConfig(format!(
                "schedule {id}: interval must be greater than zero"
            )));
        }
        let job = self.job.clone();
        let schedule_id = id.to_string();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                debug!(schedule_id = %schedule_id, "timer fired");
                let job = job.clone();
                let id = schedule_id.clone();
                tokio::spawn(async move { job.fire(&id).await });
            }
        });

        let previous = self
            .timers()
            .insert(id.to_string(), Timer { interval, handle });
        if let Some(old) = previous {
            old.handle.abort();
        }
        info!(schedule_id = %id, interval = %humantime::format_duration(interval), "schedule armed");
        Ok(())
    }

    /// Cancel the timer for `id`. Unknown ids are ignored.
    pub fn remove(&self, id: &str) -> bool {
        match self.timers().remove(id) {
            Some(timer) => {
                timer.handle.abort();
                info!(schedule_id = %id, "schedule disarmed");
                true
            }
            None => false,
        }
    }

    /// Arm every active descriptor. Used at startup, since timers are not persisted.
    /// A descriptor that cannot be armed is logged and skipped.
    pub fn reconcile(&self, descriptors: &[ScheduleDescriptor]) -> usize {
        let mut armed = 0;
        for d in descriptors.iter().filter(|d| d.active) {
            match self.upsert(&d.id, d.interval) {
                Ok(()) => armed += 1,
                Err(e) => warn!(schedule_id = %d.id, error = %e, "skipping schedule"),
            }
        }
        info!(count = armed, "loaded existing schedules");
        armed
    }

    /// Make the registry match `descriptors` exactly.
    ///
    /// Timers whose interval is unchanged keep their phase; inactive or missing
    /// schedules are disarmed. Descriptors that cannot be armed are skipped.
    pub fn sync(&self, descriptors: &[ScheduleDescriptor]) -> SyncReport {
        let mut report = SyncReport::default();
        let wanted: HashMap<&str, Duration> = descriptors
            .iter()
            .filter(|d| d.active)
            .map(|d| (d.id.as_str(), d.interval))
            .collect();

        let stale: Vec<String> = self
            .timers()
            .keys()
            .filter(|id| !wanted.contains_key(id.as_str()))
            .cloned()
            .collect();
        for id in stale {
            self.remove(&id);
            report.removed.push(id);
        }

        for (id, interval) in wanted {
            let current = self.timers().get(id).map(|t| t.interval);
            if current != Some(interval) {
                match self.upsert(id, interval) {
                    Ok(()) => report.added.push(id.to_string()),
                    Err(e) => warn!(schedule_id = %id, error = %e, "skipping schedule"),
                }
            }
        }
        report.added.sort();
        report
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.timers().len()
    }

    pub fn scheduled_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.timers().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Cancel every timer. In-flight runs are left to finish.
    pub fn shutdown(&self) {
        for (_, timer) in self.timers().drain() {
            timer.handle.abort();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
