//! Catalog of prompt systems, schedules and runs.
//!
//! The engine talks to [`Storage`]; [`JsonStore`] keeps everything in a single JSON
//! document under the data directory. Every mutation re-reads the file, applies the
//! change and writes it back, so writers in other processes are not clobbered.

use crate::model::{HistoryPoint, PromptSystem, RunRecord, ScheduleDescriptor};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tokio::sync::RwLock;

#[async_trait]
pub trait Storage: Send + Sync {
    async fn get_prompt_system(&self, id: &str) -> Result<Option<PromptSystem>>;
    async fn save_prompt_system(&self, system: &PromptSystem) -> Result<()>;
    async fn list_prompt_systems(&self) -> Result<Vec<PromptSystem>>;

    async fn save_run(&self, run: &RunRecord) -> Result<()>;
    async fn get_run(&self, id: &str) -> Result<Option<RunRecord>>;
    /// Most recent run for a prompt system, scheduled or not.
    async fn latest_run_for_prompt_system(&self, prompt_system_id: &str)
        -> Result<Option<RunRecord>>;
    /// Most recent run produced by a schedule, skipping `exclude_run_id`.
    async fn latest_run_for_schedule(
        &self,
        schedule_id: &str,
        exclude_run_id: Option<&str>,
    ) -> Result<Option<RunRecord>>;
    /// Runs for a prompt system created at or after `since`, oldest first.
    async fn runs_since(&self, prompt_system_id: &str, since: OffsetDateTime)
        -> Result<Vec<RunRecord>>;

    async fn get_schedule(&self, id: &str) -> Result<Option<ScheduleDescriptor>>;
    async fn save_schedule(&self, schedule: &ScheduleDescriptor) -> Result<()>;
    /// Returns whether a schedule was removed.
    async fn delete_schedule(&self, id: &str) -> Result<bool>;
    async fn list_schedules(&self, active_only: bool) -> Result<Vec<ScheduleDescriptor>>;
}

/// Score history for a prompt system over the last `days` days.
pub async fn history(
    storage: &dyn Storage,
    prompt_system_id: &str,
    days: u32,
) -> Result<Vec<HistoryPoint>> {
    let since = OffsetDateTime::now_utc() - time::Duration::days(i64::from(days));
    let runs = storage.runs_since(prompt_system_id, since).await?;
    Ok(runs.iter().map(HistoryPoint::from).collect())
}

/// Default location of the catalog file.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("prompt-regress")
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Catalog {
    #[serde(default)]
    prompt_systems: BTreeMap<String, PromptSystem>,
    #[serde(default)]
    schedules: BTreeMap<String, ScheduleDescriptor>,
    /// Append-only, in creation order.
    #[serde(default)]
    runs: Vec<RunRecord>,
}

pub struct JsonStore {
    path: Option<PathBuf>,
    catalog: RwLock<Catalog>,
}

impl JsonStore {
    /// Open (or create) `catalog.json` inside `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        let path = dir.join("catalog.json");
        let catalog = read_catalog(&path)?;
        Ok(Self {
            path: Some(path),
            catalog: RwLock::new(catalog),
        })
    }

    /// A store that never touches the filesystem.
    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            catalog: RwLock::new(Catalog::default()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Re-read the file, picking up edits made by other processes.
    pub async fn reload(&self) -> Result<()> {
        if let Some(path) = &self.path {
            let fresh = read_catalog(path)?;
            *self.catalog.write().await = fresh;
        }
        Ok(())
    }

    /// Apply `change` to the latest on-disk catalog and write it back. The write lock
    /// is held throughout, so writers in this process are serialized.
    async fn mutate<T>(&self, change: impl FnOnce(&mut Catalog) -> T) -> Result<T> {
        let mut catalog = self.catalog.write().await;
        if let Some(path) = &self.path {
            *catalog = read_catalog(path)?;
        }
        let out = change(&mut catalog);
        self.flush(&catalog)?;
        Ok(out)
    }

    fn flush(&self, catalog: &Catalog) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let data = serde_json::to_vec_pretty(catalog)?;
        let tmp = path.with_extension(format!("json.{}.tmp", std::process::id()));
        std::fs::write(&tmp, data).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, path).with_context(|| format!("replace {}", path.display()))?;
        Ok(())
    }
}

fn read_catalog(path: &Path) -> Result<Catalog> {
    if !path.exists() {
        return Ok(Catalog::default());
    }
    let data = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&data).with_context(|| format!("parse {}", path.display()))
}

#[async_trait]
impl Storage for JsonStore {
    async fn get_prompt_system(&self, id: &str) -> Result<Option<PromptSystem>> {
        Ok(self.catalog.read().await.prompt_systems.get(id).cloned())
    }

    async fn save_prompt_system(&self, system: &PromptSystem) -> Result<()> {
        self.mutate(|c| {
            c.prompt_systems.insert(system.id.clone(), system.clone());
        })
        .await
    }

    async fn list_prompt_systems(&self) -> Result<Vec<PromptSystem>> {
        Ok(self
            .catalog
            .read()
            .await
            .prompt_systems
            .values()
            .cloned()
            .collect())
    }

    async fn save_run(&self, run: &RunRecord) -> Result<()> {
        self.mutate(|c| c.runs.push(run.clone())).await
    }

    async fn get_run(&self, id: &str) -> Result<Option<RunRecord>> {
        Ok(self
            .catalog
            .read()
            .await
            .runs
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }

    async fn latest_run_for_prompt_system(
        &self,
        prompt_system_id: &str,
    ) -> Result<Option<RunRecord>> {
        Ok(self
            .catalog
            .read()
            .await
            .runs
            .iter()
            .rev()
            .find(|r| r.prompt_system_id == prompt_system_id)
            .cloned())
    }

    async fn latest_run_for_schedule(
        &self,
        schedule_id: &str,
        exclude_run_id: Option<&str>,
    ) -> Result<Option<RunRecord>> {
        Ok(self
            .catalog
            .read()
            .await
            .runs
            .iter()
            .rev()
            .filter(|r| Some(r.id.as_str()) != exclude_run_id)
            .find(|r| r.schedule_id.as_deref() == Some(schedule_id))
            .cloned())
    }

    async fn runs_since(
        &self,
        prompt_system_id: &str,
        since: OffsetDateTime,
    ) -> Result<Vec<RunRecord>> {
        Ok(self
            .catalog
            .read()
            .await
            .runs
            .iter()
            .filter(|r| r.prompt_system_id == prompt_system_id && r.created_at >= since)
            .cloned()
            .collect())
    }

    async fn get_schedule(&self, id: &str) -> Result<Option<ScheduleDescriptor>> {
        Ok(self.catalog.read().await.schedules.get(id).cloned())
    }

    async fn save_schedule(&self, schedule: &ScheduleDescriptor) -> Result<()> {
        self.mutate(|c| {
            c.schedules.insert(schedule.id.clone(), schedule.clone());
        })
        .await
    }

    async fn delete_schedule(&self, id: &str) -> Result<bool> {
        self.mutate(|c| c.schedules.remove(id).is_some()).await
    }

    async fn list_schedules(&self, active_only: bool) -> Result<Vec<ScheduleDescriptor>> {
        Ok(self
            .catalog
            .read()
            .await
            .schedules
            .values()
            .filter(|s| !active_only || s.active)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RunOutcome;

    fn run(ps: &str, schedule: Option<&str>, avg: f64) -> RunRecord {
        let mut outcome = RunOutcome::new(Vec::new(), Vec::new());
        outcome.avg_score = avg;
        RunRecord::new(ps, schedule, outcome)
    }

    #[tokio::test]
    async fn latest_run_respects_recency_and_exclusion() {
        let store = JsonStore::in_memory();
        let a = run("ps", Some("s1"), 0.9);
        let b = run("ps", None, 0.5);
        let c = run("ps", Some("s1"), 0.6);
        for r in [&a, &b, &c] {
            store.save_run(r).await.unwrap();
        }

        let latest = store.latest_run_for_prompt_system("ps").await.unwrap().unwrap();
        assert_eq!(latest.id, c.id);

        let prev = store
            .latest_run_for_schedule("s1", Some(&c.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(prev.id, a.id);
        assert!(store
            .latest_run_for_schedule("other", None)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn history_marks_scheduled_runs() {
        let store = JsonStore::in_memory();
        store.save_run(&run("ps", Some("s1"), 0.9)).await.unwrap();
        store.save_run(&run("ps", None, 0.4)).await.unwrap();
        store.save_run(&run("other", None, 0.1)).await.unwrap();

        let points = history(&store, "ps", 7).await.unwrap();
        assert_eq!(points.len(), 2);
        assert!(points[0].is_scheduled);
        assert!(!points[1].is_scheduled);
        assert_eq!(points[1].avg_score, 0.4);
    }

    #[tokio::test]
    async fn file_store_round_trips_through_reload() {
        let dir = std::env::temp_dir().join(format!("prompt-regress-test-{}", crate::model::new_id()));
        let store = JsonStore::open(&dir).unwrap();
        store.save_run(&run("ps", None, 0.7)).await.unwrap();

        let other = JsonStore::open(&dir).unwrap();
        let latest = other.latest_run_for_prompt_system("ps").await.unwrap().unwrap();
        assert_eq!(latest.outcome.avg_score, 0.7);

        store.save_run(&run("ps", None, 0.2)).await.unwrap();
        other.reload().await.unwrap();
        let latest = other.latest_run_for_prompt_system("ps").await.unwrap().unwrap();
        assert_eq!(latest.outcome.avg_score, 0.2);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn writes_keep_changes_made_by_another_store() {
        let dir = std::env::temp_dir().join(format!("prompt-regress-test-{}", crate::model::new_id()));
        let daemon = JsonStore::open(&dir).unwrap();
        let mut sched = crate::orchestrator::post_process::tests::schedule(0.1, false);
        daemon.save_schedule(&sched).await.unwrap();

        // another process pauses the schedule while the daemon still holds the old copy
        let cli = JsonStore::open(&dir).unwrap();
        sched.active = false;
        cli.save_schedule(&sched).await.unwrap();

        daemon.save_run(&run("ps-1", Some("sched-1"), 0.8)).await.unwrap();

        let reopened = JsonStore::open(&dir).unwrap();
        let stored = reopened.get_schedule("sched-1").await.unwrap().unwrap();
        assert!(!stored.active);
        assert!(reopened.latest_run_for_schedule("sched-1", None).await.unwrap().is_some());
        // the writer's own view is refreshed too
        assert!(!daemon.get_schedule("sched-1").await.unwrap().unwrap().active);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn delete_unknown_schedule_is_not_an_error() {
        let store = JsonStore::in_memory();
        assert!(!store.delete_schedule("nope").await.unwrap());
    }
}
