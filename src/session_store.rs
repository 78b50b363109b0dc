//! Key-value store with per-entry expiry, used for optimization sessions.
//!
//! [`FileSessionStore`] is what the CLI uses: every process opened on the same data
//! directory sees the same sessions, so `optimize stop` reaches a loop running in
//! another process and the daemon's sweep cleans up after finished CLI sessions.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use time::OffsetDateTime;

#[cfg(test)]
pub use memory::MemorySessionStore;

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;
}

#[derive(Debug, Serialize, Deserialize)]
struct FileEntry {
    value: String,
    #[serde(with = "time::serde::rfc3339")]
    expires_at: OffsetDateTime,
}

type Entries = BTreeMap<String, FileEntry>;

/// Sessions kept in `sessions.json` under the data directory. Each call re-reads
/// the file, drops expired entries and, when something changed, writes it back.
/// Expiry is wall-clock, since other processes share the file.
pub struct FileSessionStore {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl FileSessionStore {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        Ok(Self {
            path: dir.join("sessions.json"),
            lock: tokio::sync::Mutex::new(()),
        })
    }

    fn read(&self) -> Result<Entries> {
        if !self.path.exists() {
            return Ok(Entries::new());
        }
        let data =
            std::fs::read(&self.path).with_context(|| format!("read {}", self.path.display()))?;
        let mut entries: Entries = serde_json::from_slice(&data)
            .with_context(|| format!("parse {}", self.path.display()))?;
        let now = OffsetDateTime::now_utc();
        entries.retain(|_, e| e.expires_at > now);
        Ok(entries)
    }

    fn write(&self, entries: &Entries) -> Result<()> {
        let data = serde_json::to_vec_pretty(entries)?;
        let tmp = self.path.with_extension(format!("json.{}.tmp", std::process::id()));
        std::fs::write(&tmp, data).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("replace {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut entries = self.read()?;
        entries.insert(
            key.to_string(),
            FileEntry {
                value,
                expires_at: OffsetDateTime::now_utc() + ttl,
            },
        );
        self.write(&entries)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock().await;
        Ok(self.read()?.remove(key).map(|e| e.value))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut entries = self.read()?;
        let removed = entries.remove(key).is_some();
        if removed {
            self.write(&entries)?;
        }
        Ok(removed)
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let _guard = self.lock.lock().await;
        Ok(self
            .read()?
            .into_keys()
            .filter(|k| k.starts_with(prefix))
            .collect())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let store = MemorySessionStore::new();
        store
            .set("s:1", "one".into(), Duration::from_secs(10))
            .await
            .unwrap();
        store
            .set("s:2", "two".into(), Duration::from_secs(60))
            .await
            .unwrap();
        store
            .set("other", "x".into(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.list_keys("s:").await.unwrap(), vec!["s:1", "s:2"]);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.get("s:1").await.unwrap(), None);
        assert_eq!(store.get("s:2").await.unwrap().as_deref(), Some("two"));
        assert_eq!(store.list_keys("s:").await.unwrap(), vec!["s:2"]);
    }

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("prompt-regress-sessions-{}", crate::model::new_id()))
    }

    #[tokio::test]
    async fn file_store_is_shared_between_instances() {
        let dir = temp_dir();
        let a = FileSessionStore::open(&dir).unwrap();
        let b = FileSessionStore::open(&dir).unwrap();

        a.set("s:1", "running".into(), Duration::from_secs(600))
            .await
            .unwrap();
        b.set("other", "x".into(), Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(b.get("s:1").await.unwrap().as_deref(), Some("running"));

        b.set("s:1", "stopped".into(), Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(a.get("s:1").await.unwrap().as_deref(), Some("stopped"));
        assert_eq!(a.list_keys("s:").await.unwrap(), vec!["s:1"]);

        assert!(a.delete("s:1").await.unwrap());
        assert_eq!(b.get("s:1").await.unwrap(), None);
        assert_eq!(b.get("other").await.unwrap().as_deref(), Some("x"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn file_store_hides_expired_entries() {
        let dir = temp_dir();
        let store = FileSessionStore::open(&dir).unwrap();
        store.set("gone", "v".into(), Duration::ZERO).await.unwrap();
        store
            .set("kept", "v".into(), Duration::from_secs(600))
            .await
            .unwrap();

        assert_eq!(store.get("gone").await.unwrap(), None);
        assert!(!store.delete("gone").await.unwrap());
        assert_eq!(store.list_keys("").await.unwrap(), vec!["kept"]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn delete_reports_presence() {
        let store = MemorySessionStore::new();
        store
            .set("k", "v".into(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
    }
}
