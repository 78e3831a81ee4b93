//! Durable backlog of records that failed delivery
//!
//! The backlog is a JSON array of records in a single file, oldest first.
//! Every mutation reads the whole file, changes the list in memory and
//! rewrites the whole file (temp file + rename).
//!
//! Read-modify-write cycles are serialised twice: by an async mutex shared
//! by every `Backlog` in the process that points at the same path, and by
//! an exclusive `fs2` lock on `<path>.lock` that keeps other processes
//! (`send`, `backlog flush`) out. A drain holds both while its resends run.
//!
//! A missing file is an empty backlog. Malformed content (bad JSON or bad
//! UTF-8) is moved aside to `<path>.corrupt` and treated as empty. Any other
//! read failure aborts the mutation, so the file on disk stays as it was.

use chrono::{Duration as ChronoDuration, Local};
use dashmap::DashMap;
use fs2::FileExt;
use futures::future::join_all;
use std::ffi::OsString;
use std::fmt::Display;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio::fs;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::BacklogConfig;
use crate::error::StorageError;
use crate::record::Record;

/// Eviction limits applied on append
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// 0 = unlimited
    pub max_entries: usize,
    /// 0 = unlimited
    pub max_age_hours: u64,
}

impl RetentionPolicy {
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Drop expired entries, then the oldest entries beyond the count limit.
    /// Returns how many were dropped. Entries with an unparseable `datetime`
    /// are never considered expired.
    fn apply(&self, entries: &mut Vec<Record>) -> usize {
        let before = entries.len();

        if self.max_age_hours > 0 {
            let cutoff = Local::now() - ChronoDuration::hours(self.max_age_hours as i64);
            entries.retain(|r| r.timestamp().map_or(true, |t| t >= cutoff));
        }

        if self.max_entries > 0 && entries.len() > self.max_entries {
            let excess = entries.len() - self.max_entries;
            entries.drain(..excess);
        }

        before - entries.len()
    }
}

/// Outcome of one drain attempt
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub attempted: usize,
    pub delivered: usize,
    pub remaining: usize,
}

impl DrainReport {
    pub fn is_noop(&self) -> bool {
        self.attempted == 0
    }
}

/// One async mutex per backlog path for the whole process
///
/// A reload builds a new `Backlog` while ticks of the old relay may still be
/// draining; both must queue on the same lock.
fn path_lock(path: &Path) -> Arc<Mutex<()>> {
    static LOCKS: OnceLock<DashMap<PathBuf, Arc<Mutex<()>>>> = OnceLock::new();

    let key = std::env::current_dir()
        .map(|dir| dir.join(path))
        .unwrap_or_else(|_| path.to_path_buf());

    LOCKS
        .get_or_init(DashMap::new)
        .entry(key)
        .or_default()
        .value()
        .clone()
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Held for the duration of one read-modify-write
struct WriteGuard {
    file: std::fs::File,
    _local: OwnedMutexGuard<()>,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(error = %e, "Failed to release backlog file lock");
        }
    }
}

pub struct Backlog {
    path: PathBuf,
    policy: RetentionPolicy,
    lock: Arc<Mutex<()>>,
}

impl Backlog {
    pub fn new(path: impl Into<PathBuf>, policy: RetentionPolicy) -> Self {
        let path = path.into();
        Self {
            lock: path_lock(&path),
            path,
            policy,
        }
    }

    pub fn from_config(config: &BacklogConfig) -> Self {
        Self::new(
            config.path.clone(),
            RetentionPolicy {
                max_entries: config.max_entries,
                max_age_hours: config.max_age_hours,
            },
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist `record` at the end of the backlog
    ///
    /// Returns the committed backlog length. On `Err` nothing was written and
    /// the previous file content still stands.
    pub async fn append(&self, record: Record) -> Result<usize, StorageError> {
        let _guard = self.lock_for_write().await?;

        let mut entries = self.load_for_write().await?;
        entries.push(record);

        let evicted = self.policy.apply(&mut entries);
        if evicted > 0 {
            tracing::warn!(
                evicted = evicted,
                max_entries = self.policy.max_entries,
                max_age_hours = self.policy.max_age_hours,
                "Backlog retention limit reached, dropped oldest records"
            );
            crate::telemetry::record_evicted(evicted);
        }

        self.store(&entries).await?;
        crate::telemetry::record_backlog_len(entries.len());
        Ok(entries.len())
    }

    /// Resend every entry concurrently and keep only the ones that failed
    ///
    /// All attempts run to completion regardless of individual failures. An
    /// entry leaves the backlog if and only if `send` reported success for it.
    /// The locks are held for the whole drain; appends from overlapping ticks
    /// wait for it.
    pub async fn drain_attempt<F, Fut, T, E>(&self, send: F) -> Result<DrainReport, StorageError>
    where
        F: Fn(Record) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let _guard = self.lock_for_write().await?;

        let entries = self.load_for_write().await?;
        if entries.is_empty() {
            return Ok(DrainReport::default());
        }

        let attempted = entries.len();
        tracing::info!(entries = attempted, "Resending backlog");

        let outcomes = join_all(entries.iter().cloned().map(&send)).await;

        let mut failed = Vec::new();
        for (entry, outcome) in entries.into_iter().zip(outcomes) {
            match outcome {
                Ok(_) => crate::telemetry::record_delivery("backlog", true),
                Err(e) => {
                    tracing::warn!(datetime = %entry.datetime, error = %e, "Backlog resend failed");
                    crate::telemetry::record_delivery("backlog", false);
                    failed.push(entry);
                }
            }
        }

        let report = DrainReport {
            attempted,
            delivered: attempted - failed.len(),
            remaining: failed.len(),
        };

        // Nothing delivered: the file already holds exactly `failed`
        if report.delivered > 0 {
            self.store(&failed).await?;
        }
        crate::telemetry::record_backlog_len(report.remaining);

        Ok(report)
    }

    /// Current entries, oldest first
    ///
    /// Read-only: takes no lock and never moves a malformed file aside.
    pub async fn entries(&self) -> Vec<Record> {
        match self.load().await {
            Ok(entries) => entries,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => {
                tracing::warn!(path = ?self.path, error = %e, "Failed to read backlog");
                Vec::new()
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.entries().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn lock_for_write(&self) -> Result<WriteGuard, StorageError> {
        let local = self.lock.clone().lock_owned().await;

        let lock_path = sibling(&self.path, ".lock");
        let opened = lock_path.clone();
        let file = tokio::task::spawn_blocking(move || -> std::io::Result<std::fs::File> {
            if let Some(parent) = opened.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            #[allow(clippy::suspicious_open_options)]
            let file = std::fs::OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&opened)?;
            file.lock_exclusive()?;
            Ok(file)
        })
        .await
        .map_err(|e| StorageError::io(&lock_path, std::io::Error::other(e)))?
        .map_err(|e| StorageError::io(&lock_path, e))?;

        Ok(WriteGuard {
            file,
            _local: local,
        })
    }

    async fn load(&self) -> Result<Vec<Record>, StorageError> {
        let content = fs::read_to_string(&self.path)
            .await
            .map_err(|e| StorageError::io(&self.path, e))?;

        if content.trim().is_empty() {
            return Ok(Vec::new());
        }

        serde_json::from_str(&content).map_err(StorageError::Malformed)
    }

    /// `load` for a mutation: missing or malformed content is an empty list,
    /// any other read failure is returned so nothing gets overwritten
    async fn load_for_write(&self) -> Result<Vec<Record>, StorageError> {
        match self.load().await {
            Ok(entries) => Ok(entries),
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) if e.is_malformed() => {
                tracing::warn!(path = ?self.path, error = %e, "Backlog file is malformed, starting empty");
                self.quarantine().await?;
                Ok(Vec::new())
            }
            Err(e) => {
                tracing::error!(path = ?self.path, error = %e, "Failed to read backlog, leaving it untouched");
                Err(e)
            }
        }
    }

    /// Move unreadable content out of the way so the next write does not destroy it
    async fn quarantine(&self) -> Result<(), StorageError> {
        let target = sibling(&self.path, ".corrupt");

        fs::rename(&self.path, &target)
            .await
            .map_err(|e| StorageError::io(&target, e))?;
        tracing::warn!(target = ?target, "Malformed backlog moved aside");
        Ok(())
    }

    async fn store(&self, entries: &[Record]) -> Result<(), StorageError> {
        let content = serde_json::to_string(entries).map_err(StorageError::Serialize)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StorageError::io(parent, e))?;
            }
        }

        let tmp = sibling(&self.path, ".tmp");

        fs::write(&tmp, content.as_bytes())
            .await
            .map_err(|e| StorageError::io(&tmp, e))?;
        if let Err(e) = fs::rename(&tmp, &self.path).await {
            if let Err(cleanup) = fs::remove_file(&tmp).await {
                tracing::warn!(path = ?tmp, error = %cleanup, "Failed to remove temporary backlog file");
            }
            return Err(StorageError::io(&self.path, e));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Metric, Observation};
    use chrono::TimeZone;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn create_test_backlog(policy: RetentionPolicy) -> (Backlog, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let backlog = Backlog::new(temp_dir.path().join("backlog.json"), policy);
        (backlog, temp_dir)
    }

    fn record(label: &str) -> Record {
        let mut observations = BTreeMap::new();
        observations.insert(
            Metric::SolarPower.id().to_string(),
            Observation::new(json!(label), Some("W".to_string())),
        );
        Record {
            datetime: Local::now().format(crate::record::DATETIME_FORMAT).to_string(),
            observations,
        }
    }

    fn label(record: &Record) -> String {
        record
            .get(Metric::SolarPower)
            .and_then(|o| o.value.as_str())
            .unwrap_or_default()
            .to_string()
    }

    async fn labels(backlog: &Backlog) -> Vec<String> {
        backlog.entries().await.iter().map(label).collect()
    }

    #[tokio::test]
    async fn test_append_to_missing_file() {
        let (backlog, _temp_dir) = create_test_backlog(RetentionPolicy::unlimited());
        assert!(!backlog.path().exists());

        assert_eq!(backlog.append(record("A")).await.unwrap(), 1);
        assert!(backlog.path().exists());
        assert_eq!(labels(&backlog).await, vec!["A"]);
    }

    #[tokio::test]
    async fn test_append_creates_parent_directory() {
        let temp_dir = TempDir::new().unwrap();
        let backlog = Backlog::new(
            temp_dir.path().join("nested/dir/backlog.json"),
            RetentionPolicy::unlimited(),
        );
        assert_eq!(backlog.append(record("A")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_append_to_malformed_file_starts_empty() {
        let (backlog, _temp_dir) = create_test_backlog(RetentionPolicy::unlimited());
        fs::write(backlog.path(), "{not json").await.unwrap();

        assert_eq!(backlog.append(record("A")).await.unwrap(), 1);
        assert_eq!(labels(&backlog).await, vec!["A"]);

        // original content kept for inspection
        let corrupt = backlog.path().with_file_name("backlog.json.corrupt");
        assert_eq!(fs::read_to_string(corrupt).await.unwrap(), "{not json");
    }

    #[tokio::test]
    async fn test_persisted_as_flat_list() {
        let (backlog, _temp_dir) = create_test_backlog(RetentionPolicy::unlimited());
        backlog.append(record("A")).await.unwrap();
        backlog.append(record("B")).await.unwrap();

        let raw = fs::read_to_string(backlog.path()).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let list = value.as_array().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1]["solar_power"]["value"], json!("B"));
    }

    #[tokio::test]
    async fn test_drain_all_succeed_clears_backlog() {
        let (backlog, _temp_dir) = create_test_backlog(RetentionPolicy::unlimited());
        for l in ["A", "B", "C"] {
            backlog.append(record(l)).await.unwrap();
        }

        let report = backlog
            .drain_attempt(|_r| async { Ok::<_, String>(()) })
            .await
            .unwrap();

        assert_eq!(
            report,
            DrainReport {
                attempted: 3,
                delivered: 3,
                remaining: 0
            }
        );
        assert!(backlog.is_empty().await);
    }

    #[tokio::test]
    async fn test_drain_all_fail_preserves_order() {
        let (backlog, _temp_dir) = create_test_backlog(RetentionPolicy::unlimited());
        for l in ["A", "B", "C", "D"] {
            backlog.append(record(l)).await.unwrap();
        }

        let report = backlog
            .drain_attempt(|_r| async { Err::<(), _>("endpoint down") })
            .await
            .unwrap();

        assert_eq!(report.delivered, 0);
        assert_eq!(report.remaining, 4);
        assert_eq!(labels(&backlog).await, vec!["A", "B", "C", "D"]);
    }

    #[tokio::test]
    async fn test_drain_partial_failure_keeps_only_failed() {
        let (backlog, _temp_dir) = create_test_backlog(RetentionPolicy::unlimited());
        for l in ["A", "B", "C"] {
            backlog.append(record(l)).await.unwrap();
        }

        let report = backlog
            .drain_attempt(|r| async move {
                if label(&r) == "B" {
                    Err("rejected")
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert_eq!(report.delivered, 2);
        assert_eq!(labels(&backlog).await, vec!["B"]);
    }

    #[tokio::test]
    async fn test_drain_attempts_every_entry_despite_failures() {
        let (backlog, _temp_dir) = create_test_backlog(RetentionPolicy::unlimited());
        for l in ["A", "B", "C", "D", "E"] {
            backlog.append(record(l)).await.unwrap();
        }

        let calls = AtomicUsize::new(0);
        let report = backlog
            .drain_attempt(|r| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if label(&r) == "A" || label(&r) == "D" {
                        Err("fail")
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(report.remaining, 2);
        assert_eq!(labels(&backlog).await, vec!["A", "D"]);
    }

    #[tokio::test]
    async fn test_drain_empty_is_noop() {
        let (backlog, _temp_dir) = create_test_backlog(RetentionPolicy::unlimited());

        let calls = AtomicUsize::new(0);
        let report = backlog
            .drain_attempt(|_r| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, String>(()) }
            })
            .await
            .unwrap();

        assert!(report.is_noop());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        // no write happened
        assert!(!backlog.path().exists());
    }

    #[tokio::test]
    async fn test_drain_malformed_file_is_noop() {
        let (backlog, _temp_dir) = create_test_backlog(RetentionPolicy::unlimited());
        fs::write(backlog.path(), "[{\"broken\":").await.unwrap();

        let report = backlog
            .drain_attempt(|_r| async { Ok::<_, String>(()) })
            .await
            .unwrap();
        assert!(report.is_noop());
    }

    #[tokio::test]
    async fn test_concurrent_appends_are_not_lost() {
        let (backlog, _temp_dir) = create_test_backlog(RetentionPolicy::unlimited());
        let backlog = std::sync::Arc::new(backlog);

        let mut handles = Vec::new();
        for i in 0..20 {
            let backlog = backlog.clone();
            handles.push(tokio::spawn(async move {
                backlog.append(record(&i.to_string())).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(backlog.len().await, 20);
    }

    #[tokio::test]
    async fn test_append_during_drain_survives_rewrite() {
        let (backlog, _temp_dir) = create_test_backlog(RetentionPolicy::unlimited());
        backlog.append(record("A")).await.unwrap();

        let (report, appended) = tokio::join!(
            backlog.drain_attempt(|_r| async {
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                Ok::<_, String>(())
            }),
            async {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                backlog.append(record("C")).await
            }
        );

        assert_eq!(report.unwrap().delivered, 1);
        assert_eq!(appended.unwrap(), 1);
        assert_eq!(labels(&backlog).await, vec!["C"]);
    }

    #[tokio::test]
    async fn test_instances_on_same_path_share_lock() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("backlog.json");
        // relay before and after a reload
        let old = Backlog::new(&path, RetentionPolicy::unlimited());
        let new = Backlog::new(&path, RetentionPolicy::unlimited());
        old.append(record("A")).await.unwrap();

        let (report, appended) = tokio::join!(
            old.drain_attempt(|_r| async {
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                Ok::<_, String>(())
            }),
            async {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                new.append(record("C")).await
            }
        );

        assert_eq!(report.unwrap().delivered, 1);
        assert!(appended.is_ok());
        assert_eq!(labels(&new).await, vec!["C"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_lock_blocks_other_holders() {
        let (backlog, _temp_dir) = create_test_backlog(RetentionPolicy::unlimited());
        let lock_path = backlog.path().with_file_name("backlog.json.lock");

        // another process holding the lock
        let held = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)
            .unwrap();
        held.lock_exclusive().unwrap();

        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            backlog.append(record("A")),
        )
        .await;
        assert!(blocked.is_err());

        FileExt::unlock(&held).unwrap();
        drop(held);

        assert_eq!(backlog.append(record("B")).await.unwrap(), 1);
        assert_eq!(labels(&backlog).await, vec!["B"]);
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_quarantined() {
        let (backlog, _temp_dir) = create_test_backlog(RetentionPolicy::unlimited());
        let raw = vec![b'[', 0xff, b']'];
        fs::write(backlog.path(), &raw).await.unwrap();

        assert_eq!(backlog.append(record("A")).await.unwrap(), 1);

        let corrupt = backlog.path().with_file_name("backlog.json.corrupt");
        assert_eq!(fs::read(corrupt).await.unwrap(), raw);
        assert_eq!(labels(&backlog).await, vec!["A"]);
    }

    #[tokio::test]
    async fn test_unreadable_backlog_is_left_untouched() {
        let (backlog, _temp_dir) = create_test_backlog(RetentionPolicy::unlimited());
        // a directory where the file should be: reading fails, but not as NotFound
        fs::create_dir(backlog.path()).await.unwrap();
        fs::write(backlog.path().join("keep"), "x").await.unwrap();

        assert!(backlog.append(record("A")).await.is_err());
        assert!(backlog
            .drain_attempt(|_r| async { Ok::<_, String>(()) })
            .await
            .is_err());

        assert!(backlog.path().join("keep").exists());
        assert!(!backlog.path().with_file_name("backlog.json.corrupt").exists());
    }

    #[tokio::test]
    async fn test_entries_does_not_quarantine() {
        let (backlog, _temp_dir) = create_test_backlog(RetentionPolicy::unlimited());
        fs::write(backlog.path(), "{not json").await.unwrap();

        assert!(backlog.entries().await.is_empty());
        assert_eq!(fs::read_to_string(backlog.path()).await.unwrap(), "{not json");
        assert!(!backlog.path().with_file_name("backlog.json.corrupt").exists());
    }

    #[tokio::test]
    async fn test_failed_rename_removes_temp_file() {
        let (backlog, _temp_dir) = create_test_backlog(RetentionPolicy::unlimited());
        fs::create_dir(backlog.path()).await.unwrap();
        fs::write(backlog.path().join("keep"), "x").await.unwrap();

        assert!(backlog.store(&[record("A")]).await.is_err());
        assert!(!backlog.path().with_file_name("backlog.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_retention_max_entries_evicts_oldest() {
        let (backlog, _temp_dir) = create_test_backlog(RetentionPolicy {
            max_entries: 2,
            max_age_hours: 0,
        });
        for l in ["A", "B", "C"] {
            backlog.append(record(l)).await.unwrap();
        }

        assert_eq!(labels(&backlog).await, vec!["B", "C"]);
    }

    #[test]
    fn test_retention_max_age_evicts_expired() {
        let policy = RetentionPolicy {
            max_entries: 0,
            max_age_hours: 24,
        };
        let old_at = Local::now() - ChronoDuration::hours(48);
        let mut old = Record::new(&old_at);
        old.insert(Metric::SolarPower, Observation::absent());
        let unparseable = Record {
            datetime: "unknown".to_string(),
            observations: BTreeMap::new(),
        };
        let fresh = record("fresh");

        let mut entries = vec![old, unparseable.clone(), fresh.clone()];
        assert_eq!(policy.apply(&mut entries), 1);
        assert_eq!(entries, vec![unparseable, fresh]);
    }

    #[test]
    fn test_retention_unlimited_keeps_everything() {
        let at = Local.with_ymd_and_hms(2001, 1, 1, 0, 0, 0).unwrap();
        let mut entries = vec![Record::new(&at); 50];
        assert_eq!(RetentionPolicy::unlimited().apply(&mut entries), 0);
        assert_eq!(entries.len(), 50);
    }
}
