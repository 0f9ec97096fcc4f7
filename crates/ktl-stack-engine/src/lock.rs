use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lock file location under a stack root.
pub const LOCK_FILE: &str = ".ktl/stack/lock";

/// Contents of the run lock. A lock is stale (reclaimable without
/// takeover) once `acquired_at + ttl` has passed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub owner: String,
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
    pub ttl_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

impl LockInfo {
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        let age = now - self.acquired_at;
        age.num_seconds() >= 0 && age.num_seconds() as u64 > self.ttl_secs
    }
}

/// Exclusive run lock keyed by stack root, released on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

/// Default owner string: `user@host:pid`.
pub fn default_owner() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    let host = gethostname::gethostname().to_string_lossy().to_string();
    format!("{user}@{host}:{}", std::process::id())
}

impl RunLock {
    /// Acquire the lock for a stack root. An existing fresh lock fails
    /// unless `takeover` is set; a stale lock is reclaimed silently.
    pub fn acquire(
        stack_root: &Path,
        owner: &str,
        ttl: Duration,
        takeover: bool,
    ) -> Result<Self> {
        let path = stack_root.join(LOCK_FILE);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create lock dir {}", parent.display()))?;
        }

        if path.exists() {
            match read_lock(&path) {
                Ok(existing) => {
                    if !existing.is_stale(Utc::now()) && !takeover {
                        bail!(
                            "stack is locked by {} (pid {} on {}) since {}; \
                             pass takeover to override",
                            existing.owner,
                            existing.pid,
                            existing.hostname,
                            existing.acquired_at
                        );
                    }
                }
                // A corrupt lock file is treated as stale.
                Err(_) => {}
            }
            fs::remove_file(&path)
                .with_context(|| format!("failed to remove lock file {}", path.display()))?;
        }

        let info = LockInfo {
            owner: owner.to_string(),
            pid: std::process::id(),
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            acquired_at: Utc::now(),
            ttl_secs: ttl.as_secs(),
            run_id: None,
        };
        write_lock(&path, &info)?;
        Ok(Self { path })
    }

    /// Record the run id in the lock for diagnostics.
    pub fn set_run_id(&self, run_id: &str) -> Result<()> {
        let mut info = read_lock(&self.path)?;
        info.run_id = Some(run_id.to_string());
        write_lock(&self.path, &info)
    }

    pub fn info(stack_root: &Path) -> Result<Option<LockInfo>> {
        let path = stack_root.join(LOCK_FILE);
        if !path.exists() {
            return Ok(None);
        }
        read_lock(&path).map(Some)
    }

    pub fn release(&mut self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)
                .with_context(|| format!("failed to remove lock file {}", self.path.display()))?;
        }
        Ok(())
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

fn read_lock(path: &Path) -> Result<LockInfo> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read lock file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse lock file {}", path.display()))
}

fn write_lock(path: &Path, info: &LockInfo) -> Result<()> {
    let json = serde_json::to_string_pretty(info).context("failed to serialize lock info")?;
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)
            .with_context(|| format!("failed to create lock tmp file {}", tmp.display()))?;
        file.write_all(json.as_bytes())
            .with_context(|| format!("failed to write lock tmp file {}", tmp.display()))?;
        file.sync_all().context("failed to sync lock file")?;
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename lock file to {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_and_release_removes() {
        let td = tempfile::tempdir().expect("tempdir");
        let mut lock =
            RunLock::acquire(td.path(), "me@host:1", Duration::from_secs(600), false)
                .expect("acquire");
        let info = RunLock::info(td.path()).expect("read").expect("present");
        assert_eq!(info.owner, "me@host:1");
        assert_eq!(info.pid, std::process::id());

        lock.release().expect("release");
        assert!(RunLock::info(td.path()).expect("read").is_none());
    }

    #[test]
    fn fresh_lock_refuses_second_acquire() {
        let td = tempfile::tempdir().expect("tempdir");
        let _lock = RunLock::acquire(td.path(), "a", Duration::from_secs(600), false)
            .expect("first acquire");
        let err = RunLock::acquire(td.path(), "b", Duration::from_secs(600), false)
            .expect_err("must fail");
        assert!(format!("{err:#}").contains("stack is locked by a"));
    }

    #[test]
    fn takeover_overrides_a_fresh_lock() {
        let td = tempfile::tempdir().expect("tempdir");
        let _lock = RunLock::acquire(td.path(), "a", Duration::from_secs(600), false)
            .expect("first acquire");
        let _second = RunLock::acquire(td.path(), "b", Duration::from_secs(600), true)
            .expect("takeover");
        let info = RunLock::info(td.path()).expect("read").expect("present");
        assert_eq!(info.owner, "b");
    }

    #[test]
    fn stale_lock_is_reclaimed_without_takeover() {
        let td = tempfile::tempdir().expect("tempdir");
        let path = td.path().join(LOCK_FILE);
        fs::create_dir_all(path.parent().unwrap()).expect("mkdir");
        let stale = LockInfo {
            owner: "old".to_string(),
            pid: 1,
            hostname: "gone".to_string(),
            acquired_at: Utc::now() - chrono::Duration::hours(2),
            ttl_secs: 60,
            run_id: None,
        };
        fs::write(&path, serde_json::to_string(&stale).unwrap()).expect("seed");

        let _lock = RunLock::acquire(td.path(), "new", Duration::from_secs(600), false)
            .expect("reclaim stale");
        let info = RunLock::info(td.path()).expect("read").expect("present");
        assert_eq!(info.owner, "new");
    }

    #[test]
    fn corrupt_lock_is_reclaimed() {
        let td = tempfile::tempdir().expect("tempdir");
        let path = td.path().join(LOCK_FILE);
        fs::create_dir_all(path.parent().unwrap()).expect("mkdir");
        fs::write(&path, "not json").expect("seed");
        let _lock = RunLock::acquire(td.path(), "new", Duration::from_secs(600), false)
            .expect("reclaim corrupt");
    }

    #[test]
    fn drop_releases_the_lock() {
        let td = tempfile::tempdir().expect("tempdir");
        {
            let _lock = RunLock::acquire(td.path(), "a", Duration::from_secs(600), false)
                .expect("acquire");
        }
        assert!(RunLock::info(td.path()).expect("read").is_none());
    }

    #[test]
    fn set_run_id_is_visible_to_readers() {
        let td = tempfile::tempdir().expect("tempdir");
        let lock = RunLock::acquire(td.path(), "a", Duration::from_secs(600), false)
            .expect("acquire");
        lock.set_run_id("run-42").expect("set run id");
        let info = RunLock::info(td.path()).expect("read").expect("present");
        assert_eq!(info.run_id.as_deref(), Some("run-42"));
    }

    #[test]
    fn default_owner_has_user_host_pid_shape() {
        let owner = default_owner();
        assert!(owner.contains('@'));
        assert!(owner.ends_with(&format!(":{}", std::process::id())));
    }
}
