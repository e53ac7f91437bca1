//! Repository-level execution lock.
//!
//! Atomic create-if-not-exists on `.lonelycat/locks/execution.lock`; the file
//! carries the holder's metadata. Acquisition polls at 1 s and times out at
//! 600 s by default. A lock is considered stale only when it is older than the
//! stale threshold AND the recorded pid cannot be confirmed alive.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::ExecutorError;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(7200);
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Metadata written into the lock file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockInfo {
    pub execution_id: String,
    pub plan_id: String,
    pub acquired_at: DateTime<Utc>,
    pub pid: u32,
    pub hostname: String,
}

pub struct ExecutionLock {
    lock_file: PathBuf,
    timeout: Duration,
    stale_threshold: Duration,
}

impl ExecutionLock {
    pub fn new(workspace_root: &Path) -> Result<Self, ExecutorError> {
        Self::with_timeouts(workspace_root, DEFAULT_TIMEOUT, DEFAULT_STALE_THRESHOLD)
    }

    pub fn with_timeouts(
        workspace_root: &Path,
        timeout: Duration,
        stale_threshold: Duration,
    ) -> Result<Self, ExecutorError> {
        let lock_dir = workspace_root.join(".lonelycat").join("locks");
        std::fs::create_dir_all(&lock_dir)?;
        Ok(Self {
            lock_file: lock_dir.join("execution.lock"),
            timeout,
            stale_threshold,
        })
    }

    /// Acquire the lock, blocking up to the configured timeout. On timeout, a
    /// stale lock is cleaned up and one more attempt is made.
    pub fn acquire(&self, execution_id: &str, plan_id: &str) -> Result<LockGuard, ExecutorError> {
        let start = Instant::now();
        loop {
            if let Some(guard) = self.try_acquire(execution_id, plan_id)? {
                info!(execution_id, "execution lock acquired");
                return Ok(guard);
            }

            if start.elapsed() >= self.timeout {
                if self.is_stale() {
                    warn!("detected stale execution lock, attempting cleanup");
                    let _ = std::fs::remove_file(&self.lock_file);
                    if let Some(guard) = self.try_acquire(execution_id, plan_id)? {
                        info!(execution_id, "lock acquired after stale cleanup");
                        return Ok(guard);
                    }
                }
                let holder = self
                    .read_lock()
                    .map(|i| i.execution_id)
                    .unwrap_or_else(|| "unknown".to_string());
                return Err(ExecutorError::LockAcquisition(format!(
                    "could not acquire lock after {}s, held by {holder}",
                    self.timeout.as_secs()
                )));
            }

            std::thread::sleep(POLL_INTERVAL.min(self.timeout));
        }
    }

    fn try_acquire(
        &self,
        execution_id: &str,
        plan_id: &str,
    ) -> Result<Option<LockGuard>, ExecutorError> {
        let mut file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_file)
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let info = LockInfo {
            execution_id: execution_id.to_string(),
            plan_id: plan_id.to_string(),
            acquired_at: Utc::now(),
            pid: std::process::id(),
            hostname: hostname(),
        };
        file.write_all(serde_json::to_string_pretty(&info)?.as_bytes())?;
        Ok(Some(LockGuard {
            lock_file: self.lock_file.clone(),
            execution_id: execution_id.to_string(),
        }))
    }

    pub fn is_locked(&self) -> bool {
        self.lock_file.exists()
    }

    pub fn lock_info(&self) -> Option<LockInfo> {
        self.read_lock()
    }

    fn read_lock(&self) -> Option<LockInfo> {
        let content = std::fs::read_to_string(&self.lock_file).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Stale requires both: old enough, and holder pid not provably alive.
    fn is_stale(&self) -> bool {
        let Some(info) = self.read_lock() else {
            return false;
        };
        let age = Utc::now().signed_duration_since(info.acquired_at);
        if age.num_seconds() < self.stale_threshold.as_secs() as i64 {
            return false;
        }
        if process_alive(info.pid) {
            warn!(pid = info.pid, "lock is old but holder process is still alive");
            return false;
        }
        warn!(
            pid = info.pid,
            age_seconds = age.num_seconds(),
            "lock is stale, holder process not running"
        );
        true
    }
}

/// Releases the lock on drop after verifying ownership by execution id.
#[derive(Debug)]
pub struct LockGuard {
    lock_file: PathBuf,
    execution_id: String,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let owned = std::fs::read_to_string(&self.lock_file)
            .ok()
            .and_then(|c| serde_json::from_str::<LockInfo>(&c).ok())
            .map(|i| i.execution_id == self.execution_id)
            .unwrap_or(false);
        if owned {
            if let Err(e) = std::fs::remove_file(&self.lock_file) {
                warn!(error = %e, "failed to release execution lock");
            } else {
                info!(execution_id = %self.execution_id, "execution lock released");
            }
        } else {
            warn!(
                execution_id = %self.execution_id,
                "lock ownership mismatch on release, leaving lock file in place"
            );
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Best-effort liveness probe. Conservative: when the check cannot be made the
/// process is assumed alive.
#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn short_lock(ws: &Path) -> ExecutionLock {
        ExecutionLock::with_timeouts(ws, Duration::from_millis(50), DEFAULT_STALE_THRESHOLD)
            .unwrap()
    }

    #[test]
    fn acquire_writes_metadata_and_release_removes_file() {
        let ws = tempfile::tempdir().unwrap();
        let lock = ExecutionLock::new(ws.path()).unwrap();

        let guard = lock.acquire("exec_1", "plan_1").unwrap();
        assert!(lock.is_locked());
        let info = lock.lock_info().unwrap();
        assert_eq!(info.execution_id, "exec_1");
        assert_eq!(info.plan_id, "plan_1");
        assert_eq!(info.pid, std::process::id());

        drop(guard);
        assert!(!lock.is_locked());
    }

    #[test]
    fn second_acquire_times_out_while_held() {
        let ws = tempfile::tempdir().unwrap();
        let lock = short_lock(ws.path());

        let _guard = lock.acquire("exec_1", "plan_1").unwrap();
        let second = short_lock(ws.path());
        let err = second.acquire("exec_2", "plan_2").unwrap_err();
        assert!(matches!(err, ExecutorError::LockAcquisition(_)));
        assert!(err.to_string().contains("exec_1"));
    }

    #[test]
    fn sequential_acquires_succeed() {
        let ws = tempfile::tempdir().unwrap();
        let lock = ExecutionLock::new(ws.path()).unwrap();
        drop(lock.acquire("exec_1", "plan_1").unwrap());
        drop(lock.acquire("exec_2", "plan_2").unwrap());
        assert!(!lock.is_locked());
    }

    #[test]
    fn stale_lock_with_dead_pid_is_cleaned_up() {
        let ws = tempfile::tempdir().unwrap();
        let lock =
            ExecutionLock::with_timeouts(ws.path(), Duration::from_millis(50), Duration::ZERO)
                .unwrap();

        // Plant a lock from a long-gone process, acquired far in the past.
        let stale = LockInfo {
            execution_id: "exec_dead".to_string(),
            plan_id: "plan_dead".to_string(),
            acquired_at: Utc::now() - chrono::Duration::hours(3),
            pid: u32::MAX - 1,
            hostname: "ghost".to_string(),
        };
        std::fs::write(
            ws.path().join(".lonelycat/locks/execution.lock"),
            serde_json::to_string(&stale).unwrap(),
        )
        .unwrap();

        let guard = lock.acquire("exec_new", "plan_new").unwrap();
        assert_eq!(lock.lock_info().unwrap().execution_id, "exec_new");
        drop(guard);
    }

    #[test]
    fn fresh_foreign_lock_is_not_stale() {
        let ws = tempfile::tempdir().unwrap();
        let lock = short_lock(ws.path());

        let fresh = LockInfo {
            execution_id: "exec_other".to_string(),
            plan_id: "plan_other".to_string(),
            acquired_at: Utc::now(),
            pid: u32::MAX - 1,
            hostname: "other".to_string(),
        };
        std::fs::write(
            ws.path().join(".lonelycat/locks/execution.lock"),
            serde_json::to_string(&fresh).unwrap(),
        )
        .unwrap();

        assert!(lock.acquire("exec_new", "plan_new").is_err());
        // The foreign lock survives the failed attempt.
        assert_eq!(lock.lock_info().unwrap().execution_id, "exec_other");
    }

    #[test]
    fn concurrent_threads_serialize() {
        let ws = tempfile::tempdir().unwrap();
        let root = ws.path().to_path_buf();
        let counter = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let max_seen = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let root = root.clone();
                let counter = counter.clone();
                let max_seen = max_seen.clone();
                std::thread::spawn(move || {
                    let lock = ExecutionLock::new(&root).unwrap();
                    let _guard = lock
                        .acquire(&format!("exec_{i}"), &format!("plan_{i}"))
                        .unwrap();
                    let inside =
                        counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                    max_seen.fetch_max(inside, std::sync::atomic::Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    counter.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max_seen.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
