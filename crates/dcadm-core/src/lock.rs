//! Process-wide file lock.
//!
//! One lock file at a well-known path guarantees a single planner/executor
//! per host. The file holds JSON metadata about the holder (PID, hostname,
//! acquisition time, plan id). Acquisition blocks indefinitely, emitting a
//! progress line after one second of waiting; a sentinel left by a dead
//! process on the same host is reclaimed. Release is idempotent and also
//! happens on Drop.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Reporter;

const POLL_PERIOD: Duration = Duration::from_millis(500);
const PROGRESS_AFTER: Duration = Duration::from_secs(1);

/// Metadata stored in the lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
    pub plan_id: Option<String>,
}

/// The held lock. Callers pass it (by reference) to operations that
/// require mutual exclusion; dropping it releases the file.
#[derive(Debug)]
pub struct HeldLock {
    path: PathBuf,
    released: bool,
}

/// Acquire the lock, blocking until the current holder releases it or its
/// sentinel proves stale.
pub fn acquire(path: &Path, reporter: &mut dyn Reporter) -> Result<HeldLock> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create lock dir {}", parent.display()))?;
    }

    let started = Instant::now();
    let mut announced = false;

    loop {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => {
                write_direct(file, path, &current_info())?;
                return Ok(HeldLock {
                    path: path.to_path_buf(),
                    released: false,
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                match read_info(path) {
                    Ok(info) if is_stale(&info) => {
                        reporter.warn(&format!(
                            "removing stale lock left by dead pid {} on {}",
                            info.pid, info.hostname
                        ));
                        let _ = fs::remove_file(path);
                        continue;
                    }
                    Ok(info) => {
                        if !announced && started.elapsed() >= PROGRESS_AFTER {
                            reporter.info(&format!(
                                "waiting for lock {} held by pid {} on {} since {}",
                                path.display(),
                                info.pid,
                                info.hostname,
                                info.acquired_at
                            ));
                            announced = true;
                        }
                    }
                    // Unreadable sentinel: likely mid-write by the holder;
                    // keep waiting rather than steal.
                    Err(_) => {}
                }
                std::thread::sleep(POLL_PERIOD);
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to create lock file {}", path.display())
                });
            }
        }
    }
}

impl HeldLock {
    /// Record the plan id being executed under this lock.
    pub fn set_plan_id(&self, plan_id: &str) -> Result<()> {
        let mut info = read_info(&self.path)?;
        info.plan_id = Some(plan_id.to_string());

        let tmp = tmp_path(&self.path);
        let file = File::create(&tmp)
            .with_context(|| format!("failed to create lock tmp file {}", tmp.display()))?;
        write_direct(file, &tmp, &info)?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to rename lock file to {}", self.path.display()))
    }

    /// Release the lock. Safe to call more than once.
    pub fn release(&mut self) -> Result<()> {
        if !self.released && self.path.exists() {
            fs::remove_file(&self.path)
                .with_context(|| format!("failed to remove lock file {}", self.path.display()))?;
        }
        self.released = true;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

pub fn read_info(path: &Path) -> Result<LockInfo> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read lock file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse lock JSON from {}", path.display()))
}

fn current_info() -> LockInfo {
    LockInfo {
        pid: std::process::id(),
        hostname: gethostname::gethostname().to_string_lossy().to_string(),
        acquired_at: Utc::now(),
        plan_id: None,
    }
}

/// A sentinel is stale when it was written by this host and the holding
/// process no longer exists.
fn is_stale(info: &LockInfo) -> bool {
    let us = gethostname::gethostname().to_string_lossy().to_string();
    if info.hostname != us {
        return false;
    }
    !process_alive(info.pid)
}

fn process_alive(pid: u32) -> bool {
    let proc_root = Path::new("/proc");
    if !proc_root.exists() {
        // No procfs to consult: never steal.
        return true;
    }
    proc_root.join(pid.to_string()).exists()
}

fn tmp_path(path: &Path) -> PathBuf {
    path.with_extension("tmp")
}

fn write_direct(mut file: File, path: &Path, info: &LockInfo) -> Result<()> {
    let json = serde_json::to_string_pretty(info).context("failed to serialize lock info")?;
    file.write_all(json.as_bytes())
        .with_context(|| format!("failed to write lock file {}", path.display()))?;
    file.sync_all().context("failed to sync lock file")
}
