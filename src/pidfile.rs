//! Durable PID registry.
//!
//! The registry is the engine's only durable state: one JSON document per
//! user recording which OS processes the supervisor spawned, so a later run
//! can detect survivors of a crash. Log content and health state are never
//! persisted. Absence of the file is the canonical "no tracked processes"
//! state: the file is deleted, not emptied, when the last entry goes.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{Result, SupervisorError};

/// Current on-disk format version.
pub const PID_FILE_VERSION: u32 = 1;

/// One tracked process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PidFileEntry {
    pub tool_index: usize,
    pub tool_name: String,
    pub pid: u32,
    /// Spawn time in epoch milliseconds.
    pub start_time: u64,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

/// The on-disk document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PidFileData {
    pub version: u32,
    pub processes: Vec<PidFileEntry>,
}

impl PidFileData {
    pub fn new(processes: Vec<PidFileEntry>) -> Self {
        Self {
            version: PID_FILE_VERSION,
            processes,
        }
    }
}

/// Handle to the registry file.
///
/// Every mutation is a load-modify-save cycle over the shared file, so all
/// mutating operations hold one lock across the whole cycle. Tasks that
/// observe exits concurrently each land their own removal instead of
/// overwriting each other's. Clones share the lock.
#[derive(Debug, Clone)]
pub struct PidRegistry {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl PidRegistry {
    /// A registry at an explicit path. Tests point this at a temp dir.
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// The fixed per-user location, `~/.toolbay/processes.json`.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .expect("could not determine home directory")
            .join(".toolbay")
            .join("processes.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the registry. Returns `None` when the file is absent or
    /// unreadable or its contents do not parse; a corrupt registry is
    /// treated the same as no registry, never an error.
    pub fn load(&self) -> Option<PidFileData> {
        if !self.path.exists() {
            return None;
        }
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read pid file, ignoring");
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(data) => Some(data),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to parse pid file, ignoring");
                None
            }
        }
    }

    /// Atomically replaces the registry contents.
    pub fn save(&self, data: &PidFileData) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.persist(data)
    }

    /// Writes to a temp file in the same directory, then renames over the
    /// target, so a crash mid-write never leaves a torn document. Callers
    /// hold the mutation lock.
    fn persist(&self, data: &PidFileData) -> Result<()> {
        let parent = self.path.parent().ok_or_else(|| SupervisorError::PidFile {
            path: self.path.clone(),
            source: std::io::Error::other("pid file path has no parent directory"),
        })?;
        std::fs::create_dir_all(parent).map_err(|e| SupervisorError::PidFile {
            path: self.path.clone(),
            source: e,
        })?;

        let content =
            serde_json::to_string_pretty(data).map_err(|e| SupervisorError::PidFile {
                path: self.path.clone(),
                source: std::io::Error::other(e),
            })?;

        let mut tmp =
            tempfile::NamedTempFile::new_in(parent).map_err(|e| SupervisorError::PidFile {
                path: self.path.clone(),
                source: e,
            })?;
        tmp.write_all(content.as_bytes())
            .map_err(|e| SupervisorError::PidFile {
                path: self.path.clone(),
                source: e,
            })?;
        tmp.persist(&self.path).map_err(|e| SupervisorError::PidFile {
            path: self.path.clone(),
            source: e.error,
        })?;

        debug!(path = %self.path.display(), entries = data.processes.len(), "saved pid file");
        Ok(())
    }

    /// Inserts or replaces the entry for `entry.tool_index`.
    pub fn update(&self, entry: PidFileEntry) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut data = self
            .load()
            .unwrap_or_else(|| PidFileData::new(Vec::new()));
        match data
            .processes
            .iter_mut()
            .find(|e| e.tool_index == entry.tool_index)
        {
            Some(existing) => *existing = entry,
            None => data.processes.push(entry),
        }
        self.persist(&data)
    }

    /// Drops the entry for `tool_index`. Deletes the file entirely once it
    /// would become empty.
    pub fn remove(&self, tool_index: usize) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let Some(mut data) = self.load() else {
            return Ok(());
        };
        data.processes.retain(|e| e.tool_index != tool_index);
        if data.processes.is_empty() {
            self.delete()
        } else {
            self.persist(&data)
        }
    }

    /// Deletes the registry file.
    pub fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.delete()
    }

    fn delete(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "removed pid file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SupervisorError::PidFile {
                path: self.path.clone(),
                source: e,
            }),
        }
    }

    /// Entries from a previous run whose process is still alive.
    ///
    /// Liveness probing needs unix signals; on other platforms this returns
    /// nothing and the scan is skipped.
    pub fn find_orphans(&self) -> Vec<PidFileEntry> {
        let Some(data) = self.load() else {
            return Vec::new();
        };
        data.processes
            .into_iter()
            .filter(|entry| process_alive(entry.pid))
            .collect()
    }
}

/// Whether a pid refers to a live process this user can signal.
#[cfg(unix)]
pub(crate) fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
pub(crate) fn process_alive(_pid: u32) -> bool {
    false
}

/// Terminates an orphaned process: SIGTERM, a bounded wait for it to exit,
/// then SIGKILL. Returns `true` once the process is gone. A pid that
/// disappears between liveness checks (ESRCH) counts as success.
#[cfg(unix)]
pub(crate) async fn terminate_pid(pid: u32) -> bool {
    use std::time::Duration;

    let pid_i32 = pid as i32;
    if unsafe { libc::kill(pid_i32, 0) } != 0 {
        return true;
    }
    if unsafe { libc::kill(pid_i32, libc::SIGTERM) } != 0 {
        return std::io::Error::last_os_error().raw_os_error() == Some(libc::ESRCH);
    }
    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(200)).await;
        if unsafe { libc::kill(pid_i32, 0) } != 0 {
            return true;
        }
    }
    if unsafe { libc::kill(pid_i32, libc::SIGKILL) } != 0 {
        return std::io::Error::last_os_error().raw_os_error() == Some(libc::ESRCH);
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    unsafe { libc::kill(pid_i32, 0) != 0 }
}

#[cfg(not(unix))]
pub(crate) async fn terminate_pid(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(index: usize, name: &str, pid: u32) -> PidFileEntry {
        PidFileEntry {
            tool_index: index,
            tool_name: name.to_string(),
            pid,
            start_time: 1_700_000_000_000,
            command: "node".to_string(),
            args: vec!["server.js".to_string()],
            cwd: PathBuf::from("/tmp"),
        }
    }

    fn registry(dir: &TempDir) -> PidRegistry {
        PidRegistry::new(dir.path().join("processes.json"))
    }

    #[test]
    fn load_returns_none_when_absent() {
        let dir = TempDir::new().unwrap();
        assert!(registry(&dir).load().is_none());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let data = PidFileData::new(vec![entry(0, "api", 100), entry(1, "web", 101)]);
        reg.save(&data).unwrap();
        assert_eq!(reg.load().unwrap(), data);
    }

    #[test]
    fn serialized_keys_are_camel_case() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        reg.save(&PidFileData::new(vec![entry(3, "api", 42)]))
            .unwrap();
        let raw = std::fs::read_to_string(reg.path()).unwrap();
        assert!(raw.contains("\"toolIndex\": 3"));
        assert!(raw.contains("\"toolName\": \"api\""));
        assert!(raw.contains("\"startTime\""));
        assert!(raw.contains("\"version\": 1"));
    }

    #[test]
    fn update_upserts_by_tool_index() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        reg.update(entry(0, "api", 100)).unwrap();
        reg.update(entry(1, "web", 101)).unwrap();
        reg.update(entry(0, "api", 200)).unwrap();

        let data = reg.load().unwrap();
        assert_eq!(data.processes.len(), 2);
        assert_eq!(data.processes[0].pid, 200);
        assert_eq!(data.processes[1].pid, 101);
    }

    #[test]
    fn removing_last_entry_deletes_the_file() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        reg.update(entry(0, "api", 100)).unwrap();
        reg.update(entry(1, "web", 101)).unwrap();

        reg.remove(0).unwrap();
        assert!(reg.path().exists());
        assert_eq!(reg.load().unwrap().processes.len(), 1);

        reg.remove(1).unwrap();
        assert!(!reg.path().exists());
        assert!(reg.load().is_none());
    }

    #[test]
    fn remove_without_file_is_a_noop() {
        let dir = TempDir::new().unwrap();
        registry(&dir).remove(7).unwrap();
    }

    #[test]
    fn corrupt_file_loads_as_none() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        std::fs::write(reg.path(), "not json{").unwrap();
        assert!(reg.load().is_none());
    }

    #[test]
    fn clear_removes_the_file() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        reg.update(entry(0, "api", 100)).unwrap();
        reg.clear().unwrap();
        assert!(!reg.path().exists());
        reg.clear().unwrap();
    }

    // Two tools exiting at once remove their entries from separate tasks.
    #[test]
    fn concurrent_removes_delete_the_file() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        for round in 0..200 {
            reg.save(&PidFileData::new(vec![
                entry(0, "api", 100),
                entry(1, "web", 101),
            ]))
            .unwrap();

            let a = reg.clone();
            let b = reg.clone();
            let t1 = std::thread::spawn(move || a.remove(0).unwrap());
            let t2 = std::thread::spawn(move || b.remove(1).unwrap());
            t1.join().unwrap();
            t2.join().unwrap();

            assert!(
                !reg.path().exists(),
                "round {round}: every entry was removed but the file survived: {:?}",
                reg.load().map(|d| d.processes)
            );
        }
    }

    #[test]
    fn update_racing_remove_keeps_the_updated_entry() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        for round in 0..200 {
            reg.save(&PidFileData::new(vec![entry(0, "api", 100)]))
                .unwrap();

            let a = reg.clone();
            let b = reg.clone();
            let t1 = std::thread::spawn(move || a.update(entry(1, "web", 101)).unwrap());
            let t2 = std::thread::spawn(move || b.remove(0).unwrap());
            t1.join().unwrap();
            t2.join().unwrap();

            let data = reg.load().unwrap_or_else(|| {
                panic!("round {round}: the entry written by update was lost")
            });
            let indices: Vec<usize> =
                data.processes.iter().map(|e| e.tool_index).collect();
            assert_eq!(indices, vec![1], "round {round}");
        }
    }

    #[cfg(unix)]
    #[test]
    fn dead_pids_are_not_orphans() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        // pid from a long-gone range; kill(pid, 0) fails with ESRCH
        reg.update(entry(0, "ghost", u32::MAX / 2)).unwrap();
        assert!(reg.find_orphans().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn own_pid_counts_as_alive() {
        assert!(process_alive(std::process::id()));
    }
}
