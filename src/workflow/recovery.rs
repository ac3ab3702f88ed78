use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::workflow::model::{TaskId, TaskResult};
use crate::workflow::state::StateManager;

const RECOVERY_VERSION: &str = "1.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureInfo {
    pub task_id: TaskId,
    pub exit_code: i32,
    pub error: String,
}

/// Snapshot of a run, written under `<log_dir>/recovery/` so a later
/// invocation can judge whether `--start-from` is safe.
#[derive(Debug, Serialize, Deserialize)]
pub struct RecoveryState {
    pub version: String,
    pub task_file_path: String,
    pub task_file_hash: String,
    pub created: String,
    pub updated: String,
    pub log_file: String,
    pub execution_path: Vec<TaskId>,
    pub current_task: TaskId,
    pub task_results: HashMap<TaskId, TaskResult>,
    pub global_vars: HashMap<String, String>,
    pub failure_info: Option<FailureInfo>,
}

pub struct RecoveryManager {
    task_file: PathBuf,
    recovery_file: PathBuf,
}

impl RecoveryManager {
    pub fn new(task_file: &Path, log_dir: &Path) -> std::io::Result<Self> {
        let task_file = task_file.canonicalize().unwrap_or_else(|_| task_file.to_path_buf());

        // <basename>_<sha256(path)[:8]>.recovery.json
        let path_hash = hex_digest(task_file.to_string_lossy().as_bytes());
        let basename = task_file
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("task");
        let recovery_dir = log_dir.join("recovery");
        std::fs::create_dir_all(&recovery_dir)?;

        Ok(RecoveryManager {
            recovery_file: recovery_dir.join(format!(
                "{}_{}.recovery.json",
                basename,
                &path_hash[..8]
            )),
            task_file,
        })
    }

    pub fn recovery_file(&self) -> &Path {
        &self.recovery_file
    }

    pub fn exists(&self) -> bool {
        self.recovery_file.exists()
    }

    fn task_file_hash(&self) -> std::io::Result<String> {
        let content = std::fs::read(&self.task_file)?;
        Ok(hex_digest(&content))
    }

    /// Persist the current run state. An existing snapshot keeps its
    /// original `created` timestamp.
    pub fn save_state(
        &self,
        state: &StateManager,
        log_file: &str,
        failure_info: Option<FailureInfo>,
    ) -> std::io::Result<()> {
        let now = chrono::Local::now().to_rfc3339();
        let created = self
            .load_state()
            .map(|existing| existing.created)
            .unwrap_or_else(|| now.clone());

        let task_results = state.all_task_results();
        let mut execution_path = state.execution_path();
        if execution_path.is_empty() {
            // Reconstruct from successful results when the caller never
            // tracked the path explicitly.
            let mut ids: Vec<TaskId> = task_results
                .iter()
                .filter(|(_, r)| r.success)
                .map(|(id, _)| *id)
                .collect();
            ids.sort_unstable();
            execution_path = ids;
        }

        let snapshot = RecoveryState {
            version: RECOVERY_VERSION.to_string(),
            task_file_path: self.task_file.to_string_lossy().into_owned(),
            task_file_hash: self.task_file_hash()?,
            created,
            updated: now,
            log_file: log_file.to_string(),
            execution_path,
            current_task: state.current_task(),
            task_results,
            global_vars: state.globals(),
            failure_info,
        };

        let json = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(&self.recovery_file, json)?;
        debug!("recovery state saved to {:?}", self.recovery_file);
        Ok(())
    }

    pub fn load_state(&self) -> Option<RecoveryState> {
        let content = std::fs::read_to_string(&self.recovery_file).ok()?;
        match serde_json::from_str(&content) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!("failed to load recovery state: {}", e);
                None
            }
        }
    }

    /// A snapshot is only safe to resume from when the task file still
    /// exists, its content hash matches, and the snapshot version is known.
    pub fn validate_state(&self, snapshot: &RecoveryState) -> Result<(), String> {
        if !self.task_file.exists() {
            return Err(format!("task file no longer exists: {:?}", self.task_file));
        }
        let current_hash = self
            .task_file_hash()
            .map_err(|e| format!("cannot hash task file: {}", e))?;
        if current_hash != snapshot.task_file_hash {
            return Err("task file has been modified since the recovery state was saved".to_string());
        }
        if snapshot.version != RECOVERY_VERSION {
            return Err(format!(
                "incompatible recovery state version: {} (expected {})",
                snapshot.version, RECOVERY_VERSION
            ));
        }
        Ok(())
    }

    /// Called on clean completion.
    pub fn delete(&self) {
        if self.recovery_file.exists() {
            if let Err(e) = std::fs::remove_file(&self.recovery_file) {
                warn!("failed to delete recovery file: {}", e);
            }
        }
    }
}

fn hex_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let task_file = dir.path().join("deploy.txt");
        std::fs::write(&task_file, "task=0\ncommand=true\n").unwrap();
        (dir, task_file)
    }

    #[test]
    fn test_save_load_round_trip() {
        let (dir, task_file) = setup();
        let manager = RecoveryManager::new(&task_file, dir.path()).unwrap();
        assert!(!manager.exists());

        let state = StateManager::new();
        state.store_task_result(
            0,
            TaskResult {
                exit_code: 0,
                stdout: "ok".to_string(),
                success: true,
                ..Default::default()
            },
        );
        state.append_to_execution_path(0);
        state.set_current_task(0);

        manager.save_state(&state, "run.log", None).unwrap();
        assert!(manager.exists());

        let snapshot = manager.load_state().unwrap();
        assert_eq!(snapshot.version, RECOVERY_VERSION);
        assert_eq!(snapshot.execution_path, vec![0]);
        assert_eq!(snapshot.task_results[&0].stdout, "ok");
        manager.validate_state(&snapshot).unwrap();
    }

    #[test]
    fn test_modified_task_file_invalidates() {
        let (dir, task_file) = setup();
        let manager = RecoveryManager::new(&task_file, dir.path()).unwrap();
        manager
            .save_state(&StateManager::new(), "run.log", None)
            .unwrap();

        std::fs::write(&task_file, "task=0\ncommand=false\n").unwrap();
        let snapshot = manager.load_state().unwrap();
        let err = manager.validate_state(&snapshot).unwrap_err();
        assert!(err.contains("modified"));
    }

    #[test]
    fn test_failure_info_persisted_and_deleted() {
        let (dir, task_file) = setup();
        let manager = RecoveryManager::new(&task_file, dir.path()).unwrap();
        manager
            .save_state(
                &StateManager::new(),
                "run.log",
                Some(FailureInfo {
                    task_id: 3,
                    exit_code: 10,
                    error: "next condition not met".to_string(),
                }),
            )
            .unwrap();

        let snapshot = manager.load_state().unwrap();
        let failure = snapshot.failure_info.unwrap();
        assert_eq!(failure.task_id, 3);
        assert_eq!(failure.exit_code, 10);

        manager.delete();
        assert!(!manager.exists());
    }
}
