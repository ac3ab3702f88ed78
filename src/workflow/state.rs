use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::workflow::model::{Globals, Task, TaskId, TaskResult, TaskResults};

/// Thread-safe store for everything mutable during a run: task results, loop
/// bookkeeping, globals, the current-task cursor, and the execution path.
///
/// One mutex guards the whole struct. Critical sections are tiny and never
/// span an await point; getters hand out defensive copies so callers hold no
/// borrow into the store.
#[derive(Default)]
pub struct StateManager {
    inner: Mutex<State>,
}

#[derive(Default)]
struct State {
    tasks: BTreeMap<TaskId, Task>,
    task_results: TaskResults,
    current_task: TaskId,
    loop_counter: HashMap<TaskId, i64>,
    loop_iterations: HashMap<TaskId, u32>,
    globals: Globals,
    execution_path: Vec<TaskId>,
    failed_due_to_condition: bool,
}

impl StateManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ----- task results -----

    pub fn store_task_result(&self, task_id: TaskId, result: TaskResult) {
        self.lock().task_results.insert(task_id, result);
    }

    pub fn task_result(&self, task_id: TaskId) -> Option<TaskResult> {
        self.lock().task_results.get(&task_id).cloned()
    }

    pub fn has_task_result(&self, task_id: TaskId) -> bool {
        self.lock().task_results.contains_key(&task_id)
    }

    pub fn all_task_results(&self) -> TaskResults {
        self.lock().task_results.clone()
    }

    // ----- current task -----

    pub fn set_current_task(&self, task_id: TaskId) {
        self.lock().current_task = task_id;
    }

    pub fn current_task(&self) -> TaskId {
        self.lock().current_task
    }

    // ----- loop tracking -----

    pub fn set_loop_counter(&self, task_id: TaskId, remaining: i64) {
        self.lock().loop_counter.insert(task_id, remaining);
    }

    pub fn loop_counter(&self, task_id: TaskId) -> i64 {
        self.lock().loop_counter.get(&task_id).copied().unwrap_or(0)
    }

    pub fn decrement_loop_counter(&self, task_id: TaskId) -> i64 {
        let mut state = self.lock();
        match state.loop_counter.get_mut(&task_id) {
            Some(remaining) => {
                *remaining -= 1;
                *remaining
            }
            None => 0,
        }
    }

    pub fn set_loop_iteration(&self, task_id: TaskId, iteration: u32) {
        self.lock().loop_iterations.insert(task_id, iteration);
    }

    pub fn loop_iteration(&self, task_id: TaskId) -> u32 {
        self.lock().loop_iterations.get(&task_id).copied().unwrap_or(0)
    }

    pub fn clear_loop_tracking(&self, task_id: TaskId) {
        let mut state = self.lock();
        state.loop_counter.remove(&task_id);
        state.loop_iterations.remove(&task_id);
    }

    // ----- globals -----

    pub fn set_globals(&self, globals: Globals) {
        self.lock().globals = globals;
    }

    pub fn globals(&self) -> Globals {
        self.lock().globals.clone()
    }

    pub fn global(&self, name: &str) -> Option<String> {
        self.lock().globals.get(name).cloned()
    }

    // ----- execution path -----

    pub fn append_to_execution_path(&self, task_id: TaskId) {
        let mut state = self.lock();
        if !state.execution_path.contains(&task_id) {
            state.execution_path.push(task_id);
        }
    }

    pub fn execution_path(&self) -> Vec<TaskId> {
        self.lock().execution_path.clone()
    }

    pub fn set_execution_path(&self, path: Vec<TaskId>) {
        self.lock().execution_path = path;
    }

    // ----- task definitions -----

    pub fn set_tasks(&self, tasks: BTreeMap<TaskId, Task>) {
        self.lock().tasks = tasks;
    }

    pub fn task(&self, task_id: TaskId) -> Option<Task> {
        self.lock().tasks.get(&task_id).cloned()
    }

    pub fn has_task(&self, task_id: TaskId) -> bool {
        self.lock().tasks.contains_key(&task_id)
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        self.lock().tasks.keys().copied().collect()
    }

    /// Rewrite a task's hostname in place; used once after host validation
    /// resolves names to FQDNs.
    pub fn rewrite_hostname(&self, task_id: TaskId, fqdn: &str) {
        let mut state = self.lock();
        if let Some(task) = state.tasks.get_mut(&task_id) {
            if let crate::workflow::model::TaskKind::Normal(spec) = &mut task.kind {
                spec.hostname = fqdn.to_string();
            }
        }
    }

    // ----- workflow outcome -----

    pub fn mark_failed_due_to_condition(&self) {
        self.lock().failed_due_to_condition = true;
    }

    pub fn failed_due_to_condition(&self) -> bool {
        self.lock().failed_due_to_condition
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_round_trip() {
        let state = StateManager::new();
        assert!(!state.has_task_result(0));
        state.store_task_result(
            0,
            TaskResult {
                exit_code: 0,
                stdout: "hello".to_string(),
                success: true,
                ..Default::default()
            },
        );
        assert!(state.has_task_result(0));
        assert_eq!(state.task_result(0).unwrap().stdout, "hello");
        assert!(state.task_result(9).is_none());
    }

    #[test]
    fn test_loop_counters() {
        let state = StateManager::new();
        assert_eq!(state.loop_counter(4), 0);
        state.set_loop_counter(4, 3);
        assert_eq!(state.decrement_loop_counter(4), 2);
        assert_eq!(state.decrement_loop_counter(4), 1);
        state.set_loop_iteration(4, 2);
        assert_eq!(state.loop_iteration(4), 2);
        state.clear_loop_tracking(4);
        assert_eq!(state.loop_counter(4), 0);
        assert_eq!(state.loop_iteration(4), 0);
        // Decrementing untracked tasks is a no-op.
        assert_eq!(state.decrement_loop_counter(9), 0);
    }

    #[test]
    fn test_execution_path_dedup() {
        let state = StateManager::new();
        state.append_to_execution_path(0);
        state.append_to_execution_path(5);
        state.append_to_execution_path(0);
        assert_eq!(state.execution_path(), vec![0, 5]);
    }

    #[test]
    fn test_globals_copy_out() {
        let state = StateManager::new();
        let mut globals = Globals::new();
        globals.insert("ENV".to_string(), "prod".to_string());
        state.set_globals(globals);
        assert_eq!(state.global("ENV").as_deref(), Some("prod"));
        let mut copy = state.globals();
        copy.insert("ENV".to_string(), "dev".to_string());
        // Mutating the copy leaves the store untouched.
        assert_eq!(state.global("ENV").as_deref(), Some("prod"));
    }
}
