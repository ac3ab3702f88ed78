use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

pub type TaskId = u32;
pub type Globals = HashMap<String, String>;
pub type TaskResults = HashMap<TaskId, TaskResult>;

/// One record of the task file before type-specific interpretation. The
/// validator works on this form so it can flag fields that the typed model
/// would silently drop.
#[derive(Debug, Clone, Default)]
pub struct RawTask {
    pub id: TaskId,
    /// Line number of the `task=` line, for diagnostics.
    pub line: usize,
    /// Key/value pairs in file order, excluding the `task` key itself.
    pub fields: Vec<(String, String)>,
}

impl RawTask {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Re-serialize as `key=value` lines, starting with the `task=` line.
    pub fn to_key_values(&self) -> String {
        let mut out = format!("task={}\n", self.id);
        for (k, v) in &self.fields {
            out.push_str(k);
            out.push('=');
            out.push_str(v);
            out.push('\n');
        }
        out
    }
}

/// Command-bearing portion of a normal task.
#[derive(Debug, Clone, Default)]
pub struct NormalSpec {
    pub hostname: String,
    pub command: Option<String>,
    pub arguments: String,
    pub exec: Option<String>,
    pub stdout_split: Option<String>,
    pub stderr_split: Option<String>,
    /// `return=N`: with no command the task terminates the engine with N;
    /// with a command the engine exits N after the command runs.
    pub return_code: Option<i32>,
}

/// Retry settings as written in the file; counts and delays may contain
/// variable references, so they resolve at execution time.
#[derive(Debug, Clone, Default)]
pub struct RawRetry {
    pub retry_failed: Option<String>,
    pub retry_count: Option<String>,
    pub retry_delay: Option<String>,
}

/// Fully resolved retry policy for a parallel or conditional block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    pub count: u32,
    pub delay_secs: u64,
}

#[derive(Debug, Clone, Default)]
pub struct BlockSpec {
    pub children: Vec<TaskId>,
    pub max_parallel: Option<usize>,
    pub retry: RawRetry,
}

#[derive(Debug, Clone, Default)]
pub struct ConditionalSpec {
    pub condition: String,
    pub if_true_tasks: Vec<TaskId>,
    pub if_false_tasks: Vec<TaskId>,
    pub retry: RawRetry,
}

#[derive(Debug, Clone)]
pub enum TaskKind {
    Normal(NormalSpec),
    Parallel(BlockSpec),
    Conditional(ConditionalSpec),
    Decision,
}

impl TaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::Normal(_) => "normal",
            TaskKind::Parallel(_) => "parallel",
            TaskKind::Conditional(_) => "conditional",
            TaskKind::Decision => "decision",
        }
    }
}

/// A validated task. Flow-control fields are shared across kinds; the
/// command/block payload lives in `kind`.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub condition: Option<String>,
    pub success: Option<String>,
    pub failure: Option<String>,
    pub next: Option<String>,
    pub on_success: Option<TaskId>,
    pub on_failure: Option<TaskId>,
    pub loop_count: Option<u32>,
    pub loop_break: Option<String>,
    /// Seconds to sleep after the task; may contain variable references.
    pub sleep: Option<String>,
    /// Raw timeout value; may contain variable references.
    pub timeout: Option<String>,
}

impl Task {
    pub fn normal(&self) -> Option<&NormalSpec> {
        match &self.kind {
            TaskKind::Normal(spec) => Some(spec),
            _ => None,
        }
    }
}

/// Parse a comma-separated child-task list (`tasks=10,11,12`).
pub fn parse_task_list(value: &str) -> Result<Vec<TaskId>, String> {
    let mut ids = Vec::new();
    for part in value.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let id = part
            .parse::<TaskId>()
            .map_err(|_| format!("invalid task reference '{}'", part))?;
        ids.push(id);
    }
    Ok(ids)
}

/// Build the typed task from its raw form. The validator has already
/// rejected malformed files; this conversion still reports anything it
/// cannot represent so `--skip-task-validation` runs fail loudly instead of
/// misbehaving.
pub fn build_task(raw: &RawTask) -> Result<Task, String> {
    let kind = match raw.get("type") {
        None => TaskKind::Normal(NormalSpec {
            hostname: raw.get("hostname").unwrap_or("").to_string(),
            command: raw.get("command").map(str::to_string),
            arguments: raw.get("arguments").unwrap_or("").to_string(),
            exec: raw.get("exec").map(str::to_string),
            stdout_split: raw.get("stdout_split").map(str::to_string),
            stderr_split: raw.get("stderr_split").map(str::to_string),
            return_code: match raw.get("return") {
                Some(v) => Some(
                    v.trim()
                        .parse::<i32>()
                        .map_err(|_| format!("task {}: invalid return code '{}'", raw.id, v))?,
                ),
                None => None,
            },
        }),
        Some("parallel") => TaskKind::Parallel(BlockSpec {
            children: parse_task_list(raw.get("tasks").unwrap_or(""))
                .map_err(|e| format!("task {}: {}", raw.id, e))?,
            max_parallel: match raw.get("max_parallel") {
                Some(v) => Some(v.trim().parse::<usize>().map_err(|_| {
                    format!("task {}: invalid max_parallel '{}'", raw.id, v)
                })?),
                None => None,
            },
            retry: raw_retry(raw),
        }),
        Some("conditional") => TaskKind::Conditional(ConditionalSpec {
            condition: raw.get("condition").unwrap_or("").to_string(),
            if_true_tasks: parse_task_list(raw.get("if_true_tasks").unwrap_or(""))
                .map_err(|e| format!("task {}: {}", raw.id, e))?,
            if_false_tasks: parse_task_list(raw.get("if_false_tasks").unwrap_or(""))
                .map_err(|e| format!("task {}: {}", raw.id, e))?,
            retry: raw_retry(raw),
        }),
        Some("decision") => TaskKind::Decision,
        Some(other) => return Err(format!("task {}: unknown type '{}'", raw.id, other)),
    };

    let parse_target = |key: &str| -> Result<Option<TaskId>, String> {
        match raw.get(key) {
            Some(v) => v
                .trim()
                .parse::<TaskId>()
                .map(Some)
                .map_err(|_| format!("task {}: invalid {} target '{}'", raw.id, key, v)),
            None => Ok(None),
        }
    };

    Ok(Task {
        id: raw.id,
        kind,
        condition: match raw.get("type") {
            // A conditional's gate lives in its spec; `condition` on other
            // kinds is the skip-gate.
            Some("conditional") => None,
            _ => raw.get("condition").map(str::to_string),
        },
        success: raw.get("success").map(str::to_string),
        failure: raw.get("failure").map(str::to_string),
        next: raw.get("next").map(str::to_string),
        on_success: parse_target("on_success")?,
        on_failure: parse_target("on_failure")?,
        loop_count: match raw.get("loop") {
            Some(v) => Some(
                v.trim()
                    .parse::<u32>()
                    .map_err(|_| format!("task {}: invalid loop count '{}'", raw.id, v))?,
            ),
            None => None,
        },
        loop_break: raw.get("loop_break").map(str::to_string),
        sleep: raw.get("sleep").map(str::to_string),
        timeout: raw.get("timeout").map(str::to_string),
    })
}

fn raw_retry(raw: &RawTask) -> RawRetry {
    RawRetry {
        retry_failed: raw.get("retry_failed").map(str::to_string),
        retry_count: raw.get("retry_count").map(str::to_string),
        retry_delay: raw.get("retry_delay").map(str::to_string),
    }
}

/// The stored outcome of one task execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskResult {
    pub exit_code: i32,
    /// Bounded preview of the stream (or the split result, stored in full).
    pub stdout: String,
    pub stderr: String,
    /// Spill-file paths holding the full stream when truncated.
    pub stdout_file: Option<PathBuf>,
    pub stderr_file: Option<PathBuf>,
    pub stdout_size: u64,
    pub stderr_size: u64,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub success: bool,
    pub skipped: bool,
    #[serde(default)]
    pub sleep_seconds: f64,
}

impl TaskResult {
    pub fn skipped() -> Self {
        let msg = "Task skipped due to condition";
        TaskResult {
            exit_code: -1,
            stderr: msg.to_string(),
            stderr_size: msg.len() as u64,
            skipped: true,
            ..Default::default()
        }
    }

    pub fn from_return(code: i32) -> Self {
        TaskResult {
            exit_code: code,
            success: code == 0,
            ..Default::default()
        }
    }

    pub fn internal_error(message: &str) -> Self {
        TaskResult {
            exit_code: 255,
            stderr: message.to_string(),
            stderr_size: message.len() as u64,
            ..Default::default()
        }
    }

    /// Outcome category driving retry decisions.
    pub fn category(&self) -> ResultCategory {
        if self.success {
            ResultCategory::Success
        } else if self.exit_code == crate::error::exit_code::TIMEOUT {
            ResultCategory::Timeout
        } else {
            ResultCategory::Failed
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCategory {
    Success,
    /// Exit 124; never retried.
    Timeout,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(id: TaskId, fields: &[(&str, &str)]) -> RawTask {
        RawTask {
            id,
            line: 1,
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_build_normal_task() {
        let task = build_task(&raw(
            0,
            &[
                ("hostname", "web01"),
                ("command", "uptime"),
                ("arguments", "-p"),
                ("next", "exit_0"),
            ],
        ))
        .unwrap();
        let spec = task.normal().unwrap();
        assert_eq!(spec.hostname, "web01");
        assert_eq!(spec.command.as_deref(), Some("uptime"));
        assert_eq!(task.next.as_deref(), Some("exit_0"));
    }

    #[test]
    fn test_build_parallel_task() {
        let task = build_task(&raw(
            1,
            &[
                ("type", "parallel"),
                ("tasks", "10, 11,12"),
                ("max_parallel", "3"),
                ("retry_failed", "true"),
                ("retry_count", "2"),
            ],
        ))
        .unwrap();
        match task.kind {
            TaskKind::Parallel(spec) => {
                assert_eq!(spec.children, vec![10, 11, 12]);
                assert_eq!(spec.max_parallel, Some(3));
                assert_eq!(spec.retry.retry_count.as_deref(), Some("2"));
            }
            other => panic!("expected parallel, got {}", other.name()),
        }
    }

    #[test]
    fn test_build_rejects_bad_targets() {
        assert!(build_task(&raw(0, &[("on_success", "five")])).is_err());
        assert!(build_task(&raw(0, &[("type", "bogus")])).is_err());
        assert!(build_task(&raw(0, &[("return", "abc")])).is_err());
    }

    #[test]
    fn test_conditional_gate_not_duplicated() {
        let task = build_task(&raw(
            2,
            &[
                ("type", "conditional"),
                ("condition", "stdout~PROD"),
                ("if_true_tasks", "20"),
                ("if_false_tasks", "21"),
            ],
        ))
        .unwrap();
        // The gate belongs to the spec, not the shared skip-condition field.
        assert!(task.condition.is_none());
        match task.kind {
            TaskKind::Conditional(spec) => assert_eq!(spec.condition, "stdout~PROD"),
            other => panic!("expected conditional, got {}", other.name()),
        }
    }

    #[test]
    fn test_result_category() {
        let ok = TaskResult {
            success: true,
            ..Default::default()
        };
        assert_eq!(ok.category(), ResultCategory::Success);
        let timeout = TaskResult {
            exit_code: 124,
            ..Default::default()
        };
        assert_eq!(timeout.category(), ResultCategory::Timeout);
        let failed = TaskResult {
            exit_code: 3,
            ..Default::default()
        };
        assert_eq!(failed.category(), ResultCategory::Failed);
    }

    #[test]
    fn test_raw_round_trip() {
        let task = raw(5, &[("hostname", "h"), ("command", "echo"), ("next", "always")]);
        let text = task.to_key_values();
        assert_eq!(text, "task=5\nhostname=h\ncommand=echo\nnext=always\n");
    }
}
