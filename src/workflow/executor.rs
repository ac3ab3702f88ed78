use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::backends::resolve_backend;
use crate::error::exit_code;
use crate::util::{expand_env_vars, format_output_for_log};
use crate::workflow::condition::evaluate_condition;
use crate::workflow::controller::{route, NextAction};
use crate::workflow::model::{NormalSpec, Task, TaskId, TaskResult};
use crate::workflow::output::StreamingOutputHandler;
use crate::workflow::state::StateManager;
use crate::workflow::vars::replace_variables;
use crate::workflow::{Shutdown, DEFAULT_EXEC_TYPE, DEFAULT_TIMEOUT_SECS, MAX_TIMEOUT_SECS, MIN_TIMEOUT_SECS};

/// Shared context handed to every executor.
#[derive(Clone)]
pub struct ExecContext {
    pub state: Arc<StateManager>,
    pub shutdown: Shutdown,
    pub dry_run: bool,
    pub default_timeout: u64,
    pub exec_override: Option<String>,
    pub spill_dir: PathBuf,
}

/// What the engine main loop does after a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Next(TaskId),
    Loop,
    TerminalOk,
    TerminalFail,
    /// `return=N`: the engine exits with this code.
    Return(i32),
}

/// Result of executing one task body, before routing.
#[derive(Debug)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub result: TaskResult,
}

/// Error that must abort the engine rather than route onward.
#[derive(Debug)]
pub enum CoreError {
    /// The command binary does not exist; the run is built on sand.
    MissingBinary(String),
}

impl ExecContext {
    /// Execution type priority: task field, CLI override, environment,
    /// built-in default.
    pub fn determine_execution_type(&self, spec: &NormalSpec, task_label: &str) -> String {
        if let Some(exec) = &spec.exec {
            let (resolved, _) =
                replace_variables(exec, &self.state.globals(), &self.state.all_task_results());
            debug!("Task {}: Using execution type from task: {}", task_label, resolved);
            return resolved;
        }
        if let Some(exec) = &self.exec_override {
            debug!("Task {}: Using execution type from args: {}", task_label, exec);
            return exec.clone();
        }
        if let Ok(exec) = std::env::var("TASK_EXECUTOR_TYPE") {
            debug!("Task {}: Using execution type from environment: {}", task_label, exec);
            return exec;
        }
        DEFAULT_EXEC_TYPE.to_string()
    }

    /// Timeout priority: task field, CLI default, `TASK_EXECUTOR_TIMEOUT`,
    /// built-in default. Always clamped to the valid range.
    pub fn task_timeout(&self, task: &Task, task_label: &str) -> u64 {
        let timeout = if let Some(raw) = &task.timeout {
            let (resolved, ok) =
                replace_variables(raw, &self.state.globals(), &self.state.all_task_results());
            match (ok, resolved.trim().parse::<i64>()) {
                (true, Ok(value)) => value,
                _ => {
                    warn!(
                        "Task {}: invalid timeout value '{}', using default",
                        task_label, raw
                    );
                    self.default_timeout as i64
                }
            }
        } else if self.default_timeout > 0 {
            self.default_timeout as i64
        } else if let Ok(raw) = std::env::var("TASK_EXECUTOR_TIMEOUT") {
            raw.trim().parse::<i64>().unwrap_or(DEFAULT_TIMEOUT_SECS as i64)
        } else {
            DEFAULT_TIMEOUT_SECS as i64
        };

        if timeout < MIN_TIMEOUT_SECS as i64 {
            warn!(
                "Task {}: timeout {} too low, using minimum {}",
                task_label, timeout, MIN_TIMEOUT_SECS
            );
            MIN_TIMEOUT_SECS
        } else if timeout > MAX_TIMEOUT_SECS as i64 {
            warn!(
                "Task {}: timeout {} too high, using maximum {}",
                task_label, timeout, MAX_TIMEOUT_SECS
            );
            MAX_TIMEOUT_SECS
        } else {
            timeout as u64
        }
    }

    /// Post-task sleep in seconds, with variables resolved. Unresolved or
    /// invalid values skip the sleep.
    pub fn resolve_sleep(&self, task: &Task, task_label: &str) -> f64 {
        let Some(raw) = &task.sleep else {
            return 0.0;
        };
        let (resolved, ok) =
            replace_variables(raw, &self.state.globals(), &self.state.all_task_results());
        if !ok {
            warn!(
                "Task {}: unresolved variables in sleep time, skipping sleep",
                task_label
            );
            return 0.0;
        }
        match resolved.trim().parse::<f64>() {
            Ok(secs) if secs > 0.0 => secs,
            Ok(_) => 0.0,
            Err(_) => {
                warn!("Task {}: invalid sleep time '{}', continuing", task_label, raw);
                0.0
            }
        }
    }
}

/// Sleep that honors the shutdown flag at 500 ms granularity.
pub async fn sleep_with_shutdown(seconds: f64, shutdown: &Shutdown) {
    let mut remaining = seconds;
    while remaining > 0.0 && !shutdown.is_requested() {
        let chunk = remaining.min(0.5);
        tokio::time::sleep(Duration::from_secs_f64(chunk)).await;
        remaining -= chunk;
    }
}

/// Execute one task body: skip-condition, return tasks, substitution, spawn,
/// output capture, splitting, success evaluation. No storing, no routing;
/// callers own those so the same core serves sequential, parallel and
/// conditional execution.
pub async fn execute_task_core(
    ctx: &ExecContext,
    task: &Task,
    master_timeout: Option<u64>,
    task_label: &str,
) -> Result<TaskOutcome, CoreError> {
    let spec = match task.normal() {
        Some(spec) => spec,
        None => {
            // Composite tasks never reach the core; validation forbids
            // nesting. Capture instead of crashing if one slips through.
            return Ok(TaskOutcome {
                task_id: task.id,
                result: TaskResult::internal_error("composite task routed to command core"),
            });
        }
    };

    let globals = ctx.state.globals();
    let results = ctx.state.all_task_results();

    // 1. Skip-condition.
    if let Some(condition) = &task.condition {
        let met = evaluate_condition(condition, 0, "", "", &globals, &results, None);
        if !met {
            info!(
                "Task {}: Condition '{}' evaluated to FALSE, skipping task",
                task_label, condition
            );
            return Ok(TaskOutcome {
                task_id: task.id,
                result: TaskResult::skipped(),
            });
        }
        info!(
            "Task {}: Condition '{}' evaluated to TRUE, executing task",
            task_label, condition
        );
    }

    // 2. Return-only task.
    if spec.command.is_none() {
        if let Some(code) = spec.return_code {
            info!("Task {}: Return task with exit code {}", task_label, code);
            return Ok(TaskOutcome {
                task_id: task.id,
                result: TaskResult::from_return(code),
            });
        }
    }

    // 3. Variable substitution.
    let (hostname, _) = replace_variables(&spec.hostname, &globals, &results);
    let (command, resolved) =
        replace_variables(spec.command.as_deref().unwrap_or(""), &globals, &results);
    let (arguments, args_resolved) = replace_variables(&spec.arguments, &globals, &results);
    if !resolved || !args_resolved {
        let msg = format!("unresolved variable references in task {}", task.id);
        warn!("Task {}: {}, skipping task", task_label, msg);
        let mut result = TaskResult::skipped();
        result.stderr = msg.clone();
        result.stderr_size = msg.len() as u64;
        return Ok(TaskOutcome {
            task_id: task.id,
            result,
        });
    }

    // 4./5. Execution type and argv.
    let exec_name = ctx.determine_execution_type(spec, task_label);
    let (canonical, backend) = resolve_backend(&exec_name);
    if !crate::backends::is_known_exec_type(&exec_name) {
        warn!(
            "Task {}: unknown execution type '{}', using '{}'",
            task_label, exec_name, canonical
        );
    }
    let arguments = expand_env_vars(&arguments);
    let argv = backend.build_argv(&hostname, &command, &arguments);
    let display_command = argv.join(" ");
    debug!("Task {}: command array: {:?}", task_label, argv);

    // 6. Timeout.
    let timeout = master_timeout.unwrap_or_else(|| ctx.task_timeout(task, task_label));
    if master_timeout.is_some() && task.timeout.is_some() {
        debug!(
            "Task {}: task timeout overridden by master timeout {}s",
            task_label, timeout
        );
    }

    let sleep_seconds = ctx.resolve_sleep(task, task_label);

    // 7. Dry run.
    if ctx.dry_run {
        info!(
            "Task {}: [DRY RUN] Would execute [{}]: {}",
            task_label, canonical, display_command
        );
        let mut result = TaskResult {
            exit_code: 0,
            stdout: "DRY RUN STDOUT".to_string(),
            success: true,
            sleep_seconds,
            ..Default::default()
        };
        result.stdout_size = result.stdout.len() as u64;
        return Ok(TaskOutcome {
            task_id: task.id,
            result,
        });
    }

    info!(
        "Task {}: Executing [{}]: {}",
        task_label, canonical, display_command
    );

    // 8. Spawn and stream.
    let child = Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let child = match child {
        Ok(child) => child,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(CoreError::MissingBinary(format!(
                "command '{}' not found",
                argv[0]
            )));
        }
        Err(e) => {
            warn!("Task {}: Error executing command: {}", task_label, e);
            let msg = e.to_string();
            return Ok(TaskOutcome {
                task_id: task.id,
                result: TaskResult {
                    exit_code: 1,
                    stderr: msg.clone(),
                    stderr_size: msg.len() as u64,
                    sleep_seconds,
                    ..Default::default()
                },
            });
        }
    };

    let handler = StreamingOutputHandler::new(&ctx.spill_dir);
    let capture = match handler
        .stream_process_output(child, Some(Duration::from_secs(timeout)), &ctx.shutdown)
        .await
    {
        Ok(capture) => capture,
        Err(e) => {
            error!("Task {}: output streaming failed: {}", task_label, e);
            return Ok(TaskOutcome {
                task_id: task.id,
                result: TaskResult::internal_error(&e.to_string()),
            });
        }
    };

    let mut exit_code_value = capture.exit_code;
    let mut stdout = capture.stdout.preview;
    let mut stderr = capture.stderr.preview;
    let mut stdout_file = capture.stdout.file;
    let mut stderr_file = capture.stderr.file;
    let mut stdout_truncated = capture.stdout.truncated;
    let mut stderr_truncated = capture.stderr.truncated;
    let mut stdout_size = capture.stdout.size;
    let mut stderr_size = capture.stderr.size;

    if capture.timed_out {
        info!(
            "Task {}: Timeout after {} seconds. Process killed.",
            task_label, timeout
        );
        exit_code_value = exit_code::TIMEOUT;
        stderr.push_str(&format!(
            "\nProcess killed after timeout of {} seconds",
            timeout
        ));
        stderr_size = stderr.len() as u64;
    }

    info!("Task {}: Exit code: {}", task_label, exit_code_value);
    let formatted_stdout = format_output_for_log(&stdout, 200);
    if !formatted_stdout.is_empty() {
        info!("Task {}: STDOUT: {}", task_label, formatted_stdout);
    }
    let formatted_stderr = format_output_for_log(&stderr, 200);
    if !formatted_stderr.is_empty() {
        info!("Task {}: STDERR: {}", task_label, formatted_stderr);
    }

    // 9. Output splitting. The split result is authoritative: it is stored
    // in full and the spill-file reference is dropped.
    if let Some(split_spec) = &spec.stdout_split {
        let full = full_stream(&stdout, stdout_truncated, stdout_file.as_deref());
        stdout = crate::workflow::vars::split_output(&full, split_spec);
        info!(
            "Task {}: Split STDOUT: {}",
            task_label,
            format_output_for_log(&stdout, 200)
        );
        stdout_file = None;
        stdout_truncated = false;
        stdout_size = stdout.len() as u64;
    }
    if let Some(split_spec) = &spec.stderr_split {
        let full = full_stream(&stderr, stderr_truncated, stderr_file.as_deref());
        stderr = crate::workflow::vars::split_output(&full, split_spec);
        info!(
            "Task {}: Split STDERR: {}",
            task_label,
            format_output_for_log(&stderr, 200)
        );
        stderr_file = None;
        stderr_truncated = false;
        stderr_size = stderr.len() as u64;
    }

    // 10. Success evaluation: explicit success condition, else inverted
    // failure condition, else exit code.
    let success = if let Some(condition) = &task.success {
        let value = evaluate_condition(
            condition,
            exit_code_value,
            &stdout,
            &stderr,
            &globals,
            &results,
            None,
        );
        info!(
            "Task {}: Success condition '{}' evaluated to: {}",
            task_label, condition, value
        );
        value
    } else if let Some(condition) = &task.failure {
        let failed = evaluate_condition(
            condition,
            exit_code_value,
            &stdout,
            &stderr,
            &globals,
            &results,
            None,
        );
        info!(
            "Task {}: Failure condition '{}' evaluated to: {} -> success={}",
            task_label, condition, failed, !failed
        );
        !failed
    } else {
        let value = exit_code_value == 0;
        debug!("Task {}: Success (default): {}", task_label, value);
        value
    };

    Ok(TaskOutcome {
        task_id: task.id,
        result: TaskResult {
            exit_code: exit_code_value,
            stdout,
            stderr,
            stdout_file,
            stderr_file,
            stdout_size,
            stderr_size,
            stdout_truncated,
            stderr_truncated,
            success,
            skipped: false,
            sleep_seconds,
        },
    })
}

fn full_stream(preview: &str, truncated: bool, file: Option<&std::path::Path>) -> String {
    if truncated {
        if let Some(path) = file {
            if let Ok(content) = std::fs::read_to_string(path) {
                return content;
            }
        }
    }
    preview.to_string()
}

/// Run one normal task end-to-end on the orchestrator: execute, store,
/// sleep, honor `return=`, then route.
pub async fn execute_sequential(ctx: &ExecContext, task: &Task) -> Result<Flow, CoreError> {
    ctx.state.set_current_task(task.id);

    // Seed loop bookkeeping so the first iteration already displays `.1`.
    let mut task_label = task.id.to_string();
    if task.next.as_deref() == Some("loop") {
        if let Some(count) = task.loop_count {
            if ctx.state.loop_counter(task.id) == 0 {
                ctx.state.set_loop_counter(task.id, count as i64);
                ctx.state.set_loop_iteration(task.id, 1);
            }
            task_label = format!("{}.{}", task.id, ctx.state.loop_iteration(task.id));
        }
    }

    let outcome = execute_task_core(ctx, task, None, &task_label).await?;
    let result = outcome.result;
    ctx.state.store_task_result(task.id, result.clone());

    if result.skipped {
        return Ok(Flow::Next(task.id + 1));
    }

    let spec = task.normal();
    let return_only = spec.is_some_and(|s| s.return_code.is_some() && s.command.is_none());
    if return_only {
        let code = result.exit_code;
        if code == 0 {
            info!("SUCCESS: Task execution completed successfully with return code 0");
        } else {
            info!("FAILURE: Task execution failed with return code {}", code);
        }
        return Ok(Flow::Return(code));
    }

    if result.sleep_seconds > 0.0 && !ctx.dry_run {
        info!(
            "Task {}: Sleeping for {} seconds",
            task_label, result.sleep_seconds
        );
        sleep_with_shutdown(result.sleep_seconds, &ctx.shutdown).await;
    }

    // A command paired with `return=N` runs first, then ends the engine
    // with N. The stored result keeps the command's real exit code.
    if let Some(code) = spec.and_then(|s| s.return_code) {
        info!("Task {}: Returning with exit code {}", task_label, code);
        return Ok(Flow::Return(code));
    }

    let action = route(
        &ctx.state,
        task,
        result.exit_code,
        &result.stdout,
        &result.stderr,
        result.success,
    );
    Ok(match action {
        NextAction::Goto(id) => Flow::Next(id),
        NextAction::Loop => Flow::Loop,
        NextAction::TerminalOk => Flow::TerminalOk,
        NextAction::TerminalFail => Flow::TerminalFail,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{build_task, RawTask};

    fn context(dry_run: bool, dir: &std::path::Path) -> ExecContext {
        ExecContext {
            state: Arc::new(StateManager::new()),
            shutdown: Shutdown::default(),
            dry_run,
            default_timeout: 30,
            exec_override: Some("local".to_string()),
            spill_dir: dir.to_path_buf(),
        }
    }

    fn task(id: TaskId, fields: &[(&str, &str)]) -> Task {
        build_task(&RawTask {
            id,
            line: 1,
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_core_runs_local_command() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(false, dir.path());
        let t = task(0, &[("command", "echo"), ("arguments", "hello world")]);
        let outcome = execute_task_core(&ctx, &t, None, "0").await.unwrap();
        assert_eq!(outcome.result.exit_code, 0);
        assert!(outcome.result.success);
        assert_eq!(outcome.result.stdout, "hello world\n");
    }

    #[tokio::test]
    async fn test_core_missing_binary_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(false, dir.path());
        let t = task(0, &[("command", "definitely_not_a_real_binary_xyz")]);
        let err = execute_task_core(&ctx, &t, None, "0").await;
        assert!(matches!(err, Err(CoreError::MissingBinary(_))));
    }

    #[tokio::test]
    async fn test_core_skip_condition() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(false, dir.path());
        let t = task(0, &[("command", "echo"), ("condition", "false")]);
        let outcome = execute_task_core(&ctx, &t, None, "0").await.unwrap();
        assert!(outcome.result.skipped);
        assert_eq!(outcome.result.exit_code, -1);
    }

    #[tokio::test]
    async fn test_core_success_condition_overrides_exit() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(false, dir.path());
        let t = task(
            0,
            &[
                ("command", "echo"),
                ("arguments", "PARTIAL"),
                ("success", "stdout~COMPLETE"),
            ],
        );
        let outcome = execute_task_core(&ctx, &t, None, "0").await.unwrap();
        assert_eq!(outcome.result.exit_code, 0);
        assert!(!outcome.result.success);
    }

    #[tokio::test]
    async fn test_core_failure_condition_inverts() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(false, dir.path());
        let t = task(
            0,
            &[
                ("command", "echo"),
                ("arguments", "clean"),
                ("failure", "stdout~ERROR"),
            ],
        );
        let outcome = execute_task_core(&ctx, &t, None, "0").await.unwrap();
        assert!(outcome.result.success);
    }

    #[tokio::test]
    async fn test_core_split_applies_before_conditions() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(false, dir.path());
        let t = task(
            0,
            &[
                ("command", "echo"),
                ("arguments", "root:x:0"),
                ("stdout_split", "colon,1"),
                ("success", "stdout=x"),
            ],
        );
        let outcome = execute_task_core(&ctx, &t, None, "0").await.unwrap();
        assert_eq!(outcome.result.stdout, "x");
        assert!(outcome.result.success);
        assert!(!outcome.result.stdout_truncated);
        assert!(outcome.result.stdout_file.is_none());
    }

    #[tokio::test]
    async fn test_core_dry_run_spawns_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(true, dir.path());
        let t = task(0, &[("command", "definitely_not_a_real_binary_xyz")]);
        let outcome = execute_task_core(&ctx, &t, None, "0").await.unwrap();
        assert!(outcome.result.success);
        assert_eq!(outcome.result.stdout, "DRY RUN STDOUT");
    }

    #[tokio::test]
    async fn test_core_timeout_reports_124() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(false, dir.path());
        let t = task(
            0,
            &[("command", "sleep"), ("arguments", "30"), ("timeout", "5")],
        );
        // Master timeout shortens the wait to keep the test fast.
        let outcome = execute_task_core(&ctx, &t, Some(1), "0").await.unwrap();
        assert_eq!(outcome.result.exit_code, 124);
        assert!(!outcome.result.success);
        assert!(outcome.result.stderr.contains("timeout"));
    }

    #[tokio::test]
    async fn test_sequential_return_only_task() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(false, dir.path());
        let t = task(0, &[("return", "4")]);
        let flow = execute_sequential(&ctx, &t).await.unwrap();
        assert_eq!(flow, Flow::Return(4));
        let stored = ctx.state.task_result(0).unwrap();
        assert_eq!(stored.exit_code, 4);
        assert!(!stored.success);
    }

    #[tokio::test]
    async fn test_sequential_command_and_return() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(false, dir.path());
        let t = task(0, &[("command", "echo"), ("arguments", "hi"), ("return", "3")]);
        let flow = execute_sequential(&ctx, &t).await.unwrap();
        assert_eq!(flow, Flow::Return(3));
        // The stored result reflects the command's real exit code.
        let stored = ctx.state.task_result(0).unwrap();
        assert_eq!(stored.exit_code, 0);
        assert!(stored.success);
    }

    #[tokio::test]
    async fn test_sequential_stores_and_routes() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(false, dir.path());
        let t = task(
            0,
            &[("command", "echo"), ("arguments", "ok"), ("next", "exit_0")],
        );
        let flow = execute_sequential(&ctx, &t).await.unwrap();
        assert_eq!(flow, Flow::Next(1));
        assert!(ctx.state.has_task_result(0));
    }

    #[tokio::test]
    async fn test_timeout_clamping() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(false, dir.path());
        let low = task(0, &[("command", "true"), ("timeout", "4")]);
        assert_eq!(ctx.task_timeout(&low, "0"), 5);
        let high = task(0, &[("command", "true"), ("timeout", "2000")]);
        assert_eq!(ctx.task_timeout(&high, "0"), 1000);
        let normal = task(0, &[("command", "true"), ("timeout", "60")]);
        assert_eq!(ctx.task_timeout(&normal, "0"), 60);
    }
}
