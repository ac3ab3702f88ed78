use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::exit_code;
use crate::workflow::condition::BlockStats;
use crate::workflow::controller::{route_block, NextAction};
use crate::workflow::executor::{
    execute_task_core, sleep_with_shutdown, CoreError, ExecContext, Flow, TaskOutcome,
};
use crate::workflow::model::{
    RawRetry, ResultCategory, RetryConfig, Task, TaskId, TaskKind, TaskResult,
};

/// Resolve a block's retry settings. Retries are enabled by
/// `retry_failed=true` or an explicit `retry_count`; out-of-range values
/// fall back to 1 with a warning.
pub fn parse_retry_config(ctx: &ExecContext, retry: &RawRetry) -> Option<RetryConfig> {
    let enabled = retry
        .retry_failed
        .as_deref()
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
        || retry.retry_count.is_some();
    if !enabled {
        return None;
    }

    let globals = ctx.state.globals();
    let results = ctx.state.all_task_results();
    let resolve = |raw: &Option<String>, default: i64| -> i64 {
        match raw {
            Some(value) => {
                let (resolved, _) =
                    crate::workflow::vars::replace_variables(value, &globals, &results);
                resolved.trim().parse::<i64>().unwrap_or(default)
            }
            None => default,
        }
    };

    let mut count = resolve(&retry.retry_count, 1);
    if !(1..=1000).contains(&count) {
        warn!("retry_count {} out of range (1-1000), using 1", count);
        count = 1;
    }
    let mut delay = resolve(&retry.retry_delay, 1);
    if !(0..=300).contains(&delay) {
        warn!("retry_delay {} out of range (0-300), using 1", delay);
        delay = 1;
    }

    Some(RetryConfig {
        count: count as u32,
        delay_secs: delay as u64,
    })
}

/// Execute one child with the block's retry policy. Successful attempts
/// short-circuit; timeouts (exit 124) are never retried. Attempts task_label
/// as `parent-child.1`, `.2`, ...
pub async fn run_child_with_retry(
    ctx: &ExecContext,
    parent_id: TaskId,
    child: &Task,
    master_timeout: Option<u64>,
    retry: Option<RetryConfig>,
) -> TaskOutcome {
    let attempts = retry.map_or(1, |r| r.count + 1);
    let delay = retry.map_or(0, |r| r.delay_secs);
    let mut last: Option<TaskOutcome> = None;

    for attempt in 0..attempts {
        let retry_display = if retry.is_some() {
            format!(".{}", attempt + 1)
        } else {
            String::new()
        };
        let task_label = format!("{}-{}{}", parent_id, child.id, retry_display);

        let outcome = match execute_task_core(ctx, child, master_timeout, &task_label).await {
            Ok(outcome) => outcome,
            Err(CoreError::MissingBinary(msg)) => {
                // Inside a block a missing binary is captured per-child, not
                // fatal to the engine.
                error!("Task {}: {}", task_label, msg);
                TaskOutcome {
                    task_id: child.id,
                    result: TaskResult {
                        exit_code: 1,
                        stderr: msg.clone(),
                        stderr_size: msg.len() as u64,
                        ..Default::default()
                    },
                }
            }
        };

        let category = outcome.result.category();
        match category {
            ResultCategory::Success => {
                if attempt > 0 {
                    info!(
                        "Task {}-{}.{}: SUCCESS after {} retry attempt(s)",
                        parent_id,
                        child.id,
                        attempt + 1,
                        attempt
                    );
                }
                return outcome;
            }
            ResultCategory::Timeout => {
                debug!("Task {}-{}: TIMEOUT - no retry attempted", parent_id, child.id);
                return outcome;
            }
            ResultCategory::Failed => {
                if attempt + 1 < attempts {
                    info!(
                        "Task {}-{}.{}: FAILED - will retry as Task {}-{}.{} in {}s",
                        parent_id,
                        child.id,
                        attempt + 1,
                        parent_id,
                        child.id,
                        attempt + 2,
                        delay
                    );
                    if !ctx.dry_run && delay > 0 {
                        sleep_with_shutdown(delay as f64, &ctx.shutdown).await;
                    }
                    last = Some(outcome);
                } else {
                    if attempt > 0 {
                        info!(
                            "Task {}-{}.{}: FAILED after {} retry attempt(s) - giving up",
                            parent_id,
                            child.id,
                            attempt + 1,
                            attempt
                        );
                    }
                    return outcome;
                }
            }
        }
        if ctx.shutdown.is_requested() {
            break;
        }
    }

    last.unwrap_or(TaskOutcome {
        task_id: child.id,
        result: TaskResult::internal_error("retry loop produced no result"),
    })
}

/// Synthesized parent result for a block of child outcomes.
pub struct Aggregation {
    pub stats: BlockStats,
    pub result: TaskResult,
}

pub fn aggregate_results(label: &str, outcomes: &[TaskOutcome]) -> Aggregation {
    let total = outcomes.len();
    let success = outcomes.iter().filter(|o| o.result.success).count();
    let timeout_ids: Vec<TaskId> = outcomes
        .iter()
        .filter(|o| o.result.exit_code == exit_code::TIMEOUT)
        .map(|o| o.task_id)
        .collect();
    let failed_ids: Vec<TaskId> = outcomes
        .iter()
        .filter(|o| !o.result.success && o.result.exit_code != exit_code::TIMEOUT)
        .map(|o| o.task_id)
        .collect();

    let mut stdout = format!("{}: {}/{} successful", label, success, total);
    if !timeout_ids.is_empty() {
        stdout.push_str(&format!(", {} timeout", timeout_ids.len()));
    }
    if !failed_ids.is_empty() {
        stdout.push_str(&format!(", {} failed", failed_ids.len()));
    }

    let mut stderr = String::new();
    if !failed_ids.is_empty() {
        stderr.push_str(&format!("Failed tasks: {:?}. ", failed_ids));
    }
    if !timeout_ids.is_empty() {
        stderr.push_str(&format!("Timeout tasks: {:?}", timeout_ids));
    }
    let stderr = stderr.trim().to_string();

    let overall_success = success == total;
    let result = TaskResult {
        exit_code: if overall_success { 0 } else { 1 },
        stdout_size: stdout.len() as u64,
        stderr_size: stderr.len() as u64,
        stdout,
        stderr,
        success: overall_success,
        ..Default::default()
    };

    Aggregation {
        stats: BlockStats {
            success,
            failed: total - success,
            total,
        },
        result,
    }
}

/// Execute a parallel block: fan the children onto a bounded pool, apply
/// the retry policy per child, enforce the master timeout over the whole
/// block, aggregate, store, and route.
pub async fn execute_parallel(ctx: &ExecContext, task: &Task) -> Flow {
    let TaskKind::Parallel(spec) = &task.kind else {
        error!("Task {}: not a parallel task", task.id);
        return Flow::TerminalFail;
    };
    ctx.state.set_current_task(task.id);

    if spec.children.is_empty() {
        info!("Task {}: No tasks specified", task.id);
        return Flow::Next(task.id + 1);
    }

    let mut children = Vec::new();
    let mut missing = Vec::new();
    for id in &spec.children {
        match ctx.state.task(*id) {
            Some(child) => children.push(child),
            None => missing.push(*id),
        }
    }
    if !missing.is_empty() {
        error!("Task {}: Missing referenced tasks: {:?}", task.id, missing);
        return Flow::TerminalFail;
    }

    let pool = spec.max_parallel.unwrap_or(children.len()).min(children.len()).max(1);
    let retry = parse_retry_config(ctx, &spec.retry);
    let master_timeout = ctx.task_timeout(task, &task.id.to_string());

    let retry_info = retry.map_or(String::new(), |r| {
        format!(
            ", retry_failed=true (count={}, delay={}s)",
            r.count, r.delay_secs
        )
    });
    info!(
        "Task {}: Starting parallel execution of {} tasks (max_parallel={}, timeout={}s{})",
        task.id,
        children.len(),
        pool,
        master_timeout,
        retry_info
    );

    let semaphore = Arc::new(Semaphore::new(pool));
    let deadline = Instant::now() + Duration::from_secs(master_timeout);
    let started = std::time::Instant::now();

    let mut running: FuturesUnordered<_> = children
        .iter()
        .map(|child| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                // Closed only when the block is torn down; treat as cancel.
                let _permit = semaphore.acquire().await;
                run_child_with_retry(ctx, task.id, child, Some(master_timeout), retry).await
            }
        })
        .collect();

    let mut outcomes: Vec<TaskOutcome> = Vec::new();
    let mut completed: HashSet<TaskId> = HashSet::new();
    let mut master_timed_out = false;

    loop {
        tokio::select! {
            next = running.next() => {
                let Some(outcome) = next else { break };

                // Post-task sleep is serialized by the collector so result
                // recording order stays deterministic.
                if outcome.result.sleep_seconds > 0.0 && !ctx.dry_run {
                    info!(
                        "Task {}-{}: Sleeping for {} seconds...",
                        task.id, outcome.task_id, outcome.result.sleep_seconds
                    );
                    sleep_with_shutdown(outcome.result.sleep_seconds, &ctx.shutdown).await;
                }

                let mut status = format!("Success: {}", outcome.result.success);
                if outcome.result.exit_code == exit_code::TIMEOUT {
                    status.push_str(" (timeout)");
                } else if outcome.result.skipped {
                    status.push_str(" (skipped)");
                }
                info!(
                    "Task {}: Completed task {} - {}",
                    task.id, outcome.task_id, status
                );

                completed.insert(outcome.task_id);
                outcomes.push(outcome);
            }
            _ = tokio::time::sleep_until(deadline) => {
                master_timed_out = true;
                break;
            }
        }
        if ctx.shutdown.is_requested() {
            info!("Parallel execution interrupted by shutdown request");
            break;
        }
    }

    if master_timed_out {
        info!(
            "Task {}: MASTER TIMEOUT ({}s) reached after {:.1}s",
            task.id,
            master_timeout,
            started.elapsed().as_secs_f64()
        );
    }
    // Dropping the future set cancels unfinished children; their processes
    // die with the futures (kill-on-drop).
    drop(running);

    let mut cancelled = 0;
    for child in &children {
        if !completed.contains(&child.id) {
            cancelled += 1;
            let msg = format!(
                "Task cancelled due to master timeout ({}s)",
                master_timeout
            );
            outcomes.push(TaskOutcome {
                task_id: child.id,
                result: TaskResult {
                    exit_code: exit_code::TIMEOUT,
                    stderr_size: msg.len() as u64,
                    stderr: msg,
                    ..Default::default()
                },
            });
        }
    }
    if cancelled > 0 {
        info!(
            "Task {}: Cancelled {} remaining tasks due to master timeout",
            task.id, cancelled
        );
    }

    info!(
        "Task {}: Parallel execution completed in {:.2} seconds",
        task.id,
        started.elapsed().as_secs_f64()
    );

    // Child results stay individually addressable (@child_stdout@), and the
    // parent gets the synthesized aggregate under its own ID.
    for outcome in &outcomes {
        ctx.state
            .store_task_result(outcome.task_id, outcome.result.clone());
    }
    let aggregation = aggregate_results("Parallel execution", &outcomes);
    ctx.state
        .store_task_result(task.id, aggregation.result.clone());

    debug!(
        "Task {}: Overall result - Success: {} ({}/{} tasks succeeded)",
        task.id,
        aggregation.result.success,
        aggregation.stats.success,
        aggregation.stats.total
    );

    let action = route_block(
        &ctx.state,
        task,
        &aggregation.stats,
        aggregation.result.exit_code,
        &aggregation.result.stdout,
        &aggregation.result.stderr,
    );
    match action {
        NextAction::Goto(id) => Flow::Next(id),
        NextAction::Loop => Flow::Loop,
        NextAction::TerminalOk => Flow::TerminalOk,
        NextAction::TerminalFail => Flow::TerminalFail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{build_task, RawTask};
    use crate::workflow::state::StateManager;
    use crate::workflow::Shutdown;
    use std::collections::BTreeMap;

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

    fn context_with_tasks(tasks: Vec<Task>, dir: &std::path::Path) -> ExecContext {
        let state = StateManager::new();
        let map: BTreeMap<TaskId, Task> = tasks.into_iter().map(|t| (t.id, t)).collect();
        state.set_tasks(map);
        ExecContext {
            state: Arc::new(state),
            shutdown: Shutdown::default(),
            dry_run: false,
            default_timeout: 30,
            exec_override: Some("local".to_string()),
            spill_dir: dir.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn test_parallel_all_success() {
        let dir = tempfile::tempdir().unwrap();
        let parent = task(
            1,
            &[
                ("type", "parallel"),
                ("tasks", "10,11"),
                ("max_parallel", "2"),
                ("next", "all_success"),
            ],
        );
        let ctx = context_with_tasks(
            vec![
                parent.clone(),
                task(10, &[("command", "echo"), ("arguments", "a")]),
                task(11, &[("command", "echo"), ("arguments", "b")]),
            ],
            dir.path(),
        );

        let flow = execute_parallel(&ctx, &parent).await;
        assert_eq!(flow, Flow::Next(2));

        let parent_result = ctx.state.task_result(1).unwrap();
        assert!(parent_result.success);
        assert_eq!(parent_result.exit_code, 0);
        assert!(parent_result.stdout.contains("2/2 successful"));
        // Child results remain individually addressable.
        assert_eq!(ctx.state.task_result(10).unwrap().stdout, "a\n");
        assert_eq!(ctx.state.task_result(11).unwrap().stdout, "b\n");
    }

    #[tokio::test]
    async fn test_parallel_failure_routes_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let parent = task(
            1,
            &[("type", "parallel"), ("tasks", "10,11"), ("next", "all_success")],
        );
        let ctx = context_with_tasks(
            vec![
                parent.clone(),
                task(10, &[("command", "true")]),
                task(11, &[("command", "false")]),
            ],
            dir.path(),
        );

        let flow = execute_parallel(&ctx, &parent).await;
        assert_eq!(flow, Flow::TerminalFail);
        let parent_result = ctx.state.task_result(1).unwrap();
        assert!(!parent_result.success);
        assert!(parent_result.stderr.contains("Failed tasks: [11]"));
    }

    #[tokio::test]
    async fn test_parallel_any_success_predicate() {
        let dir = tempfile::tempdir().unwrap();
        let parent = task(
            1,
            &[("type", "parallel"), ("tasks", "10,11"), ("next", "any_success")],
        );
        let ctx = context_with_tasks(
            vec![
                parent.clone(),
                task(10, &[("command", "true")]),
                task(11, &[("command", "false")]),
            ],
            dir.path(),
        );
        assert_eq!(execute_parallel(&ctx, &parent).await, Flow::Next(2));
    }

    #[tokio::test]
    async fn test_parallel_master_timeout_cancels_children() {
        let dir = tempfile::tempdir().unwrap();
        let parent = task(
            1,
            &[
                ("type", "parallel"),
                ("tasks", "10,11"),
                ("max_parallel", "2"),
                ("timeout", "5"),
            ],
        );
        let ctx = context_with_tasks(
            vec![
                parent.clone(),
                task(10, &[("command", "sleep"), ("arguments", "30")]),
                task(11, &[("command", "sleep"), ("arguments", "30")]),
            ],
            dir.path(),
        );

        let started = std::time::Instant::now();
        let flow = execute_parallel(&ctx, &parent).await;
        assert!(started.elapsed() < Duration::from_secs(20));
        assert_eq!(flow, Flow::TerminalFail);

        for id in [10u32, 11] {
            let result = ctx.state.task_result(id).unwrap();
            assert_eq!(result.exit_code, 124, "task {} should time out", id);
            assert!(!result.success);
        }
    }

    #[tokio::test]
    async fn test_parallel_retry_recovers() {
        let dir = tempfile::tempdir().unwrap();
        // The child fails until its marker file exists, then succeeds.
        let marker = dir.path().join("attempts");
        let script = format!(
            "c=$(cat {m} 2>/dev/null || echo 0); c=$((c+1)); echo $c > {m}; test $c -ge 3",
            m = marker.display()
        );
        let parent = task(
            1,
            &[
                ("type", "parallel"),
                ("tasks", "10"),
                ("retry_failed", "true"),
                ("retry_count", "2"),
                ("retry_delay", "0"),
                ("next", "all_success"),
            ],
        );
        let ctx = context_with_tasks(
            vec![
                parent.clone(),
                task(10, &[("command", &script), ("exec", "shell")]),
            ],
            dir.path(),
        );

        let flow = execute_parallel(&ctx, &parent).await;
        assert_eq!(flow, Flow::Next(2));
        assert!(ctx.state.task_result(10).unwrap().success);
        assert_eq!(std::fs::read_to_string(&marker).unwrap().trim(), "3");
    }

    #[tokio::test]
    async fn test_retry_config_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_with_tasks(vec![], dir.path());

        assert!(parse_retry_config(&ctx, &RawRetry::default()).is_none());

        let enabled = RawRetry {
            retry_failed: Some("true".to_string()),
            retry_count: Some("3".to_string()),
            retry_delay: Some("2".to_string()),
        };
        assert_eq!(
            parse_retry_config(&ctx, &enabled),
            Some(RetryConfig {
                count: 3,
                delay_secs: 2
            })
        );

        let out_of_range = RawRetry {
            retry_failed: Some("true".to_string()),
            retry_count: Some("5000".to_string()),
            retry_delay: Some("999".to_string()),
        };
        assert_eq!(
            parse_retry_config(&ctx, &out_of_range),
            Some(RetryConfig {
                count: 1,
                delay_secs: 1
            })
        );
    }

    #[test]
    fn test_aggregate_results_shape() {
        let outcomes = vec![
            TaskOutcome {
                task_id: 10,
                result: TaskResult {
                    success: true,
                    ..Default::default()
                },
            },
            TaskOutcome {
                task_id: 11,
                result: TaskResult {
                    exit_code: 124,
                    ..Default::default()
                },
            },
            TaskOutcome {
                task_id: 12,
                result: TaskResult {
                    exit_code: 2,
                    ..Default::default()
                },
            },
        ];
        let agg = aggregate_results("Parallel execution", &outcomes);
        assert_eq!(
            agg.result.stdout,
            "Parallel execution: 1/3 successful, 1 timeout, 1 failed"
        );
        assert!(agg.result.stderr.contains("Failed tasks: [12]"));
        assert!(agg.result.stderr.contains("Timeout tasks: [11]"));
        assert_eq!(agg.stats.failed, 2);
        assert_eq!(agg.result.exit_code, 1);
    }
}
