use std::time::Duration;

use tracing::{error, info, warn};

use crate::error::exit_code;
use crate::workflow::condition::evaluate_condition;
use crate::workflow::controller::{route_block, NextAction};
use crate::workflow::executor::{ExecContext, Flow, TaskOutcome};
use crate::workflow::model::{Task, TaskKind};
use crate::workflow::parallel::{aggregate_results, parse_retry_config, run_child_with_retry};

/// Execute a conditional block: evaluate the gate, run the selected branch
/// sequentially (with the same per-child retry shape as parallel blocks),
/// aggregate, store, and route.
pub async fn execute_conditional(ctx: &ExecContext, task: &Task) -> Flow {
    let TaskKind::Conditional(spec) = &task.kind else {
        error!("Task {}: not a conditional task", task.id);
        return Flow::TerminalFail;
    };
    ctx.state.set_current_task(task.id);

    if spec.condition.is_empty() {
        info!(
            "Task {}: No condition specified, skipping conditional task",
            task.id
        );
        return Flow::Next(task.id + 1);
    }

    // The gate sees no command output; it runs on globals and prior results.
    let gate = evaluate_condition(
        &spec.condition,
        0,
        "",
        "",
        &ctx.state.globals(),
        &ctx.state.all_task_results(),
        None,
    );
    let branch = if gate { "TRUE" } else { "FALSE" };
    info!(
        "Task {}: Conditional condition '{}' evaluated to {}",
        task.id, spec.condition, branch
    );

    let child_ids = if gate {
        &spec.if_true_tasks
    } else {
        &spec.if_false_tasks
    };
    if child_ids.is_empty() {
        // Both branches are validated non-empty; hitting this means the
        // file skipped validation.
        error!(
            "Task {}: FATAL - Empty task list for {} branch. Conditional blocks must have at least one task in each branch.",
            task.id, branch
        );
        return Flow::TerminalFail;
    }

    let mut children = Vec::new();
    let mut missing = Vec::new();
    for id in child_ids {
        match ctx.state.task(*id) {
            Some(child) => children.push(child),
            None => missing.push(*id),
        }
    }
    if !missing.is_empty() {
        error!(
            "Task {}: Missing referenced tasks in {} branch: {:?}",
            task.id, branch, missing
        );
        return Flow::TerminalFail;
    }

    let retry = parse_retry_config(ctx, &spec.retry);
    let retry_info = retry.map_or(String::new(), |r| {
        format!(
            ", retry_failed=true (count={}, delay={}s)",
            r.count, r.delay_secs
        )
    });
    info!(
        "Task {}: Executing {} branch with {} tasks (sequential{})",
        task.id,
        branch,
        children.len(),
        retry_info
    );

    let started = std::time::Instant::now();
    let mut outcomes: Vec<TaskOutcome> = Vec::new();

    for child in &children {
        if ctx.shutdown.is_requested() {
            info!("Conditional execution interrupted by shutdown request");
            break;
        }

        // Children keep their own timeouts here; there is no master
        // deadline over a conditional branch.
        let outcome = run_child_with_retry(ctx, task.id, child, None, retry).await;

        // Post-task sleep runs on a detached timer; the wait is bounded at
        // sleep + 5s so a stalled timer cannot block the branch forever.
        let sleep_seconds = outcome.result.sleep_seconds;
        if sleep_seconds > 0.0 && !ctx.dry_run {
            info!(
                "Task {}-{}: Sleeping for {} seconds...",
                task.id, outcome.task_id, sleep_seconds
            );
            let shutdown = ctx.shutdown.clone();
            let timer = tokio::spawn(async move {
                crate::workflow::executor::sleep_with_shutdown(sleep_seconds, &shutdown).await;
            });
            let bound = Duration::from_secs_f64(sleep_seconds + 5.0);
            if tokio::time::timeout(bound, timer).await.is_err() {
                warn!(
                    "Task {}-{}: Sleep timer did not complete within timeout, proceeding",
                    task.id, outcome.task_id
                );
            }
        }

        ctx.state
            .store_task_result(outcome.task_id, outcome.result.clone());

        let mut status = format!("Success: {}", outcome.result.success);
        if outcome.result.exit_code == exit_code::TIMEOUT {
            status.push_str(" (timeout)");
        } else if outcome.result.skipped {
            status.push_str(" (skipped)");
        }
        info!(
            "Task {}-{}: Completed - {}",
            task.id, outcome.task_id, status
        );

        outcomes.push(outcome);
    }

    info!(
        "Task {}: Conditional execution completed in {:.2} seconds",
        task.id,
        started.elapsed().as_secs_f64()
    );

    let label = format!("Conditional {} branch", branch);
    let aggregation = aggregate_results(&label, &outcomes);
    ctx.state
        .store_task_result(task.id, aggregation.result.clone());

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
