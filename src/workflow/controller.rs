use tracing::{debug, info};

use crate::workflow::condition::{evaluate_block_predicate, evaluate_condition, BlockStats};
use crate::workflow::model::{Task, TaskId};
use crate::workflow::state::StateManager;

/// Where the workflow goes after a task completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    /// Continue with this task ID (the target may not exist, which ends the
    /// workflow successfully).
    Goto(TaskId),
    /// Re-execute the same task (loop iteration).
    Loop,
    /// Stop the workflow successfully (`next=never`).
    TerminalOk,
    /// Stop the workflow as failed (exit code 10).
    TerminalFail,
}

/// Compute the next task for a normal or decision outcome.
///
/// `on_success`/`on_failure` take priority (they are mutually exclusive with
/// `next` by validation); otherwise `next` decides; with neither, execution
/// falls through to `current + 1`.
pub fn route(
    state: &StateManager,
    task: &Task,
    exit_code: i32,
    stdout: &str,
    stderr: &str,
    success: bool,
) -> NextAction {
    if task.on_success.is_some() || task.on_failure.is_some() {
        return route_explicit(task, success);
    }

    match task.next.as_deref() {
        None => NextAction::Goto(task.id + 1),
        Some("never") => {
            info!("Task {}: 'next=never' found, stopping execution", task.id);
            NextAction::TerminalOk
        }
        Some("always") => NextAction::Goto(task.id + 1),
        Some("loop") if task.loop_count.is_some() => {
            let break_met = task.loop_break.as_deref().is_some_and(|expr| {
                evaluate_condition(
                    expr,
                    exit_code,
                    stdout,
                    stderr,
                    &state.globals(),
                    &state.all_task_results(),
                    Some(success),
                )
            });
            handle_loop(state, task, break_met)
        }
        Some(expression) => {
            let met = evaluate_condition(
                expression,
                exit_code,
                stdout,
                stderr,
                &state.globals(),
                &state.all_task_results(),
                Some(success),
            );
            if met {
                info!(
                    "Task {}: 'next' condition '{}' met, proceeding to next task",
                    task.id, expression
                );
                NextAction::Goto(task.id + 1)
            } else {
                info!(
                    "Task {}: 'next' condition '{}' not met, stopping execution",
                    task.id, expression
                );
                state.mark_failed_due_to_condition();
                NextAction::TerminalFail
            }
        }
    }
}

/// Routing for parallel and conditional blocks: `next` is first tried as an
/// aggregate predicate over the block statistics, then as a regular
/// expression against the synthesized parent result.
pub fn route_block(
    state: &StateManager,
    task: &Task,
    stats: &BlockStats,
    exit_code: i32,
    stdout: &str,
    stderr: &str,
) -> NextAction {
    let block_success = stats.success == stats.total;

    // An explicit `success` aggregate decides the block outcome before any
    // `next` handling.
    if let Some(expression) = &task.success {
        let met = evaluate_block_expression(state, expression, stats, exit_code, stdout, stderr);
        info!(
            "Task {}: Success condition '{}' evaluated to: {}",
            task.id, expression, met
        );
        if task.on_success.is_some() || task.on_failure.is_some() {
            return route_explicit(task, met);
        }
        return if met {
            NextAction::Goto(task.id + 1)
        } else {
            state.mark_failed_due_to_condition();
            NextAction::TerminalFail
        };
    }

    if task.on_success.is_some() || task.on_failure.is_some() {
        let continue_on = match task.next.as_deref() {
            // Validation forbids next + routing together; reaching here
            // without next means plain all-success semantics.
            None => block_success,
            Some(expr) => evaluate_block_expression(state, expr, stats, exit_code, stdout, stderr),
        };
        return route_explicit(task, continue_on);
    }

    match task.next.as_deref() {
        None => {
            // Default for blocks: all children must succeed.
            if block_success {
                NextAction::Goto(task.id + 1)
            } else {
                state.mark_failed_due_to_condition();
                NextAction::TerminalFail
            }
        }
        Some("never") => NextAction::TerminalOk,
        Some("always") => NextAction::Goto(task.id + 1),
        Some("loop") if task.loop_count.is_some() => {
            let break_met = task.loop_break.as_deref().is_some_and(|expr| {
                evaluate_block_expression(state, expr, stats, exit_code, stdout, stderr)
            });
            handle_loop(state, task, break_met)
        }
        Some(expression) => {
            let met = evaluate_block_expression(state, expression, stats, exit_code, stdout, stderr);
            info!(
                "Task {}: block condition '{}' evaluated to: {}",
                task.id, expression, met
            );
            if met {
                NextAction::Goto(task.id + 1)
            } else {
                state.mark_failed_due_to_condition();
                NextAction::TerminalFail
            }
        }
    }
}

fn evaluate_block_expression(
    state: &StateManager,
    expression: &str,
    stats: &BlockStats,
    exit_code: i32,
    stdout: &str,
    stderr: &str,
) -> bool {
    if let Some(value) = evaluate_block_predicate(expression, stats) {
        debug!(
            "aggregate predicate '{}': {}/{} successful -> {}",
            expression, stats.success, stats.total, value
        );
        return value;
    }
    evaluate_condition(
        expression,
        exit_code,
        stdout,
        stderr,
        &state.globals(),
        &state.all_task_results(),
        Some(stats.success == stats.total),
    )
}

fn route_explicit(task: &Task, success: bool) -> NextAction {
    match (success, task.on_success, task.on_failure) {
        (true, Some(target), _) => {
            info!("Task {}: Success - jumping to Task {}", task.id, target);
            NextAction::Goto(target)
        }
        (false, _, Some(target)) => {
            info!("Task {}: Failure - jumping to Task {}", task.id, target);
            NextAction::Goto(target)
        }
        // Success with only on_failure set continues sequentially.
        (true, None, Some(_)) => NextAction::Goto(task.id + 1),
        // Failure with only on_success set ends the workflow as failed.
        (false, Some(_), None) => NextAction::TerminalFail,
        (_, None, None) => NextAction::Goto(task.id + 1),
    }
}

/// Loop bookkeeping shared by sequential and block loops. The executor seeds
/// the counter before the first iteration; re-entries advance the iteration
/// number used for `.N` display.
fn handle_loop(state: &StateManager, task: &Task, break_met: bool) -> NextAction {
    let id = task.id;
    let loop_count = task.loop_count.unwrap_or(0) as i64;

    if state.loop_counter(id) == 0 {
        state.set_loop_counter(id, loop_count);
        state.set_loop_iteration(id, 1);
        info!("Task {}: Loop initialized with count {}", id, loop_count);
    } else {
        let iteration = state.loop_iteration(id);
        state.set_loop_iteration(id, iteration + 1);
    }

    if break_met {
        info!(
            "Task {}: Breaking loop - loop_break condition satisfied",
            id
        );
        state.clear_loop_tracking(id);
        return NextAction::Goto(id + 1);
    }

    let remaining = state.decrement_loop_counter(id);
    if remaining > 0 {
        info!(
            "Task {}.{}: Loop iteration completed, {} iterations remaining",
            id,
            state.loop_iteration(id),
            remaining
        );
        NextAction::Loop
    } else {
        info!("Task {}: Loop completed, proceeding to next task", id);
        state.clear_loop_tracking(id);
        NextAction::Goto(id + 1)
    }
}
