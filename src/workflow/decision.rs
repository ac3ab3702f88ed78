use tracing::{error, info};

use crate::workflow::condition::evaluate_condition;
use crate::workflow::controller::{route, NextAction};
use crate::workflow::executor::{ExecContext, Flow};
use crate::workflow::model::{Task, TaskResult};

/// Execute a decision task: a pure routing node with no command.
///
/// Exactly one of `success`/`failure` is present (validated). The decision
/// passes when the success condition holds, or when the failure condition
/// does not. A synthetic result is stored so later tasks can reference the
/// outcome, then normal routing applies.
pub async fn execute_decision(ctx: &ExecContext, task: &Task) -> Flow {
    ctx.state.set_current_task(task.id);
    info!("Task {}: DECISION - Evaluating conditions", task.id);

    let globals = ctx.state.globals();
    let results = ctx.state.all_task_results();

    let passed = match (&task.success, &task.failure) {
        (Some(expression), _) => {
            let met = evaluate_condition(expression, 0, "", "", &globals, &results, None);
            info!(
                "Task {}: Decision condition '{}' evaluated to: {}",
                task.id, expression, met
            );
            met
        }
        (None, Some(expression)) => {
            let met = evaluate_condition(expression, 0, "", "", &globals, &results, None);
            info!(
                "Task {}: Failure condition '{}' evaluated to: {}",
                task.id, expression, met
            );
            !met
        }
        (None, None) => {
            // Unreachable after validation.
            error!(
                "Task {}: Decision block has no success or failure conditions defined",
                task.id
            );
            return Flow::TerminalFail;
        }
    };

    if passed {
        info!("Task {}: Decision PASSED", task.id);
    } else {
        info!("Task {}: Decision FAILED", task.id);
    }

    let label = if passed { "success" } else { "failure" };
    let stdout = format!("Decision: {}", label);
    ctx.state.store_task_result(
        task.id,
        TaskResult {
            exit_code: if passed { 0 } else { 1 },
            stdout_size: stdout.len() as u64,
            stdout,
            success: passed,
            ..Default::default()
        },
    );

    // A numeric `next` is plain forward routing; everything else goes
    // through the regular controller rules.
    if let Some(next) = task.next.as_deref() {
        if task.on_success.is_none() && task.on_failure.is_none() {
            if let Ok(target) = next.trim().parse::<u32>() {
                info!("Task {}: Proceeding to task {} (next)", task.id, target);
                return Flow::Next(target);
            }
        }
    }

    let result = ctx.state.task_result(task.id).unwrap_or_default();
    match route(
        &ctx.state,
        task,
        result.exit_code,
        &result.stdout,
        &result.stderr,
        passed,
    ) {
        NextAction::Goto(id) => Flow::Next(id),
        NextAction::Loop => Flow::Loop,
        NextAction::TerminalOk => Flow::TerminalOk,
        NextAction::TerminalFail => Flow::TerminalFail,
    }
}
