use std::collections::{BTreeMap, HashSet, VecDeque};

use lazy_static::lazy_static;
use regex::Regex;

use crate::workflow::condition::check_expression;
use crate::workflow::model::{build_task, parse_task_list, RawTask, Task, TaskId};
use crate::workflow::parser::ParsedFile;

lazy_static! {
    static ref TASK_REF: Regex = Regex::new(r"(?i)@(\d+)_(stdout|stderr|success|exit)@").unwrap();
    static ref GLOBAL_REF: Regex = Regex::new(r"@([a-zA-Z_][a-zA-Z0-9_]*)@").unwrap();
    static ref TASK_SHAPED: Regex = Regex::new(r"(?i)^\d+_(stdout|stderr|success|exit)$").unwrap();
    static ref MODIFIER_SHAPED: Regex = Regex::new(r"^[a-z_]+=\d+$").unwrap();
}

const KNOWN_FIELDS: [&str; 25] = [
    "type",
    "hostname",
    "command",
    "arguments",
    "exec",
    "timeout",
    "success",
    "failure",
    "condition",
    "next",
    "on_success",
    "on_failure",
    "loop",
    "loop_break",
    "sleep",
    "stdout_split",
    "stderr_split",
    "return",
    "tasks",
    "max_parallel",
    "retry_failed",
    "retry_count",
    "retry_delay",
    "if_true_tasks",
    "if_false_tasks",
];

const AGGREGATE_MODIFIERS: [&str; 4] = ["min_success", "max_failed", "min_failed", "max_success"];
const KNOWN_DELIMITERS: [&str; 9] = [
    "space",
    "whitespace",
    "tab",
    "newline",
    "colon",
    "semicolon",
    "semi",
    "comma",
    "pipe",
];

#[derive(Debug, Default)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Typed tasks, present when no build error occurred.
    pub tasks: BTreeMap<TaskId, Task>,
}

impl ValidationReport {
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, raw: &RawTask, message: impl AsRef<str>) {
        self.errors.push(format!(
            "Line {}: Task {}: {}",
            raw.line,
            raw.id,
            message.as_ref()
        ));
    }

    fn warn(&mut self, raw: &RawTask, message: impl AsRef<str>) {
        self.warnings.push(format!(
            "Line {}: Task {}: {}",
            raw.line,
            raw.id,
            message.as_ref()
        ));
    }
}

/// Validate the parsed file and build the typed task map.
///
/// Errors abort the run with a validation exit; warnings are logged and
/// execution proceeds.
pub fn validate(parsed: &ParsedFile) -> ValidationReport {
    let mut report = ValidationReport::default();

    if parsed.tasks.is_empty() {
        report.errors.push("no tasks defined in task file".to_string());
        return report;
    }

    // Children of parallel/conditional blocks obey extra rules.
    let mut child_ids: HashSet<TaskId> = HashSet::new();
    for raw in parsed.tasks.values() {
        for key in ["tasks", "if_true_tasks", "if_false_tasks"] {
            if let Some(value) = raw.get(key) {
                if let Ok(ids) = parse_task_list(value) {
                    child_ids.extend(ids);
                }
            }
        }
    }

    for raw in parsed.tasks.values() {
        validate_fields(raw, &mut report);
        validate_mutual_exclusions(raw, &mut report);
        validate_routing(raw, parsed, &mut report);
        validate_expressions(raw, &mut report);
        validate_next_value(raw, &mut report);
        validate_splits(raw, &mut report);
        validate_variable_references(raw, parsed, &mut report);

        match raw.get("type") {
            Some("parallel") => validate_block(raw, parsed, "tasks", &mut report),
            Some("conditional") => validate_conditional(raw, parsed, &mut report),
            Some("decision") => validate_decision(raw, &mut report),
            Some(other) => report.error(raw, format!("unknown task type '{}'", other)),
            None => validate_normal(raw, child_ids.contains(&raw.id), &mut report),
        }
    }

    validate_reachability(parsed, &child_ids, &mut report);

    // Typed conversion; errors here usually duplicate earlier findings but
    // catch anything schema checks missed.
    let mut tasks = BTreeMap::new();
    for raw in parsed.tasks.values() {
        match build_task(raw) {
            Ok(task) => {
                tasks.insert(task.id, task);
            }
            Err(message) => report.errors.push(message),
        }
    }
    if report.ok() {
        report.tasks = tasks;
    }
    report
}

fn validate_fields(raw: &RawTask, report: &mut ValidationReport) {
    let mut seen = HashSet::new();
    for (key, _) in &raw.fields {
        if !KNOWN_FIELDS.contains(&key.as_str()) {
            report.warn(raw, format!("has unknown field '{}'", key));
        }
        if !seen.insert(key.clone()) {
            report.warn(raw, format!("field '{}' appears more than once", key));
        }
    }
}

fn validate_mutual_exclusions(raw: &RawTask, report: &mut ValidationReport) {
    if raw.has("next") && (raw.has("on_success") || raw.has("on_failure")) {
        report.error(
            raw,
            "'next' and 'on_success'/'on_failure' are mutually exclusive",
        );
    }
    if raw.has("success") && raw.has("failure") {
        report.error(raw, "'success' and 'failure' are mutually exclusive");
    }
    if raw.get("next") == Some("loop") && !raw.has("loop") {
        report.error(raw, "'next=loop' requires a 'loop' count");
    }
    if raw.has("loop") && raw.get("next") != Some("loop") {
        report.warn(raw, "'loop' has no effect without 'next=loop'");
    }
    if raw.has("loop_break") && raw.get("next") != Some("loop") {
        report.warn(raw, "'loop_break' has no effect without 'next=loop'");
    }
}

fn validate_routing(raw: &RawTask, parsed: &ParsedFile, report: &mut ValidationReport) {
    for key in ["on_success", "on_failure"] {
        let Some(value) = raw.get(key) else { continue };
        match value.trim().parse::<TaskId>() {
            Ok(target) => {
                // Forward-only: loops re-enter through the LOOP signal, never
                // through explicit routing.
                if target <= raw.id {
                    report.error(
                        raw,
                        format!(
                            "'{}={}' must target a task after {} (backward jumps are not allowed)",
                            key, target, raw.id
                        ),
                    );
                } else if !parsed.tasks.contains_key(&target) {
                    report.warn(
                        raw,
                        format!("'{}={}' targets an undefined task", key, target),
                    );
                }
            }
            Err(_) => report.error(raw, format!("invalid '{}' value '{}'", key, value)),
        }
    }
}

fn validate_expressions(raw: &RawTask, report: &mut ValidationReport) {
    for key in ["success", "failure", "condition", "loop_break"] {
        if let Some(expression) = raw.get(key) {
            for problem in check_expression(expression) {
                report.error(raw, format!("{}: {}", key, problem));
            }
        }
    }
}

fn validate_next_value(raw: &RawTask, report: &mut ValidationReport) {
    let Some(next) = raw.get("next") else { return };
    let is_block = matches!(raw.get("type"), Some("parallel") | Some("conditional"));

    match next {
        "never" | "always" | "loop" => return,
        "success" => return,
        "partial_success" => {
            report.error(raw, "'next=partial_success' is not supported");
            return;
        }
        "all_success" | "any_success" | "majority_success" => {
            if !is_block {
                report.warn(
                    raw,
                    format!("'next={}' only aggregates parallel/conditional blocks", next),
                );
            }
            return;
        }
        _ => {}
    }

    if is_block && MODIFIER_SHAPED.is_match(next) {
        let key = next.split('=').next().unwrap_or("");
        if !AGGREGATE_MODIFIERS.contains(&key) {
            report.error(
                raw,
                format!(
                    "unknown modifier '{}' (valid: {})",
                    key,
                    AGGREGATE_MODIFIERS.join(", ")
                ),
            );
        }
        return;
    }
    if !is_block && (AGGREGATE_MODIFIERS.iter().any(|m| next.starts_with(m))) {
        report.warn(
            raw,
            format!("'next={}' only aggregates parallel/conditional blocks", next),
        );
        return;
    }

    // Decision tasks may route with a plain task ID.
    if raw.get("type") == Some("decision") && next.trim().parse::<TaskId>().is_ok() {
        return;
    }

    for problem in check_expression(next) {
        report.error(raw, format!("next: {}", problem));
    }
}

fn validate_splits(raw: &RawTask, report: &mut ValidationReport) {
    for key in ["stdout_split", "stderr_split"] {
        let Some(value) = raw.get(key) else { continue };
        let Some((delimiter, index)) = value.split_once(',') else {
            report.error(raw, format!("'{}' must be 'delimiter,index'", key));
            continue;
        };
        if index.trim().parse::<usize>().is_err() {
            report.error(
                raw,
                format!("'{}' index '{}' must be a non-negative integer", key, index),
            );
        }
        if !KNOWN_DELIMITERS.contains(&delimiter) && Regex::new(delimiter).is_err() {
            report.warn(raw, format!("'{}' uses unknown delimiter '{}'", key, delimiter));
        }
    }
}

fn validate_variable_references(raw: &RawTask, parsed: &ParsedFile, report: &mut ValidationReport) {
    for (key, value) in &raw.fields {
        for caps in TASK_REF.captures_iter(value) {
            let referenced: TaskId = match caps[1].parse() {
                Ok(id) => id,
                Err(_) => continue,
            };
            if !parsed.tasks.contains_key(&referenced) {
                report.error(
                    raw,
                    format!("{} references undefined task result @{}_...@", key, referenced),
                );
            } else if referenced >= raw.id {
                report.warn(
                    raw,
                    format!(
                        "{} references task {} which has not run yet at this point",
                        key, referenced
                    ),
                );
            }
        }
        for caps in GLOBAL_REF.captures_iter(value) {
            let name = &caps[1];
            if TASK_SHAPED.is_match(name) {
                continue;
            }
            if !parsed.globals.contains_key(name) {
                report.error(
                    raw,
                    format!("{} references undefined global variable @{}@", key, name),
                );
            }
        }
    }
}

fn validate_normal(raw: &RawTask, is_child: bool, report: &mut ValidationReport) {
    if !raw.has("command") && !raw.has("return") {
        report.warn(raw, "has neither 'command' nor 'return'");
    }
    if let Some(value) = raw.get("return") {
        if value.trim().parse::<i32>().is_err() {
            report.error(raw, format!("invalid return code '{}'", value));
        }
    }
    if let Some(exec) = raw.get("exec") {
        if !exec.contains('@') && !crate::backends::is_known_exec_type(exec) {
            report.warn(
                raw,
                format!(
                    "unknown execution type '{}' (valid: pbrun, p7s, local, wwrs, shell; aliases: sh, bash)",
                    exec
                ),
            );
        }
    }
    if let Some(timeout) = raw.get("timeout") {
        if !timeout.contains('@') {
            match timeout.trim().parse::<i64>() {
                Ok(value) if !(5..=1000).contains(&value) => report.warn(
                    raw,
                    format!("timeout {} outside 5-1000, it will be clamped", value),
                ),
                Ok(_) => {}
                Err(_) => report.error(raw, format!("invalid timeout '{}'", timeout)),
            }
        }
    }
    for key in ["retry_failed", "retry_count", "retry_delay"] {
        if raw.has(key) {
            report.warn(
                raw,
                format!("'{}' only applies to parallel/conditional blocks", key),
            );
        }
    }
    if is_child {
        for key in ["on_success", "on_failure", "next"] {
            if raw.has(key) {
                report.error(
                    raw,
                    format!("'{}' is not allowed on a task referenced by a block", key),
                );
            }
        }
        for key in ["loop", "loop_break"] {
            if raw.has(key) {
                report.error(
                    raw,
                    format!("'{}' is not allowed on a task referenced by a block", key),
                );
            }
        }
    }
}

fn validate_block(
    raw: &RawTask,
    parsed: &ParsedFile,
    list_field: &str,
    report: &mut ValidationReport,
) {
    let Some(value) = raw.get(list_field) else {
        report.error(raw, format!("parallel task requires a '{}' field", list_field));
        return;
    };
    validate_child_list(raw, parsed, list_field, value, true, report);

    if let Some(max_parallel) = raw.get("max_parallel") {
        match max_parallel.trim().parse::<usize>() {
            Ok(0) => report.error(raw, "'max_parallel' must be at least 1"),
            Ok(_) => {}
            Err(_) => report.error(raw, format!("invalid 'max_parallel' value '{}'", max_parallel)),
        }
    }
    validate_retry_fields(raw, report);
}

fn validate_conditional(raw: &RawTask, parsed: &ParsedFile, report: &mut ValidationReport) {
    if !raw.has("condition") {
        report.error(raw, "conditional task requires a 'condition' field");
    }
    // Both branches are mandatory and non-empty: missing either makes the
    // workflow nondeterministic.
    for key in ["if_true_tasks", "if_false_tasks"] {
        match raw.get(key) {
            None => report.error(raw, format!("conditional task requires '{}'", key)),
            Some(value) if value.trim().is_empty() => {
                report.error(raw, format!("'{}' must not be empty", key))
            }
            Some(value) => validate_child_list(raw, parsed, key, value, false, report),
        }
    }
    validate_retry_fields(raw, report);
}

fn validate_child_list(
    raw: &RawTask,
    parsed: &ParsedFile,
    field: &str,
    value: &str,
    reject_self: bool,
    report: &mut ValidationReport,
) {
    let ids = match parse_task_list(value) {
        Ok(ids) => ids,
        Err(message) => {
            report.error(raw, format!("{}: {}", field, message));
            return;
        }
    };
    if ids.is_empty() {
        report.error(raw, format!("'{}' must reference at least one task", field));
        return;
    }
    for id in ids {
        if reject_self && id == raw.id {
            report.error(raw, format!("{} references the block itself", field));
            continue;
        }
        match parsed.tasks.get(&id) {
            None => report.error(raw, format!("{} references undefined task {}", field, id)),
            Some(child) => {
                if let Some(kind @ ("parallel" | "conditional")) = child.get("type") {
                    report.error(
                        raw,
                        format!(
                            "{} references task {} which is itself a {} block (nesting is not supported)",
                            field, id, kind
                        ),
                    );
                }
            }
        }
    }
}

fn validate_retry_fields(raw: &RawTask, report: &mut ValidationReport) {
    if let Some(count) = raw.get("retry_count") {
        if !count.contains('@') {
            match count.trim().parse::<i64>() {
                Ok(value) if !(1..=1000).contains(&value) => {
                    report.warn(raw, format!("retry_count {} outside 1-1000", value))
                }
                Ok(_) => {}
                Err(_) => report.error(raw, format!("invalid retry_count '{}'", count)),
            }
        }
    }
    if let Some(delay) = raw.get("retry_delay") {
        if !delay.contains('@') {
            match delay.trim().parse::<i64>() {
                Ok(value) if !(0..=300).contains(&value) => {
                    report.warn(raw, format!("retry_delay {} outside 0-300", value))
                }
                Ok(_) => {}
                Err(_) => report.error(raw, format!("invalid retry_delay '{}'", delay)),
            }
        }
    }
}

fn validate_decision(raw: &RawTask, report: &mut ValidationReport) {
    for key in ["command", "hostname", "timeout"] {
        if raw.has(key) {
            report.error(raw, format!("decision task must not define '{}'", key));
        }
    }
    if !raw.has("success") && !raw.has("failure") {
        report.error(raw, "decision task requires 'success' or 'failure'");
    }
    // Mutual exclusion of success/failure is checked for every task type.
}

/// Walk the routing graph from the lowest task and warn about tasks that no
/// path reaches. Gaps where a fall-through points at a missing ID end the
/// workflow, which is worth a warning too.
fn validate_reachability(
    parsed: &ParsedFile,
    child_ids: &HashSet<TaskId>,
    report: &mut ValidationReport,
) {
    let Some(&start) = parsed.tasks.keys().next() else {
        return;
    };

    let mut visited: HashSet<TaskId> = HashSet::new();
    let mut queue: VecDeque<TaskId> = VecDeque::from([start]);

    while let Some(id) = queue.pop_front() {
        if !visited.insert(id) {
            continue;
        }
        let Some(raw) = parsed.tasks.get(&id) else {
            continue;
        };

        let mut push = |target: TaskId, queue: &mut VecDeque<TaskId>| {
            if parsed.tasks.contains_key(&target) {
                queue.push_back(target);
            }
        };

        for key in ["tasks", "if_true_tasks", "if_false_tasks"] {
            if let Some(value) = raw.get(key) {
                if let Ok(ids) = parse_task_list(value) {
                    for child in ids {
                        push(child, &mut queue);
                    }
                }
            }
        }

        for key in ["on_success", "on_failure"] {
            if let Some(value) = raw.get(key) {
                if let Ok(target) = value.trim().parse::<TaskId>() {
                    push(target, &mut queue);
                }
            }
        }

        match raw.get("next") {
            Some("never") => {}
            Some(value) if raw.get("type") == Some("decision") => {
                if let Ok(target) = value.trim().parse::<TaskId>() {
                    push(target, &mut queue);
                } else {
                    push(id + 1, &mut queue);
                }
            }
            _ => {
                // Fall-through to id+1 happens when success is not routed
                // elsewhere: either no routing at all, or only on_failure.
                if raw.get("on_success").is_none() {
                    push(id + 1, &mut queue);
                }
            }
        }

        if raw.get("next") != Some("never")
            && !parsed.tasks.contains_key(&(id + 1))
            && raw.get("on_success").is_none()
            && raw.get("on_failure").is_none()
            && !raw.has("return")
            && !child_ids.contains(&id)
            && parsed.tasks.keys().any(|&other| other > id)
        {
            report.warn(
                raw,
                format!(
                    "falls through to undefined task {}; the workflow ends here",
                    id + 1
                ),
            );
        }
    }

    for (id, raw) in &parsed.tasks {
        if !visited.contains(id) && !child_ids.contains(id) {
            report.warn(raw, "is unreachable from the starting task");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::parser::parse_task_text;

    fn validate_text(text: &str) -> ValidationReport {
        validate(&parse_task_text(text).unwrap())
    }

    #[test]
    fn test_valid_file_passes() {
        let report = validate_text(
            "task=0\nhostname=h\ncommand=echo\narguments=hi\nnext=exit_0\n\ntask=1\nhostname=h\ncommand=true\n",
        );
        assert!(report.ok(), "errors: {:?}", report.errors);
        assert_eq!(report.tasks.len(), 2);
    }

    #[test]
    fn test_backward_jump_rejected() {
        let report = validate_text("task=0\ncommand=true\n\ntask=5\ncommand=true\non_failure=0\n");
        assert!(!report.ok());
        assert!(report.errors[0].contains("backward"));
    }

    #[test]
    fn test_self_jump_rejected() {
        let report = validate_text("task=5\ncommand=true\non_success=5\n");
        assert!(!report.ok());
    }

    #[test]
    fn test_next_and_routing_exclusive() {
        let report =
            validate_text("task=0\ncommand=true\nnext=always\non_success=1\n\ntask=1\ncommand=true\n");
        assert!(!report.ok());
        assert!(report.errors[0].contains("mutually exclusive"));
    }

    #[test]
    fn test_nested_parallel_rejected() {
        let report = validate_text(
            "task=0\ntype=parallel\ntasks=1\n\ntask=1\ntype=parallel\ntasks=2\n\ntask=2\ncommand=true\n",
        );
        assert!(!report.ok());
        assert!(report.errors.iter().any(|e| e.contains("nesting")));
    }

    #[test]
    fn test_child_with_routing_rejected() {
        let report = validate_text(
            "task=0\ntype=parallel\ntasks=10\n\ntask=10\ncommand=true\non_success=11\n\ntask=11\ncommand=true\n",
        );
        assert!(!report.ok());
    }

    #[test]
    fn test_child_with_loop_rejected() {
        let report = validate_text(
            "task=0\ntype=parallel\ntasks=10\n\ntask=10\ncommand=true\nnext=loop\nloop=2\n",
        );
        assert!(!report.ok());
    }

    #[test]
    fn test_parallel_self_reference_rejected() {
        let report = validate_text("task=0\ntype=parallel\ntasks=0\n");
        assert!(!report.ok());
    }

    #[test]
    fn test_conditional_requires_both_branches() {
        let report = validate_text(
            "task=0\ntype=conditional\ncondition=true\nif_true_tasks=1\n\ntask=1\ncommand=true\n",
        );
        assert!(!report.ok());
        assert!(report.errors.iter().any(|e| e.contains("if_false_tasks")));
    }

    #[test]
    fn test_decision_rules() {
        let ok = validate_text("task=0\ntype=decision\nsuccess=true\non_success=1\n\ntask=1\ncommand=true\n");
        assert!(ok.ok(), "errors: {:?}", ok.errors);

        let with_command = validate_text("task=0\ntype=decision\nsuccess=true\ncommand=echo\n");
        assert!(!with_command.ok());

        let no_condition = validate_text("task=0\ntype=decision\n");
        assert!(!no_condition.ok());

        let both = validate_text("task=0\ntype=decision\nsuccess=true\nfailure=false\n");
        assert!(!both.ok());
    }

    #[test]
    fn test_undefined_global_reference_rejected() {
        let report = validate_text("task=0\ncommand=echo\narguments=@NOPE@\n");
        assert!(!report.ok());
        assert!(report.errors[0].contains("@NOPE@"));
    }

    #[test]
    fn test_forward_task_reference_warns() {
        let report =
            validate_text("task=0\ncommand=echo\narguments=@1_stdout@\n\ntask=1\ncommand=true\n");
        assert!(report.ok());
        assert!(report.warnings.iter().any(|w| w.contains("not run yet")));
    }

    #[test]
    fn test_operator_in_parens_rejected() {
        let report = validate_text("task=0\ncommand=true\nsuccess=(exit_0&stdout~OK)\n");
        assert!(!report.ok());
    }

    #[test]
    fn test_unquoted_operator_pattern_rejected() {
        let report = validate_text("task=0\ncommand=true\nsuccess=stdout~a=b&c\n");
        assert!(!report.ok());
        let quoted = validate_text("task=0\ncommand=true\nsuccess=stdout~\"a=b&c\"\n");
        assert!(quoted.ok(), "errors: {:?}", quoted.errors);
    }

    #[test]
    fn test_partial_success_removed() {
        let report = validate_text("task=0\ntype=parallel\ntasks=1\nnext=partial_success\n\ntask=1\ncommand=true\n");
        assert!(!report.ok());
    }

    #[test]
    fn test_unreachable_task_warns() {
        let report = validate_text(
            "task=0\ncommand=true\nnext=never\n\ntask=9\ncommand=true\n",
        );
        assert!(report.ok());
        assert!(report.warnings.iter().any(|w| w.contains("unreachable")));
    }

    #[test]
    fn test_next_loop_requires_loop_count() {
        let report = validate_text("task=0\ncommand=true\nnext=loop\n");
        assert!(!report.ok());
    }

    #[test]
    fn test_unknown_field_warns() {
        let report = validate_text("task=0\ncommand=true\nfrobnicate=1\n");
        assert!(report.ok());
        assert!(report.warnings.iter().any(|w| w.contains("frobnicate")));
    }
}
