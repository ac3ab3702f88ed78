use tracing::debug;

use crate::workflow::model::{Globals, TaskResults};
use crate::workflow::vars::{replace_variables, split_output};

/// Comparison operators in match priority order. Longer operators first so
/// `!~` is never read as `!` + `~` and `<=` never as `<`.
const OPERATORS: [&str; 8] = ["!~", "<=", ">=", "!=", "~", "=", "<", ">"];

/// Evaluate a condition expression against a task outcome.
///
/// Grammar: `|` joins OR terms, `&` joins AND factors inside a term, and
/// parentheses may wrap a single simple condition. Variables are expanded
/// first; an expression that still fails to parse evaluates to false rather
/// than aborting the workflow.
pub fn evaluate_condition(
    condition: &str,
    exit_code: i32,
    stdout: &str,
    stderr: &str,
    globals: &Globals,
    results: &TaskResults,
    current_success: Option<bool>,
) -> bool {
    let condition = condition.trim();
    if condition.is_empty() {
        return false;
    }

    let (condition, _resolved) = replace_variables(condition, globals, results);
    debug!("condition after variable replacement: '{}'", condition);

    let or_parts = split_top_level(&condition, '|');
    if or_parts.len() > 1 {
        // Evaluate every operand; OR has no short-circuit contract.
        let values: Vec<bool> = or_parts
            .iter()
            .map(|part| evaluate_and_term(part, exit_code, stdout, stderr, current_success))
            .collect();
        return values.into_iter().any(|v| v);
    }
    evaluate_and_term(&condition, exit_code, stdout, stderr, current_success)
}

fn evaluate_and_term(
    term: &str,
    exit_code: i32,
    stdout: &str,
    stderr: &str,
    current_success: Option<bool>,
) -> bool {
    let and_parts = split_top_level(term, '&');
    if and_parts.len() > 1 {
        let values: Vec<bool> = and_parts
            .iter()
            .map(|part| evaluate_simple_condition(part, exit_code, stdout, stderr, current_success))
            .collect();
        return values.into_iter().all(|v| v);
    }
    evaluate_simple_condition(term, exit_code, stdout, stderr, current_success)
}

/// Evaluate one simple condition (no boolean operators).
pub fn evaluate_simple_condition(
    condition: &str,
    exit_code: i32,
    stdout: &str,
    stderr: &str,
    current_success: Option<bool>,
) -> bool {
    let mut condition = condition.trim();

    // Strip matched outer parentheses: (exit_0), ((stdout~OK)).
    while condition.starts_with('(') && condition.ends_with(')') {
        if !parens_wrap_whole(condition) {
            break;
        }
        condition = condition[1..condition.len() - 1].trim();
    }

    let lower = condition.to_lowercase();

    // Built-in exit-code conditions.
    if lower == "exit_0" {
        return exit_code == 0;
    }
    if lower == "exit_not_0" {
        return exit_code != 0;
    }
    if let Some(rest) = lower.strip_prefix("exit_") {
        if let Ok(expected) = rest.parse::<i32>() {
            return exit_code == expected;
        }
        debug!("invalid exit code condition '{}', treating as false", condition);
        return false;
    }

    if lower == "success" {
        return current_success.unwrap_or(exit_code == 0);
    }

    // stdout/stderr pattern and count conditions. Plain comparisons on the
    // streams (stdout=..., stdout<...) fall through to the operator path.
    for (stream_name, stream) in [("stdout", stdout), ("stderr", stderr)] {
        if !lower.starts_with(stream_name) {
            continue;
        }
        let has_count = lower.contains("_count");
        let has_tilde = condition.contains('~');
        let has_comparison = OPERATORS
            .iter()
            .filter(|op| !op.contains('~'))
            .any(|op| condition.contains(op));
        if !(has_count || has_tilde || !has_comparison) {
            continue;
        }

        if lower == format!("{}~", stream_name) {
            return stream.trim().is_empty();
        }
        if lower == format!("{}!~", stream_name) {
            return !stream.trim().is_empty();
        }
        if has_tilde {
            let stripped = stream.trim_end_matches('\n');
            let negated = lower.starts_with(&format!("{}!~", stream_name));
            if let Some((_, raw_pattern)) = condition.split_once('~') {
                let pattern = extract_pattern(raw_pattern);
                let found = stripped.contains(&pattern);
                return if negated { !found } else { found };
            }
        }
        if has_count {
            return evaluate_count_condition(&lower, stream);
        }
    }

    // General comparisons: exit=2, stdout:colon,1=value, VAR<10, ...
    if OPERATORS.iter().any(|op| condition.contains(op)) {
        return evaluate_operator_comparison(condition, exit_code, stdout, stderr);
    }

    if lower == "true" {
        return true;
    }
    if lower == "false" {
        return false;
    }

    // Legacy substring forms.
    if let Some(term) = condition.strip_prefix("contains:") {
        return stdout.contains(term);
    }
    if let Some(term) = condition.strip_prefix("not_contains:") {
        return !stdout.contains(term);
    }

    debug!("unrecognized condition '{}', treating as false", condition);
    false
}

/// `stdout_count=3`, `stderr_count<5`. An empty (trimmed) stream counts as 0
/// lines.
fn evaluate_count_condition(condition: &str, stream: &str) -> bool {
    let Some((_, spec)) = condition.split_once("_count") else {
        return false;
    };
    let mut chars = spec.chars();
    let Some(op) = chars.next() else {
        return false;
    };
    let Ok(expected) = chars.as_str().trim().parse::<usize>() else {
        debug!("invalid count specification in condition '{}'", condition);
        return false;
    };

    let trimmed = stream.trim();
    let actual = if trimmed.is_empty() {
        0
    } else {
        trimmed.split('\n').count()
    };

    match op {
        '=' => actual == expected,
        '<' => actual < expected,
        '>' => actual > expected,
        _ => {
            debug!("invalid operator in count condition '{}'", condition);
            false
        }
    }
}

/// Parse `lhs OP rhs`, with quote support on the right side so patterns can
/// contain operator characters. Returns `None` when no operator is found or
/// a quote never closes.
pub fn parse_operator_condition(condition: &str) -> Option<(&'static str, String, String)> {
    // First pass: quoted right-hand sides take priority because they may
    // contain any characters.
    for op in OPERATORS {
        let Some(op_idx) = condition.find(op) else {
            continue;
        };
        let left = condition[..op_idx].trim();
        let right_raw = condition[op_idx + op.len()..].trim();
        let mut right_chars = right_raw.chars();
        let quote = match right_chars.next() {
            Some(q @ ('"' | '\'')) => q,
            _ => continue,
        };

        let mut close_idx = None;
        let mut prev_escape = false;
        for (i, c) in right_raw.char_indices().skip(1) {
            if c == quote && !prev_escape {
                close_idx = Some(i);
                break;
            }
            prev_escape = c == '\\' && !prev_escape;
        }

        match close_idx {
            Some(idx) => {
                let remainder = right_raw[idx + 1..].trim();
                if !remainder.is_empty() {
                    debug!("unexpected text after closing quote in '{}'", condition);
                    continue;
                }
                let unescaped = right_raw[1..idx].replace(&format!("\\{}", quote), &quote.to_string());
                return Some((op, left.to_string(), unescaped));
            }
            None => {
                debug!("unclosed quote in condition '{}'", condition);
                return None;
            }
        }
    }

    // Second pass: unquoted, split on the highest-priority operator present.
    for op in OPERATORS {
        if let Some((left, right)) = condition.split_once(op) {
            return Some((op, left.trim().to_string(), right.trim().to_string()));
        }
    }
    None
}

fn evaluate_operator_comparison(condition: &str, exit_code: i32, stdout: &str, stderr: &str) -> bool {
    let Some((op, left, right)) = parse_operator_condition(condition) else {
        debug!("could not parse operator condition '{}'", condition);
        return false;
    };

    let left_lower = left.to_lowercase();
    let left_val: String = if let Some(spec) = left_lower.strip_prefix("stdout:") {
        split_output(stdout, spec)
    } else if let Some(spec) = left_lower.strip_prefix("stderr:") {
        split_output(stderr, spec)
    } else if left_lower == "exit" {
        exit_code.to_string()
    } else if left_lower == "stdout" {
        stdout.trim_end_matches('\n').to_string()
    } else if left_lower == "stderr" {
        stderr.trim_end_matches('\n').to_string()
    } else {
        left.clone()
    };

    match op {
        "=" => values_equal(&left_val, &right),
        "!=" => !values_equal(&left_val, &right),
        "~" => left_val.contains(&right),
        "!~" => !left_val.contains(&right),
        "<" | "<=" | ">" | ">=" => {
            // Numeric-only: if either side is not a number the comparison is
            // false, not an error.
            let (Some(l), Some(r)) = (to_number(&left_val), to_number(&right)) else {
                debug!("non-numeric comparison '{}' treated as false", condition);
                return false;
            };
            match op {
                "<" => l < r,
                "<=" => l <= r,
                ">" => l > r,
                ">=" => l >= r,
                _ => unreachable!(),
            }
        }
        _ => false,
    }
}

/// Equality compares numerically when both sides parse as numbers, so
/// `exit=0` matches `00`; otherwise it is a plain string comparison.
fn values_equal(left: &str, right: &str) -> bool {
    match (to_number(left), to_number(right)) {
        (Some(l), Some(r)) => l == r,
        _ => left == right,
    }
}

fn to_number(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok()
}

/// Extract a `~` pattern, removing matching quotes. An unclosed quote is
/// treated permissively: the leading quote is dropped.
fn extract_pattern(raw: &str) -> String {
    let pattern = raw.trim();
    let mut chars = pattern.chars();
    match chars.next() {
        Some(q @ ('"' | '\'')) => {
            if pattern.len() > 1 && pattern.ends_with(q) {
                let inner = &pattern[1..pattern.len() - 1];
                inner.replace(&format!("\\{}", q), &q.to_string())
            } else {
                debug!("unclosed quote in pattern '{}', treating as unquoted", pattern);
                chars.as_str().to_string()
            }
        }
        _ => pattern.to_string(),
    }
}

/// Split on a separator at quote depth zero. Parentheses never legally
/// contain separators, so only quotes matter here.
fn split_top_level(text: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut prev_escape = false;

    for c in text.chars() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q && !prev_escape {
                    quote = None;
                }
                prev_escape = c == '\\' && !prev_escape;
            }
            None => {
                if c == '"' || c == '\'' {
                    quote = Some(c);
                    current.push(c);
                } else if c == sep {
                    parts.push(current.trim().to_string());
                    current.clear();
                } else {
                    current.push(c);
                }
            }
        }
    }
    parts.push(current.trim().to_string());
    parts
}

/// True when the outermost parentheses of `text` wrap the entire string.
fn parens_wrap_whole(text: &str) -> bool {
    let mut depth = 0i32;
    for (i, c) in text.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            _ => {}
        }
        if depth == 0 && i < text.len() - 1 {
            return false;
        }
    }
    depth == 0
}

/// Aggregate outcome of a parallel or conditional block.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockStats {
    pub success: usize,
    pub failed: usize,
    pub total: usize,
}

/// Evaluate an aggregate predicate over block statistics. Returns `None`
/// when the condition is not an aggregate form, in which case the caller
/// evaluates it as a regular expression against the synthesized parent
/// result.
pub fn evaluate_block_predicate(condition: &str, stats: &BlockStats) -> Option<bool> {
    match condition.trim() {
        "all_success" => Some(stats.success == stats.total),
        "any_success" => Some(stats.success > 0),
        // Strict majority: ties fail.
        "majority_success" => Some(stats.success * 2 > stats.total),
        other => {
            let (key, value) = other.split_once('=')?;
            let threshold = value.trim().parse::<usize>().ok()?;
            match key.trim() {
                "min_success" => Some(stats.success >= threshold),
                "max_success" => Some(stats.success <= threshold),
                "min_failed" => Some(stats.failed >= threshold),
                "max_failed" => Some(stats.failed <= threshold),
                _ => None,
            }
        }
    }
}

/// Static grammar checks applied at validation time. Execution never calls
/// this; it evaluates permissively instead.
pub fn check_expression(expression: &str) -> Vec<String> {
    let mut errors = Vec::new();

    // Operators inside parentheses: parens may wrap a simple condition only.
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut prev_escape = false;
    for c in expression.chars() {
        match quote {
            Some(q) => {
                if c == q && !prev_escape {
                    quote = None;
                }
                prev_escape = c == '\\' && !prev_escape;
            }
            None => match c {
                '"' | '\'' => quote = Some(c),
                '(' => depth += 1,
                ')' => depth -= 1,
                '&' | '|' if depth > 0 => {
                    errors.push(format!(
                        "operators inside parentheses are not supported in '{}': use (a)&(b) instead of (a&b)",
                        expression
                    ));
                }
                _ => {}
            },
        }
        if depth < 0 {
            errors.push(format!("unbalanced parentheses in '{}'", expression));
            return errors;
        }
    }
    if depth != 0 {
        errors.push(format!("unbalanced parentheses in '{}'", expression));
    }
    if quote.is_some() {
        errors.push(format!("unclosed quote in '{}'", expression));
    }

    // Unquoted pattern text containing operator characters is ambiguous.
    for part in split_top_level(expression, '|')
        .iter()
        .flat_map(|p| split_top_level(p, '&'))
    {
        let part = part.trim_start_matches('(').trim_end_matches(')').trim();
        if let Some((_, raw_pattern)) = part.split_once('~') {
            let raw_pattern = raw_pattern.trim();
            if raw_pattern.is_empty() || raw_pattern.starts_with('"') || raw_pattern.starts_with('\'') {
                continue;
            }
            if OPERATORS.iter().any(|op| raw_pattern.contains(op)) {
                errors.push(format!(
                    "pattern '{}' contains operator characters and must be quoted, e.g. ~\"{}\"",
                    raw_pattern, raw_pattern
                ));
            }
        }
    }

    errors
}
