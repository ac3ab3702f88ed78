use lazy_static::lazy_static;
use regex::Regex;
use tracing::debug;

use crate::workflow::model::{Globals, TaskResults};
use crate::workflow::MAX_VARIABLE_EXPANSION_DEPTH;

lazy_static! {
    static ref TASK_TOKEN: Regex = Regex::new(r"(?i)@(\d+)_(stdout|stderr|success|exit)@").unwrap();
    static ref GLOBAL_TOKEN: Regex = Regex::new(r"@([a-zA-Z_][a-zA-Z0-9_]*)@").unwrap();
    static ref TASK_SHAPED_NAME: Regex = Regex::new(r"(?i)^\d+_(stdout|stderr|success|exit)$").unwrap();
}

/// Expand `@N_stdout@`-style task references and `@NAME@` globals in `text`.
///
/// Expansion is iterative so a global can expand to a string that still
/// contains references (`@A@` -> `@B@/bin`), bounded at
/// `MAX_VARIABLE_EXPANSION_DEPTH` iterations. Returns the expanded text and
/// whether every reference resolved; callers decide what a partial
/// resolution means for them.
pub fn replace_variables(text: &str, globals: &Globals, results: &TaskResults) -> (String, bool) {
    if text.is_empty() {
        return (String::new(), true);
    }

    let mut out = text.to_string();
    for iteration in 0..MAX_VARIABLE_EXPANSION_DEPTH {
        let mut changed = false;

        let pass = TASK_TOKEN.replace_all(&out, |caps: &regex::Captures| {
            let id: u32 = caps[1].parse().unwrap_or(u32::MAX);
            match task_field_value(id, &caps[2], results) {
                Some(value) => {
                    changed = true;
                    debug!("replaced {} with '{}'", &caps[0], value);
                    value
                }
                None => caps[0].to_string(),
            }
        });
        let mut pass = pass.into_owned();

        pass = GLOBAL_TOKEN
            .replace_all(&pass, |caps: &regex::Captures| {
                let name = &caps[1];
                if TASK_SHAPED_NAME.is_match(name) {
                    return caps[0].to_string();
                }
                match globals.get(name) {
                    Some(value) => {
                        changed = true;
                        debug!(
                            "replaced @{}@ with '{}' (iteration {})",
                            name,
                            display_value(name, value),
                            iteration + 1
                        );
                        value.clone()
                    }
                    None => caps[0].to_string(),
                }
            })
            .into_owned();

        out = pass;
        if !changed {
            break;
        }
    }

    // Anything still token-shaped after the bounded expansion is
    // unresolved, whether the name is unknown or the chain never settled.
    let leftover = unresolved_tokens(&out);
    if !leftover.is_empty() {
        debug!("unresolved variables in '{}': {}", text, leftover.join(", "));
        return (out, false);
    }
    (out, true)
}

/// References still present in `text` after expansion.
pub fn unresolved_tokens(text: &str) -> Vec<String> {
    let mut leftover: Vec<String> = TASK_TOKEN
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect();
    leftover.extend(
        GLOBAL_TOKEN
            .find_iter(text)
            .map(|m| m.as_str().to_string()),
    );
    leftover
}

fn task_field_value(id: u32, field: &str, results: &TaskResults) -> Option<String> {
    let result = results.get(&id)?;
    let value = match field.to_lowercase().as_str() {
        "stdout" => stream_value(&result.stdout, result.stdout_truncated, result.stdout_file.as_deref()),
        "stderr" => stream_value(&result.stderr, result.stderr_truncated, result.stderr_file.as_deref()),
        "success" => result.success.to_string(),
        "exit" => result.exit_code.to_string(),
        _ => return None,
    };
    Some(value)
}

/// Full stream content: the spill file when the preview was truncated,
/// otherwise the stored value (which already holds split results in full).
fn stream_value(preview: &str, truncated: bool, file: Option<&std::path::Path>) -> String {
    if truncated {
        if let Some(path) = file {
            if let Ok(content) = std::fs::read_to_string(path) {
                return content.trim_end_matches('\n').to_string();
            }
        }
    }
    preview.trim_end_matches('\n').to_string()
}

/// True when a variable's value must never appear in logs.
///
/// Prefixes: SECRET_, MASK_, HIDE_, PASSWORD_, TOKEN_.
/// Suffixes: _PASSWORD, _TOKEN, _SECRET, _KEY. Case-insensitive.
pub fn should_mask_variable(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    let upper = name.to_uppercase();
    const PREFIXES: [&str; 5] = ["SECRET_", "MASK_", "HIDE_", "PASSWORD_", "TOKEN_"];
    const SUFFIXES: [&str; 4] = ["_PASSWORD", "_TOKEN", "_SECRET", "_KEY"];
    PREFIXES.iter().any(|p| upper.starts_with(p)) || SUFFIXES.iter().any(|s| upper.ends_with(s))
}

pub fn mask_value(value: &str) -> String {
    format!("<masked len={}>", value.chars().count())
}

/// Value as it may appear in debug output.
pub fn display_value(name: &str, value: &str) -> String {
    if should_mask_variable(name) {
        mask_value(value)
    } else {
        value.to_string()
    }
}

/// Split `output` per a `DELIM,IDX` spec and return the 0-based field.
///
/// Named delimiters map to patterns (`space`, `whitespace`, `tab`,
/// `newline`, `colon`, `semicolon`/`semi`, `comma`, `pipe`); anything else is
/// used as a regex. A malformed spec, bad pattern, or out-of-range index
/// returns the original output unchanged.
pub fn split_output(output: &str, split_spec: &str) -> String {
    if output.is_empty() || split_spec.is_empty() {
        return output.to_string();
    }

    let Some((delimiter, index)) = split_spec.split_once(',') else {
        return output.to_string();
    };
    let Ok(index) = index.trim().parse::<usize>() else {
        return output.to_string();
    };

    let pattern = match delimiter {
        "space" => r" +",
        "whitespace" => r"\s+",
        "tab" => r"\t+",
        "newline" => r"\n+",
        "colon" => ":",
        "semicolon" | "semi" => ";",
        "comma" => ",",
        "pipe" => r"\|",
        custom => custom,
    };

    let Ok(re) = Regex::new(pattern) else {
        return output.to_string();
    };
    let parts: Vec<&str> = re.split(output).collect();
    match parts.get(index) {
        Some(part) => part.to_string(),
        None => output.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::TaskResult;
    use std::collections::HashMap;

    fn result_with_stdout(stdout: &str) -> TaskResult {
        TaskResult {
            exit_code: 0,
            stdout: stdout.to_string(),
            success: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_task_reference_expansion() {
        let globals = HashMap::new();
        let mut results = HashMap::new();
        results.insert(0, result_with_stdout("web01.example.com\n"));

        let (text, ok) = replace_variables("ssh @0_stdout@", &globals, &results);
        assert!(ok);
        assert_eq!(text, "ssh web01.example.com");

        // Field names match case-insensitively.
        let (text, ok) = replace_variables("@0_STDOUT@", &globals, &results);
        assert!(ok);
        assert_eq!(text, "web01.example.com");

        let (text, ok) = replace_variables("@0_exit@/@0_success@", &globals, &results);
        assert!(ok);
        assert_eq!(text, "0/true");
    }

    #[test]
    fn test_global_chaining() {
        let mut globals = HashMap::new();
        globals.insert("BASE".to_string(), "/opt".to_string());
        globals.insert("APP".to_string(), "@BASE@/app".to_string());
        let results = HashMap::new();

        let (text, ok) = replace_variables("run @APP@/bin", &globals, &results);
        assert!(ok);
        assert_eq!(text, "run /opt/app/bin");
    }

    #[test]
    fn test_unresolved_reference() {
        let globals = HashMap::new();
        let results = HashMap::new();
        let (text, ok) = replace_variables("echo @MISSING@", &globals, &results);
        assert!(!ok);
        assert_eq!(text, "echo @MISSING@");

        let (_, ok) = replace_variables("echo @7_stdout@", &globals, &results);
        assert!(!ok);
    }

    #[test]
    fn test_circular_reference_terminates() {
        let mut globals = HashMap::new();
        globals.insert("A".to_string(), "@B@".to_string());
        globals.insert("B".to_string(), "@A@".to_string());
        let results = HashMap::new();

        let (text, ok) = replace_variables("@A@", &globals, &results);
        // Bounded expansion leaves a token behind and reports failure.
        assert!(!ok);
        assert!(text.contains('@'));
    }

    #[test]
    fn test_truncated_stdout_reads_spill_file(){
        let dir = tempfile::tempdir().unwrap();
        let spill = dir.path().join("stdout_spill");
        std::fs::write(&spill, "full output from disk\n").unwrap();

        let mut results = HashMap::new();
        results.insert(
            3,
            TaskResult {
                stdout: "preview".to_string(),
                stdout_truncated: true,
                stdout_file: Some(spill),
                success: true,
                ..Default::default()
            },
        );
        let (text, ok) = replace_variables("@3_stdout@", &HashMap::new(), &results);
        assert!(ok);
        assert_eq!(text, "full output from disk");
    }

    #[test]
    fn test_masking_rules() {
        assert!(should_mask_variable("SECRET_API"));
        assert!(should_mask_variable("DB_PASSWORD"));
        assert!(should_mask_variable("token_admin"));
        assert!(should_mask_variable("SSH_KEY"));
        assert!(!should_mask_variable("HOSTNAME"));
        assert!(!should_mask_variable(""));
        assert_eq!(mask_value("super_secret_123"), "<masked len=16>");
    }

    #[test]
    fn test_split_output_named_delimiters() {
        assert_eq!(split_output("a b  c", "space,2"), "c");
        assert_eq!(split_output("a:b:c", "colon,1"), "b");
        assert_eq!(split_output("l1\nl2\nl3", "newline,0"), "l1");
        assert_eq!(split_output("x|y", "pipe,1"), "y");
        assert_eq!(split_output("a\tb", "tab,1"), "b");
    }

    #[test]
    fn test_split_output_custom_and_out_of_range() {
        assert_eq!(split_output("a--b--c", "--,1"), "b");
        // Out-of-range index returns the original string.
        assert_eq!(split_output("a b", "space,9"), "a b");
        // Malformed spec returns the original string.
        assert_eq!(split_output("a b", "space"), "a b");
    }
}
