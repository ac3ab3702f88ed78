use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, warn};

use crate::error::TaskerError;
use crate::util::expand_env_vars;
use crate::workflow::model::{Globals, RawTask, TaskId};

/// Parsed task file: globals defined before the first `task=` line, plus the
/// raw task records in ID order.
#[derive(Debug, Default)]
pub struct ParsedFile {
    pub globals: Globals,
    pub tasks: BTreeMap<TaskId, RawTask>,
}

/// Parse a task file.
///
/// Line rules: `key=value` split on the first `=`; `#` lines and blank lines
/// are comments; lines starting with `-` are reserved for CLI echo and
/// ignored. A `task=<id>` line opens a new record; everything before the
/// first one defines globals. Duplicate task IDs are fatal.
pub fn parse_task_file(path: &Path) -> Result<ParsedFile, TaskerError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| TaskerError::TaskFile(format!("cannot read {:?}: {}", path, e)))?;
    parse_task_text(&content)
}

pub fn parse_task_text(content: &str) -> Result<ParsedFile, TaskerError> {
    let mut parsed = ParsedFile::default();
    let mut current: Option<RawTask> = None;

    for (idx, raw_line) in content.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.trim();

        if line.is_empty() || line.starts_with('#') || line.starts_with('-') {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            warn!("line {}: ignoring malformed line '{}'", line_no, line);
            continue;
        };
        let key = key.trim();
        let value = value.trim();

        if key == "task" {
            if let Some(done) = current.take() {
                store_task(&mut parsed, done)?;
            }
            let id = value.parse::<TaskId>().map_err(|_| {
                TaskerError::TaskFile(format!("line {}: invalid task ID '{}'", line_no, value))
            })?;
            current = Some(RawTask {
                id,
                line: line_no,
                fields: Vec::new(),
            });
        } else if let Some(task) = current.as_mut() {
            task.fields.push((key.to_string(), value.to_string()));
        } else {
            // Before the first task: a global variable definition. Values get
            // environment expansion, then sanitization.
            let expanded = expand_env_vars(value);
            let cleaned = sanitize_global_value(key, &expanded);
            debug!("global variable: {} = {}", key, cleaned);
            parsed.globals.insert(key.to_string(), cleaned);
        }
    }

    if let Some(done) = current.take() {
        store_task(&mut parsed, done)?;
    }
    Ok(parsed)
}

fn store_task(parsed: &mut ParsedFile, task: RawTask) -> Result<(), TaskerError> {
    if parsed.tasks.contains_key(&task.id) {
        return Err(TaskerError::TaskFile(format!(
            "duplicate task ID {} (line {})",
            task.id, task.line
        )));
    }
    parsed.tasks.insert(task.id, task);
    Ok(())
}

/// Strip control characters from a global value; anything removed is logged.
/// Values feed command lines later, so embedded escapes and NULs never make
/// it into storage.
fn sanitize_global_value(name: &str, value: &str) -> String {
    let cleaned: String = value
        .chars()
        .filter(|c| !c.is_control() || *c == '\t')
        .collect();
    if cleaned != value {
        warn!("global variable '{}': control characters removed", name);
    }
    cleaned
}

/// Re-serialize the parsed file as `key=value` text. Globals first, then
/// tasks in ID order. Re-parsing the output yields an equivalent task map.
pub fn serialize(parsed: &ParsedFile) -> String {
    let mut out = String::new();
    let mut names: Vec<&String> = parsed.globals.keys().collect();
    names.sort();
    for name in names {
        out.push_str(name);
        out.push('=');
        out.push_str(&parsed.globals[name]);
        out.push('\n');
    }
    if !parsed.globals.is_empty() {
        out.push('\n');
    }
    for task in parsed.tasks.values() {
        out.push_str(&task.to_key_values());
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# deployment workflow
ENVIRONMENT=production
TARGET=$TASKER_PARSER_TEST_HOME/app

task=0
hostname=web01
command=echo
arguments=hello
next=exit_0

task=1
hostname=web01
command=echo
arguments=@0_stdout@
";

    #[test]
    fn test_parse_globals_and_tasks() {
        std::env::set_var("TASKER_PARSER_TEST_HOME", "/opt");
        let parsed = parse_task_text(SAMPLE).unwrap();
        assert_eq!(parsed.globals["ENVIRONMENT"], "production");
        assert_eq!(parsed.globals["TARGET"], "/opt/app");
        assert_eq!(parsed.tasks.len(), 2);
        assert_eq!(parsed.tasks[&0].get("command"), Some("echo"));
        assert_eq!(parsed.tasks[&1].get("arguments"), Some("@0_stdout@"));
    }

    #[test]
    fn test_duplicate_task_id_is_fatal() {
        let text = "task=0\ncommand=a\ntask=0\ncommand=b\n";
        assert!(parse_task_text(text).is_err());
    }

    #[test]
    fn test_comment_and_dash_lines_ignored() {
        let text = "# header\n--echo from cli\n-v\ntask=3\nhostname=h\ncommand=true\n";
        let parsed = parse_task_text(text).unwrap();
        assert_eq!(parsed.tasks.len(), 1);
        assert!(parsed.globals.is_empty());
    }

    #[test]
    fn test_value_keeps_later_equals() {
        let text = "task=0\ncommand=echo\narguments=A=B=C\n";
        let parsed = parse_task_text(text).unwrap();
        assert_eq!(parsed.tasks[&0].get("arguments"), Some("A=B=C"));
    }

    #[test]
    fn test_global_sanitization_strips_controls() {
        let text = "GREETING=hi\u{7}there\ntask=0\ncommand=true\n";
        let parsed = parse_task_text(text).unwrap();
        assert_eq!(parsed.globals["GREETING"], "hithere");
    }

    #[test]
    fn test_round_trip_equivalence() {
        let parsed = parse_task_text(SAMPLE).unwrap();
        let text = serialize(&parsed);
        let reparsed = parse_task_text(&text).unwrap();
        assert_eq!(parsed.tasks.len(), reparsed.tasks.len());
        for (id, task) in &parsed.tasks {
            assert_eq!(task.fields, reparsed.tasks[id].fields, "task {}", id);
        }
        assert_eq!(parsed.globals, reparsed.globals);
    }
}
