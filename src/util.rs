use chrono::Local;
use lazy_static::lazy_static;
use regex::Regex;
use std::path::{Path, PathBuf};

lazy_static! {
    static ref UNSAFE_FILENAME: Regex = Regex::new(r"[^a-zA-Z0-9._-]").unwrap();
    static ref ENV_VAR: Regex =
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)").unwrap();
}

/// Sanitize a filename so it is safe as a log-file prefix: strip the path and
/// extension, replace anything outside `[a-zA-Z0-9._-]`, cap at 50 chars.
pub fn sanitize_filename(filename: &str) -> String {
    let base = Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("");

    let mut sanitized = UNSAFE_FILENAME.replace_all(base, "_").into_owned();
    if sanitized.is_empty() {
        sanitized = "task".to_string();
    }
    sanitized.truncate(50);
    sanitized
}

/// Replace characters that would break a TSV row.
pub fn sanitize_for_tsv(value: &str) -> String {
    value.replace(['\t', '\n', '\r'], " ")
}

/// Expand `$VAR` / `${VAR}` from the process environment. Unknown variables
/// expand to the empty string.
pub fn expand_env_vars(value: &str) -> String {
    ENV_VAR
        .replace_all(value, |caps: &regex::Captures| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or("");
            std::env::var(name).unwrap_or_default()
        })
        .into_owned()
}

/// Timestamp used inside log lines and summary rows: `DDMmmYY HH:MM:SS`.
pub fn timestamp() -> String {
    Local::now().format("%d%b%y %H:%M:%S").to_string()
}

/// Timestamp used in file names: `DDMmmYY_HHMMSS`.
pub fn file_timestamp() -> String {
    Local::now().format("%d%b%y_%H%M%S").to_string()
}

/// Determine the log directory: CLI flag, then `TASK_EXECUTOR_LOG`, then
/// `~/TASKER`, then `./logs`. The directory is created if missing.
pub fn resolve_log_directory(cmd_log_dir: Option<&str>) -> anyhow::Result<PathBuf> {
    let dir = cmd_log_dir
        .map(PathBuf::from)
        .or_else(|| std::env::var("TASK_EXECUTOR_LOG").ok().map(PathBuf::from))
        .or_else(|| std::env::var("HOME").ok().map(|h| Path::new(&h).join("TASKER")))
        .unwrap_or_else(|| PathBuf::from("logs"));

    std::fs::create_dir_all(&dir)
        .map_err(|e| anyhow::anyhow!("creating log directory {:?}: {}", dir, e))?;
    Ok(dir)
}

/// Truncate command output for a log line, flattening newlines.
pub fn format_output_for_log(output: &str, max_length: usize) -> String {
    let flat = output.trim_end_matches('\n').replace('\n', " | ");
    if flat.chars().count() > max_length {
        let cut: String = flat.chars().take(max_length).collect();
        format!("{}... ({} chars total)", cut, flat.chars().count())
    } else {
        flat
    }
}

/// Split a string the way a POSIX shell tokenizes simple words: whitespace
/// separated, with single/double quotes grouping and backslash escapes.
pub fn split_arguments(arguments: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = arguments.chars().peekable();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                } else if c == '\\' && q == '"' {
                    match chars.peek() {
                        Some(&n) if n == '"' || n == '\\' => {
                            current.push(n);
                            chars.next();
                        }
                        _ => current.push(c),
                    }
                } else {
                    current.push(c);
                }
            }
            None => {
                if c == '\'' || c == '"' {
                    quote = Some(c);
                    in_word = true;
                } else if c == '\\' {
                    if let Some(&n) = chars.peek() {
                        current.push(n);
                        chars.next();
                        in_word = true;
                    }
                } else if c.is_whitespace() {
                    if in_word {
                        out.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                } else {
                    current.push(c);
                    in_word = true;
                }
            }
        }
    }
    if in_word {
        out.push(current);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("/tmp/deploy tasks.txt"), "deploy_tasks");
        assert_eq!(sanitize_filename("simple.txt"), "simple");
        assert_eq!(sanitize_filename("???"), "task");
        let long = "a".repeat(80);
        assert_eq!(sanitize_filename(&long).len(), 50);
    }

    #[test]
    fn test_sanitize_for_tsv() {
        assert_eq!(sanitize_for_tsv("a\tb\nc"), "a b c");
    }

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TASKER_UTIL_TEST", "xyz");
        assert_eq!(expand_env_vars("pre $TASKER_UTIL_TEST post"), "pre xyz post");
        assert_eq!(expand_env_vars("${TASKER_UTIL_TEST}/bin"), "xyz/bin");
        assert_eq!(expand_env_vars("$TASKER_UTIL_TEST_MISSING_"), "");
    }

    #[test]
    fn test_format_output_for_log() {
        assert_eq!(format_output_for_log("one\ntwo\n", 200), "one | two");
        let long = "x".repeat(250);
        let formatted = format_output_for_log(&long, 200);
        assert!(formatted.contains("(250 chars total)"));
    }

    #[test]
    fn test_split_arguments() {
        assert_eq!(split_arguments("a b c"), vec!["a", "b", "c"]);
        assert_eq!(split_arguments("a 'b c' d"), vec!["a", "b c", "d"]);
        assert_eq!(split_arguments(r#"--msg "hello world""#), vec!["--msg", "hello world"]);
        assert_eq!(split_arguments(""), Vec::<String>::new());
        assert_eq!(split_arguments(r"a\ b"), vec!["a b"]);
    }
}
