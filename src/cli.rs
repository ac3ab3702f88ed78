use clap::Parser;

/// Execute tasks on local and remote hosts with declarative flow control.
#[derive(Parser, Debug)]
#[command(name = "tasker")]
#[command(version)]
#[command(about = "Execute task files with conditions, routing, retries and parallel blocks")]
pub struct Cli {
    /// Path to the task file
    pub task_file: String,

    /// Actually run the commands (default is dry run)
    #[arg(short = 'r', long = "run")]
    pub run: bool,

    /// Directory to store log files
    #[arg(short = 'l', long = "log-dir")]
    pub log_dir: Option<String>,

    /// Logging level
    #[arg(long = "log-level", value_parser = ["ERROR", "WARN", "INFO", "DEBUG"], default_value = "INFO")]
    pub log_level: String,

    /// Execution type (overridden by task-specific settings)
    #[arg(short = 't', long = "type", value_parser = ["pbrun", "p7s", "local", "wwrs", "shell"])]
    pub exec_type: Option<String>,

    /// Default command timeout in seconds (5-1000)
    #[arg(short = 'o', long = "timeout", default_value_t = 30)]
    pub timeout: i64,

    /// Check connectivity for pbrun/p7s/wwrs hosts
    #[arg(short = 'c', long = "connection-test")]
    pub connection_test: bool,

    /// Project name for summary logging
    #[arg(short = 'p', long = "project")]
    pub project: Option<String>,

    /// Start execution from a specific task ID (resume capability)
    #[arg(long = "start-from", value_name = "TASK_ID")]
    pub start_from: Option<u32>,

    /// Skip task file and dependency validation (faster resume)
    #[arg(long = "skip-task-validation")]
    pub skip_task_validation: bool,

    /// Skip host validation and use hostnames as-is (risky)
    #[arg(long = "skip-host-validation")]
    pub skip_host_validation: bool,

    /// Skip ALL validation (task + host)
    #[arg(long = "skip-validation")]
    pub skip_validation: bool,

    /// Validate everything and exit without executing tasks
    #[arg(long = "validate-only")]
    pub validate_only: bool,

    /// Show the execution plan and ask for confirmation before running
    #[arg(long = "show-plan")]
    pub show_plan: bool,

    /// Enable debug logging (shorthand for --log-level=DEBUG)
    #[arg(short = 'd', long = "debug")]
    pub debug: bool,
}

impl Cli {
    /// Effective log level after the -d shorthand.
    pub fn effective_log_level(&self) -> &str {
        if self.debug && self.log_level == "INFO" {
            "DEBUG"
        } else {
            &self.log_level
        }
    }

    /// Default timeout clamped to the valid range, with a notice when the
    /// given value was out of bounds.
    pub fn clamped_timeout(&self) -> (u64, Option<String>) {
        if self.timeout < 5 {
            (
                5,
                Some(format!("Timeout {} too low, using minimum 5", self.timeout)),
            )
        } else if self.timeout > 1000 {
            (
                1000,
                Some(format!(
                    "Timeout {} too high, using maximum 1000",
                    self.timeout
                )),
            )
        } else {
            (self.timeout as u64, None)
        }
    }
}
