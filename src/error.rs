use thiserror::Error;

/// Process exit codes used by the engine.
///
/// Task files can additionally exit with any code via `return=N`.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const TASK_FAILED: i32 = 1;
    pub const CONDITION_FAILED: i32 = 10;
    pub const DEPENDENCY_FAILED: i32 = 11;
    pub const HOST_UNREACHABLE: i32 = 12;
    pub const CONNECTION_FAILED: i32 = 13;
    pub const INVALID_ARGUMENTS: i32 = 14;
    pub const VALIDATION_FAILED: i32 = 20;
    pub const NO_TASKS_FOUND: i32 = 21;
    pub const TIMEOUT: i32 = 124;
    pub const SIGNAL_INTERRUPT: i32 = 130;
}

/// Error kinds surfaced by the engine.
///
/// Per-task failures never appear here: they are captured into `TaskResult`s
/// and routed through the workflow controller. Only conditions that end the
/// whole engine run become a `TaskerError`.
#[derive(Debug, Error)]
pub enum TaskerError {
    #[error("task file error: {0}")]
    TaskFile(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("host unreachable: {0}")]
    HostUnreachable(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("no tasks found: {0}")]
    NoTasks(String),

    #[error("dependency failure: {0}")]
    Dependency(String),

    #[error("summary write failed: {0}")]
    Summary(String),
}

impl TaskerError {
    /// Map an error kind to the process exit code it implies.
    pub fn exit_code(&self) -> i32 {
        match self {
            TaskerError::TaskFile(_) | TaskerError::Validation(_) => exit_code::VALIDATION_FAILED,
            TaskerError::HostUnreachable(_) => exit_code::HOST_UNREACHABLE,
            TaskerError::ConnectionFailed(_) => exit_code::CONNECTION_FAILED,
            TaskerError::NoTasks(_) => exit_code::NO_TASKS_FOUND,
            TaskerError::Dependency(_) => exit_code::DEPENDENCY_FAILED,
            TaskerError::Summary(_) => exit_code::TASK_FAILED,
        }
    }
}

pub type Result<T> = std::result::Result<T, TaskerError>;
