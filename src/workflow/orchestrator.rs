use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{exit_code, TaskerError};
use crate::util::file_timestamp;
use crate::workflow::conditional::execute_conditional;
use crate::workflow::decision::execute_decision;
use crate::workflow::executor::{execute_sequential, CoreError, ExecContext, Flow};
use crate::workflow::hosts::validate_hosts;
use crate::workflow::model::{build_task, Task, TaskId, TaskKind};
use crate::workflow::parallel::execute_parallel;
use crate::workflow::parser::parse_task_file;
use crate::workflow::recovery::{FailureInfo, RecoveryManager};
use crate::workflow::state::StateManager;
use crate::workflow::summary::{SummaryRow, SummaryWriter};
use crate::workflow::validate::validate;
use crate::workflow::vars::replace_variables;
use crate::workflow::{Shutdown, DEFAULT_EXEC_TYPE};

/// Everything the engine needs for one run, resolved from the CLI surface.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub task_file: PathBuf,
    pub log_dir: PathBuf,
    pub log_file: PathBuf,
    pub dry_run: bool,
    pub exec_type: Option<String>,
    pub default_timeout: u64,
    pub connection_test: bool,
    pub project: Option<String>,
    pub start_from: Option<TaskId>,
    pub skip_task_validation: bool,
    pub skip_host_validation: bool,
    pub show_plan: bool,
    pub validate_only: bool,
}

/// Row-level bookkeeping for the final summary line.
#[derive(Debug, Default)]
struct FinalState {
    task_id: Option<TaskId>,
    hostname: String,
    command: String,
    exit_code: i32,
}

pub struct Orchestrator {
    config: EngineConfig,
    state: Arc<StateManager>,
    shutdown: Shutdown,
    spill_dir: PathBuf,
}

impl Orchestrator {
    pub fn new(config: EngineConfig) -> Self {
        let spill_dir = config.log_dir.join("runs").join(Uuid::new_v4().to_string());
        Orchestrator {
            config,
            state: Arc::new(StateManager::new()),
            shutdown: Shutdown::default(),
            spill_dir,
        }
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Run the workflow to completion and return the process exit code.
    pub async fn run(&self) -> i32 {
        match self.run_inner().await {
            Ok(code) => code,
            Err(e) => {
                error!("{}", e);
                e.exit_code()
            }
        }
    }

    async fn run_inner(&self) -> Result<i32, TaskerError> {
        info!("=== Task Execution Start: {} ===", file_timestamp());
        info!("# Task file: {}", self.config.task_file.display());
        if self.config.dry_run {
            info!("# Dry run mode");
        }
        debug!("# Default timeout: {} [s]", self.config.default_timeout);

        // Parse.
        let parsed = parse_task_file(&self.config.task_file)?;
        info!("# Found {} global variables", parsed.globals.len());
        self.state.set_globals(parsed.globals.clone());

        if parsed.tasks.is_empty() {
            return Err(TaskerError::NoTasks("no valid tasks to execute".to_string()));
        }

        self.backup_task_file();

        // Validate.
        let tasks = if self.config.skip_task_validation {
            info!("# Skipping task file validation due to --skip-task-validation flag");
            let mut map = std::collections::BTreeMap::new();
            for raw in parsed.tasks.values() {
                let task = build_task(raw).map_err(TaskerError::Validation)?;
                map.insert(task.id, task);
            }
            map
        } else {
            let report = validate(&parsed);
            for warning in &report.warnings {
                warn!("{}", warning);
            }
            if !report.ok() {
                for problem in &report.errors {
                    error!("{}", problem);
                }
                return Err(TaskerError::Validation(format!(
                    "{} validation error(s) in {}",
                    report.errors.len(),
                    self.config.task_file.display()
                )));
            }
            report.tasks
        };
        info!(
            "# Successfully parsed {} valid tasks from '{}'",
            tasks.len(),
            self.config.task_file.display()
        );
        self.state.set_tasks(tasks);

        if self.config.show_plan && !self.show_plan_and_confirm() {
            info!("Execution cancelled by user");
            return Ok(exit_code::SUCCESS);
        }

        // Hosts.
        if self.config.skip_host_validation {
            warn!("# WARNING: Skipping host validation due to --skip-host-validation flag");
            warn!("# WARNING: Using hostnames as-is without FQDN resolution or reachability check");
        } else {
            validate_hosts(
                &self.state,
                self.config.exec_type.as_deref(),
                self.config.connection_test,
            )
            .await?;
        }

        if self.config.validate_only {
            info!("# All validations completed successfully");
            info!("# Validate-only mode: exiting without task execution");
            return Ok(exit_code::SUCCESS);
        }

        let recovery = if self.config.dry_run {
            None
        } else {
            RecoveryManager::new(&self.config.task_file, &self.config.log_dir)
                .map_err(|e| warn!("recovery state unavailable: {}", e))
                .ok()
        };

        // Resuming with --start-from is only safe against an unchanged task
        // file; an existing snapshot carries the hash to check.
        if self.config.start_from.is_some() {
            if let Some(manager) = recovery.as_ref().filter(|m| m.exists()) {
                if let Some(snapshot) = manager.load_state() {
                    match manager.validate_state(&snapshot) {
                        Ok(()) => info!(
                            "# Recovery state matches this task file (execution path so far: {:?})",
                            snapshot.execution_path
                        ),
                        Err(reason) => warn!("# Recovery state cannot be used: {}", reason),
                    }
                }
            }
        }

        // Starting task.
        let start_id = self.resolve_start_task()?;

        let ctx = ExecContext {
            state: Arc::clone(&self.state),
            shutdown: self.shutdown.clone(),
            dry_run: self.config.dry_run,
            default_timeout: self.config.default_timeout,
            exec_override: self.config.exec_type.clone(),
            spill_dir: self.spill_dir.clone(),
        };

        let mut final_state = FinalState::default();
        let mut next_id = start_id;
        let mut executed = 0usize;

        let code = loop {
            if self.shutdown.is_requested() {
                info!("Shutdown requested, stopping workflow");
                break exit_code::SIGNAL_INTERRUPT;
            }

            let Some(task) = self.state.task(next_id) else {
                // Ran past the last task: the workflow is complete and the
                // last task's exit code is the engine's.
                if executed == 0 {
                    error!("FAILED: No tasks were executed.");
                    break exit_code::DEPENDENCY_FAILED;
                }
                break final_state.exit_code.max(0);
            };

            self.state.append_to_execution_path(next_id);

            let flow = match &task.kind {
                TaskKind::Normal(_) => match execute_sequential(&ctx, &task).await {
                    Ok(flow) => flow,
                    Err(CoreError::MissingBinary(msg)) => {
                        error!(
                            "FATAL ERROR: # EXECUTION TERMINATED: Missing command detected during runtime: {}",
                            msg
                        );
                        executed += 1;
                        self.update_final_state(&mut final_state, &task);
                        final_state.exit_code = exit_code::VALIDATION_FAILED;
                        break exit_code::VALIDATION_FAILED;
                    }
                },
                TaskKind::Parallel(_) => execute_parallel(&ctx, &task).await,
                TaskKind::Conditional(_) => execute_conditional(&ctx, &task).await,
                TaskKind::Decision => execute_decision(&ctx, &task).await,
            };
            executed += 1;
            self.update_final_state(&mut final_state, &task);

            if self.shutdown.is_requested() {
                break exit_code::SIGNAL_INTERRUPT;
            }

            match flow {
                Flow::Next(id) => next_id = id,
                Flow::Loop => {}
                Flow::TerminalOk => break exit_code::SUCCESS,
                Flow::TerminalFail => break exit_code::CONDITION_FAILED,
                Flow::Return(code) => break code,
            }
        };

        // Final banner.
        if code == exit_code::SUCCESS {
            info!(
                "SUCCESS: Task execution completed successfully - {} task(s) executed.",
                executed
            );
        } else if code == exit_code::SIGNAL_INTERRUPT {
            error!("FAILURE: Task execution interrupted by signal");
        } else {
            error!("FAILURE: Task execution failed with exit code {}", code);
        }

        self.write_summary(&final_state, code);
        self.finish_recovery(recovery.as_ref(), &final_state, code);
        self.cleanup_spill_files(code);

        Ok(code)
    }

    fn backup_task_file(&self) {
        let Some(name) = self.config.task_file.file_name().and_then(|n| n.to_str()) else {
            return;
        };
        let copy_path = self
            .config
            .log_dir
            .join(format!("{}_{}", name, file_timestamp()));
        match std::fs::copy(&self.config.task_file, &copy_path) {
            Ok(_) => debug!("created task file copy: {}", copy_path.display()),
            Err(e) => warn!("could not copy task file to log directory: {}", e),
        }
    }

    fn resolve_start_task(&self) -> Result<TaskId, TaskerError> {
        let ids = self.state.task_ids();
        let lowest = *ids.first().unwrap_or(&0);

        match self.config.start_from {
            Some(start) => {
                if !self.state.has_task(start) {
                    return Err(TaskerError::Dependency(format!(
                        "start task {} not found; available tasks: {:?}",
                        start, ids
                    )));
                }
                if start > 0 {
                    warn!(
                        "# WARNING: Task result references for tasks 0-{} will be unresolved",
                        start - 1
                    );
                }
                info!("# Starting execution from Task {}", start);
                Ok(start)
            }
            None => {
                if !self.state.has_task(0) && lowest > 0 {
                    info!(
                        "Task 0 not found, auto-starting from lowest available task {}",
                        lowest
                    );
                    return Ok(lowest);
                }
                Ok(0)
            }
        }
    }

    fn show_plan_and_confirm(&self) -> bool {
        info!("# Execution plan:");
        for id in self.state.task_ids() {
            let Some(task) = self.state.task(id) else { continue };
            let description = match &task.kind {
                TaskKind::Normal(spec) => format!(
                    "[{}] {} {}",
                    if spec.hostname.is_empty() {
                        "local"
                    } else {
                        spec.hostname.as_str()
                    },
                    spec.command.as_deref().unwrap_or("return"),
                    spec.arguments
                ),
                TaskKind::Parallel(spec) => format!("parallel {:?}", spec.children),
                TaskKind::Conditional(spec) => format!(
                    "conditional '{}' true={:?} false={:?}",
                    spec.condition, spec.if_true_tasks, spec.if_false_tasks
                ),
                TaskKind::Decision => "decision".to_string(),
            };
            let routing = match (&task.next, task.on_success, task.on_failure) {
                (Some(next), _, _) => format!(" next={}", next),
                (None, Some(s), Some(f)) => format!(" on_success={} on_failure={}", s, f),
                (None, Some(s), None) => format!(" on_success={}", s),
                (None, None, Some(f)) => format!(" on_failure={}", f),
                (None, None, None) => String::new(),
            };
            info!("#   Task {}: {}{}", id, description, routing);
        }

        if self.config.dry_run || !std::io::stdin().is_terminal() {
            return true;
        }
        eprint!("Do you want to proceed with execution? (y/N): ");
        let mut answer = String::new();
        if std::io::stdin().read_line(&mut answer).is_err() {
            return false;
        }
        answer.trim().eq_ignore_ascii_case("y")
    }

    fn update_final_state(&self, final_state: &mut FinalState, task: &Task) {
        final_state.task_id = Some(task.id);
        let result = self.state.task_result(task.id).unwrap_or_default();
        final_state.exit_code = result.exit_code;

        match &task.kind {
            TaskKind::Normal(spec) => {
                let globals = self.state.globals();
                let results = self.state.all_task_results();
                let (hostname, _) = replace_variables(&spec.hostname, &globals, &results);
                let exec_name = spec
                    .exec
                    .clone()
                    .or_else(|| self.config.exec_type.clone())
                    .unwrap_or_else(|| DEFAULT_EXEC_TYPE.to_string());
                final_state.hostname = if hostname.is_empty() { exec_name } else { hostname };
                let (command, _) = replace_variables(
                    spec.command.as_deref().unwrap_or("return"),
                    &globals,
                    &results,
                );
                let (arguments, _) = replace_variables(&spec.arguments, &globals, &results);
                final_state.command = format!("{} {}", command, arguments).trim().to_string();
            }
            TaskKind::Parallel(spec) => {
                final_state.hostname = "parallel".to_string();
                final_state.command = format!("parallel execution of tasks {:?}", spec.children);
            }
            TaskKind::Conditional(spec) => {
                final_state.hostname = "conditional".to_string();
                final_state.command = format!(
                    "conditional branch execution ('{}')",
                    spec.condition
                );
            }
            TaskKind::Decision => {
                final_state.hostname = "decision".to_string();
                final_state.command = result.stdout;
            }
        }
    }

    fn write_summary(&self, final_state: &FinalState, code: i32) {
        let Some(project) = &self.config.project else {
            return;
        };
        let writer = SummaryWriter::new(&self.config.log_dir, project);
        let row = SummaryRow {
            task_file: self
                .config
                .task_file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            task_id: final_state
                .task_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string()),
            hostname: final_state.hostname.clone(),
            command: final_state.command.clone(),
            exit_code: code,
            success: code == exit_code::SUCCESS,
            log_file: self
                .config
                .log_file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        if let Err(e) = writer.append_row(&row) {
            // Summary failures must never mask the run outcome; report on
            // every channel that still works, ending with an emergency file
            // in the home directory.
            error!("{}", e);
            eprintln!("tasker: {}", e);
            println!("tasker: {}", e);
            if let Ok(home) = std::env::var("HOME") {
                let emergency = std::path::Path::new(&home).join(".tasker_emergency.log");
                let line = format!("[{}] {}\n", crate::util::timestamp(), e);
                if let Ok(mut file) = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&emergency)
                {
                    use std::io::Write;
                    let _ = file.write_all(line.as_bytes());
                }
            }
        }
    }

    fn finish_recovery(&self, recovery: Option<&RecoveryManager>, final_state: &FinalState, code: i32) {
        let Some(recovery) = recovery else { return };
        if code == exit_code::SUCCESS {
            recovery.delete();
            return;
        }
        let failure_info = final_state.task_id.map(|task_id| FailureInfo {
            task_id,
            exit_code: code,
            error: format!("workflow ended with exit code {}", code),
        });
        if let Err(e) = recovery.save_state(
            &self.state,
            &self.config.log_file.to_string_lossy(),
            failure_info,
        ) {
            warn!("failed to save recovery state: {}", e);
        } else {
            info!(
                "# Recovery state saved to {}",
                recovery.recovery_file().display()
            );
        }
    }

    /// Spill files outlive their tasks for cross-task substitution, so the
    /// run directory is removed here. Failed real runs keep it: the
    /// recovery snapshot references those files.
    fn cleanup_spill_files(&self, code: i32) {
        let keep = !self.config.dry_run
            && code != exit_code::SUCCESS
            && code != exit_code::SIGNAL_INTERRUPT;
        if keep && self.spill_dir.exists() {
            info!(
                "# Keeping output files for recovery under {}",
                self.spill_dir.display()
            );
            return;
        }
        if self.spill_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.spill_dir) {
                warn!("failed to remove spill directory: {}", e);
            }
        }
    }
}

/// Install SIGINT/SIGTERM handlers that trip the shutdown flag. In-flight
/// subprocesses see the flag at their polling points and are terminated
/// gracefully.
pub fn install_signal_handlers(shutdown: Shutdown) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut interrupt = match signal(SignalKind::interrupt()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("cannot install SIGINT handler: {}", e);
                return;
            }
        };
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("cannot install SIGTERM handler: {}", e);
                return;
            }
        };
        tokio::select! {
            _ = interrupt.recv() => info!("Received SIGINT, initiating shutdown"),
            _ = terminate.recv() => info!("Received SIGTERM, initiating shutdown"),
        }
        shutdown.request();
    });
}
