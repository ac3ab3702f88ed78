mod backends;
mod cli;
mod error;
mod logging;
mod util;
mod workflow;

use clap::Parser;
use std::path::PathBuf;

use crate::util::{file_timestamp, sanitize_filename};
use crate::workflow::{install_signal_handlers, EngineConfig, Orchestrator};

#[tokio::main]
async fn main() {
    let opts = cli::Cli::parse();
    let dry_run = !opts.run;

    let log_dir = match util::resolve_log_directory(opts.log_dir.as_deref()) {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("tasker: {}", e);
            std::process::exit(error::exit_code::INVALID_ARGUMENTS);
        }
    };

    let suffix = if dry_run { "dryrun" } else { "log" };
    let log_file = log_dir.join(format!(
        "{}_{}.{}",
        sanitize_filename(&opts.task_file),
        file_timestamp(),
        suffix
    ));

    if let Err(e) = logging::init(&log_file, opts.effective_log_level()) {
        eprintln!("tasker: {}", e);
        std::process::exit(error::exit_code::INVALID_ARGUMENTS);
    }

    let (timeout, clamp_notice) = opts.clamped_timeout();
    if let Some(notice) = clamp_notice {
        tracing::warn!("{}", notice);
    }

    let skip_task_validation = opts.skip_task_validation || opts.skip_validation;
    let skip_host_validation = opts.skip_host_validation || opts.skip_validation;
    if skip_host_validation {
        tracing::warn!("Skipping host validation can lead to connection failures!");
    }

    let config = EngineConfig {
        task_file: PathBuf::from(&opts.task_file),
        log_dir,
        log_file,
        dry_run,
        exec_type: opts.exec_type.clone(),
        default_timeout: timeout,
        connection_test: opts.connection_test,
        project: opts.project.as_deref().map(sanitize_filename),
        start_from: opts.start_from,
        skip_task_validation,
        skip_host_validation,
        show_plan: opts.show_plan,
        validate_only: opts.validate_only,
    };

    let orchestrator = Orchestrator::new(config);
    install_signal_handlers(orchestrator.shutdown_handle());

    let code = orchestrator.run().await;
    std::process::exit(code);
}
