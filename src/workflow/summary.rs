use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::TaskerError;
use crate::util::{sanitize_for_tsv, timestamp};

const HEADER: &str = "#Timestamp\tTask File\tTask ID\tHostname\tCommand\tExit Code\tStatus\tLog File";

/// One row of the shared project summary file.
#[derive(Debug, Clone, Default)]
pub struct SummaryRow {
    pub task_file: String,
    pub task_id: String,
    pub hostname: String,
    pub command: String,
    pub exit_code: i32,
    pub success: bool,
    pub log_file: String,
}

/// Append-only TSV summary shared across engine instances. Writes take an
/// advisory exclusive lock with bounded retry; each run appends exactly one
/// row.
pub struct SummaryWriter {
    path: PathBuf,
    lock_timeout: Duration,
}

impl SummaryWriter {
    pub fn new(log_dir: &Path, project: &str) -> Self {
        // Shared files on loaded batch hosts need a longer lock window.
        let lock_secs = if std::env::var("TASK_EXECUTOR_HIGH_LOAD").is_ok() {
            45
        } else {
            20
        };
        SummaryWriter {
            path: log_dir.join(format!("{}.summary", project)),
            lock_timeout: Duration::from_secs(lock_secs),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append_row(&self, row: &SummaryRow) -> Result<(), TaskerError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| TaskerError::Summary(format!("cannot open {:?}: {}", self.path, e)))?;

        self.lock_exclusive(&file)?;
        let result = self.write_locked(&file, row);
        unsafe {
            libc::flock(file.as_raw_fd(), libc::LOCK_UN);
        }
        result
    }

    fn lock_exclusive(&self, file: &std::fs::File) -> Result<(), TaskerError> {
        let fd = file.as_raw_fd();
        let started = Instant::now();
        loop {
            let rc = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
            if rc == 0 {
                return Ok(());
            }
            let errno = std::io::Error::last_os_error();
            match errno.raw_os_error() {
                Some(libc::EWOULDBLOCK) | Some(libc::EACCES) => {
                    if started.elapsed() >= self.lock_timeout {
                        return Err(TaskerError::Summary(format!(
                            "could not acquire lock on shared summary file {:?} within {} seconds; \
                             another instance is currently writing",
                            self.path,
                            self.lock_timeout.as_secs()
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
                _ => {
                    return Err(TaskerError::Summary(format!(
                        "file locking error on {:?}: {}",
                        self.path, errno
                    )));
                }
            }
        }
    }

    fn write_locked(&self, mut file: &std::fs::File, row: &SummaryRow) -> Result<(), TaskerError> {
        let len = file
            .metadata()
            .map_err(|e| TaskerError::Summary(e.to_string()))?
            .len();
        if len == 0 {
            writeln!(file, "{}", HEADER).map_err(|e| TaskerError::Summary(e.to_string()))?;
        }

        let status = if row.success { "SUCCESS" } else { "FAILURE" };
        let line = [
            timestamp(),
            sanitize_for_tsv(&row.task_file),
            sanitize_for_tsv(&row.task_id),
            sanitize_for_tsv(&row.hostname),
            sanitize_for_tsv(&row.command),
            row.exit_code.to_string(),
            status.to_string(),
            row.log_file.clone(),
        ]
        .join("\t");

        writeln!(file, "{}", line).map_err(|e| TaskerError::Summary(e.to_string()))?;
        file.flush().map_err(|e| TaskerError::Summary(e.to_string()))?;
        debug!("summary row appended to {:?}", self.path);
        Ok(())
    }
}
