use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::workflow::{Shutdown, OUTPUT_CHUNK_SIZE, SPILL_THRESHOLD};

/// Captured state of one output stream after the process ended.
#[derive(Debug, Default)]
pub struct StreamCapture {
    /// In-memory content, capped at the spill threshold.
    pub preview: String,
    /// Spill file holding the full stream once the threshold was crossed.
    pub file: Option<PathBuf>,
    pub size: u64,
    pub truncated: bool,
}

/// Outcome of supervising a child process to completion.
#[derive(Debug, Default)]
pub struct ProcessCapture {
    pub stdout: StreamCapture,
    pub stderr: StreamCapture,
    pub exit_code: i32,
    pub timed_out: bool,
}

/// Drains a subprocess's stdout and stderr concurrently in 8 KiB chunks.
/// Streams stay in memory up to the spill threshold; past it the content
/// moves to a named file in the run's spill directory and subsequent chunks
/// are written straight to disk.
///
/// Spill files are deliberately left on disk here: later tasks read them
/// through variable substitution. The orchestrator deletes the spill
/// directory at workflow completion.
pub struct StreamingOutputHandler {
    threshold: usize,
    spill_dir: PathBuf,
}

impl StreamingOutputHandler {
    pub fn new(spill_dir: &Path) -> Self {
        StreamingOutputHandler {
            threshold: SPILL_THRESHOLD,
            spill_dir: spill_dir.to_path_buf(),
        }
    }

    pub fn with_threshold(spill_dir: &Path, threshold: usize) -> Self {
        StreamingOutputHandler {
            threshold,
            spill_dir: spill_dir.to_path_buf(),
        }
    }

    /// Supervise `child` until it exits, the timeout elapses, or shutdown is
    /// requested. The process state is polled every 100 ms; on timeout or
    /// shutdown the child receives SIGTERM, 500 ms of grace, then SIGKILL.
    pub async fn stream_process_output(
        &self,
        mut child: Child,
        timeout: Option<Duration>,
        shutdown: &Shutdown,
    ) -> std::io::Result<ProcessCapture> {
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();

        let stdout_task = tokio::spawn(drain_stream(
            stdout_pipe,
            self.threshold,
            self.spill_dir.clone(),
            "stdout",
        ));
        let stderr_task = tokio::spawn(drain_stream(
            stderr_pipe,
            self.threshold,
            self.spill_dir.clone(),
            "stderr",
        ));

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut poll = tokio::time::interval(Duration::from_millis(100));
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut timed_out = false;
        let status = loop {
            tokio::select! {
                status = child.wait() => break status?,
                _ = poll.tick() => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        timed_out = true;
                        terminate_gracefully(&mut child).await;
                        break child.wait().await?;
                    }
                    if shutdown.is_requested() {
                        debug!("shutdown requested, terminating child process");
                        terminate_gracefully(&mut child).await;
                        break child.wait().await?;
                    }
                }
            }
        };

        // Readers get a bounded window to finish after the process ends.
        let stdout = join_reader(stdout_task).await;
        let stderr = join_reader(stderr_task).await;

        let exit_code = exit_code_of(&status);
        Ok(ProcessCapture {
            stdout,
            stderr,
            exit_code,
            timed_out,
        })
    }
}

async fn join_reader(
    task: tokio::task::JoinHandle<std::io::Result<StreamCapture>>,
) -> StreamCapture {
    match tokio::time::timeout(Duration::from_secs(5), task).await {
        Ok(Ok(Ok(capture))) => capture,
        Ok(Ok(Err(e))) => {
            debug!("stream reader failed: {}", e);
            StreamCapture::default()
        }
        Ok(Err(e)) => {
            debug!("stream reader panicked: {}", e);
            StreamCapture::default()
        }
        Err(_) => {
            debug!("stream reader did not finish within 5s");
            StreamCapture::default()
        }
    }
}

/// SIGTERM, 500 ms grace, then SIGKILL.
async fn terminate_gracefully(child: &mut Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    if matches!(child.try_wait(), Ok(None)) {
        let _ = child.start_kill();
    }
}

fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(1)
}

async fn drain_stream<R>(
    reader: Option<R>,
    threshold: usize,
    spill_dir: PathBuf,
    label: &'static str,
) -> std::io::Result<StreamCapture>
where
    R: AsyncReadExt + Unpin + Send + 'static,
{
    let mut capture = StreamCapture::default();
    let Some(mut reader) = reader else {
        return Ok(capture);
    };

    let mut preview: Vec<u8> = Vec::new();
    let mut spill: Option<tokio::fs::File> = None;
    let mut size: usize = 0;
    let mut buf = vec![0u8; OUTPUT_CHUNK_SIZE];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let chunk = &buf[..n];

        if size + n > threshold && spill.is_none() {
            tokio::fs::create_dir_all(&spill_dir).await?;
            let path = spill_dir.join(format!("tasker_{}_{}.out", label, Uuid::new_v4()));
            let mut file = tokio::fs::File::create(&path).await?;
            // Everything accumulated so far moves to disk first.
            file.write_all(&preview).await?;
            capture.file = Some(path);
            spill = Some(file);
        }

        if let Some(file) = spill.as_mut() {
            file.write_all(chunk).await?;
        }

        // The in-memory copy doubles as the preview, capped at the
        // threshold even while the spill file keeps growing.
        if preview.len() < threshold {
            let room = threshold - preview.len();
            preview.extend_from_slice(&chunk[..n.min(room)]);
        }
        size += n;
    }

    if let Some(file) = spill.as_mut() {
        file.flush().await?;
    }

    capture.preview = String::from_utf8_lossy(&preview).into_owned();
    capture.size = size as u64;
    capture.truncated = capture.file.is_some();
    Ok(capture)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    fn spawn_shell(script: &str) -> Child {
        Command::new("/bin/bash")
            .arg("-c")
            .arg(script)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .expect("spawn")
    }

    #[tokio::test]
    async fn test_small_output_stays_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let handler = StreamingOutputHandler::new(dir.path());
        let child = spawn_shell("echo out; echo err >&2");
        let capture = handler
            .stream_process_output(child, None, &Shutdown::default())
            .await
            .unwrap();

        assert_eq!(capture.exit_code, 0);
        assert!(!capture.timed_out);
        assert_eq!(capture.stdout.preview, "out\n");
        assert_eq!(capture.stderr.preview, "err\n");
        assert!(capture.stdout.file.is_none());
        assert!(!capture.stdout.truncated);
    }

    #[tokio::test]
    async fn test_large_output_spills_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let handler = StreamingOutputHandler::with_threshold(dir.path(), 1024);
        let child = spawn_shell("head -c 4096 /dev/zero | tr '\\0' 'x'");
        let capture = handler
            .stream_process_output(child, None, &Shutdown::default())
            .await
            .unwrap();

        assert_eq!(capture.stdout.size, 4096);
        assert!(capture.stdout.truncated);
        assert_eq!(capture.stdout.preview.len(), 1024);
        let path = capture.stdout.file.expect("spill file");
        let full = std::fs::read_to_string(&path).unwrap();
        assert_eq!(full.len(), 4096);
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let handler = StreamingOutputHandler::new(dir.path());
        let child = spawn_shell("sleep 30");
        let started = std::time::Instant::now();
        let capture = handler
            .stream_process_output(child, Some(Duration::from_secs(1)), &Shutdown::default())
            .await
            .unwrap();

        assert!(capture.timed_out);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_shutdown_terminates_process() {
        let dir = tempfile::tempdir().unwrap();
        let handler = StreamingOutputHandler::new(dir.path());
        let shutdown = Shutdown::default();
        shutdown.request();
        let child = spawn_shell("sleep 30");
        let started = std::time::Instant::now();
        let capture = handler
            .stream_process_output(child, None, &shutdown)
            .await
            .unwrap();

        assert!(!capture.timed_out);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_ne!(capture.exit_code, 0);
    }

    #[tokio::test]
    async fn test_nonzero_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let handler = StreamingOutputHandler::new(dir.path());
        let child = spawn_shell("exit 7");
        let capture = handler
            .stream_process_output(child, None, &Shutdown::default())
            .await
            .unwrap();
        assert_eq!(capture.exit_code, 7);
    }
}
