use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::util::split_arguments;

/// How commands reach their target host. Each execution type knows how to
/// build its argv and how to probe connectivity to a remote host.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// True when the backend reaches another machine and host validation
    /// should resolve and probe the hostname.
    fn is_remote(&self) -> bool {
        true
    }

    /// The client binary that must exist on this machine, if any.
    fn client_binary(&self) -> Option<&'static str> {
        None
    }

    /// Build the argv executed with `shell=false`.
    fn build_argv(&self, hostname: &str, command: &str, arguments: &str) -> Vec<String>;

    /// Test connectivity to `hostname`. Backends without a remote side
    /// accept everything.
    async fn probe(&self, _hostname: &str) -> bool {
        true
    }
}

/// Direct execution on this machine: `[cmd, args...]`.
pub struct LocalBackend;

#[async_trait]
impl Backend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    fn is_remote(&self) -> bool {
        false
    }

    fn build_argv(&self, _hostname: &str, command: &str, arguments: &str) -> Vec<String> {
        let mut argv = vec![command.to_string()];
        argv.extend(split_arguments(arguments));
        argv
    }
}

/// Execution through `/bin/bash -c`, so pipes, redirects and command
/// substitution work. Command and arguments become one script string.
pub struct ShellBackend;

#[async_trait]
impl Backend for ShellBackend {
    fn name(&self) -> &'static str {
        "shell"
    }

    fn is_remote(&self) -> bool {
        false
    }

    fn build_argv(&self, _hostname: &str, command: &str, arguments: &str) -> Vec<String> {
        let script = format!("{} {}", command, arguments).trim().to_string();
        vec!["/bin/bash".to_string(), "-c".to_string(), script]
    }
}

/// PowerBroker remote execution.
pub struct PbrunBackend;

#[async_trait]
impl Backend for PbrunBackend {
    fn name(&self) -> &'static str {
        "pbrun"
    }

    fn client_binary(&self) -> Option<&'static str> {
        Some("pbrun")
    }

    fn build_argv(&self, hostname: &str, command: &str, arguments: &str) -> Vec<String> {
        let mut argv = vec![
            "pbrun".to_string(),
            "-n".to_string(),
            "-h".to_string(),
            hostname.to_string(),
            command.to_string(),
        ];
        argv.extend(split_arguments(arguments));
        argv
    }

    async fn probe(&self, hostname: &str) -> bool {
        run_probe(&["pbrun", "-n", "-h", hostname, "pbtest"]).await
    }
}

pub struct P7sBackend;

#[async_trait]
impl Backend for P7sBackend {
    fn name(&self) -> &'static str {
        "p7s"
    }

    fn client_binary(&self) -> Option<&'static str> {
        Some("p7s")
    }

    fn build_argv(&self, hostname: &str, command: &str, arguments: &str) -> Vec<String> {
        let mut argv = vec!["p7s".to_string(), hostname.to_string(), command.to_string()];
        argv.extend(split_arguments(arguments));
        argv
    }

    async fn probe(&self, hostname: &str) -> bool {
        run_probe(&["p7s", hostname, "pbtest"]).await
    }
}

pub struct WwrsBackend;

#[async_trait]
impl Backend for WwrsBackend {
    fn name(&self) -> &'static str {
        "wwrs"
    }

    fn client_binary(&self) -> Option<&'static str> {
        Some("wwrs_clir")
    }

    fn build_argv(&self, hostname: &str, command: &str, arguments: &str) -> Vec<String> {
        let mut argv = vec![
            "wwrs_clir".to_string(),
            hostname.to_string(),
            command.to_string(),
        ];
        argv.extend(split_arguments(arguments));
        argv
    }

    async fn probe(&self, hostname: &str) -> bool {
        run_probe(&["wwrs_clir", hostname, "wwrs_test"]).await
    }
}

/// A probe passes when the client exits 0 and prints OK within 10 seconds.
async fn run_probe(argv: &[&str]) -> bool {
    debug!("probe: {}", argv.join(" "));
    let output = Command::new(argv[0])
        .args(&argv[1..])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(Duration::from_secs(10), output).await {
        Ok(Ok(out)) => out.status.success() && String::from_utf8_lossy(&out.stdout).contains("OK"),
        Ok(Err(e)) => {
            debug!("probe spawn failed: {}", e);
            false
        }
        Err(_) => {
            debug!("probe timed out");
            false
        }
    }
}

/// Resolve an execution-type name (with `sh`/`bash` aliases) to a backend.
/// Unknown names fall back to local execution; callers log the fallback.
pub fn resolve_backend(exec_type: &str) -> (&'static str, Box<dyn Backend>) {
    match exec_type.trim().to_lowercase().as_str() {
        "local" => ("local", Box::new(LocalBackend)),
        "shell" | "sh" | "bash" | "/bin/sh" | "/bin/bash" => ("shell", Box::new(ShellBackend)),
        "pbrun" => ("pbrun", Box::new(PbrunBackend)),
        "p7s" => ("p7s", Box::new(P7sBackend)),
        "wwrs" => ("wwrs", Box::new(WwrsBackend)),
        _ => ("local", Box::new(LocalBackend)),
    }
}

/// True when `exec_type` names one of the supported backends or aliases.
pub fn is_known_exec_type(exec_type: &str) -> bool {
    matches!(
        exec_type.trim().to_lowercase().as_str(),
        "local" | "shell" | "sh" | "bash" | "/bin/sh" | "/bin/bash" | "pbrun" | "p7s" | "wwrs"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_argv() {
        let argv = LocalBackend.build_argv("", "echo", "hello world");
        assert_eq!(argv, vec!["echo", "hello", "world"]);
    }

    #[test]
    fn test_shell_argv_single_script() {
        let argv = ShellBackend.build_argv("", "ls /tmp", "| wc -l");
        assert_eq!(argv, vec!["/bin/bash", "-c", "ls /tmp | wc -l"]);
    }

    #[test]
    fn test_pbrun_argv() {
        let argv = PbrunBackend.build_argv("web01", "uptime", "-p");
        assert_eq!(argv, vec!["pbrun", "-n", "-h", "web01", "uptime", "-p"]);
    }

    #[test]
    fn test_wwrs_argv() {
        let argv = WwrsBackend.build_argv("db02", "df", "-h /var");
        assert_eq!(argv, vec!["wwrs_clir", "db02", "df", "-h", "/var"]);
    }

    #[test]
    fn test_resolve_backend_aliases() {
        assert_eq!(resolve_backend("bash").0, "shell");
        assert_eq!(resolve_backend("sh").0, "shell");
        assert_eq!(resolve_backend("PBRUN").0, "pbrun");
        // Unknown types fall back to local execution.
        assert_eq!(resolve_backend("telnet").0, "local");
    }

    #[test]
    fn test_remote_flags() {
        assert!(!LocalBackend.is_remote());
        assert!(!ShellBackend.is_remote());
        assert!(PbrunBackend.is_remote());
        assert!(P7sBackend.is_remote());
        assert!(WwrsBackend.is_remote());
    }
}
