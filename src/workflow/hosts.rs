use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::backends::resolve_backend;
use crate::error::TaskerError;
use crate::workflow::model::TaskKind;
use crate::workflow::state::StateManager;
use crate::workflow::vars::replace_variables;
use crate::workflow::DEFAULT_EXEC_TYPE;

/// Resolve and probe every unique (hostname, exec type) pair, then rewrite
/// hostnames in place to their validated FQDNs.
///
/// DNS resolution and a ping check always run for remote hosts; the
/// exec-specific remote probe (pbtest and friends) runs when
/// `connection_test` is set.
pub async fn validate_hosts(
    state: &StateManager,
    exec_override: Option<&str>,
    connection_test: bool,
) -> Result<(), TaskerError> {
    let globals = state.globals();
    let results = state.all_task_results();

    // hostname -> exec types that reach it
    let mut combinations: HashMap<String, HashSet<String>> = HashMap::new();
    let mut host_tasks: HashMap<String, Vec<u32>> = HashMap::new();

    for id in state.task_ids() {
        let Some(task) = state.task(id) else { continue };
        let TaskKind::Normal(spec) = &task.kind else {
            continue;
        };
        if spec.hostname.is_empty() {
            continue;
        }
        let (hostname, resolved) = replace_variables(&spec.hostname, &globals, &results);
        if !resolved || hostname.is_empty() {
            continue;
        }

        let exec_name = spec
            .exec
            .clone()
            .or_else(|| exec_override.map(str::to_string))
            .or_else(|| std::env::var("TASK_EXECUTOR_TYPE").ok())
            .unwrap_or_else(|| DEFAULT_EXEC_TYPE.to_string());
        let (canonical, backend) = resolve_backend(&exec_name);
        if !backend.is_remote() {
            continue;
        }

        combinations
            .entry(hostname.clone())
            .or_default()
            .insert(canonical.to_string());
        host_tasks.entry(hostname).or_default().push(id);
    }

    if combinations.is_empty() {
        return Ok(());
    }

    // Client binaries must exist before any remote command can run.
    let mut missing_clients = HashSet::new();
    for exec_types in combinations.values() {
        for exec_name in exec_types {
            let (_, backend) = resolve_backend(exec_name);
            if let Some(binary) = backend.client_binary() {
                if !binary_exists(binary) {
                    missing_clients.insert(format!("{} ({})", exec_name, binary));
                }
            }
        }
    }
    if !missing_clients.is_empty() {
        let mut names: Vec<String> = missing_clients.into_iter().collect();
        names.sort();
        return Err(TaskerError::ConnectionFailed(format!(
            "required remote execution commands not found: {}",
            names.join(", ")
        )));
    }

    let total_tests: usize = combinations.values().map(|set| set.len()).sum();
    info!(
        "# Validating {} unique hosts with {} connection tests...",
        combinations.len(),
        total_tests
    );

    let mut fqdns: HashMap<String, String> = HashMap::new();
    for (hostname, exec_types) in &combinations {
        let Some(fqdn) = resolve_hostname(hostname).await else {
            return Err(TaskerError::HostUnreachable(format!(
                "hostname '{}' could not be resolved",
                hostname
            )));
        };

        if !ping_host(&fqdn).await {
            return Err(TaskerError::HostUnreachable(format!(
                "host '{}' did not answer ping",
                fqdn
            )));
        }

        if connection_test {
            for exec_name in exec_types {
                let (_, backend) = resolve_backend(exec_name);
                if !backend.probe(&fqdn).await {
                    return Err(TaskerError::ConnectionFailed(format!(
                        "{} connection to '{}' failed",
                        exec_name, fqdn
                    )));
                }
            }
        }

        fqdns.insert(hostname.clone(), fqdn);
    }

    // The one permitted task mutation: hostnames become their FQDNs.
    for (hostname, fqdn) in &fqdns {
        if hostname == fqdn {
            continue;
        }
        debug!("replacing hostname '{}' with validated FQDN '{}'", hostname, fqdn);
        for id in host_tasks.get(hostname).into_iter().flatten() {
            state.rewrite_hostname(*id, fqdn);
        }
    }

    info!("# All host validations passed.");
    Ok(())
}

/// Fast path: /etc/hosts. Then DNS with a bounded wait, then the site
/// resolver (`op mc_isac -f`) which can map short names to FQDNs.
async fn resolve_hostname(hostname: &str) -> Option<String> {
    if in_etc_hosts(hostname) {
        debug!("hostname '{}' found in /etc/hosts", hostname);
        return Some(hostname.to_string());
    }

    let lookup = tokio::net::lookup_host((hostname, 0));
    match tokio::time::timeout(Duration::from_secs(5), lookup).await {
        Ok(Ok(mut addrs)) => {
            if addrs.next().is_some() {
                debug!("hostname '{}' resolved via DNS", hostname);
                return Some(hostname.to_string());
            }
        }
        Ok(Err(e)) => debug!("DNS lookup for '{}' failed: {}", hostname, e),
        Err(_) => debug!("DNS lookup for '{}' timed out", hostname),
    }

    match run_capture(&["op", "mc_isac", "-f", hostname], 10).await {
        Some(stdout) if !stdout.trim().is_empty() => {
            let fqdn = stdout.trim().to_string();
            debug!("resolved '{}' to FQDN '{}' using op mc_isac", hostname, fqdn);
            Some(fqdn)
        }
        _ => {
            warn!("could not resolve hostname '{}'", hostname);
            None
        }
    }
}

fn in_etc_hosts(hostname: &str) -> bool {
    let Ok(content) = std::fs::read_to_string("/etc/hosts") else {
        return false;
    };
    content
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .any(|line| line.split_whitespace().skip(1).any(|name| name == hostname))
}

async fn ping_host(hostname: &str) -> bool {
    match run_status(&["ping", "-c", "1", "-W", "1", hostname], 5).await {
        Some(ok) => ok,
        None => false,
    }
}

async fn run_status(argv: &[&str], timeout_secs: u64) -> Option<bool> {
    let child = Command::new(argv[0])
        .args(&argv[1..])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status();
    match tokio::time::timeout(Duration::from_secs(timeout_secs), child).await {
        Ok(Ok(status)) => Some(status.success()),
        _ => None,
    }
}

async fn run_capture(argv: &[&str], timeout_secs: u64) -> Option<String> {
    let child = Command::new(argv[0])
        .args(&argv[1..])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output();
    match tokio::time::timeout(Duration::from_secs(timeout_secs), child).await {
        Ok(Ok(output)) if output.status.success() => {
            Some(String::from_utf8_lossy(&output.stdout).into_owned())
        }
        _ => None,
    }
}

fn binary_exists(name: &str) -> bool {
    let Ok(path) = std::env::var("PATH") else {
        return false;
    };
    path.split(':').any(|dir| {
        let candidate = Path::new(dir).join(name);
        candidate.is_file()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{build_task, RawTask};
    use std::collections::BTreeMap;

    #[test]
    fn test_binary_exists_for_shell() {
        assert!(binary_exists("sh"));
        assert!(!binary_exists("definitely_not_a_real_binary_xyz"));
    }

    #[test]
    fn test_etc_hosts_lookup() {
        // localhost is present on any sane system.
        assert!(in_etc_hosts("localhost"));
        assert!(!in_etc_hosts("no-such-host-entry-xyz"));
    }

    #[tokio::test]
    async fn test_local_tasks_skip_validation() {
        let state = StateManager::new();
        let raw = RawTask {
            id: 0,
            line: 1,
            fields: vec![
                ("hostname".to_string(), "irrelevant".to_string()),
                ("command".to_string(), "true".to_string()),
                ("exec".to_string(), "local".to_string()),
            ],
        };
        let task = build_task(&raw).unwrap();
        state.set_tasks(BTreeMap::from([(0, task)]));

        // Local execution never probes the network.
        assert!(validate_hosts(&state, None, true).await.is_ok());
    }

    #[tokio::test]
    async fn test_localhost_resolves() {
        let state = StateManager::new();
        let raw = RawTask {
            id: 0,
            line: 1,
            fields: vec![
                ("hostname".to_string(), "localhost".to_string()),
                ("command".to_string(), "true".to_string()),
                ("exec".to_string(), "pbrun".to_string()),
            ],
        };
        let task = build_task(&raw).unwrap();
        state.set_tasks(BTreeMap::from([(0, task)]));

        // Without the pbrun client installed this must fail as a
        // connection error, not a hostname error.
        let result = validate_hosts(&state, None, false).await;
        if binary_exists("pbrun") {
            assert!(result.is_ok());
        } else {
            assert!(matches!(result, Err(TaskerError::ConnectionFailed(_))));
        }
    }
}
