//! Process manager integration: the two primitives the daemon needs from
//! the host, following a service's logs and restarting it.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::config::{ProcessManagerKind, ServiceDefinition};

/// Result of a finished restart command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartOutcome {
    /// `None` when the command was killed by a signal
    pub exit_code: Option<i32>,
    pub stderr: String,
}

impl RestartOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[async_trait]
pub trait ProcessManager: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Start a long-running process that follows the service's log.
    ///
    /// stdout carries one entry per line; the child dies with its handle.
    fn spawn_tail(&self, service: &ServiceDefinition) -> std::io::Result<Child>;

    /// Run the service's restart command to completion.
    async fn restart(&self, service: &ServiceDefinition) -> std::io::Result<RestartOutcome>;
}

pub fn from_kind(kind: ProcessManagerKind) -> std::sync::Arc<dyn ProcessManager> {
    match kind {
        ProcessManagerKind::Systemd => std::sync::Arc::new(SystemdManager),
        ProcessManagerKind::Command => std::sync::Arc::new(CommandManager),
    }
}

/// `journalctl` for logs, `systemctl` for restarts.
pub struct SystemdManager;

impl SystemdManager {
    /// `journalctl <query> -f --output=json`
    pub fn tail_args(service: &ServiceDefinition) -> Vec<String> {
        let mut args = service.log_query_args.clone();
        args.push("-f".to_string());
        args.push("--output=json".to_string());
        args
    }

    /// `systemctl [--user] restart <unit>`, with the unit and scope taken
    /// from the journal query.
    pub fn restart_args(service: &ServiceDefinition) -> Vec<String> {
        let query = &service.log_query_args;
        let mut args = Vec::new();
        if query.iter().any(|a| a == "--user") {
            args.push("--user".to_string());
        }
        args.push("restart".to_string());
        args.push(unit_from_query(query).unwrap_or_else(|| service.name.clone()));
        args
    }
}

fn unit_from_query(query: &[String]) -> Option<String> {
    let mut iter = query.iter();
    while let Some(arg) = iter.next() {
        if arg == "-u" || arg == "--unit" {
            return iter.next().cloned();
        }
        if let Some(unit) = arg.strip_prefix("--unit=") {
            return Some(unit.to_string());
        }
        if let Some(unit) = arg.strip_prefix("-u").filter(|u| !u.is_empty()) {
            return Some(unit.to_string());
        }
    }
    None
}

#[async_trait]
impl ProcessManager for SystemdManager {
    fn name(&self) -> &'static str {
        "systemd"
    }

    fn spawn_tail(&self, service: &ServiceDefinition) -> std::io::Result<Child> {
        spawn_piped("journalctl", &Self::tail_args(service))
    }

    async fn restart(&self, service: &ServiceDefinition) -> std::io::Result<RestartOutcome> {
        run_to_completion("systemctl", &Self::restart_args(service)).await
    }
}

/// Runs the configured argv directly. Used where there is no systemd, and
/// by tests.
pub struct CommandManager;

#[async_trait]
impl ProcessManager for CommandManager {
    fn name(&self) -> &'static str {
        "command"
    }

    fn spawn_tail(&self, service: &ServiceDefinition) -> std::io::Result<Child> {
        let (program, args) = split_argv(&service.log_query_args)?;
        spawn_piped(program, args)
    }

    async fn restart(&self, service: &ServiceDefinition) -> std::io::Result<RestartOutcome> {
        let argv = service.restart_command.as_deref().unwrap_or_default();
        let (program, args) = split_argv(argv)?;
        run_to_completion(program, args).await
    }
}

fn split_argv(argv: &[String]) -> std::io::Result<(&str, &[String])> {
    match argv.split_first() {
        Some((program, args)) => Ok((program.as_str(), args)),
        None => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "empty command line",
        )),
    }
}

fn spawn_piped(program: &str, args: &[String]) -> std::io::Result<Child> {
    debug!("Spawning tail: {} {:?}", program, args);
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
}

async fn run_to_completion(program: &str, args: &[String]) -> std::io::Result<RestartOutcome> {
    debug!("Running: {} {:?}", program, args);
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await?;
    Ok(RestartOutcome {
        exit_code: output.status.code(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

/// Stop a child: SIGTERM, then SIGKILL if it outlives `timeout`.
pub async fn terminate(child: &mut Child, timeout: Duration) {
    if let Some(pid) = child.id() {
        debug!("Sending SIGTERM to process {}", pid);
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => debug!("Tail process exited with {:?}", status),
        Ok(Err(e)) => warn!("Error waiting for tail process: {}", e),
        Err(_) => {
            warn!("Tail process did not stop within {:?}, killing", timeout);
            let _ = child.kill().await;
        }
    }
}
