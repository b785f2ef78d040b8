//! Process spawning and termination primitives

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::runtime::output::ProcessClose;

/// Environment variable telling a child that a control channel is open on stdin
pub const CONTROL_ENV: &str = "SUITE_RUNNER_CONTROL";

/// Configuration for spawning a shell command
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Process name (for logging)
    pub name: String,
    /// Command line, run through `sh -c`
    pub command: String,
    /// Environment variables
    pub env: HashMap<String, String>,
    /// Working directory
    pub working_dir: Option<PathBuf>,
    /// Keep stdin open as a control channel
    pub control: bool,
}

impl CommandSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            env: HashMap::new(),
            working_dir: None,
            control: false,
        }
    }
}

/// Event emitted by a multiplexed process
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    /// Process started
    Started { pid: u32 },
    /// Log capture failed; the process is being terminated
    Error { message: String },
    /// Terminal notification, sent exactly once
    Closed(ProcessClose),
}

/// Channel on which processes report events, tagged with their name
pub type EventSender = mpsc::UnboundedSender<(String, ProcessEvent)>;

/// Control message sent to instrumented children.
///
/// The only shape a child acts upon is `{"exit":true}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub exit: bool,
}

impl ControlMessage {
    /// Ask the child to exit gracefully
    pub fn exit() -> Self {
        Self { exit: true }
    }

    /// Encode as one newline-terminated JSON line
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Spawn `spec.command` through `sh -c` in its own process group
pub fn spawn_shell(spec: &CommandSpec) -> std::io::Result<Child> {
    let mut cmd = Command::new("sh");
    cmd.args(["-c", &spec.command])
        .envs(&spec.env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if spec.control {
        cmd.stdin(Stdio::piped()).env(CONTROL_ENV, "stdin");
    } else {
        cmd.stdin(Stdio::null());
    }

    if let Some(dir) = &spec.working_dir {
        cmd.current_dir(dir);
    }

    #[cfg(unix)]
    cmd.process_group(0);

    log::debug!("[{}] Spawning: {}", spec.name, spec.command);
    cmd.spawn()
}

/// Force-kill a process and every process in its group
pub fn kill_process_tree(pid: u32) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, killpg, Signal};
        use nix::unistd::Pid;

        let pid = Pid::from_raw(pid as i32);
        if killpg(pid, Signal::SIGKILL).is_err() {
            // Not a group leader (or already gone): fall back to the process itself
            let _ = kill(pid, Signal::SIGKILL);
        }
    }

    #[cfg(not(unix))]
    {
        log::warn!("Process tree kill is not supported on this platform (pid {})", pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_message_shape() {
        let line = ControlMessage::exit().to_line().unwrap();
        assert_eq!(line, "{\"exit\":true}\n");

        let parsed: ControlMessage = serde_json::from_str("{\"exit\":true}").unwrap();
        assert_eq!(parsed, ControlMessage::exit());
    }

    #[tokio::test]
    async fn test_spawn_shell_sets_env_and_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = CommandSpec::new("env", "printf '%s %s' \"$GREETING\" \"$(pwd)\"");
        spec.env.insert("GREETING".to_string(), "hello".to_string());
        spec.working_dir = Some(dir.path().to_path_buf());

        let child = spawn_shell(&spec).unwrap();
        let output = child.wait_with_output().await.unwrap();
        let stdout = String::from_utf8_lossy(&output.stdout);

        assert!(output.status.success());
        assert!(stdout.starts_with("hello "));
        let reported = std::fs::canonicalize(stdout.trim_start_matches("hello ")).unwrap();
        assert_eq!(reported, std::fs::canonicalize(dir.path()).unwrap());
    }

    #[tokio::test]
    async fn test_kill_process_tree_terminates_group() {
        let spec = CommandSpec::new("sleeper", "sleep 30 & sleep 30; wait");
        let mut child = spawn_shell(&spec).unwrap();
        let pid = child.id().unwrap();

        kill_process_tree(pid);

        let status = tokio::time::timeout(std::time::Duration::from_secs(5), child.wait())
            .await
            .expect("process group should die")
            .unwrap();
        assert!(!status.success());
    }
}
