//! Compose-backed container strategy
//!
//! Containers are created once per suite (`up --no-start`), started one by
//! one, and followed through `logs -f`, which is the process the multiplexer
//! sees. The exit code comes from `inspect` when the engine reports the
//! container as exited, from the log tail otherwise.

use crate::context::RunContext;
use crate::error::{display_code, Result, SuiteError};
use crate::runtime::output::{attach, MuxOptions, ProcessClose};
use crate::runtime::process::EventSender;
use crate::runtime::sink::LogSink;
use crate::runtime::supervisor::{ServiceHandle, ServiceStrategy};
use crate::suite::{Service, Suite};
use async_trait::async_trait;
use regex::Regex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, LazyLock};
use tokio::process::{Child, Command};

/// Exit code assumed when neither the engine nor the logs tell
pub const DEFAULT_EXIT_CODE: i32 = 1;

static EXIT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"exited with code (\d+)").unwrap());

/// How to reach the compose control plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeSettings {
    /// Executable, e.g. `docker` or `docker-compose`
    pub program: String,
    /// Subcommand placed before compose arguments, e.g. `compose`
    pub command: Option<String>,
    /// Container engine command used for `inspect`, e.g. `docker` or
    /// `podman --remote`
    pub engine: String,
    pub file: Option<PathBuf>,
    pub project: Option<String>,
    /// Pass `--volumes` to `down`
    pub remove_volumes: bool,
}

impl Default for ComposeSettings {
    fn default() -> Self {
        Self {
            program: "docker".to_string(),
            command: Some("compose".to_string()),
            engine: "docker".to_string(),
            file: None,
            project: None,
            remove_volumes: false,
        }
    }
}

/// Thin wrapper over the compose CLI
#[derive(Debug, Clone)]
pub struct Compose {
    settings: ComposeSettings,
}

impl Compose {
    pub fn new(settings: ComposeSettings) -> Self {
        Self { settings }
    }

    /// Full argument list after the program name
    pub fn args(&self, args: &[&str]) -> Vec<String> {
        let mut full = Vec::new();
        if let Some(command) = &self.settings.command {
            full.push(command.clone());
        }
        if let Some(file) = &self.settings.file {
            full.push("-f".to_string());
            full.push(file.to_string_lossy().into_owned());
        }
        if let Some(project) = &self.settings.project {
            full.push("-p".to_string());
            full.push(project.clone());
        }
        full.extend(args.iter().map(|a| a.to_string()));
        full
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.settings.program);
        cmd.args(self.args(args)).stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }

    /// Run a compose command to completion, returning its stdout
    async fn run(&self, args: &[&str]) -> Result<String> {
        let line = args.join(" ");
        log::debug!("Running {} {}", self.settings.program, self.args(args).join(" "));

        let output = self
            .command(args)
            .output()
            .await
            .map_err(|e| SuiteError::Compose(format!("{}: {}", line, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SuiteError::Compose(format!(
                "`{}` exited with code {}: {}",
                line,
                display_code(&output.status.code()),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Create containers without starting them
    pub async fn up_no_start(&self, build: bool) -> Result<()> {
        if build {
            self.run(&["up", "--no-start", "--build"]).await?;
        } else {
            self.run(&["up", "--no-start"]).await?;
        }
        Ok(())
    }

    pub async fn start(&self, container: &str) -> Result<()> {
        self.run(&["start", container]).await.map(|_| ())
    }

    pub async fn stop(&self, container: &str) -> Result<()> {
        self.run(&["stop", container]).await.map(|_| ())
    }

    pub async fn down(&self, volumes: bool) -> Result<()> {
        if volumes {
            self.run(&["down", "--volumes"]).await?;
        } else {
            self.run(&["down"]).await?;
        }
        Ok(())
    }

    /// Follow a container's output. The child is the multiplexed process.
    pub fn logs_follow(&self, container: &str) -> std::io::Result<Child> {
        let mut cmd = self.command(&["logs", "-f", "--no-color", container]);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        #[cfg(unix)]
        cmd.process_group(0);
        cmd.spawn()
    }

    /// Ask the engine for the container's exit code.
    ///
    /// `None` unless the container has actually exited.
    pub async fn inspect_exit_code(&self, container: &str) -> Option<i32> {
        let ids = match self.run(&["ps", "-a", "-q", container]).await {
            Ok(ids) => ids,
            Err(e) => {
                log::debug!("[{}] Container lookup failed: {}", container, e);
                return None;
            }
        };
        let id = ids.lines().map(str::trim).find(|l| !l.is_empty())?;

        let mut engine = self.settings.engine.split_whitespace();
        let output = Command::new(engine.next()?)
            .args(engine)
            .args(["inspect", "--format", "{{.State.Status}} {{.State.ExitCode}}", id])
            .stdin(Stdio::null())
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            log::debug!("[{}] Inspect failed with code {:?}", container, output.status.code());
            return None;
        }
        parse_inspect(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse `<status> <exit code>`; the code only counts once the status is `exited`
fn parse_inspect(output: &str) -> Option<i32> {
    let mut fields = output.split_whitespace();
    let status = fields.next()?;
    if status != "exited" {
        log::debug!("Container is {}, ignoring its exit code", status);
        return None;
    }
    fields.next()?.parse().ok()
}

/// Last `exited with code N` in the log tail
pub fn parse_exit_code(tail: &[String]) -> Option<i32> {
    tail.iter().rev().find_map(|line| {
        EXIT_PATTERN
            .captures(line)
            .and_then(|caps| caps[1].parse().ok())
    })
}

/// Services as compose containers
#[derive(Debug, Clone)]
pub struct DockerStrategy {
    ctx: Arc<RunContext>,
    compose: Compose,
    echo: bool,
}

impl DockerStrategy {
    pub fn new(ctx: Arc<RunContext>, settings: ComposeSettings) -> Self {
        Self {
            ctx,
            compose: Compose::new(settings),
            echo: true,
        }
    }

    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    fn container<'a>(&self, handle: &'a ServiceHandle) -> &'a str {
        handle.container.as_deref().unwrap_or(&handle.name)
    }
}

#[async_trait]
impl ServiceStrategy for DockerStrategy {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn prepare(&self, suite: &Suite) -> Result<()> {
        let build = self.ctx.claim_image_build();
        log::info!(
            "[{}] Creating containers{}",
            suite.id(),
            if build { " (building images)" } else { "" }
        );
        self.ctx.mark_compose_used();
        self.compose.up_no_start(build).await
    }

    async fn start(&self, suite: &Suite, service: &Service, events: EventSender) -> Result<ServiceHandle> {
        let container = service.container.as_deref().unwrap_or(&service.name);
        self.compose.start(container).await?;

        let child = self
            .compose
            .logs_follow(container)
            .map_err(|source| SuiteError::ProcessSpawn {
                name: service.name.clone(),
                source,
            })?;
        let sink = LogSink::for_service(self.ctx.logs_root(), &suite.type_name, &suite.name, &service.name);
        let options = MuxOptions {
            record_exit_code: false,
            echo: self.echo,
        };
        let process = attach(&service.name, child, sink, options, Some(events));
        Ok(ServiceHandle::for_service(service, process))
    }

    async fn stop(&self, handle: &ServiceHandle) -> Result<()> {
        if handle.process.is_closed() {
            return Ok(());
        }
        let container = self.container(handle);
        log::debug!("[{}] Stopping container {}", handle.name, container);
        if let Err(e) = self.compose.stop(container).await {
            // The follower would otherwise outlive a container we cannot stop
            handle.process.terminate();
            return Err(e);
        }
        Ok(())
    }

    async fn exit_code(&self, handle: &ServiceHandle, close: &ProcessClose) -> Option<i32> {
        let container = self.container(handle);
        let code = match self.compose.inspect_exit_code(container).await {
            Some(code) => code,
            None => parse_exit_code(&close.tail).unwrap_or(DEFAULT_EXIT_CODE),
        };

        if let Err(e) = handle.process.sink().write_exit_code(Some(code)).await {
            log::error!("[{}] Cannot record exit code: {}", handle.name, e);
        }
        Some(code)
    }

    async fn teardown(&self) -> Result<()> {
        if !self.ctx.compose_used() {
            return Ok(());
        }
        log::info!("Removing compose resources");
        self.compose.down(self.compose.settings.remove_volumes).await
    }
}
