//! Suite orchestrator - sequences suites and owns the shared teardown

use crate::context::RunContext;
use crate::error::SuiteError;
use crate::runtime::docker::{ComposeSettings, DockerStrategy};
use crate::runtime::local::LocalStrategy;
use crate::runtime::process::CommandSpec;
use crate::runtime::supervisor::{RunResult, ServiceStrategy, Supervisor, DEFAULT_SHUTDOWN_TIMEOUT};
use crate::runtime::test_runner::{instrument, resolve_test_runner};
use crate::suite::{Suite, SuiteType, BEFORE_NAME};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Suite types to run (None = all)
    pub types: Option<HashSet<String>>,
    /// Suites to run, by name or `type/name` (None = all)
    pub suites: Option<HashSet<String>>,
    /// Grace period for coverage services after the exit message
    pub shutdown_timeout: Duration,
    /// Echo process output to the console
    pub echo: bool,
    /// Command prefix for coverage runs
    pub coverage_wrapper: Vec<String>,
    pub compose: ComposeSettings,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            types: None,
            suites: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            echo: true,
            coverage_wrapper: Vec::new(),
            compose: ComposeSettings::default(),
        }
    }
}

/// Lifecycle of one suite
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuiteState {
    Idle,
    Skipped,
    BeforeRunning,
    BeforeFailed,
    ServicesStarting,
    ServicesRunning,
    TestRunning,
    StoppingAll,
    Passed,
    Failed,
}

impl SuiteState {
    fn rank(self) -> u8 {
        match self {
            SuiteState::Idle => 0,
            SuiteState::BeforeRunning => 1,
            SuiteState::ServicesStarting => 2,
            SuiteState::ServicesRunning => 3,
            SuiteState::TestRunning => 4,
            SuiteState::StoppingAll => 5,
            SuiteState::Skipped | SuiteState::BeforeFailed | SuiteState::Passed | SuiteState::Failed => 6,
        }
    }

    pub fn is_final(self) -> bool {
        self.rank() == 6
    }
}

impl fmt::Display for SuiteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SuiteState::Idle => "idle",
            SuiteState::Skipped => "skipped",
            SuiteState::BeforeRunning => "before-running",
            SuiteState::BeforeFailed => "before-failed",
            SuiteState::ServicesStarting => "services-starting",
            SuiteState::ServicesRunning => "services-running",
            SuiteState::TestRunning => "test-running",
            SuiteState::StoppingAll => "stopping-all",
            SuiteState::Passed => "passed",
            SuiteState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Forward-only state of one suite, observable through [`SuiteProgress::subscribe`]
#[derive(Debug)]
pub struct SuiteProgress {
    id: String,
    state: watch::Sender<SuiteState>,
}

impl SuiteProgress {
    pub fn new(id: impl Into<String>) -> Self {
        let (state, _) = watch::channel(SuiteState::Idle);
        Self { id: id.into(), state }
    }

    /// Move to `next` unless the suite is already past it
    pub fn advance(&self, next: SuiteState) {
        let id = &self.id;
        self.state.send_if_modified(|state| {
            if next.rank() <= state.rank() {
                return false;
            }
            log::debug!("[{}] {} -> {}", id, state, next);
            *state = next;
            true
        });
    }

    pub fn state(&self) -> SuiteState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SuiteState> {
        self.state.subscribe()
    }
}

/// Final outcome of one suite
#[derive(Debug)]
pub struct SuiteOutcome {
    /// `type/name`
    pub suite: String,
    pub state: SuiteState,
    pub error: Option<SuiteError>,
    pub results: Vec<RunResult>,
}

impl SuiteOutcome {
    fn skipped(suite: &Suite) -> Self {
        Self {
            suite: suite.id(),
            state: SuiteState::Skipped,
            error: None,
            results: Vec::new(),
        }
    }
}

/// Aggregate of a whole invocation
#[derive(Debug, Default)]
pub struct RunSummary {
    pub outcomes: Vec<SuiteOutcome>,
    pub teardown_error: Option<SuiteError>,
}

impl RunSummary {
    fn count(&self, state: SuiteState) -> usize {
        self.outcomes.iter().filter(|o| o.state == state).count()
    }

    pub fn passed(&self) -> usize {
        self.count(SuiteState::Passed)
    }

    pub fn failed(&self) -> usize {
        self.count(SuiteState::Failed) + self.count(SuiteState::BeforeFailed)
    }

    pub fn skipped(&self) -> usize {
        self.count(SuiteState::Skipped)
    }

    pub fn success(&self) -> bool {
        self.failed() == 0 && self.teardown_error.is_none()
    }

    pub fn outcome(&self, suite: &str) -> Option<&SuiteOutcome> {
        self.outcomes.iter().find(|o| o.suite == suite)
    }
}

/// Runs suite types one after another
pub struct Orchestrator {
    ctx: Arc<RunContext>,
    config: OrchestratorConfig,
    supervisor: Supervisor,
    docker: Arc<DockerStrategy>,
    interrupt: watch::Receiver<bool>,
}

impl Orchestrator {
    pub fn new(ctx: Arc<RunContext>, config: OrchestratorConfig) -> Self {
        let local = Arc::new(
            LocalStrategy::new(ctx.clone())
                .with_coverage_wrapper(config.coverage_wrapper.clone())
                .with_echo(config.echo),
        );
        let runner = resolve_test_runner(&config.coverage_wrapper);
        let supervisor = Supervisor::new(local, runner).with_shutdown_timeout(config.shutdown_timeout);
        let docker = Arc::new(DockerStrategy::new(ctx.clone(), config.compose.clone()).with_echo(config.echo));
        let (_, interrupt) = watch::channel(false);

        Self {
            ctx,
            config,
            supervisor,
            docker,
            interrupt,
        }
    }

    /// Operator interrupts arrive as `true` on this channel
    pub fn with_interrupt(mut self, interrupt: watch::Receiver<bool>) -> Self {
        self.supervisor = self.supervisor.with_interrupt(interrupt.clone());
        self.interrupt = interrupt;
        self
    }

    fn interrupted(&self) -> bool {
        *self.interrupt.borrow()
    }

    /// Whether `suite` passes the type and suite filters
    pub fn selected(&self, suite: &Suite) -> bool {
        if !suite.enabled {
            return false;
        }
        if let Some(types) = &self.config.types {
            if !types.contains(&suite.type_name) {
                return false;
            }
        }
        if let Some(suites) = &self.config.suites {
            if !suites.contains(&suite.name) && !suites.contains(&suite.id()) {
                return false;
            }
        }
        true
    }

    /// Run every selected suite, then tear down shared resources once
    pub async fn run(&self, types: &[SuiteType]) -> RunSummary {
        self.ctx.reset();
        let mut summary = RunSummary::default();

        for suite_type in types {
            log::info!("Suite type '{}': {} suite(s)", suite_type.name, suite_type.suites.len());
            for suite in &suite_type.suites {
                if !self.selected(suite) {
                    log::debug!("[{}] Not selected, skipping", suite.id());
                    summary.outcomes.push(SuiteOutcome::skipped(suite));
                    continue;
                }
                if self.interrupted() {
                    log::info!("[{}] Skipped after interrupt", suite.id());
                    summary.outcomes.push(SuiteOutcome::skipped(suite));
                    continue;
                }
                summary.outcomes.push(self.run_suite(suite).await);
            }
        }

        summary.teardown_error = self.teardown().await;

        log::info!(
            "{} passed, {} failed, {} skipped",
            summary.passed(),
            summary.failed(),
            summary.skipped()
        );
        summary
    }

    async fn run_suite(&self, suite: &Suite) -> SuiteOutcome {
        let id = suite.id();
        let progress = SuiteProgress::new(&id);
        log::info!("[{}] Running", id);

        if let Some(before) = &suite.before {
            progress.advance(SuiteState::BeforeRunning);
            if let Err(e) = self.run_before(suite, before).await {
                progress.advance(SuiteState::BeforeFailed);
                let error = SuiteError::SuiteAbort {
                    suite: id.clone(),
                    source: Box::new(e),
                };
                log::error!("[{}] FAILED: {}", id, error);
                return SuiteOutcome {
                    suite: id,
                    state: SuiteState::BeforeFailed,
                    error: Some(error),
                    results: Vec::new(),
                };
            }
        }

        let strategy: Arc<dyn ServiceStrategy> = if suite.docker {
            self.docker.clone()
        } else {
            self.supervisor.local().clone()
        };
        let report = self.supervisor.run_tracked(suite, strategy, &progress).await;

        let state = if report.passed() {
            log::info!("[{}] PASSED", id);
            SuiteState::Passed
        } else {
            SuiteState::Failed
        };
        progress.advance(state);

        let error = report.outcome.err();
        if let Some(e) = &error {
            log::error!("[{}] FAILED: {}", id, e);
        }
        SuiteOutcome {
            suite: id,
            state,
            error,
            results: report.results,
        }
    }

    /// Run the before-command to completion under the `before` sink
    async fn run_before(&self, suite: &Suite, command: &str) -> Result<(), SuiteError> {
        let handle = self
            .supervisor
            .local()
            .spawn(suite, CommandSpec::new(BEFORE_NAME, command), None)?;

        let mut interrupt = self.interrupt.clone();
        let close = tokio::select! {
            close = handle.wait() => close,
            _ = wait_interrupt(&mut interrupt) => {
                handle.terminate();
                handle.wait().await;
                return Err(SuiteError::Interrupted);
            }
        };

        if close.code == Some(0) {
            log::debug!("[{}] Before command done", suite.id());
            Ok(())
        } else {
            Err(SuiteError::BeforeFailed { code: close.code })
        }
    }

    async fn teardown(&self) -> Option<SuiteError> {
        let strategies: [Arc<dyn ServiceStrategy>; 2] = [self.supervisor.local().clone(), self.docker.clone()];
        let mut first = None;
        for strategy in strategies {
            if let Err(e) = strategy.teardown().await {
                log::error!("Teardown of {} services failed: {}", strategy.name(), e);
                first.get_or_insert(e);
            }
        }
        first
    }

    /// Describe what `run` would do
    pub fn plan(&self, types: &[SuiteType]) -> RunPlan {
        let runner = self.supervisor.runner();
        let suites = types
            .iter()
            .flat_map(|t| t.suites.iter())
            .map(|suite| PlannedSuite {
                id: suite.id(),
                selected: self.selected(suite),
                strategy: if suite.docker { "docker" } else { "local" },
                before: suite.before.clone(),
                services: suite
                    .services
                    .iter()
                    .map(|service| {
                        let target = match (&service.container, &service.command) {
                            (Some(container), _) if suite.docker => format!("container {}", container),
                            (_, Some(command)) if service.coverage => {
                                instrument(&self.config.coverage_wrapper, command)
                            }
                            (_, Some(command)) => command.clone(),
                            _ => String::new(),
                        };
                        let mut flags = Vec::new();
                        if service.abort_on_error {
                            flags.push("abort_on_error");
                        }
                        if service.abort_on_exit {
                            flags.push("abort_on_exit");
                        }
                        if service.coverage {
                            flags.push("coverage");
                        }
                        PlannedService {
                            name: service.name.clone(),
                            target,
                            flags,
                            wait_on: service
                                .readiness
                                .as_ref()
                                .map(|r| r.resources.iter().map(|r| r.to_string()).collect())
                                .unwrap_or_default(),
                        }
                    })
                    .collect(),
                test: runner.command(suite),
            })
            .collect();

        RunPlan {
            logs_root: self.ctx.logs_root().display().to_string(),
            runner: runner.name(),
            suites,
        }
    }
}

async fn wait_interrupt(interrupt: &mut watch::Receiver<bool>) {
    if interrupt.wait_for(|interrupted| *interrupted).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Dry-run description of an invocation
#[derive(Debug)]
pub struct RunPlan {
    pub logs_root: String,
    pub runner: &'static str,
    pub suites: Vec<PlannedSuite>,
}

#[derive(Debug)]
pub struct PlannedSuite {
    pub id: String,
    pub selected: bool,
    pub strategy: &'static str,
    pub before: Option<String>,
    pub services: Vec<PlannedService>,
    pub test: String,
}

#[derive(Debug)]
pub struct PlannedService {
    pub name: String,
    pub target: String,
    pub flags: Vec<&'static str>,
    pub wait_on: Vec<String>,
}

impl fmt::Display for RunPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run Plan")?;
        writeln!(f, "========")?;
        writeln!(f)?;
        writeln!(f, "Logs: {}", self.logs_root)?;
        writeln!(f, "Test runner: {}", self.runner)?;

        for (i, suite) in self.suites.iter().enumerate() {
            writeln!(f)?;
            writeln!(
                f,
                "  {}. {} [{}]{}",
                i + 1,
                suite.id,
                suite.strategy,
                if suite.selected { "" } else { " (skipped)" }
            )?;
            if let Some(before) = &suite.before {
                writeln!(f, "     Before: {}", before)?;
            }
            for service in &suite.services {
                write!(f, "     Service {}: {}", service.name, service.target)?;
                if !service.flags.is_empty() {
                    write!(f, " [{}]", service.flags.join(", "))?;
                }
                writeln!(f)?;
                if !service.wait_on.is_empty() {
                    writeln!(f, "       Waits on: {}", service.wait_on.join(", "))?;
                }
            }
            writeln!(f, "     Test: {}", suite.test)?;
        }
        Ok(())
    }
}
