//! Service supervisor
//!
//! Starts the services of one suite concurrently, then the test runner, and
//! applies the abort protocol: the first terminal condition (a failing
//! `abort_on_error` service, any `abort_on_exit` exit, the test finishing, a
//! readiness or spawn failure, an operator interrupt) fires stop-all exactly
//! once. The suite resolves only after every started process reported Closed.

use crate::error::{Result, SuiteError};
use crate::readiness::{ReadinessSpec, ReadinessWaiter};
use crate::runtime::local::LocalStrategy;
use crate::runtime::orchestrator::{SuiteProgress, SuiteState};
use crate::runtime::output::{ProcessClose, ProcessHandle};
use crate::runtime::process::{CommandSpec, ControlMessage, EventSender, ProcessEvent};
use crate::runtime::test_runner::TestRunner;
use crate::suite::{Service, Suite, TEST_RUNNER_NAME};
use async_trait::async_trait;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Time a gracefully stopped process gets before it is force-killed
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How services of a suite are brought up and down
#[async_trait]
pub trait ServiceStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Called once per suite before any service starts
    async fn prepare(&self, _suite: &Suite) -> Result<()> {
        Ok(())
    }

    /// Start `service` and multiplex its output
    async fn start(&self, suite: &Suite, service: &Service, events: EventSender) -> Result<ServiceHandle>;

    /// Force the service down. No-op on a closed handle.
    async fn stop(&self, handle: &ServiceHandle) -> Result<()>;

    /// Exit code to classify once the handle closed
    async fn exit_code(&self, _handle: &ServiceHandle, close: &ProcessClose) -> Option<i32> {
        close.code
    }

    /// Release shared resources after the last suite
    async fn teardown(&self) -> Result<()> {
        Ok(())
    }
}

/// What a supervised process is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Service,
    TestRunner,
}

/// A started service or test runner
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    pub name: String,
    pub process: ProcessHandle,
    pub abort_on_error: bool,
    pub abort_on_exit: bool,
    pub coverage: bool,
    /// Compose service reference, for container handles
    pub container: Option<String>,
    pub role: Role,
}

impl ServiceHandle {
    pub fn for_service(service: &Service, process: ProcessHandle) -> Self {
        Self {
            name: service.name.clone(),
            process,
            abort_on_error: service.abort_on_error,
            abort_on_exit: service.abort_on_exit,
            coverage: service.coverage,
            container: service.container.clone(),
            role: Role::Service,
        }
    }

    pub fn test_runner(process: ProcessHandle) -> Self {
        Self {
            name: TEST_RUNNER_NAME.to_string(),
            process,
            abort_on_error: false,
            abort_on_exit: false,
            coverage: false,
            container: None,
            role: Role::TestRunner,
        }
    }
}

/// How a process was asked to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Sent the exit control message
    Graceful,
    /// Killed (local) or stopped through compose (container)
    Forced,
}

/// Why stop-all fired
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopCause {
    ServiceFailed(String),
    ServiceExited(String),
    TestFinished { passed: bool },
    StartFailed(String),
    Interrupted,
}

impl StopCause {
    /// Whether coverage services get to flush their data
    pub fn is_graceful(&self) -> bool {
        matches!(self, StopCause::TestFinished { passed: true } | StopCause::Interrupted)
    }
}

impl fmt::Display for StopCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopCause::ServiceFailed(name) => write!(f, "service '{}' failed", name),
            StopCause::ServiceExited(name) => write!(f, "service '{}' exited", name),
            StopCause::TestFinished { passed: true } => write!(f, "tests passed"),
            StopCause::TestFinished { passed: false } => write!(f, "tests failed"),
            StopCause::StartFailed(name) => write!(f, "'{}' failed to start", name),
            StopCause::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Outcome of one service (or the test runner) in a suite run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub name: String,
    pub role: Role,
    /// Exit code, `None` when killed or unknown
    pub code: Option<i32>,
    pub last_log: Option<String>,
    /// Whether the process started and reported Closed
    pub closed: bool,
    pub error: Option<String>,
    pub stopped: Option<StopMode>,
}

/// Mutable state of one suite run, owned by the supervisor's event loop
#[derive(Debug, Default)]
pub struct SuiteRunState {
    pub results: IndexMap<String, RunResult>,
    pub running: IndexMap<String, ServiceHandle>,
    stop_modes: HashMap<String, StopMode>,
    stop_cause: Option<StopCause>,
    first_error: Option<SuiteError>,
}

impl SuiteRunState {
    /// Fire stop-all. Returns `true` only the first time.
    pub fn trigger_stop_all(&mut self, cause: StopCause) -> bool {
        if self.stop_cause.is_some() {
            return false;
        }
        self.stop_cause = Some(cause);
        true
    }

    pub fn stop_all_triggered(&self) -> bool {
        self.stop_cause.is_some()
    }

    pub fn stop_cause(&self) -> Option<&StopCause> {
        self.stop_cause.as_ref()
    }

    /// Keep `error` if it is the first one. Returns whether it was kept.
    pub fn capture(&mut self, error: SuiteError) -> bool {
        if self.first_error.is_some() {
            log::debug!("Not keeping secondary error: {}", error);
            return false;
        }
        self.first_error = Some(error);
        true
    }

    pub fn first_error(&self) -> Option<&SuiteError> {
        self.first_error.as_ref()
    }
}

/// Result of supervising one suite
#[derive(Debug)]
pub struct SuiteReport {
    /// `type/name` of the suite
    pub suite: String,
    pub results: Vec<RunResult>,
    pub outcome: Result<()>,
    pub stop_cause: Option<StopCause>,
}

impl SuiteReport {
    pub fn result(&self, name: &str) -> Option<&RunResult> {
        self.results.iter().find(|r| r.name == name)
    }

    pub fn passed(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Messages from the per-process start tasks to the event loop
enum TaskEvent {
    Started(ServiceHandle),
    Closed {
        name: String,
        code: Option<i32>,
        close: ProcessClose,
    },
    StartFailed {
        name: String,
        role: Role,
        error: SuiteError,
    },
    /// Start cancelled by stop-all before readiness completed
    Skipped { name: String, role: Role },
}

/// What a start task launches
#[derive(Clone)]
enum Starter {
    Service {
        strategy: Arc<dyn ServiceStrategy>,
        service: Service,
    },
    Test {
        local: Arc<LocalStrategy>,
        runner: Arc<dyn TestRunner>,
    },
}

impl Starter {
    fn name(&self) -> &str {
        match self {
            Starter::Service { service, .. } => &service.name,
            Starter::Test { .. } => TEST_RUNNER_NAME,
        }
    }

    fn role(&self) -> Role {
        match self {
            Starter::Service { .. } => Role::Service,
            Starter::Test { .. } => Role::TestRunner,
        }
    }

    fn readiness<'a>(&'a self, suite: &'a Suite) -> Option<&'a ReadinessSpec> {
        match self {
            Starter::Service { service, .. } => service.readiness.as_ref(),
            Starter::Test { .. } => suite.test.readiness.as_ref(),
        }
    }

    async fn start(&self, suite: &Suite, events: EventSender) -> Result<ServiceHandle> {
        match self {
            Starter::Service { strategy, service } => strategy.start(suite, service, events).await,
            Starter::Test { local, runner } => {
                let mut spec = CommandSpec::new(TEST_RUNNER_NAME, runner.command(suite));
                spec.env = suite.test.env.clone();
                spec.working_dir = suite.test.working_dir.clone();
                let process = local.spawn(suite, spec, Some(events))?;
                Ok(ServiceHandle::test_runner(process))
            }
        }
    }

    async fn exit_code(&self, handle: &ServiceHandle, close: &ProcessClose) -> Option<i32> {
        match self {
            Starter::Service { strategy, .. } => strategy.exit_code(handle, close).await,
            Starter::Test { .. } => close.code,
        }
    }
}

/// Runs suites one at a time under the abort protocol
pub struct Supervisor {
    local: Arc<LocalStrategy>,
    runner: Arc<dyn TestRunner>,
    waiter: ReadinessWaiter,
    shutdown_timeout: Duration,
    interrupt: watch::Receiver<bool>,
}

impl Supervisor {
    pub fn new(local: Arc<LocalStrategy>, runner: Arc<dyn TestRunner>) -> Self {
        // Never fires unless replaced through `with_interrupt`
        let (_, interrupt) = watch::channel(false);
        Self {
            local,
            runner,
            waiter: ReadinessWaiter::new(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            interrupt,
        }
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Operator interrupts arrive as `true` on this channel
    pub fn with_interrupt(mut self, interrupt: watch::Receiver<bool>) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn with_waiter(mut self, waiter: ReadinessWaiter) -> Self {
        self.waiter = waiter;
        self
    }

    pub fn local(&self) -> &Arc<LocalStrategy> {
        &self.local
    }

    pub fn runner(&self) -> &Arc<dyn TestRunner> {
        &self.runner
    }

    /// Supervise one suite from prepare to the last Closed notification
    pub async fn run(&self, suite: &Suite, strategy: Arc<dyn ServiceStrategy>) -> SuiteReport {
        self.run_tracked(suite, strategy, &SuiteProgress::new(suite.id())).await
    }

    /// Like [`Supervisor::run`], reporting phase changes to `progress`
    pub async fn run_tracked(
        &self,
        suite: &Suite,
        strategy: Arc<dyn ServiceStrategy>,
        progress: &SuiteProgress,
    ) -> SuiteReport {
        let id = suite.id();
        let mut state = SuiteRunState::default();
        progress.advance(SuiteState::ServicesStarting);

        if let Err(e) = strategy.prepare(suite).await {
            log::error!("[{}] Prepare failed: {}", id, e);
            return SuiteReport {
                suite: id.clone(),
                results: Vec::new(),
                outcome: Err(SuiteError::SuiteAbort {
                    suite: id,
                    source: Box::new(e),
                }),
                stop_cause: Some(StopCause::StartFailed(strategy.name().to_string())),
            };
        }

        let shared = Arc::new(suite.clone());
        let (stop_tx, stop_rx) = watch::channel(false);
        let (task_tx, mut task_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();

        let mut starters: Vec<Starter> = suite
            .services
            .iter()
            .map(|service| Starter::Service {
                strategy: strategy.clone(),
                service: service.clone(),
            })
            .collect();
        starters.push(Starter::Test {
            local: self.local.clone(),
            runner: self.runner.clone(),
        });

        log::info!(
            "[{}] Starting {} service(s) with the {} strategy",
            id,
            suite.services.len(),
            strategy.name()
        );
        let mut outstanding = starters.len();
        let mut services_pending = suite.services.len();
        if services_pending == 0 {
            progress.advance(SuiteState::ServicesRunning);
        }
        for starter in starters {
            tokio::spawn(launch(
                shared.clone(),
                starter,
                self.waiter.clone(),
                stop_rx.clone(),
                task_tx.clone(),
                event_tx.clone(),
            ));
        }
        drop(task_tx);

        let mut stops: Vec<JoinHandle<()>> = Vec::new();
        let mut interrupt = self.interrupt.clone();
        let mut interrupt_seen = false;

        while outstanding > 0 {
            tokio::select! {
                event = task_rx.recv() => {
                    let Some(event) = event else {
                        log::error!("[{}] Start tasks ended with {} outstanding", id, outstanding);
                        break;
                    };
                    match event {
                        TaskEvent::Started(handle) => {
                            log::debug!("[{}] Running", handle.name);
                            match handle.role {
                                Role::Service => settle(&mut services_pending, progress),
                                Role::TestRunner => progress.advance(SuiteState::TestRunning),
                            }
                            if state.stop_all_triggered() {
                                let graceful = state.stop_cause().is_some_and(StopCause::is_graceful);
                                stops.extend(self.stop_handle(&mut state, handle.clone(), graceful, &strategy));
                            }
                            state.running.insert(handle.name.clone(), handle);
                        }
                        TaskEvent::Closed { name, code, close } => {
                            outstanding -= 1;
                            let handle = state.running.shift_remove(&name);
                            let cause = self.on_closed(&mut state, &name, handle.as_ref(), code, &close);
                            if let Some(cause) = cause {
                                progress.advance(SuiteState::StoppingAll);
                                stops.extend(self.stop_all(&mut state, cause, &stop_tx, &strategy));
                            }
                        }
                        TaskEvent::StartFailed { name, role, error } => {
                            outstanding -= 1;
                            if role == Role::Service {
                                settle(&mut services_pending, progress);
                            }
                            log::error!("[{}] {}", name, error);
                            state.results.insert(name.clone(), RunResult {
                                name: name.clone(),
                                role,
                                code: None,
                                last_log: None,
                                closed: false,
                                error: Some(error.to_string()),
                                stopped: None,
                            });
                            state.capture(error);
                            progress.advance(SuiteState::StoppingAll);
                            stops.extend(self.stop_all(&mut state, StopCause::StartFailed(name), &stop_tx, &strategy));
                        }
                        TaskEvent::Skipped { name, role } => {
                            outstanding -= 1;
                            if role == Role::Service {
                                settle(&mut services_pending, progress);
                            }
                            log::debug!("[{}] Start cancelled", name);
                        }
                    }
                }
                Some((name, event)) = event_rx.recv() => match event {
                    ProcessEvent::Started { pid } => log::info!("[{}] Process started with PID: {}", name, pid),
                    ProcessEvent::Error { message } => {
                        log::warn!("[{}] Process terminated: {}", name, message);
                    }
                    ProcessEvent::Closed(close) => {
                        log::debug!("[{}] Close notification, code {:?}", name, close.code);
                    }
                },
                _ = interrupted(&mut interrupt), if !interrupt_seen => {
                    interrupt_seen = true;
                    log::warn!("[{}] Interrupted, stopping", id);
                    state.capture(SuiteError::Interrupted);
                    progress.advance(SuiteState::StoppingAll);
                    stops.extend(self.stop_all(&mut state, StopCause::Interrupted, &stop_tx, &strategy));
                }
            }
        }

        for stop in stops {
            let _ = stop.await;
        }

        let stop_cause = state.stop_cause.clone();
        let outcome = match state.first_error.take() {
            Some(e) => Err(SuiteError::SuiteAbort {
                suite: id.clone(),
                source: Box::new(e),
            }),
            None => Ok(()),
        };

        SuiteReport {
            suite: id,
            results: state.results.into_values().collect(),
            outcome,
            stop_cause,
        }
    }

    /// Classify a close. Returns the stop-all cause it triggers, if any.
    fn on_closed(
        &self,
        state: &mut SuiteRunState,
        name: &str,
        handle: Option<&ServiceHandle>,
        code: Option<i32>,
        close: &ProcessClose,
    ) -> Option<StopCause> {
        let role = handle.map(|h| h.role).unwrap_or(Role::Service);
        state.results.insert(
            name.to_string(),
            RunResult {
                name: name.to_string(),
                role,
                code,
                last_log: close.last_log.clone(),
                closed: true,
                error: close.error.clone(),
                stopped: state.stop_modes.get(name).copied(),
            },
        );

        if state.stop_all_triggered() {
            log::debug!("[{}] Closed during shutdown with code {:?}", name, code);
            return None;
        }

        match role {
            Role::TestRunner => {
                let passed = code == Some(0);
                if passed {
                    log::info!("[{}] Tests passed", name);
                } else {
                    log::error!("[{}] Tests failed with code {:?}", name, code);
                    state.capture(SuiteError::TestFailure { code });
                }
                Some(StopCause::TestFinished { passed })
            }
            Role::Service => {
                let handle = handle?;
                let mut cause = None;
                if code == Some(0) {
                    log::debug!("[{}] Exited cleanly", name);
                } else if handle.abort_on_error {
                    log::error!("[{}] Exited with code {:?}, aborting suite", name, code);
                    state.capture(SuiteError::ServiceExit {
                        name: name.to_string(),
                        code,
                    });
                    cause = Some(StopCause::ServiceFailed(name.to_string()));
                } else {
                    log::warn!("[{}] Exited with code {:?}", name, code);
                }

                if cause.is_none() && handle.abort_on_exit {
                    log::error!("[{}] Exited, aborting suite", name);
                    state.capture(SuiteError::ServiceExit {
                        name: name.to_string(),
                        code,
                    });
                    cause = Some(StopCause::ServiceExited(name.to_string()));
                }
                cause
            }
        }
    }

    fn stop_all(
        &self,
        state: &mut SuiteRunState,
        cause: StopCause,
        stop_tx: &watch::Sender<bool>,
        strategy: &Arc<dyn ServiceStrategy>,
    ) -> Vec<JoinHandle<()>> {
        let graceful = cause.is_graceful();
        if !state.trigger_stop_all(cause.clone()) {
            return Vec::new();
        }

        log::info!("Stopping all services: {}", cause);
        stop_tx.send_replace(true);

        let handles: Vec<ServiceHandle> = state.running.values().cloned().collect();
        handles
            .into_iter()
            .filter_map(|handle| self.stop_handle(state, handle, graceful, strategy))
            .collect()
    }

    /// Ask one process to stop in the background
    fn stop_handle(
        &self,
        state: &mut SuiteRunState,
        handle: ServiceHandle,
        graceful: bool,
        strategy: &Arc<dyn ServiceStrategy>,
    ) -> Option<JoinHandle<()>> {
        if handle.process.is_closed() {
            return None;
        }

        let mode = if graceful && handle.coverage && handle.process.has_control() {
            StopMode::Graceful
        } else {
            StopMode::Forced
        };
        state.stop_modes.insert(handle.name.clone(), mode);

        let stopper: Arc<dyn ServiceStrategy> = match handle.role {
            Role::TestRunner => self.local.clone(),
            Role::Service => strategy.clone(),
        };
        let timeout = self.shutdown_timeout;

        Some(tokio::spawn(async move {
            if mode == StopMode::Graceful {
                match handle.process.send_control(ControlMessage::exit()).await {
                    Ok(true) => {
                        if tokio::time::timeout(timeout, handle.process.wait()).await.is_ok() {
                            return;
                        }
                        log::warn!("[{}] Did not exit within {:?}, killing", handle.name, timeout);
                    }
                    Ok(false) => {}
                    Err(e) => log::warn!("[{}] Failed to send exit message: {}", handle.name, e),
                }
            }

            if let Err(e) = stopper.stop(&handle).await {
                log::error!("[{}] Error stopping: {}", handle.name, e);
            }
        }))
    }
}

/// Wait readiness, start, wait for close, report
async fn launch(
    suite: Arc<Suite>,
    starter: Starter,
    waiter: ReadinessWaiter,
    mut stop: watch::Receiver<bool>,
    tx: mpsc::UnboundedSender<TaskEvent>,
    events: EventSender,
) {
    let name = starter.name().to_string();

    let ready = tokio::select! {
        result = waiter.wait(starter.readiness(&suite)) => Some(result),
        _ = stop_requested(&mut stop) => None,
    };
    match ready {
        None => {
            let _ = tx.send(TaskEvent::Skipped {
                name,
                role: starter.role(),
            });
            return;
        }
        Some(Err(source)) => {
            let _ = tx.send(TaskEvent::StartFailed {
                name: name.clone(),
                role: starter.role(),
                error: SuiteError::ReadinessTimeout { name, source },
            });
            return;
        }
        Some(Ok(())) => {}
    }

    if *stop.borrow() {
        let _ = tx.send(TaskEvent::Skipped {
            name,
            role: starter.role(),
        });
        return;
    }

    let handle = match starter.start(&suite, events).await {
        Ok(handle) => handle,
        Err(error) => {
            let _ = tx.send(TaskEvent::StartFailed {
                name,
                role: starter.role(),
                error,
            });
            return;
        }
    };
    let _ = tx.send(TaskEvent::Started(handle.clone()));

    let close = handle.process.wait().await;
    let code = starter.exit_code(&handle, &close).await;
    let _ = tx.send(TaskEvent::Closed { name, code, close });
}

/// One more service got past its start request
fn settle(pending: &mut usize, progress: &SuiteProgress) {
    *pending = pending.saturating_sub(1);
    if *pending == 0 {
        progress.advance(SuiteState::ServicesRunning);
    }
}

async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn interrupted(interrupt: &mut watch::Receiver<bool>) {
    if interrupt.wait_for(|interrupted| *interrupted).await.is_err() {
        std::future::pending::<()>().await;
    }
}
