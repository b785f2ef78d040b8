//! Local process strategy
//!
//! Services run as shell commands in their own process group. Stopping a
//! service force-kills the whole group.

use crate::context::RunContext;
use crate::error::{Result, SuiteError};
use crate::runtime::output::{attach, MuxOptions, ProcessHandle};
use crate::runtime::process::{spawn_shell, CommandSpec, EventSender};
use crate::runtime::sink::LogSink;
use crate::runtime::supervisor::{ServiceHandle, ServiceStrategy};
use crate::runtime::test_runner::instrument;
use crate::suite::{Service, Suite};
use async_trait::async_trait;
use std::sync::Arc;

/// Spawns local processes with their output multiplexed into the log tree
#[derive(Debug, Clone)]
pub struct LocalStrategy {
    ctx: Arc<RunContext>,
    coverage_wrapper: Vec<String>,
    echo: bool,
}

impl LocalStrategy {
    pub fn new(ctx: Arc<RunContext>) -> Self {
        Self {
            ctx,
            coverage_wrapper: Vec::new(),
            echo: true,
        }
    }

    pub fn with_coverage_wrapper(mut self, wrapper: Vec<String>) -> Self {
        self.coverage_wrapper = wrapper;
        self
    }

    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Spawn `spec` for `suite`, logging under `<type>/<suite>/<spec.name>`.
    ///
    /// Suite environment and working directory apply unless `spec` sets its
    /// own.
    pub fn spawn(
        &self,
        suite: &Suite,
        mut spec: CommandSpec,
        events: Option<EventSender>,
    ) -> Result<ProcessHandle> {
        let mut env = suite.env.clone();
        env.extend(std::mem::take(&mut spec.env));
        spec.env = env;
        if spec.working_dir.is_none() {
            spec.working_dir = suite.working_dir.clone();
        }

        let sink = LogSink::for_service(self.ctx.logs_root(), &suite.type_name, &suite.name, &spec.name);
        let child = spawn_shell(&spec).map_err(|source| SuiteError::ProcessSpawn {
            name: spec.name.clone(),
            source,
        })?;

        let options = MuxOptions {
            record_exit_code: true,
            echo: self.echo,
        };
        Ok(attach(spec.name, child, sink, options, events))
    }
}

#[async_trait]
impl ServiceStrategy for LocalStrategy {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn start(&self, suite: &Suite, service: &Service, events: EventSender) -> Result<ServiceHandle> {
        let Some(command) = &service.command else {
            return Err(SuiteError::ProcessSpawn {
                name: service.name.clone(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "service has no command"),
            });
        };

        let mut spec = CommandSpec::new(&service.name, command);
        spec.env = service.env.clone();
        spec.working_dir = service.working_dir.clone();
        if service.coverage {
            spec.command = instrument(&self.coverage_wrapper, command);
            spec.control = true;
        }

        let process = self.spawn(suite, spec, Some(events))?;
        Ok(ServiceHandle::for_service(service, process))
    }

    async fn stop(&self, handle: &ServiceHandle) -> Result<()> {
        if handle.process.terminate() {
            log::debug!("[{}] Force-killed", handle.name);
        }
        Ok(())
    }
}
