//! Runtime components: process multiplexing, supervision and orchestration

pub mod docker;
pub mod local;
pub mod orchestrator;
pub mod output;
pub mod process;
pub mod sink;
pub mod supervisor;
pub mod test_runner;

pub use docker::{Compose, ComposeSettings, DockerStrategy};
pub use local::LocalStrategy;
pub use orchestrator::{
    Orchestrator, OrchestratorConfig, RunPlan, RunSummary, SuiteOutcome, SuiteProgress, SuiteState,
};
pub use output::{attach, HandleState, MuxOptions, ProcessClose, ProcessHandle};
pub use process::{spawn_shell, CommandSpec, ControlMessage, EventSender, ProcessEvent};
pub use sink::LogSink;
pub use supervisor::{
    Role, RunResult, ServiceHandle, ServiceStrategy, StopCause, StopMode, SuiteReport, Supervisor,
};
pub use test_runner::{resolve_test_runner, TestRunner};
