//! Suite Runner
//!
//! Brings up the services a test suite needs (local processes or compose
//! containers), waits until they are reachable, runs the suite's test command
//! against them and tears everything down again.
//!
//! # Overview
//!
//! - Every process's stdout/stderr is split into `out.log`, `err.log` and
//!   `combined-outerr.log` under `<logs>/<type>/<suite>/<service>/`
//! - Services and the test wait on TCP ports, files or HTTP endpoints
//! - A failing `abort_on_error` service, an `abort_on_exit` service exiting or
//!   the test finishing stops everything else in the suite, once
//! - Coverage-instrumented services get `{"exit":true}` on stdin to flush
//!   their data when the tests pass
//!
//! # Example Suite File
//!
//! ```yaml
//! args:
//!   port: 5432
//!
//! types:
//!   integration:
//!     - name: api
//!       services:
//!         db:
//!           command: "postgres -p $(arg port)"
//!           abort_on_error: true
//!       test:
//!         command: "cargo test"
//!         wait_on: ["tcp:localhost:$(arg port)"]
//! ```

pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod readiness;
pub mod runtime;
pub mod suite;

pub use cli::RunnerArgs;
pub use config::{ResolvedSuites, SubstitutionError, Substitutions, SuiteFile, SuiteFileError};
pub use context::RunContext;
pub use error::{Result, SuiteError};
pub use readiness::{ReadinessError, ReadinessSpec, ReadinessWaiter, Resource};
pub use runtime::{
    Orchestrator, OrchestratorConfig, ProcessClose, ProcessHandle, RunSummary, ServiceStrategy,
    SuiteReport, Supervisor,
};
pub use suite::{Service, Suite, SuiteType, TestSpec};
