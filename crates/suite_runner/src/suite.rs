//! Resolved suite and service descriptors
//!
//! These are produced by the suite file loader and are immutable for the
//! duration of a run.

use crate::readiness::ReadinessSpec;
use std::collections::HashMap;
use std::path::PathBuf;

/// Service name under which the test runner logs
pub const TEST_RUNNER_NAME: &str = "test";

/// Service name under which the before-command logs
pub const BEFORE_NAME: &str = "before";

/// A named group of suites run one after another
#[derive(Debug, Clone)]
pub struct SuiteType {
    pub name: String,
    pub suites: Vec<Suite>,
}

/// A named, typed group of services plus one test run
#[derive(Debug, Clone)]
pub struct Suite {
    /// Name of the suite type this suite belongs to
    pub type_name: String,
    pub name: String,
    /// Services in declaration order
    pub services: Vec<Service>,
    /// Command run to completion before any service starts
    pub before: Option<String>,
    pub test: TestSpec,
    /// Run services as compose containers instead of local processes
    pub docker: bool,
    /// Run the test command under the coverage wrapper
    pub coverage: bool,
    /// Environment shared by every process of the suite
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub enabled: bool,
}

impl Suite {
    /// `type/name` identifier used in log messages
    pub fn id(&self) -> String {
        format!("{}/{}", self.type_name, self.name)
    }
}

/// One dependency a suite needs running during its test
#[derive(Debug, Clone)]
pub struct Service {
    pub name: String,
    /// Shell command for local suites
    pub command: Option<String>,
    /// Compose service reference for docker suites
    pub container: Option<String>,
    pub env: HashMap<String, String>,
    pub readiness: Option<ReadinessSpec>,
    /// Abort the suite when this service exits non-zero
    pub abort_on_error: bool,
    /// Abort the suite when this service exits at all
    pub abort_on_exit: bool,
    /// Start under the coverage wrapper with a control channel on stdin
    pub coverage: bool,
    pub working_dir: Option<PathBuf>,
}

impl Service {
    /// A local service running `command`, with every flag off
    pub fn local(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: Some(command.into()),
            container: None,
            env: HashMap::new(),
            readiness: None,
            abort_on_error: false,
            abort_on_exit: false,
            coverage: false,
            working_dir: None,
        }
    }
}

/// The test command of a suite
#[derive(Debug, Clone)]
pub struct TestSpec {
    pub command: String,
    pub env: HashMap<String, String>,
    pub readiness: Option<ReadinessSpec>,
    pub working_dir: Option<PathBuf>,
}

impl TestSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            env: HashMap::new(),
            readiness: None,
            working_dir: None,
        }
    }
}
