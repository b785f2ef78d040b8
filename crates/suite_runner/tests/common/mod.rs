//! Shared fixtures for suite_runner integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use suite_runner::runtime::local::LocalStrategy;
use suite_runner::runtime::test_runner::resolve_test_runner;
use suite_runner::{RunContext, Service, Suite, Supervisor, TestSpec};

/// Suite type used by every fixture suite
pub const SUITE_TYPE: &str = "it";

/// Upper bound for any single scenario
pub const SCENARIO_TIMEOUT: Duration = Duration::from_secs(20);

/// Command reading control messages on stdin until asked to exit
pub const CONTROLLED_SERVICE: &str =
    r#"while read line; do case "$line" in *'"exit":true'*) echo flushed; exit 0;; esac; done"#;

/// A local suite with `services` and `test` as its test command
pub fn suite(name: &str, services: Vec<Service>, test: &str) -> Suite {
    Suite {
        type_name: SUITE_TYPE.to_string(),
        name: name.to_string(),
        services,
        before: None,
        test: TestSpec::new(test),
        docker: false,
        coverage: false,
        env: HashMap::new(),
        working_dir: None,
        enabled: true,
    }
}

pub fn service(name: &str, command: &str) -> Service {
    Service::local(name, command)
}

pub fn local_strategy(logs: &Path) -> Arc<LocalStrategy> {
    Arc::new(LocalStrategy::new(Arc::new(RunContext::new(logs))).with_echo(false))
}

/// Supervisor with a plain test runner and a short grace period
pub fn supervisor(logs: &Path) -> Supervisor {
    Supervisor::new(local_strategy(logs), resolve_test_runner(&[]))
        .with_shutdown_timeout(Duration::from_secs(2))
}

/// Log directory of `service` in fixture suite `suite`
pub fn log_dir(logs: &Path, suite: &str, service: &str) -> PathBuf {
    logs.join(SUITE_TYPE).join(suite).join(service)
}

pub fn read(path: impl AsRef<Path>) -> String {
    std::fs::read_to_string(path.as_ref())
        .unwrap_or_else(|e| panic!("cannot read {}: {}", path.as_ref().display(), e))
}
