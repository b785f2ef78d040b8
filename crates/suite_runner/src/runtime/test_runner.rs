//! Test command construction
//!
//! The runner is picked once when the run starts: a plain runner executes the
//! suite's test command as written, a coverage runner prefixes it with the
//! configured wrapper for suites that ask for coverage.

use crate::suite::Suite;
use std::sync::Arc;

/// Builds the command line of a suite's test run
pub trait TestRunner: Send + Sync + std::fmt::Debug {
    /// Short name for logs and the dry-run plan
    fn name(&self) -> &'static str;

    /// Command line to run through `sh -c`
    fn command(&self, suite: &Suite) -> String;
}

/// Runs the test command unchanged
#[derive(Debug, Clone, Default)]
pub struct PlainTestRunner;

impl TestRunner for PlainTestRunner {
    fn name(&self) -> &'static str {
        "plain"
    }

    fn command(&self, suite: &Suite) -> String {
        suite.test.command.clone()
    }
}

/// Runs coverage suites under a wrapper command
#[derive(Debug, Clone)]
pub struct CoverageTestRunner {
    wrapper: Vec<String>,
}

impl CoverageTestRunner {
    pub fn new(wrapper: Vec<String>) -> Self {
        Self { wrapper }
    }
}

impl TestRunner for CoverageTestRunner {
    fn name(&self) -> &'static str {
        "coverage"
    }

    fn command(&self, suite: &Suite) -> String {
        if suite.coverage {
            instrument(&self.wrapper, &suite.test.command)
        } else {
            suite.test.command.clone()
        }
    }
}

/// Pick the runner for this invocation
pub fn resolve_test_runner(wrapper: &[String]) -> Arc<dyn TestRunner> {
    if wrapper.is_empty() {
        Arc::new(PlainTestRunner)
    } else {
        log::debug!("Coverage wrapper: {}", wrapper.join(" "));
        Arc::new(CoverageTestRunner::new(wrapper.to_vec()))
    }
}

/// Prefix `command` with the coverage wrapper
pub fn instrument(wrapper: &[String], command: &str) -> String {
    if wrapper.is_empty() {
        return command.to_string();
    }
    let mut parts: Vec<String> = wrapper.iter().map(|w| shell_quote(w)).collect();
    parts.push(command.to_string());
    parts.join(" ")
}

fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}
