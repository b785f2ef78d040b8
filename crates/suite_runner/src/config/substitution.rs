//! `$(kind value)` substitutions in suite file strings
//!
//! | Pattern | Value |
//! |---|---|
//! | `$(arg NAME)` | suite file `args`, overridden with `-a NAME:=value` |
//! | `$(env NAME)` | suite file `env`, then the process environment |
//! | `$(suite)` / `$(type)` | name of the suite being resolved / its type |
//! | `$(timestamp [fmt])` | local time, default `%Y%m%d_%H%M%S` |
//! | `$(date [fmt])` | local date, default `%Y-%m-%d` |
//!
//! Any other `$(...)` is left alone so shell command substitutions survive.
//! Values may themselves contain patterns; expansion stops after
//! [`MAX_DEPTH`] rounds.

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::LazyLock;

/// Rounds of nested expansion before giving up
pub const MAX_DEPTH: usize = 8;

static PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\((\w+)(?:\s+([^)]*))?\)").unwrap());

/// Values visible to substitutions
#[derive(Debug, Clone, Default)]
pub struct Substitutions {
    pub args: HashMap<String, String>,
    pub env: HashMap<String, String>,
    suite: Option<String>,
    suite_type: Option<String>,
}

impl Substitutions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_arg(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(name.into(), value.into());
        self
    }

    pub fn with_args(mut self, args: HashMap<String, String>) -> Self {
        self.args.extend(args);
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    pub fn with_envs(mut self, env: HashMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    /// Scope a copy to one suite, enabling `$(suite)` and `$(type)`
    pub fn for_suite(&self, suite_type: &str, suite: &str) -> Self {
        Self {
            suite: Some(suite.to_string()),
            suite_type: Some(suite_type.to_string()),
            ..self.clone()
        }
    }

    /// Expand every pattern in `input`
    pub fn apply(&self, input: &str) -> Result<String, SubstitutionError> {
        let mut current = input.to_string();
        for _ in 0..MAX_DEPTH {
            let next = self.expand(&current)?;
            if next == current {
                return Ok(current);
            }
            current = next;
        }
        Err(SubstitutionError::TooDeep(input.to_string()))
    }

    /// Expand an optional value
    pub fn apply_opt(&self, input: Option<&str>) -> Result<Option<String>, SubstitutionError> {
        input.map(|s| self.apply(s)).transpose()
    }

    fn expand(&self, input: &str) -> Result<String, SubstitutionError> {
        let mut failure = None;
        let expanded = PATTERN.replace_all(input, |caps: &Captures| {
            let kind = &caps[1];
            let value = caps.get(2).map(|m| m.as_str().trim()).unwrap_or("");
            match self.lookup(kind, value) {
                Ok(Some(resolved)) => resolved,
                Ok(None) => caps[0].to_string(),
                Err(e) => {
                    failure.get_or_insert(e);
                    String::new()
                }
            }
        });

        match failure {
            Some(e) => Err(e),
            None => Ok(expanded.into_owned()),
        }
    }

    /// `Ok(None)` for kinds that are not ours
    fn lookup(&self, kind: &str, value: &str) -> Result<Option<String>, SubstitutionError> {
        let resolved = match kind {
            "arg" => self
                .args
                .get(value)
                .cloned()
                .ok_or_else(|| SubstitutionError::UndefinedArg(value.to_string())),
            "env" => self
                .env
                .get(value)
                .cloned()
                .or_else(|| std::env::var(value).ok())
                .ok_or_else(|| SubstitutionError::UndefinedEnv(value.to_string())),
            "suite" => self
                .suite
                .clone()
                .ok_or(SubstitutionError::OutOfScope("suite")),
            "type" => self
                .suite_type
                .clone()
                .ok_or(SubstitutionError::OutOfScope("type")),
            "timestamp" => Ok(now(value, "%Y%m%d_%H%M%S")),
            "date" => Ok(now(value, "%Y-%m-%d")),
            _ => return Ok(None),
        };
        resolved.map(Some)
    }
}

fn now(format: &str, default: &str) -> String {
    let format = if format.is_empty() { default } else { format };
    chrono::Local::now().format(format).to_string()
}

/// Errors from substitution
#[derive(Debug, Clone, thiserror::Error)]
pub enum SubstitutionError {
    #[error("Undefined argument: {0}")]
    UndefinedArg(String),

    #[error("Undefined environment variable: {0}")]
    UndefinedEnv(String),

    #[error("$({0}) is only available inside a suite")]
    OutOfScope(&'static str),

    #[error("Substitutions nested too deeply in: {0}")]
    TooDeep(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arg_and_env() {
        let subst = Substitutions::new()
            .with_arg("port", "5432")
            .with_env("DB_HOST", "db.local");
        assert_eq!(
            subst.apply("tcp:$(env DB_HOST):$(arg port)").unwrap(),
            "tcp:db.local:5432"
        );
    }

    #[test]
    fn test_suite_scope() {
        let base = Substitutions::new();
        assert!(matches!(
            base.apply("$(suite)"),
            Err(SubstitutionError::OutOfScope("suite"))
        ));

        let scoped = base.for_suite("integration", "api");
        assert_eq!(scoped.apply("logs/$(type)/$(suite)").unwrap(), "logs/integration/api");
    }

    #[test]
    fn test_timestamp_and_date() {
        let subst = Substitutions::new();
        let stamp = subst.apply("run_$(timestamp)").unwrap();
        assert_eq!(stamp.len(), "run_".len() + "YYYYmmdd_HHMMSS".len());

        let year = subst.apply("$(date %Y)").unwrap();
        assert_eq!(year.len(), 4);
        assert!(year.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_nested_args() {
        let subst = Substitutions::new()
            .with_arg("url", "http://localhost:$(arg port)/health")
            .with_arg("port", "8080");
        assert_eq!(subst.apply("$(arg url)").unwrap(), "http://localhost:8080/health");
    }

    #[test]
    fn test_self_reference_is_too_deep() {
        let subst = Substitutions::new().with_arg("loop", "x$(arg loop)");
        assert!(matches!(subst.apply("$(arg loop)"), Err(SubstitutionError::TooDeep(_))));
    }

    #[test]
    fn test_errors() {
        let subst = Substitutions::new();
        assert!(matches!(subst.apply("$(arg missing)"), Err(SubstitutionError::UndefinedArg(_))));
        assert!(matches!(
            subst.apply("$(env SUITE_RUNNER_SURELY_UNSET_VAR)"),
            Err(SubstitutionError::UndefinedEnv(_))
        ));
    }

    #[test]
    fn test_plain_text_untouched() {
        let subst = Substitutions::new();
        assert_eq!(subst.apply("echo $HOME (not a pattern)").unwrap(), "echo $HOME (not a pattern)");
        assert_eq!(subst.apply("cd $(pwd) && ls $(dirname x)").unwrap(), "cd $(pwd) && ls $(dirname x)");
        assert_eq!(subst.apply_opt(None).unwrap(), None);
    }
}
