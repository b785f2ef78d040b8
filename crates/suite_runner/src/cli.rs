//! Command-line interface for suite_runner

use argh::FromArgs;
use std::collections::{HashMap, HashSet};

/// Run test suites against locally spawned or containerized services
#[derive(FromArgs, Debug)]
pub struct RunnerArgs {
    /// path to the suite file (default: suites.yaml)
    #[argh(positional, default = "String::from(\"suites.yaml\")")]
    pub suite_file: String,

    /// override suite file arguments (format: key:=value)
    #[argh(option, short = 'a', from_str_fn(parse_arg_override))]
    pub arg: Vec<(String, String)>,

    /// only run these suite types (comma-separated)
    #[argh(option, short = 't', from_str_fn(parse_list))]
    pub types: Option<Vec<String>>,

    /// only run these suites, by name or type/name (comma-separated)
    #[argh(option, short = 's', from_str_fn(parse_list))]
    pub suites: Option<Vec<String>>,

    /// root of the log tree (overrides logs_dir from the suite file)
    #[argh(option)]
    pub logs_dir: Option<String>,

    /// exit non-zero when any suite fails
    #[argh(switch)]
    pub fail_on_error: bool,

    /// do not echo process output to the console
    #[argh(switch)]
    pub no_echo: bool,

    /// validate the suite file and exit
    #[argh(switch)]
    pub validate: bool,

    /// show the run plan without executing
    #[argh(switch)]
    pub dry_run: bool,

    /// log level (error, warn, info, debug, trace)
    #[argh(option, short = 'l', default = "String::from(\"info\")")]
    pub log_level: String,
}

/// Parse argument override in format "key:=value"
fn parse_arg_override(s: &str) -> Result<(String, String), String> {
    match s.split_once(":=") {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("Invalid argument format '{}'. Expected 'key:=value'", s)),
    }
}

/// Parse a comma-separated list, dropping empty entries
fn parse_list(s: &str) -> Result<Vec<String>, String> {
    Ok(s.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect())
}

impl RunnerArgs {
    /// Convert argument overrides to a HashMap
    pub fn arg_overrides(&self) -> HashMap<String, String> {
        self.arg.iter().cloned().collect()
    }

    pub fn type_filter(&self) -> Option<HashSet<String>> {
        self.types.as_ref().map(|t| t.iter().cloned().collect())
    }

    pub fn suite_filter(&self) -> Option<HashSet<String>> {
        self.suites.as_ref().map(|s| s.iter().cloned().collect())
    }

    /// Filter string for env_logger; unknown levels fall back to info
    pub fn log_filter(&self) -> &'static str {
        match self.log_level.to_lowercase().as_str() {
            "error" => "error",
            "warn" => "warn",
            "debug" => "debug",
            "trace" => "trace",
            _ => "info",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arg_override() {
        assert_eq!(
            parse_arg_override("port:=5432"),
            Ok(("port".to_string(), "5432".to_string()))
        );
        assert_eq!(
            parse_arg_override("url:=http://localhost:8080/a=b"),
            Ok(("url".to_string(), "http://localhost:8080/a=b".to_string()))
        );
        assert!(parse_arg_override("invalid").is_err());
        assert!(parse_arg_override(":=value").is_err());
    }

    #[test]
    fn test_parse_list() {
        assert_eq!(
            parse_list("integration, e2e,,"),
            Ok(vec!["integration".to_string(), "e2e".to_string()])
        );
    }

    #[test]
    fn test_from_args() {
        let args = RunnerArgs::from_args(
            &["suite_runner"],
            &["ci.yaml", "-a", "port:=1", "-t", "unit", "--fail-on-error", "-l", "DEBUG"],
        )
        .unwrap();
        assert_eq!(args.suite_file, "ci.yaml");
        assert_eq!(args.arg_overrides()["port"], "1");
        assert_eq!(args.type_filter(), Some(HashSet::from(["unit".to_string()])));
        assert_eq!(args.suite_filter(), None);
        assert!(args.fail_on_error);
        assert!(!args.dry_run);
        assert_eq!(args.log_filter(), "debug");
    }

    #[test]
    fn test_defaults() {
        let args = RunnerArgs::from_args(&["suite_runner"], &[]).unwrap();
        assert_eq!(args.suite_file, "suites.yaml");
        assert_eq!(args.log_filter(), "info");
        assert!(!args.no_echo);
    }
}
