//! Suite file YAML schema and resolution into runnable descriptors

use crate::config::substitution::{SubstitutionError, Substitutions};
use crate::readiness::{ReadinessSpec, Resource};
use crate::runtime::docker::ComposeSettings;
use crate::suite::{Service, Suite, SuiteType, TestSpec, BEFORE_NAME, TEST_RUNNER_NAME};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root of a suite file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteFile {
    /// Root of the per-service log tree
    #[serde(default)]
    pub logs_dir: Option<String>,

    /// Arguments with defaults, overridable from the command line
    #[serde(default)]
    pub args: IndexMap<String, ArgValue>,

    /// Environment applied to every process
    #[serde(default)]
    pub env: IndexMap<String, String>,

    #[serde(default)]
    pub coverage: CoverageConfig,

    #[serde(default)]
    pub compose: ComposeConfig,

    /// Grace period for coverage services after the exit message
    #[serde(default)]
    pub shutdown_timeout_ms: Option<u64>,

    /// Suite types in run order
    pub types: IndexMap<String, Vec<SuiteConfig>>,
}

/// Argument values can be strings, booleans or numbers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl ArgValue {
    pub fn as_string(&self) -> String {
        match self {
            ArgValue::Bool(b) => b.to_string(),
            ArgValue::Int(i) => i.to_string(),
            ArgValue::Float(f) => f.to_string(),
            ArgValue::String(s) => s.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoverageConfig {
    /// Command prefix for instrumented runs, e.g. `["cargo", "llvm-cov", "run", "--"]`
    #[serde(default)]
    pub wrapper: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeConfig {
    #[serde(default = "default_compose_program")]
    pub program: String,
    #[serde(default = "default_compose_command")]
    pub command: Option<String>,
    #[serde(default = "default_compose_program")]
    pub engine: String,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub remove_volumes: bool,
}

impl Default for ComposeConfig {
    fn default() -> Self {
        Self {
            program: default_compose_program(),
            command: default_compose_command(),
            engine: default_compose_program(),
            file: None,
            project: None,
            remove_volumes: false,
        }
    }
}

fn default_compose_program() -> String {
    "docker".to_string()
}

fn default_compose_command() -> Option<String> {
    Some("compose".to_string())
}

fn default_true() -> bool {
    true
}

/// One suite of a type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteConfig {
    pub name: String,

    /// Run services as compose containers
    #[serde(default)]
    pub docker: bool,

    /// Run the test under the coverage wrapper
    #[serde(default)]
    pub coverage: bool,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Command run to completion before services start
    #[serde(default)]
    pub before: Option<String>,

    #[serde(default)]
    pub env: IndexMap<String, String>,

    #[serde(default)]
    pub working_dir: Option<String>,

    /// Services in start order
    #[serde(default)]
    pub services: IndexMap<String, ServiceConfig>,

    pub test: TestConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default)]
    pub env: IndexMap<String, String>,
    #[serde(default)]
    pub wait_on: Option<WaitOnConfig>,
    #[serde(default)]
    pub abort_on_error: bool,
    #[serde(default)]
    pub abort_on_exit: bool,
    #[serde(default)]
    pub coverage: bool,
    #[serde(default)]
    pub working_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestConfig {
    pub command: String,
    #[serde(default)]
    pub env: IndexMap<String, String>,
    #[serde(default)]
    pub wait_on: Option<WaitOnConfig>,
    #[serde(default)]
    pub working_dir: Option<String>,
}

/// Readiness gate: a list of URIs, or the full form
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WaitOnConfig {
    Resources(Vec<String>),
    Full {
        resources: Vec<String>,
        #[serde(default)]
        interval_ms: Option<u64>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
}

impl WaitOnConfig {
    pub fn resources(&self) -> &[String] {
        match self {
            WaitOnConfig::Resources(resources) | WaitOnConfig::Full { resources, .. } => resources,
        }
    }

    fn resolve(&self, subst: &Substitutions, context: &str) -> Result<ReadinessSpec, SuiteFileError> {
        let uris = self
            .resources()
            .iter()
            .map(|uri| substitute(subst, uri, context))
            .collect::<Result<Vec<_>, _>>()?;
        let mut spec = ReadinessSpec::parse(&uris)
            .map_err(|e| SuiteFileError::Validation(format!("{}: {}", context, e)))?;

        if let WaitOnConfig::Full {
            interval_ms,
            timeout_ms,
            ..
        } = self
        {
            if let Some(ms) = interval_ms {
                spec = spec.with_interval(Duration::from_millis(*ms));
            }
            if let Some(ms) = timeout_ms {
                spec = spec.with_timeout(Duration::from_millis(*ms));
            }
        }
        Ok(spec)
    }
}

/// A suite file with every substitution applied
#[derive(Debug, Clone)]
pub struct ResolvedSuites {
    pub logs_dir: Option<PathBuf>,
    pub coverage_wrapper: Vec<String>,
    pub compose: ComposeSettings,
    pub shutdown_timeout: Option<Duration>,
    pub types: Vec<SuiteType>,
}

impl SuiteFile {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SuiteFileError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| SuiteFileError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, SuiteFileError> {
        let file: SuiteFile = serde_yaml::from_str(content)?;
        file.validate()?;
        Ok(file)
    }

    /// Structural checks. Values containing substitutions are checked again
    /// once resolved.
    pub fn validate(&self) -> Result<(), SuiteFileError> {
        if let Some(first) = self.coverage.wrapper.first() {
            if first.trim().is_empty() {
                return Err(SuiteFileError::Validation(
                    "coverage.wrapper must start with a program".to_string(),
                ));
            }
        }

        for (type_name, suites) in &self.types {
            check_name("suite type", type_name)?;

            let mut seen = std::collections::HashSet::new();
            for suite in suites {
                let id = format!("{}/{}", type_name, suite.name);
                check_name(&format!("suite in type '{}'", type_name), &suite.name)?;
                if !seen.insert(suite.name.as_str()) {
                    return Err(SuiteFileError::Validation(format!("Duplicate suite '{}'", id)));
                }

                if suite.test.command.trim().is_empty() {
                    return Err(SuiteFileError::Validation(format!(
                        "Suite '{}': test command is empty",
                        id
                    )));
                }
                check_wait_on(&format!("Suite '{}' test", id), suite.test.wait_on.as_ref())?;

                for (name, service) in &suite.services {
                    let context = format!("Suite '{}' service '{}'", id, name);
                    check_name(&context, name)?;
                    if name == TEST_RUNNER_NAME || name == BEFORE_NAME {
                        return Err(SuiteFileError::Validation(format!(
                            "{}: name is reserved for the suite's own logs",
                            context
                        )));
                    }

                    if suite.docker && service.container.is_none() {
                        return Err(SuiteFileError::Validation(format!(
                            "{}: docker suites need 'container'",
                            context
                        )));
                    }
                    if !suite.docker && service.command.is_none() {
                        return Err(SuiteFileError::Validation(format!(
                            "{}: local suites need 'command'",
                            context
                        )));
                    }
                    check_wait_on(&context, service.wait_on.as_ref())?;
                }
            }
        }

        Ok(())
    }

    /// Suite type names in declaration order
    pub fn type_names(&self) -> Vec<&str> {
        self.types.keys().map(String::as_str).collect()
    }

    pub fn suite_count(&self) -> usize {
        self.types.values().map(Vec::len).sum()
    }

    /// Apply argument overrides and substitutions
    pub fn resolve(&self, overrides: &HashMap<String, String>) -> Result<ResolvedSuites, SuiteFileError> {
        let mut args: HashMap<String, String> = self
            .args
            .iter()
            .map(|(k, v)| (k.clone(), v.as_string()))
            .collect();
        for (name, value) in overrides {
            if !self.args.contains_key(name) {
                return Err(SuiteFileError::UnknownArgument(name.clone()));
            }
            args.insert(name.clone(), value.clone());
        }

        let base = Substitutions::new()
            .with_args(args)
            .with_envs(self.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect());

        let logs_dir = base
            .apply_opt(self.logs_dir.as_deref())
            .map_err(|e| substitution_error("logs_dir", e))?
            .map(PathBuf::from);

        let coverage_wrapper = self
            .coverage
            .wrapper
            .iter()
            .map(|w| substitute(&base, w, "coverage.wrapper"))
            .collect::<Result<Vec<_>, _>>()?;

        let compose = ComposeSettings {
            program: substitute(&base, &self.compose.program, "compose.program")?,
            command: base
                .apply_opt(self.compose.command.as_deref())
                .map_err(|e| substitution_error("compose.command", e))?,
            engine: substitute(&base, &self.compose.engine, "compose.engine")?,
            file: base
                .apply_opt(self.compose.file.as_deref())
                .map_err(|e| substitution_error("compose.file", e))?
                .map(PathBuf::from),
            project: base
                .apply_opt(self.compose.project.as_deref())
                .map_err(|e| substitution_error("compose.project", e))?,
            remove_volumes: self.compose.remove_volumes,
        };

        let mut types = Vec::with_capacity(self.types.len());
        for (type_name, suites) in &self.types {
            let suites = suites
                .iter()
                .map(|suite| self.resolve_suite(&base, type_name, suite))
                .collect::<Result<Vec<_>, _>>()?;
            types.push(SuiteType {
                name: type_name.clone(),
                suites,
            });
        }

        Ok(ResolvedSuites {
            logs_dir,
            coverage_wrapper,
            compose,
            shutdown_timeout: self.shutdown_timeout_ms.map(Duration::from_millis),
            types,
        })
    }

    fn resolve_suite(
        &self,
        base: &Substitutions,
        type_name: &str,
        config: &SuiteConfig,
    ) -> Result<Suite, SuiteFileError> {
        let subst = base.for_suite(type_name, &config.name);
        let id = format!("{}/{}", type_name, config.name);

        let mut env = resolve_env(&subst, &self.env, &format!("suite '{}' global env", id))?;
        env.extend(resolve_env(&subst, &config.env, &format!("suite '{}' env", id))?);

        let services = config
            .services
            .iter()
            .map(|(name, service)| {
                let context = format!("suite '{}' service '{}'", id, name);
                resolve_service(&subst, name, service, &context)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let test_context = format!("suite '{}' test", id);
        let test = TestSpec {
            command: substitute(&subst, &config.test.command, &test_context)?,
            env: resolve_env(&subst, &config.test.env, &test_context)?,
            readiness: config
                .test
                .wait_on
                .as_ref()
                .map(|w| w.resolve(&subst, &test_context))
                .transpose()?,
            working_dir: resolve_dir(&subst, config.test.working_dir.as_deref(), &test_context)?,
        };

        Ok(Suite {
            type_name: type_name.to_string(),
            name: config.name.clone(),
            services,
            before: subst
                .apply_opt(config.before.as_deref())
                .map_err(|e| substitution_error(&format!("suite '{}' before", id), e))?,
            test,
            docker: config.docker,
            coverage: config.coverage,
            env,
            working_dir: resolve_dir(&subst, config.working_dir.as_deref(), &id)?,
            enabled: config.enabled,
        })
    }
}

fn resolve_service(
    subst: &Substitutions,
    name: &str,
    config: &ServiceConfig,
    context: &str,
) -> Result<Service, SuiteFileError> {
    Ok(Service {
        name: name.to_string(),
        command: subst
            .apply_opt(config.command.as_deref())
            .map_err(|e| substitution_error(context, e))?,
        container: subst
            .apply_opt(config.container.as_deref())
            .map_err(|e| substitution_error(context, e))?,
        env: resolve_env(subst, &config.env, context)?,
        readiness: config
            .wait_on
            .as_ref()
            .map(|w| w.resolve(subst, context))
            .transpose()?,
        abort_on_error: config.abort_on_error,
        abort_on_exit: config.abort_on_exit,
        coverage: config.coverage,
        working_dir: resolve_dir(subst, config.working_dir.as_deref(), context)?,
    })
}

fn resolve_env(
    subst: &Substitutions,
    env: &IndexMap<String, String>,
    context: &str,
) -> Result<HashMap<String, String>, SuiteFileError> {
    env.iter()
        .map(|(k, v)| -> Result<(String, String), SuiteFileError> {
            Ok((k.clone(), substitute(subst, v, &format!("{} '{}'", context, k))?))
        })
        .collect()
}

fn resolve_dir(subst: &Substitutions, dir: Option<&str>, context: &str) -> Result<Option<PathBuf>, SuiteFileError> {
    Ok(subst
        .apply_opt(dir)
        .map_err(|e| substitution_error(context, e))?
        .map(PathBuf::from))
}

fn substitute(subst: &Substitutions, value: &str, context: &str) -> Result<String, SuiteFileError> {
    subst.apply(value).map_err(|e| substitution_error(context, e))
}

fn substitution_error(context: &str, source: SubstitutionError) -> SuiteFileError {
    SuiteFileError::Substitution {
        context: context.to_string(),
        source,
    }
}

/// Names become directories of the log tree
fn check_name(what: &str, name: &str) -> Result<(), SuiteFileError> {
    let unsafe_name = name.trim().is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if unsafe_name {
        return Err(SuiteFileError::Validation(format!(
            "Invalid {} name '{}': must be non-empty and usable as a directory name",
            what, name
        )));
    }
    Ok(())
}

fn check_wait_on(context: &str, wait_on: Option<&WaitOnConfig>) -> Result<(), SuiteFileError> {
    let Some(wait_on) = wait_on else {
        return Ok(());
    };
    for uri in wait_on.resources() {
        if uri.contains("$(") {
            continue;
        }
        uri.parse::<Resource>()
            .map_err(|e| SuiteFileError::Validation(format!("{}: {}", context, e)))?;
    }
    Ok(())
}

/// Errors that can occur when loading a suite file
#[derive(Debug, thiserror::Error)]
pub enum SuiteFileError {
    #[error("Failed to read suite file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse suite file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown argument: {0}")]
    UnknownArgument(String),

    #[error("Substitution failed in {context}: {source}")]
    Substitution {
        context: String,
        #[source]
        source: SubstitutionError,
    },
}
