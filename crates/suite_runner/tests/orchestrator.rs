//! Whole-run scenarios: filters, before-commands and suite files

mod common;

use common::{log_dir, read, service, suite, SCENARIO_TIMEOUT, SUITE_TYPE};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use suite_runner::runtime::SuiteState;
use suite_runner::{Orchestrator, OrchestratorConfig, RunContext, SuiteError, SuiteFile, SuiteType};
use tokio::sync::watch;
use tokio::time::timeout;

fn orchestrator(logs: &std::path::Path, config: OrchestratorConfig) -> Orchestrator {
    let config = OrchestratorConfig { echo: false, ..config };
    Orchestrator::new(Arc::new(RunContext::new(logs)), config)
}

#[tokio::test]
async fn test_before_failure_skips_services() {
    let dir = tempfile::tempdir().unwrap();
    let mut seeded = suite("seeded", vec![service("db", "sleep 30")], "true");
    seeded.before = Some("echo seeding; exit 4".to_string());
    let types = vec![SuiteType {
        name: SUITE_TYPE.to_string(),
        suites: vec![seeded],
    }];

    let orchestrator = orchestrator(dir.path(), OrchestratorConfig::default());
    let summary = timeout(SCENARIO_TIMEOUT, orchestrator.run(&types)).await.unwrap();

    let outcome = summary.outcome("it/seeded").unwrap();
    assert_eq!(outcome.state, SuiteState::BeforeFailed);
    assert!(matches!(
        outcome.error.as_ref().map(SuiteError::root),
        Some(SuiteError::BeforeFailed { code: Some(4) })
    ));
    assert!(outcome.results.is_empty());
    assert_eq!(summary.failed(), 1);
    assert!(!summary.success());

    let before = log_dir(dir.path(), "seeded", "before");
    assert_eq!(read(before.join("out.log")), "seeding\n");
    assert_eq!(read(before.join("exit-code.log")), "4");
    assert!(!log_dir(dir.path(), "seeded", "db").exists());
}

#[tokio::test]
async fn test_filters_and_disabled_suites() {
    let dir = tempfile::tempdir().unwrap();
    let mut disabled = suite("disabled", vec![], "exit 1");
    disabled.enabled = false;
    let mut other = suite("other", vec![], "exit 1");
    other.type_name = "e2e".to_string();

    let types = vec![
        SuiteType {
            name: SUITE_TYPE.to_string(),
            suites: vec![suite("quick", vec![], "true"), disabled],
        },
        SuiteType {
            name: "e2e".to_string(),
            suites: vec![other],
        },
    ];

    let config = OrchestratorConfig {
        types: Some(HashSet::from([SUITE_TYPE.to_string()])),
        ..OrchestratorConfig::default()
    };
    let orchestrator = orchestrator(dir.path(), config);
    let summary = timeout(SCENARIO_TIMEOUT, orchestrator.run(&types)).await.unwrap();

    assert_eq!(summary.passed(), 1);
    assert_eq!(summary.skipped(), 2);
    assert!(summary.success());
    assert_eq!(summary.outcome("it/quick").unwrap().state, SuiteState::Passed);
    assert_eq!(summary.outcome("it/disabled").unwrap().state, SuiteState::Skipped);
    assert_eq!(summary.outcome("e2e/other").unwrap().state, SuiteState::Skipped);
    assert!(!dir.path().join("e2e").exists());
}

#[tokio::test]
async fn test_suite_filter_by_id() {
    let dir = tempfile::tempdir().unwrap();
    let types = vec![SuiteType {
        name: SUITE_TYPE.to_string(),
        suites: vec![suite("one", vec![], "true"), suite("two", vec![], "true")],
    }];

    let config = OrchestratorConfig {
        suites: Some(HashSet::from(["it/two".to_string()])),
        ..OrchestratorConfig::default()
    };
    let orchestrator = orchestrator(dir.path(), config);
    assert!(!orchestrator.selected(&types[0].suites[0]));
    assert!(orchestrator.selected(&types[0].suites[1]));

    let summary = timeout(SCENARIO_TIMEOUT, orchestrator.run(&types)).await.unwrap();
    assert_eq!(summary.outcome("it/one").unwrap().state, SuiteState::Skipped);
    assert_eq!(summary.outcome("it/two").unwrap().state, SuiteState::Passed);
}

#[tokio::test]
async fn test_interrupt_skips_remaining_suites() {
    let dir = tempfile::tempdir().unwrap();
    let types = vec![SuiteType {
        name: SUITE_TYPE.to_string(),
        suites: vec![suite("one", vec![], "true"), suite("two", vec![], "true")],
    }];

    let (interrupt_tx, interrupt_rx) = watch::channel(false);
    interrupt_tx.send_replace(true);
    let orchestrator = orchestrator(dir.path(), OrchestratorConfig::default()).with_interrupt(interrupt_rx);
    let summary = timeout(SCENARIO_TIMEOUT, orchestrator.run(&types)).await.unwrap();

    assert_eq!(summary.skipped(), 2);
    assert!(!dir.path().join(SUITE_TYPE).exists());
}

#[tokio::test]
async fn test_suite_file_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let ready = dir.path().join("db.ready");
    let yaml = r#"
args:
  ready: /nonexistent
types:
  it:
    - name: api
      env:
        SUITE_LABEL: "$(type)/$(suite)"
      services:
        db:
          command: "touch $(arg ready); sleep 30"
          abort_on_error: true
      test:
        command: "echo \"$SUITE_LABEL\""
        wait_on:
          resources: ["file:$(arg ready)"]
          interval_ms: 50
          timeout_ms: 5000
    - name: broken
      test:
        command: "exit 2"
"#;

    let file = SuiteFile::from_yaml(yaml).unwrap();
    let overrides = HashMap::from([("ready".to_string(), ready.display().to_string())]);
    let resolved = file.resolve(&overrides).unwrap();

    let orchestrator = orchestrator(dir.path(), OrchestratorConfig::default());
    let plan = orchestrator.plan(&resolved.types).to_string();
    assert!(plan.contains("it/api"), "{}", plan);
    assert!(plan.contains(&format!("touch {}", ready.display())), "{}", plan);

    let summary = timeout(SCENARIO_TIMEOUT, orchestrator.run(&resolved.types))
        .await
        .unwrap();
    assert_eq!(summary.passed(), 1);
    assert_eq!(summary.failed(), 1);
    assert!(!summary.success());

    let api = summary.outcome("it/api").unwrap();
    assert_eq!(api.state, SuiteState::Passed);
    let test = api.results.iter().find(|r| r.name == "test").unwrap();
    assert_eq!(test.last_log.as_deref(), Some("it/api"));
    assert!(ready.exists());

    let broken = summary.outcome("it/broken").unwrap();
    assert_eq!(broken.state, SuiteState::Failed);
    assert!(matches!(
        broken.error.as_ref().map(SuiteError::root),
        Some(SuiteError::TestFailure { code: Some(2) })
    ));
    assert_eq!(read(log_dir(dir.path(), "broken", "test").join("exit-code.log")), "2");
}
