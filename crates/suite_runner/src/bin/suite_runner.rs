//! Suite Runner CLI
//!
//! Usage:
//!   suite_runner suites.yaml
//!   suite_runner suites.yaml -t integration -a port:=6543
//!   suite_runner suites.yaml --dry-run

use std::path::PathBuf;
use std::sync::Arc;
use suite_runner::runtime::supervisor::DEFAULT_SHUTDOWN_TIMEOUT;
use suite_runner::{Orchestrator, OrchestratorConfig, RunContext, RunnerArgs, SuiteFile};
use tokio::sync::watch;

const DEFAULT_LOGS_DIR: &str = "logs";

#[tokio::main]
async fn main() {
    let args: RunnerArgs = argh::from_env();

    let env = env_logger::Env::default().default_filter_or(args.log_filter());
    env_logger::init_from_env(env);

    log::info!("Loading suite file: {}", args.suite_file);
    let suite_file = match SuiteFile::from_file(&args.suite_file) {
        Ok(file) => file,
        Err(e) => {
            log::error!("Failed to load suite file: {}", e);
            std::process::exit(1);
        }
    };

    let resolved = match suite_file.resolve(&args.arg_overrides()) {
        Ok(resolved) => resolved,
        Err(e) => {
            log::error!("Failed to resolve suite file: {}", e);
            std::process::exit(1);
        }
    };

    if args.validate {
        println!("Suite file '{}' is valid", args.suite_file);
        println!("  Types: {}", suite_file.type_names().join(", "));
        println!("  Suites: {}", suite_file.suite_count());
        return;
    }

    let logs_root = args
        .logs_dir
        .as_ref()
        .map(PathBuf::from)
        .or(resolved.logs_dir.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOGS_DIR));
    let ctx = Arc::new(RunContext::new(logs_root));

    let config = OrchestratorConfig {
        types: args.type_filter(),
        suites: args.suite_filter(),
        shutdown_timeout: resolved.shutdown_timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT),
        echo: !args.no_echo,
        coverage_wrapper: resolved.coverage_wrapper.clone(),
        compose: resolved.compose.clone(),
    };

    let (interrupt_tx, interrupt_rx) = watch::channel(false);
    let orchestrator = Orchestrator::new(ctx, config).with_interrupt(interrupt_rx);

    if args.dry_run {
        println!("{}", orchestrator.plan(&resolved.types));
        return;
    }

    if let Err(e) = ctrlc::set_handler(move || {
        log::info!("Received Ctrl+C, stopping suites...");
        interrupt_tx.send_replace(true);
    }) {
        log::error!("Failed to set Ctrl+C handler: {}", e);
        std::process::exit(1);
    }

    let summary = orchestrator.run(&resolved.types).await;

    for outcome in &summary.outcomes {
        match &outcome.error {
            Some(e) => log::info!("{}: {} ({})", outcome.suite, outcome.state, e.root()),
            None => log::info!("{}: {}", outcome.suite, outcome.state),
        }
    }

    if !summary.success() && args.fail_on_error {
        std::process::exit(1);
    }
}
