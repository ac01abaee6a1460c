//! ProcRunner CLI Entry Point
//!
//! Runs a process file end to end against a store snapshot on disk.
//!
//! # Usage
//!
//! ```bash
//! # Start an instance with start variables
//! procrunner order.yaml amount=250 customer=acme
//!
//! # Resume a waiting execution, passing data
//! procrunner order.yaml --trigger 7 approved=true
//!
//! # Start without running due jobs
//! procrunner order.yaml --no-jobs
//!
//! # Print a timeline chart after the run
//! procrunner order.yaml --timeline --parallel 8
//! ```

use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use log::{error, info, warn};

use procrunner::config::EngineConfig;
use procrunner::execution::{DelegateExecution, HandlerResult, ProcessEngine, ProcessInstanceState};
use procrunner::jobs::{Job, JobExecutor};
use procrunner::monitoring::TimelineListener;
use procrunner::process::{load_process, NodeKind, ProcessDefinition};
use procrunner::runtime::VariableValue;
use procrunner::store::{default_snapshot_path, MemoryStore, ProcessStore};
use procrunner::{APP_NAME, VERSION};

/// Default process file used when none is specified.
const DEFAULT_PROCESS: &str = "process.yaml";

/// Command-line configuration parsed from arguments.
#[derive(Debug, Default)]
struct Config {
    process_path: Option<String>,
    config_path: Option<String>,
    state_path: Option<PathBuf>,
    trigger: Option<String>,
    business_key: Option<String>,
    variables: BTreeMap<String, VariableValue>,
    run_jobs: bool,
    max_parallel: Option<usize>,
    timeline: bool,
    verbose: bool,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Business Process Execution Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: procrunner [OPTIONS] <PROCESS_FILE> [NAME=VALUE ...]");
    println!();
    println!("Arguments:");
    println!("  <PROCESS_FILE>        Path to process YAML file");
    println!("  [NAME=VALUE ...]      Start variables (or trigger data with --trigger)");
    println!();
    println!("Options:");
    println!("  --config PATH         Engine configuration YAML");
    println!("  --state PATH          Snapshot file (default: .procrunner/<name>.state.json)");
    println!("  --trigger EXECUTION   Trigger a waiting execution instead of starting");
    println!("  --business-key KEY    Business key of the started instance");
    println!("  --no-jobs             Do not run due jobs after the command");
    println!("  --parallel N          Job worker threads (default: one per CPU)");
    println!("  --timeline            Print an execution timeline chart");
    println!("  --verbose             Enable debug logging");
    println!("  --help                Show this help message");
    println!("  --version             Show version information");
    println!();
    println!("Examples:");
    println!("  procrunner order.yaml amount=250");
    println!("  procrunner order.yaml --trigger 7 approved=true");
    println!("  procrunner order.yaml --state /tmp/orders.json --no-jobs");
}

/// Parses `NAME=VALUE`; the value is read as JSON, falling back to a string.
fn parse_assignment(arg: &str) -> Result<(String, VariableValue), String> {
    let (name, raw) = arg
        .split_once('=')
        .ok_or_else(|| format!("Expected NAME=VALUE, got: {}", arg))?;

    let name = name.trim();
    if name.is_empty() {
        return Err(format!("Missing variable name in: {}", arg));
    }

    let value = match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Null) => VariableValue::Null,
        Ok(serde_json::Value::Bool(b)) => VariableValue::Boolean(b),
        Ok(serde_json::Value::Number(n)) => match n.as_i64() {
            Some(i) => VariableValue::Integer(i),
            None => VariableValue::Double(n.as_f64().unwrap_or_default()),
        },
        Ok(serde_json::Value::String(s)) => VariableValue::String(s),
        Ok(json) => VariableValue::Json(json),
        Err(_) => VariableValue::String(raw.to_string()),
    };
    Ok((name.to_string(), value))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config {
        run_jobs: true,
        ..Config::default()
    };
    let mut i = 1; // Skip program name

    let value_of = |i: &mut usize, flag: &str| -> Result<String, String> {
        *i += 1;
        args.get(*i)
            .cloned()
            .ok_or_else(|| format!("{} requires an argument", flag))
    };

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => config.verbose = true,
            "--no-jobs" => config.run_jobs = false,
            "--timeline" => config.timeline = true,
            "--config" => config.config_path = Some(value_of(&mut i, "--config")?),
            "--state" => config.state_path = Some(PathBuf::from(value_of(&mut i, "--state")?)),
            "--trigger" => config.trigger = Some(value_of(&mut i, "--trigger")?),
            "--business-key" => config.business_key = Some(value_of(&mut i, "--business-key")?),
            "--parallel" => {
                let raw = value_of(&mut i, "--parallel")?;
                let parallel: usize = raw
                    .parse()
                    .map_err(|_| format!("Invalid parallel value: {}", raw))?;
                config.max_parallel = Some(parallel);
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            arg if arg.contains('=') => {
                let (name, value) = parse_assignment(arg)?;
                config.variables.insert(name, value);
            }
            arg => {
                if config.process_path.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config.process_path = Some(arg.to_string());
            }
        }
        i += 1;
    }

    if config.trigger.is_some() && config.business_key.is_some() {
        return Err("--business-key only applies when starting an instance".to_string());
    }
    Ok(config)
}

/// Service task handler used by the CLI: logs the visible variables.
fn log_task(execution: &mut DelegateExecution<'_>) -> HandlerResult {
    info!(
        "[{}] service task '{}' on execution {}: {:?}",
        execution.process_instance_id(),
        execution.current_activity_id(),
        execution.id(),
        execution.variables()
    );
    Ok(())
}

/// Registers a logging handler for every service task of the definition.
fn register_cli_handlers(engine: &ProcessEngine, definition: &ProcessDefinition) {
    for node in &definition.nodes {
        if let NodeKind::ServiceTask { handler } = &node.kind {
            engine.register_task_fn(handler.clone(), log_task);
        }
    }
    engine.register_task_fn("noop", |_| Ok(()));
    engine.register_job_fn("log", |job: &Job, _| {
        info!("Job {} payload: {}", job.id, job.payload);
        Ok(())
    });
}

/// Prints the state of one instance plus the engine-wide dead jobs.
fn print_summary(engine: &ProcessEngine, process_instance_id: &str) -> Result<(), Box<dyn std::error::Error>> {
    println!();
    println!("{}", "Summary".bold());
    println!("  Process instance: {}", process_instance_id);

    let state = match engine.process_instance_state(process_instance_id)? {
        ProcessInstanceState::Active => "active".yellow(),
        ProcessInstanceState::Completed => "completed".green(),
        ProcessInstanceState::Deleted => "deleted".red(),
    };
    println!("  State:            {}", state);

    for execution in engine.executions(process_instance_id)? {
        if execution.is_active {
            if let Some(activity) = &execution.activity_id {
                println!("  Waiting:          {} (execution {})", activity.cyan(), execution.id);
            }
        }
    }

    for job in engine.jobs(process_instance_id)? {
        let due = job
            .due_date
            .map(|d| d.to_rfc3339())
            .unwrap_or_else(|| "now".to_string());
        println!(
            "  Job:              {} {} (retries {}, due {})",
            job.id, job.handler_type, job.retries, due
        );
    }

    let dead = engine.dead_jobs()?;
    if !dead.is_empty() {
        println!("  {}", format!("Dead jobs: {}", dead.len()).red().bold());
        for job in dead {
            println!(
                "    {} {}: {}",
                job.id,
                job.handler_type,
                job.exception_message.as_deref().unwrap_or("-")
            );
        }
    }
    println!();
    Ok(())
}

/// Main application entry point.
fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    // Setup logging
    setup_logging(config.verbose);

    // Print banner
    print_banner();

    let process_path = config
        .process_path
        .clone()
        .unwrap_or_else(|| DEFAULT_PROCESS.to_string());

    let mut engine_config = match &config.config_path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(parallel) = config.max_parallel {
        engine_config.set_job_worker_threads(parallel);
    }

    // Load process
    info!("Loading process: {}", process_path);
    let definition = load_process(&process_path).map_err(|e| {
        error!("Failed to load process: {}", e);
        format!("Could not load process from '{}': {}", process_path, e)
    })?;

    // Open state
    let state_path = config
        .state_path
        .clone()
        .unwrap_or_else(|| default_snapshot_path(&process_path));
    let store = Arc::new(MemoryStore::open(&state_path)?);

    let engine = ProcessEngine::builder()
        .config(engine_config)
        .store(store.clone())
        .build();

    let timeline = TimelineListener::new();
    if config.timeline {
        engine.add_listener(Arc::new(timeline.clone()));
    }

    register_cli_handlers(&engine, &definition);
    engine.deploy(definition.clone())?;

    // Start or trigger
    let process_instance_id = match &config.trigger {
        Some(execution_id) => {
            let execution = store
                .find_execution(execution_id)?
                .ok_or_else(|| format!("No execution '{}' in {}", execution_id, state_path.display()))?;
            engine.trigger_execution(execution_id, config.variables.clone())?;
            execution.process_instance_id
        }
        None => match &config.business_key {
            Some(key) => engine.start_process_with_business_key(&definition.id, key, config.variables.clone())?,
            None => engine.start_process(&definition.id, config.variables.clone())?,
        },
    };

    // Run due jobs
    if config.run_jobs {
        let summary = JobExecutor::new(engine.clone()).run_until_idle()?;
        if summary.dead > 0 {
            warn!("{} jobs ran out of retries", summary.dead);
        }
    } else {
        info!("Skipping job execution (--no-jobs)");
    }

    print_summary(&engine, &process_instance_id)?;

    if config.timeline {
        println!("{}", timeline.snapshot().gantt_chart());
    }

    store.save_snapshot(&state_path)?;
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("{} {}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("procrunner")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_assignment_types() {
        assert_eq!(parse_assignment("x=5").unwrap().1, VariableValue::Integer(5));
        assert_eq!(parse_assignment("ok=true").unwrap().1, VariableValue::Boolean(true));
        assert_eq!(parse_assignment("rate=0.5").unwrap().1, VariableValue::Double(0.5));
        assert_eq!(
            parse_assignment("name=acme").unwrap().1,
            VariableValue::String("acme".to_string())
        );
        assert!(matches!(parse_assignment("order={\"id\":1}").unwrap().1, VariableValue::Json(_)));
    }

    #[test]
    fn test_parse_assignment_rejects_missing_name() {
        assert!(parse_assignment("=5").is_err());
        assert!(parse_assignment("novalue").is_err());
    }

    #[test]
    fn test_parse_arguments() {
        let config = parse_arguments(&args(&[
            "order.yaml",
            "amount=250",
            "--business-key",
            "A-1",
            "--parallel",
            "2",
            "--no-jobs",
        ]))
        .unwrap();

        assert_eq!(config.process_path.as_deref(), Some("order.yaml"));
        assert_eq!(config.variables.get("amount"), Some(&VariableValue::Integer(250)));
        assert_eq!(config.business_key.as_deref(), Some("A-1"));
        assert_eq!(config.max_parallel, Some(2));
        assert!(!config.run_jobs);
    }

    #[test]
    fn test_parse_arguments_errors() {
        assert!(parse_arguments(&args(&["--parallel"])).is_err());
        assert!(parse_arguments(&args(&["--parallel", "many"])).is_err());
        assert!(parse_arguments(&args(&["--bogus"])).is_err());
        assert!(parse_arguments(&args(&["a.yaml", "b.yaml"])).is_err());
        assert!(parse_arguments(&args(&["--trigger", "7", "--business-key", "k"])).is_err());
    }
}
