//! apiflow CLI - runs workflow documents against an environment.

use anyhow::{anyhow, Context, Result};
use apiflow::{
    load_environment, DefaultWorkflowRunner, Environment, ExecutionLog, StepStatus, Workflow,
    WorkflowLoader, WorkflowResult, WorkflowRunner,
};
use chrono::Utc;
use clap::{Parser, ValueEnum};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// apiflow - chained API workflow runner.
#[derive(Parser, Debug)]
#[command(name = "apiflow", version, about)]
struct Cli {
    /// Workflow file or directory path.
    #[arg(short = 'p', long = "path")]
    workflow_path: Option<String>,

    /// Environment file (YAML or JSON).
    #[arg(short = 'e', long = "env", env = "APIFLOW_ENV")]
    env_file: Option<String>,

    /// Filter workflows by name (partial match).
    #[arg(short = 'f', long = "filter")]
    workflow_filter: Option<String>,

    /// Run only the step with this id.
    #[arg(short = 's', long = "step")]
    step: Option<String>,

    /// JSON report of an earlier run whose responses feed `--step`.
    #[arg(long = "prior-report", requires = "step")]
    prior_report: Option<String>,

    /// Enable verbose logging.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Timeout in seconds per request.
    #[arg(short = 't', long = "timeout")]
    timeout: Option<u64>,

    /// Stop a workflow at its first failed step.
    #[arg(long = "abort-on-failure")]
    abort_on_failure: bool,

    /// Directory to save report files.
    #[arg(short = 'r', long = "report-dir")]
    report_dir: Option<String>,

    /// Report output format.
    #[arg(long = "report-format", default_value = "json")]
    report_format: ReportFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, ValueEnum)]
enum ReportFormat {
    Json,
    Yaml,
    Text,
}

fn init_tracing(verbose: bool) {
    if std::env::var_os("RUST_LOG").is_none() {
        let level = if verbose { "debug" } else { "info" };
        std::env::set_var("RUST_LOG", level);
    }

    if tracing::dispatcher::has_been_set() {
        return;
    }

    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_level(true)
        .try_init();
}

fn truncate(text: &str) -> String {
    if text.len() > 500 {
        let cut = (0..=500).rev().find(|&i| text.is_char_boundary(i)).unwrap_or(0);
        format!("{}...(truncated)", &text[..cut])
    } else {
        text.to_string()
    }
}

fn print_result(result: &WorkflowResult, verbose: bool) {
    let status = if result.success() {
        "\x1b[32mPASS\x1b[0m"
    } else {
        "\x1b[31mFAIL\x1b[0m"
    };
    info!(
        "{} workflow: {} ({} ms, {:?})",
        status, result.workflow_name, result.duration_ms, result.status
    );

    for (i, step) in result.steps.iter().enumerate() {
        let marker = match step.status {
            StepStatus::Succeeded => "\x1b[32m✓\x1b[0m",
            StepStatus::Skipped => "\x1b[33m-\x1b[0m",
            _ => "\x1b[31m✗\x1b[0m",
        };
        let iteration = if step.iteration.is_empty() {
            String::new()
        } else {
            format!(" {:?}", step.iteration)
        };
        info!(
            "  {}. {} {}{} ({} ms)",
            i + 1,
            marker,
            step.step_name,
            iteration,
            step.duration_ms
        );

        if let Some(error) = &step.error {
            error!("     \x1b[31mError: {}\x1b[0m", error);
        }
        for warning in &step.warnings {
            warn!("     {}", warning);
        }

        if verbose {
            if let Some(request) = &step.request {
                debug!("     Request: {} {}", request.method, request.url);
                if let Some(body) = &request.body {
                    debug!("     Request body: {}", truncate(body));
                }
            }
            if let Some(response) = &step.response {
                debug!("     Response: Status {}", response.status);
                debug!("     Response body: {}", truncate(&response.body));
            }
            for line in &step.logs {
                debug!("     Log: {}", line);
            }
        }
    }
}

fn save_report(result: &WorkflowResult, report_dir: &Path, format: ReportFormat) -> Result<PathBuf> {
    if !report_dir.exists() {
        fs::create_dir_all(report_dir)?;
    }

    let timestamp = Utc::now().timestamp();
    let sanitized_name = result.workflow_name.replace([' ', '/'], "_");

    let (filename, content) = match format {
        ReportFormat::Json => (
            format!("{sanitized_name}-{timestamp}.json"),
            serde_json::to_string_pretty(result)?,
        ),
        ReportFormat::Yaml => (
            format!("{sanitized_name}-{timestamp}.yaml"),
            serde_yaml::to_string(result)?,
        ),
        ReportFormat::Text => {
            let mut content = String::new();
            content.push_str(&format!("Workflow: {}\n", result.workflow_name));
            content.push_str(&format!("Run: {}\n", result.run_id));
            content.push_str(&format!("Status: {:?}\n", result.status));
            if let Some(error) = &result.error {
                content.push_str(&format!("Error: {error}\n"));
            }
            content.push_str(&format!("Duration: {} ms\n\n", result.duration_ms));
            content.push_str("Steps:\n");
            for (i, step) in result.steps.iter().enumerate() {
                content.push_str(&format!(
                    "  {}. {} ({:?})\n",
                    i + 1,
                    step.step_name,
                    step.status
                ));
                if let Some(error) = &step.error {
                    content.push_str(&format!("     Error: {error}\n"));
                }
                for warning in &step.warnings {
                    content.push_str(&format!("     Warning: {warning}\n"));
                }
                content.push_str(&format!("     Duration: {} ms\n", step.duration_ms));
            }
            (format!("{sanitized_name}-{timestamp}.txt"), content)
        }
    };

    let file_path = report_dir.join(filename);
    let mut file = File::create(&file_path)?;
    file.write_all(content.as_bytes())?;

    Ok(file_path)
}

fn prepare_workflows(workflow_path: Option<String>) -> Result<Vec<Workflow>> {
    let mut loader = WorkflowLoader::new();
    for path in ["tests/workflows", "workflows"] {
        if Path::new(path).exists() {
            loader.add_path(path);
        }
    }

    let workflows = match workflow_path {
        Some(path) => {
            let path = PathBuf::from(path);
            if !path.exists() {
                return Err(anyhow!("Path does not exist: {}", path.display()));
            }
            if path.is_file() {
                vec![loader
                    .load_workflow(&path)
                    .context(format!("Failed to load workflow: {}", path.display()))?]
            } else {
                loader.load_workflows_from_dir(&path).context(format!(
                    "Failed to load workflows from directory: {}",
                    path.display()
                ))?
            }
        }
        None => loader.load_all_workflows()?,
    };

    if workflows.is_empty() {
        return Err(anyhow!("No workflows found"));
    }
    Ok(workflows)
}

fn load_prior_log(path: &str) -> Result<ExecutionLog> {
    let content = fs::read_to_string(path)
        .context(format!("Failed to read prior report: {path}"))?;
    let report: WorkflowResult = serde_json::from_str(&content)
        .context(format!("Prior report is not a JSON workflow report: {path}"))?;
    Ok(report.log)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    init_tracing(args.verbose);

    let mut workflows = prepare_workflows(args.workflow_path)?;
    if let Some(filter) = &args.workflow_filter {
        let filter = filter.to_lowercase();
        workflows.retain(|w| w.name.to_lowercase().contains(&filter));
        if workflows.is_empty() {
            return Err(anyhow!("No workflows matching the filter were found"));
        }
    }

    let environment = match &args.env_file {
        Some(path) => load_environment(path)?,
        None => Environment::default(),
    };
    info!("Using environment '{}'", environment.name);

    let prior_log = match &args.prior_report {
        Some(path) => load_prior_log(path)?,
        None => ExecutionLog::new(),
    };

    let runner = DefaultWorkflowRunner::new().with_environment(Arc::new(environment));
    let report_dir = args.report_dir.map(PathBuf::from);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            on_signal.cancel();
        }
    });

    let total_start = Instant::now();
    let total = workflows.len();
    let (mut passed, mut failed) = (0, 0);
    info!("Running {} workflow(s)...", total);

    for (idx, mut workflow) in workflows.into_iter().enumerate() {
        if cancel.is_cancelled() {
            break;
        }
        if let Some(timeout) = args.timeout {
            workflow.config.timeout = timeout;
        }
        if args.abort_on_failure {
            workflow.config.abort_on_failure = true;
        }

        info!("Workflow {}/{}: {}", idx + 1, total, workflow.name);
        let outcome = match &args.step {
            Some(step_id) => runner.run_step(&workflow, step_id, &prior_log, &cancel).await,
            None => runner.run(&workflow, &cancel).await,
        };

        match outcome {
            Ok(result) => {
                print_result(&result, args.verbose);
                if let Some(dir) = report_dir.as_deref() {
                    match save_report(&result, dir, args.report_format) {
                        Ok(path) => info!("Report saved: {}", path.display()),
                        Err(e) => error!("Failed to save report: {}", e),
                    }
                }
                if result.success() {
                    passed += 1;
                } else {
                    failed += 1;
                }
            }
            Err(e) => {
                error!("\x1b[31mWorkflow rejected: {} - {}\x1b[0m", workflow.name, e);
                failed += 1;
            }
        }
    }

    info!(
        "Summary:\n  Total: {}\n  \x1b[32mPassed: {}\x1b[0m\n  \x1b[31mFailed: {}\x1b[0m\n  Duration: {} ms",
        passed + failed,
        passed,
        failed,
        total_start.elapsed().as_millis()
    );

    if failed > 0 || cancel.is_cancelled() {
        exit(1);
    }
    Ok(())
}
