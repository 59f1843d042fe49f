//! Courier CLI - runs request collections from a workspace file.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, ValueEnum};
use courier::{
    to_curl, Collection, CollectionRunner, Environment, HttpRequest, RequestPipeline, RunListener,
    RunOptions, RunReport, RunResult, Workspace, WorkspaceLoader,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_WORKSPACES: [&str; 3] = ["courier.yaml", "courier.yml", "courier.json"];

/// Courier - HTTP collection runner with scripted tests.
#[derive(Parser, Debug)]
#[command(name = "courier", version, about)]
struct Cli {
    /// Workspace file or directory.
    #[arg(short = 'p', long = "path", env = "COURIER_WORKSPACE")]
    path: Option<PathBuf>,

    /// Collection to run, by name or id.
    #[arg(short = 'c', long = "collection")]
    collection: Option<String>,

    /// Environment to use, by name or id.
    #[arg(short = 'e', long = "env")]
    env: Option<String>,

    /// Stop after the first request that fails to get a response.
    #[arg(long = "stop-on-error")]
    stop_on_error: bool,

    /// Stop after the first request with a failing test.
    #[arg(long = "stop-on-test-failure")]
    stop_on_test_failure: bool,

    /// Delay between requests in milliseconds.
    #[arg(short = 'd', long = "delay", default_value_t = 0)]
    delay: u64,

    /// Drop response bodies from the stored results.
    #[arg(long = "no-save-responses")]
    no_save_responses: bool,

    /// Let `environment.set` in scripts affect later requests of the run.
    #[arg(long = "apply-env-changes")]
    apply_env_changes: bool,

    /// Per-request timeout in seconds.
    #[arg(short = 't', long = "timeout")]
    timeout: Option<u64>,

    /// Print curl commands instead of running the collection.
    #[arg(long = "curl")]
    curl: bool,

    /// Directory to save run report files.
    #[arg(short = 'r', long = "report-dir")]
    report_dir: Option<PathBuf>,

    /// Report output format.
    #[arg(long = "report-format", default_value = "json")]
    report_format: ReportFormat,

    /// Enable verbose logging.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
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
        .with_thread_ids(false)
        .with_thread_names(false)
        .try_init();
}

/// Prints each result as it arrives.
struct ConsoleListener {
    verbose: bool,
}

impl RunListener for ConsoleListener {
    fn on_request_start(&self, index: usize, total: usize, request: &HttpRequest) {
        debug!("{}/{} {} {}", index + 1, total, request.method, request.url);
    }

    fn on_result(&self, index: usize, _total: usize, result: &RunResult) {
        let failed = result.error.is_some() || result.status() >= 400 || result.failed_tests() > 0;
        let status = if failed {
            "\x1b[31mFAIL\x1b[0m"
        } else {
            "\x1b[32mPASS\x1b[0m"
        };
        info!(
            "{} {}. {} [{}] ({} ms)",
            status,
            index + 1,
            result.request_name,
            result.status(),
            result.duration
        );

        if let Some(error) = &result.error {
            error!("     \x1b[31mError: {}\x1b[0m", error);
        }
        for test in &result.test_results {
            if test.passed {
                info!("     \x1b[32m✓\x1b[0m {}", test.name);
            } else {
                info!(
                    "     \x1b[31m✗\x1b[0m {}: {}",
                    test.name,
                    test.message.as_deref().unwrap_or("failed")
                );
            }
        }

        if self.verbose {
            if let Some(response) = &result.response {
                let body = response.body_text();
                let truncated = if body.chars().count() > 500 {
                    format!("{}...(truncated)", body.chars().take(500).collect::<String>())
                } else {
                    body
                };
                debug!("     Response body: {}", truncated);
            }
        }
    }
}

fn locate_workspace(path: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = path {
        if !path.exists() {
            return Err(anyhow!("Path does not exist: {}", path.display()));
        }
        return Ok(path);
    }
    DEFAULT_WORKSPACES
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
        .ok_or_else(|| anyhow!("No workspace given and none of {DEFAULT_WORKSPACES:?} exists"))
}

fn select_collection(workspace: &Workspace, key: Option<&str>) -> Result<Collection> {
    let file = match key {
        Some(key) => workspace
            .find_collection(key)
            .ok_or_else(|| anyhow!("Collection not found: {key}"))?,
        None => match workspace.collections.as_slice() {
            [only] => only,
            [] => return Err(anyhow!("Workspace contains no collections")),
            many => {
                let names: Vec<&str> = many.iter().map(|c| c.name.as_str()).collect();
                return Err(anyhow!(
                    "Several collections found, pick one with --collection: {}",
                    names.join(", ")
                ));
            }
        },
    };
    file.to_collection()
        .context(format!("Invalid collection: {}", file.name))
}

fn select_environment(workspace: &Workspace, key: Option<&str>) -> Result<Option<Environment>> {
    key.map(|key| {
        workspace
            .find_environment(key)
            .cloned()
            .ok_or_else(|| anyhow!("Environment not found: {key}"))
    })
    .transpose()
}

fn save_report(report: &RunReport, report_dir: &Path, format: ReportFormat) -> Result<PathBuf> {
    if !report_dir.exists() {
        fs::create_dir_all(report_dir)?;
    }

    let timestamp = Utc::now().timestamp();
    let sanitized_name = report.collection_name.replace([' ', '/'], "_");

    let (filename, content) = match format {
        ReportFormat::Json => (
            format!("{sanitized_name}-{timestamp}.json"),
            serde_json::to_string_pretty(&report.export())?,
        ),
        ReportFormat::Yaml => (
            format!("{sanitized_name}-{timestamp}.yaml"),
            serde_yaml::to_string(report)?,
        ),
        ReportFormat::Text => (format!("{sanitized_name}-{timestamp}.txt"), report.to_text()),
    };

    let file_path = report_dir.join(filename);
    fs::write(&file_path, content)
        .context(format!("Failed to write report: {}", file_path.display()))?;
    Ok(file_path)
}

fn print_curl(pipeline: &RequestPipeline, collection: &Collection, env: Option<&Environment>) {
    for request in collection.flatten_requests() {
        println!("# {}", request.name);
        println!("{}\n", to_curl(&pipeline.preview(request, env)));
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    init_tracing(args.verbose);

    let path = locate_workspace(args.path)?;
    let mut loader = WorkspaceLoader::new();
    loader.add_path(&path);
    let mut workspace = loader
        .load()
        .context(format!("Failed to load workspace: {}", path.display()))?;
    if let Some(timeout) = args.timeout {
        workspace.config.timeout_secs = timeout;
    }

    let collection = select_collection(&workspace, args.collection.as_deref())?;
    let env = select_environment(&workspace, args.env.as_deref())?;
    let pipeline = Arc::new(RequestPipeline::new(&workspace.config));

    if args.curl {
        print_curl(&pipeline, &collection, env.as_ref());
        return Ok(());
    }

    let options = RunOptions {
        stop_on_error: args.stop_on_error,
        stop_on_test_failure: args.stop_on_test_failure,
        delay_ms: args.delay,
        save_responses: !args.no_save_responses,
        apply_environment_changes: args.apply_env_changes,
    };

    let runner = CollectionRunner::new(pipeline);
    let control = runner.control();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing the current request");
            control.stop();
        }
    });

    let listener = ConsoleListener {
        verbose: args.verbose,
    };
    let report = runner
        .run_with_listener(&collection, env.as_ref(), &options, &listener)
        .await?;

    let stats = &report.stats;
    info!(
        "Summary:\n  Requests: {} ({} succeeded, {} failed)\n  \x1b[32mTests passed: {}\x1b[0m\n  \x1b[31mTests failed: {}\x1b[0m\n  Duration: {} ms{}",
        stats.total_requests,
        stats.successful_requests,
        stats.failed_requests,
        stats.passed_tests,
        stats.failed_tests,
        stats.duration_ms(),
        if report.stopped { " (stopped)" } else { "" }
    );

    if let Some(dir) = args.report_dir.as_deref() {
        match save_report(&report, dir, args.report_format) {
            Ok(path) => info!("Report saved: {}", path.display()),
            Err(e) => error!("Failed to save report: {:#}", e),
        }
    }

    if !stats.all_passed() {
        exit(1);
    }

    Ok(())
}
