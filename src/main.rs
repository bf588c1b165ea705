use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use kanosym_core::cancel::{CancelToken, RunContext};
use kanosym_core::config::DEFAULT_TIMEOUT_SECS;
use kanosym_core::engine;
use kanosym_core::error::StoreError;
use kanosym_core::model::RunRequest;
use kanosym_core::result::TestRun;
use kanosym_core::store::{JsonFileStore, ProjectStore, TestRunStore};
use kanosym_core::validate;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "KANOSYM: portfolio-sensitivity evaluation engine",
    after_help = "EXAMPLES:
    # Run a request and persist the test run
    kanosym --run request.json --project demo

    # Validate a request without running it
    kanosym --validate request.json

    # Inspect stored runs
    kanosym --list-runs --project demo
    kanosym --show-run <TEST_RUN_ID>"
)]
struct Args {
    /// Execute the run request in the given JSON file
    #[arg(long)]
    run: Option<PathBuf>,

    /// Validate the run request in the given JSON file and exit
    #[arg(long)]
    validate: Option<PathBuf>,

    /// Project the run is saved under (created on first use)
    #[arg(long, default_value = "default")]
    project: String,

    /// Root directory of the JSON store
    #[arg(long, default_value = "kanosym-data")]
    data_dir: PathBuf,

    /// Override the RNG seed of the request
    #[arg(long)]
    seed: Option<u64>,

    /// Soft deadline for the run in seconds (default: 300)
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Create a project and exit
    #[arg(long, value_name = "NAME")]
    create_project: Option<String>,

    /// Rename a project: --rename-project OLD NEW
    #[arg(long, num_args = 2, value_names = ["OLD", "NEW"])]
    rename_project: Option<Vec<String>>,

    /// Delete a project and exit
    #[arg(long, value_name = "NAME")]
    delete_project: Option<String>,

    /// List all projects and exit
    #[arg(long)]
    list_projects: bool,

    /// List stored test runs (filtered by --project unless --all-projects)
    #[arg(long)]
    list_runs: bool,

    /// With --list-runs: list runs across every project
    #[arg(long)]
    all_projects: bool,

    /// Print a stored test run as JSON and exit
    #[arg(long, value_name = "TEST_RUN_ID")]
    show_run: Option<String>,

    /// Delete a stored test run and exit
    #[arg(long, value_name = "TEST_RUN_ID")]
    delete_run: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("kanosym_core=info,kanosym=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = Args::parse();
    let store = JsonFileStore::open(&args.data_dir)
        .with_context(|| format!("opening store at {}", args.data_dir.display()))?;

    if let Some(name) = &args.create_project {
        let record = store.create_project(name)?;
        println!("Created project '{}' ({})", record.name, record.project_id);
        return Ok(());
    }
    if let Some(names) = &args.rename_project {
        let record = store.rename_project(&names[0], &names[1])?;
        println!("Renamed project to '{}'", record.name);
        return Ok(());
    }
    if let Some(name) = &args.delete_project {
        store.delete_project(name)?;
        println!("Deleted project '{name}'");
        return Ok(());
    }
    if args.list_projects {
        for record in store.list_projects()? {
            println!(
                "{:<24} {:<38} runs={} modified={}",
                record.name,
                record.project_id,
                record.test_run_ids.len(),
                record.last_modified.to_rfc3339()
            );
        }
        return Ok(());
    }
    if args.list_runs {
        let filter = if args.all_projects {
            None
        } else {
            Some(store.get_project(&args.project)?.project_id)
        };
        for summary in store.list_test_runs(filter.as_deref())? {
            println!(
                "{}  {}  {:<9} project={}",
                summary.test_run_id,
                summary.timestamp.to_rfc3339(),
                summary.block_type.as_str(),
                summary.project_id
            );
        }
        return Ok(());
    }
    if let Some(id) = &args.show_run {
        let run = store.get_test_run(id)?;
        println!("{}", serde_json::to_string_pretty(&run)?);
        return Ok(());
    }
    if let Some(id) = &args.delete_run {
        store.delete_test_run(id)?;
        println!("Deleted test run {id}");
        return Ok(());
    }

    if let Some(path) = &args.validate {
        let request = read_request(path)?;
        match validate::validate(&request) {
            Ok(validated) => {
                println!(
                    "OK: {} sweep of '{}' over [{}, {}] in {} steps",
                    validated.spec.param.as_str(),
                    validated.spec.asset,
                    validated.spec.range.0,
                    validated.spec.range.1,
                    validated.spec.steps
                );
            }
            Err(err) => {
                println!("INVALID ({} issue(s)):", err.issues.len());
                for issue in &err.issues {
                    println!("  {:<36} {}", issue.field, issue.message);
                }
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let Some(path) = &args.run else {
        return Err(anyhow!("nothing to do; see --help"));
    };

    let mut request = read_request(path)?;
    if let Some(seed) = args.seed {
        request.seed = Some(seed);
    }
    let timeout = Duration::from_secs(args.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS));

    let project = match store.get_project(&args.project) {
        Ok(record) => record,
        Err(StoreError::NotFound { .. }) => store.create_project(&args.project)?,
        Err(e) => return Err(e.into()),
    };

    let token = CancelToken::new();
    let ctx = RunContext::new(token.clone(), Some(timeout));

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("ctrl-c received; cancelling run cooperatively");
            token.cancel();
        }
    });

    let project_id = project.project_id.clone();
    let run_ctx = ctx.clone();
    let outcome = tokio::task::spawn_blocking(move || engine::run(&request, &project_id, &run_ctx))
        .await
        .context("run worker panicked")?;

    match outcome {
        Ok(run) => {
            store.save_test_run(&run)?;
            store.attach_test_run(&project.name, &run.test_run_id)?;
            print_run(&run);
            info!(id = %run.test_run_id, "test run saved");
            Ok(())
        }
        Err(e) => {
            error!("run failed: {e}");
            Err(e.into())
        }
    }
}

fn read_request(path: &PathBuf) -> Result<RunRequest> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading request file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing request file {}", path.display()))
}

fn print_run(run: &TestRun) {
    println!();
    println!(
        "=== {} sweep of '{}' ({} mode) ===",
        run.results.perturbation.as_str(),
        run.results.asset,
        run.block_type.as_str()
    );
    println!(
        "baseline: daily={:.6} annualized={:.6}",
        run.results.baseline_portfolio_volatility_daily,
        run.results.baseline_portfolio_volatility_annualized
    );
    println!("{:>12} {:>12} {:>12} {:>12}  flags", "value", "daily", "annualized", "delta");
    for step in &run.results.results {
        let mut notes = Vec::new();
        if step.flags.non_psd {
            notes.push("non_psd");
        }
        if step.flags.quantum_fallback {
            notes.push("quantum_fallback");
        }
        println!(
            "{:>12.6} {:>12.6} {:>12.6} {:>+12.6}  {}",
            step.perturbed_value,
            step.portfolio_volatility_daily,
            step.portfolio_volatility_annualized,
            step.delta_vs_baseline,
            notes.join(",")
        );
    }

    let perf = &run.analytics.performance_metrics;
    println!(
        "steps={} time={:.3}s throughput={:.1}/s",
        perf.steps_processed, perf.total_execution_time_secs, perf.throughput_steps_per_second
    );
    if run.cancelled() {
        println!("NOTE: run was cancelled; results are partial");
    }
    println!("test_run_id: {}", run.test_run_id);
}
