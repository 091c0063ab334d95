use clap::Parser;
use sharded_test_runner::coordination::manifest::RunStatus;
use sharded_test_runner::runner::{WorkerArgs, run_worker};
use std::path::PathBuf;

/// Variables a launcher may set to identify one execution, in lookup order
const EXECUTION_TOKEN_VARS: &[&str] = &[
    "CLOUD_RUN_EXECUTION",
    "CLOUD_RUN_EXECUTION_ID",
    "EXECUTION_ID",
    "CLOUD_RUN_EXECUTION_NAME",
];

#[derive(Parser, Clone)]
#[command(about = "Run one shard of a Playwright suite and merge the reports on worker 0")]
struct Args {
    /// Zero-based index of this worker
    #[arg(long, env = "CLOUD_RUN_TASK_INDEX", default_value = "0")]
    worker_index: u32,

    /// Total number of workers in the run
    #[arg(long, env = "CLOUD_RUN_TASK_COUNT", default_value = "1")]
    worker_count: u32,

    /// Report store: bucket name, s3://bucket/prefix or a local directory
    #[arg(long, env = "REPORT_BUCKET")]
    store: String,

    /// Custom S3 endpoint (MinIO, LocalStack)
    #[arg(long, env = "AWS_ENDPOINT_URL")]
    endpoint_url: Option<String>,

    /// Repository containing the test suite
    #[arg(long, env = "TEST_REPO_URL")]
    repo_url: String,

    /// Branch, tag or commit to test
    #[arg(long, env = "TEST_REPO_REF", default_value = "main")]
    git_ref: String,

    /// Stable id shared by every invocation of this suite (default: repository name)
    #[arg(long, env = "JOB_ID")]
    base_id: Option<String>,

    /// Id shared by every worker of one invocation (default: launcher variables)
    #[arg(long)]
    execution_token: Option<String>,

    /// Local scratch directory (default: system temp directory)
    #[arg(long)]
    scratch_dir: Option<PathBuf>,

    /// Clone and install on every worker instead of sharing worker 0's checkout
    #[arg(long)]
    no_workspace_cache: bool,

    /// Quiet mode - minimal output, only show summary
    #[arg(short, long)]
    quiet: bool,
}

/// First non-empty execution token set by the launcher
fn execution_token_from_env() -> Option<String> {
    EXECUTION_TOKEN_VARS
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing based on quiet mode
    use tracing_subscriber::{EnvFilter, FmtSubscriber};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if args.quiet {
            EnvFilter::new("sharded_test_runner=warn,shard_worker=warn")
        } else {
            EnvFilter::new("sharded_test_runner=info,shard_worker=info")
        }
    });
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    if !args.quiet {
        println!("Shard Worker");
        println!("============");
        println!("Worker: {}/{}", args.worker_index, args.worker_count);
        println!("Repository: {} ({})", args.repo_url, args.git_ref);
        println!("Store: {}", args.store);
        println!();
    }

    let worker_args = WorkerArgs {
        worker_index: args.worker_index,
        worker_count: args.worker_count,
        store: args.store,
        endpoint_url: args.endpoint_url,
        repo_url: args.repo_url,
        git_ref: args.git_ref,
        base_id: args.base_id,
        execution_token: args.execution_token.or_else(execution_token_from_env),
        scratch_dir: args.scratch_dir,
        use_workspace_cache: !args.no_workspace_cache,
        quiet: args.quiet,
    };

    let outcome = run_worker(worker_args).await?;

    println!();
    println!("Shard Summary");
    println!("=============");
    println!("Run ID: {}", outcome.identity.run_id);
    println!("Shard: {}", outcome.shard.shard_arg());
    println!("Exit code: {}", outcome.exit_code);
    println!("Published files: {}", outcome.receipt.files.len());

    let mut run_failed = false;
    if let Some(merge) = &outcome.merge {
        let tests = &merge.summary.tests;
        run_failed = merge.summary.status == RunStatus::Failed;

        println!();
        println!("Run Summary");
        println!("===========");
        println!("Shards merged: {}", merge.shards.len());
        println!(
            "Tests: {} total, {} passed, {} failed, {} skipped",
            tests.total, tests.passed, tests.failed, tests.skipped
        );
        println!(
            "Report: {}",
            merge.links.html_index.as_deref().unwrap_or(&merge.summary.links.html_index)
        );
        println!(
            "JUnit: {}",
            merge.links.junit.as_deref().unwrap_or(&merge.summary.links.junit)
        );
        if !merge.cleanup.failures.is_empty() {
            println!(
                "Warning: {} intermediate object(s) could not be deleted",
                merge.cleanup.failures.len()
            );
        }
    }

    // Failing tests are reported through the exit status, not as an error
    if outcome.exit_code != 0 {
        std::process::exit(outcome.exit_code);
    }
    if run_failed {
        std::process::exit(1);
    }
    Ok(())
}
