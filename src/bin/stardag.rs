use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration, Utc};
use clap::{Args, Parser, Subcommand};
use stardag::config::{LogFormat, LoggingConfig};
use stardag::pipeline::{self, star_schema};
use stardag::{
    AwsCredentials, Connectors, Executor, MemoryObjectStore, PipelineConfig, RunContext,
    StaticCredentials, load_config,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

#[derive(Parser)]
#[command(name = "stardag")]
#[command(about = "Hourly star schema pipeline runner")]
struct Cli {
    /// TOML configuration file; `STARDAG_*` environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the pipeline graph and its schedule order.
    Graph,
    /// Print the statements every task would issue for a window.
    Plan(WindowArgs),
    /// Run the pipeline for a window against in-memory connectors.
    Run(RunArgs),
}

#[derive(Args)]
struct WindowArgs {
    /// Window start, RFC 3339.
    #[arg(long)]
    window_start: DateTime<Utc>,
    /// Window end, defaults to one hour after the start.
    #[arg(long)]
    window_end: Option<DateTime<Utc>>,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    window: WindowArgs,
    /// Directory mirrored into the configured bucket before the run.
    #[arg(long)]
    fixtures: Option<PathBuf>,
}

impl WindowArgs {
    fn context(&self, config: &PipelineConfig) -> Result<RunContext> {
        let end = self
            .window_end
            .unwrap_or(self.window_start + Duration::hours(1));
        RunContext::new(self.window_start, end, config.credentials_ref())
            .context("invalid run window")
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref()).context("failed to load configuration")?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Graph => print_graph(&config),
        Commands::Plan(args) => print_plan(&config, &args),
        Commands::Run(args) => run_pipeline(&config, &args).await,
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));

    // Logs go to stderr so stdout stays machine readable.
    let layer = match logging.format {
        LogFormat::Pretty => fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .with_filter(filter)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(filter)
            .boxed(),
    };

    tracing_subscriber::registry().with(layer).init();
}

fn print_graph(config: &PipelineConfig) -> Result<ExitCode> {
    let graph = star_schema(config).context("invalid pipeline definition")?;

    print!("{}", graph.render_tree());
    println!();
    for (i, task_id) in graph.topological_order().iter().enumerate() {
        println!("{}. {}", i + 1, task_id);
    }
    Ok(ExitCode::SUCCESS)
}

fn print_plan(config: &PipelineConfig, args: &WindowArgs) -> Result<ExitCode> {
    let graph = star_schema(config).context("invalid pipeline definition")?;
    let ctx = args.context(config)?;

    for task_id in graph.topological_order() {
        let Some(task) = graph.task(task_id) else {
            continue;
        };
        println!("{task_id} ({})", task.kind().name());
        let statements = task
            .plan(&ctx)
            .with_context(|| format!("failed to plan {task_id}"))?;
        for statement in statements {
            println!("    {statement};");
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_pipeline(config: &PipelineConfig, args: &RunArgs) -> Result<ExitCode> {
    let graph = star_schema(config).context("invalid pipeline definition")?;
    let ctx = args.window.context(config)?;

    let store = MemoryObjectStore::new();
    if let Some(dir) = &args.fixtures {
        if !dir.is_dir() {
            bail!("fixtures directory {} does not exist", dir.display());
        }
        let loaded = store
            .load_dir(&config.storage.bucket, dir)
            .with_context(|| format!("failed to load fixtures from {}", dir.display()))?;
        info!(objects = loaded, dir = %dir.display(), "loaded fixture objects");
    }

    let credentials = config.static_credentials().unwrap_or_else(|| {
        warn!("no credentials configured, using placeholder keys for the in-memory run");
        AwsCredentials::new("dry-run", "dry-run")
    });
    let warehouse = pipeline::memory_warehouse(store);
    let connectors = Connectors::with_copy_loader(
        Arc::new(warehouse),
        Arc::new(StaticCredentials::new(credentials)),
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            on_signal.cancel();
        }
    });

    info!(
        credentials = %ctx.credentials_ref(),
        window_start = %ctx.window_start(),
        "starting pipeline run"
    );
    let executor =
        Executor::new(graph, connectors).with_max_concurrency(config.executor.max_concurrency);
    let result = executor.run_with_cancellation(&ctx, cancel).await;

    println!(
        "{}",
        serde_json::to_string_pretty(&result).context("failed to serialize run result")?
    );

    if result.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
