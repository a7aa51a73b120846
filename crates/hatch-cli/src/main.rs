use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use hatch_core::{ApplicationSpec, CallingConvention, EntryPoint, HatchConfig, HostRequest};
use hatch_manager::{ApplicationManager, WorkerSettings, serve_worker};
use hatch_runtime::{GuestRuntime, WasmRuntime};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "hatch", about = "hatch — application runtime manager for WebAssembly web apps")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file
    Check {
        #[arg(long, short, default_value = "hatch.toml")]
        config: PathBuf,
    },
    /// Register one configured application and send it a single request
    Invoke(InvokeArgs),
    /// Serve one application over stdin/stdout (started by the manager)
    Worker(WorkerArgs),
}

#[derive(Args)]
struct InvokeArgs {
    #[arg(long, short, default_value = "hatch.toml")]
    config: PathBuf,

    /// Name of the `[[app]]` to invoke
    #[arg(long)]
    app: String,

    #[arg(long, short = 'X', default_value = "GET")]
    method: String,

    /// Request target, optionally with a query string
    #[arg(long, default_value = "/")]
    path: String,

    /// Request header as `Name: value` (repeatable)
    #[arg(long = "header", short = 'H')]
    headers: Vec<String>,

    /// Request body
    #[arg(long, short)]
    data: Option<String>,
}

#[derive(Args)]
struct WorkerArgs {
    /// Entry point as `module:attribute`
    #[arg(long)]
    app: String,

    #[arg(long, default_value = "sync")]
    convention: CallingConvention,

    #[arg(long)]
    lifespan: bool,

    #[arg(long)]
    working_dir: Option<PathBuf>,

    #[arg(long = "search-path")]
    search_paths: Vec<PathBuf>,

    #[arg(long, default_value_t = 30_000)]
    startup_timeout_ms: u64,

    #[arg(long, default_value_t = 30_000)]
    shutdown_timeout_ms: u64,

    /// Directory for precompiled components
    #[arg(long)]
    cache_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout belongs to the worker protocol and to invoke output
    let subscriber = fmt()
        .with_env_filter(EnvFilter::from_env("HATCH_LOG"))
        .with_writer(std::io::stderr);
    if cli.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    match cli.command {
        Commands::Check { config } => run_check(&config),
        Commands::Invoke(args) => run_invoke(args).await,
        Commands::Worker(args) => run_worker(args).await,
    }
}

fn run_check(path: &Path) -> Result<()> {
    let config =
        HatchConfig::from_file(path).with_context(|| format!("invalid configuration {}", path.display()))?;

    for app in &config.apps {
        let spec = app.validate()?;
        let mode = if app.dynamic { "dynamic" } else { "static" };
        println!(
            "{}: {} ({}, {}, {} x {})",
            app.name, spec.entry, spec.convention, mode, spec.workers, spec.concurrency
        );
    }
    println!("{} application(s) OK", config.apps.len());
    Ok(())
}

async fn run_invoke(args: InvokeArgs) -> Result<()> {
    let config = HatchConfig::from_file(&args.config)
        .with_context(|| format!("invalid configuration {}", args.config.display()))?;
    let app = config
        .app(&args.app)
        .cloned()
        .ok_or_else(|| anyhow!("no application named {:?} in {}", args.app, args.config.display()))?;
    if app.dynamic {
        bail!("{} is dynamic; dynamic applications need a resolver from the embedding host", app.name);
    }

    let mut request = HostRequest::new(args.method, &args.path);
    for header in &args.headers {
        let (name, value) = header
            .split_once(':')
            .ok_or_else(|| anyhow!("header must look like 'Name: value', got {header:?}"))?;
        request = request.with_header(name.trim(), value.trim());
    }
    if let Some(data) = args.data {
        request = request.with_body(data);
    }

    let runtime: Arc<dyn GuestRuntime> = Arc::new(WasmRuntime::new(config.runtime.cache_dir.clone())?);
    let mut worker = config.worker.clone();
    if let Some(dir) = &config.runtime.cache_dir {
        worker.args.push("--cache-dir".into());
        worker.args.push(dir.to_string_lossy().into_owned());
    }
    let manager = ApplicationManager::new(runtime, config.manager.clone()).with_worker_config(worker);

    let name = app.name.clone();
    if let Err(e) = manager.register(app, None).await {
        manager.shutdown().await;
        return Err(e.into());
    }
    let response = manager.dispatch_collect(&name, request).await;
    manager.shutdown().await;
    let response = response?;

    eprintln!("HTTP {}", response.status);
    for (name, value) in &response.headers {
        eprintln!("{name}: {value}");
    }
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&response.body)?;
    stdout.flush()?;

    if response.status >= 500 {
        bail!("application answered {}", response.status);
    }
    Ok(())
}

async fn run_worker(args: WorkerArgs) -> Result<()> {
    let entry = EntryPoint::parse(&args.app)?;
    let mut spec = ApplicationSpec::new(entry, args.convention)
        .with_lifespan(args.lifespan)
        .with_search_paths(args.search_paths);
    if let Some(dir) = args.working_dir {
        spec = spec.with_working_directory(dir);
    }
    let settings = WorkerSettings::for_spec(
        &spec,
        Duration::from_millis(args.startup_timeout_ms),
        Duration::from_millis(args.shutdown_timeout_ms),
    );

    tracing::info!(app = %spec.entry, pid = std::process::id(), "Starting worker");
    let runtime: Arc<dyn GuestRuntime> = Arc::new(WasmRuntime::new(args.cache_dir)?);
    serve_worker(runtime, spec, settings, tokio::io::stdin(), tokio::io::stdout()).await?;
    tracing::info!("Worker exited");
    Ok(())
}
