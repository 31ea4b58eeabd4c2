//! CLI commands: serve, worker, init-db, cache-analysis.

use std::future::IntoFuture;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use renderflow_analytics::{
    top_routes_absolute, top_routes_relative, AbsoluteParams, RouteCachePriority,
};
use renderflow_db::{create_pool, ensure_schema, DbConfig, DbPool};
use renderflow_events::{EventBuffer, ProgressBus};
use renderflow_http::{build_router, AppState};
use renderflow_protocol::Settings;
use renderflow_queue::{PeriodicSet, TaskQueue};
use renderflow_worker::{run_scheduler, Worker, WorkerConfig, WorkerContext, WorkerExit};

#[derive(Parser)]
#[command(name = "renderflow", version, about = "Job orchestration and analytics backbone")]
pub struct Cli {
    /// Verbose console logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create the database schema
    InitDb(InitDbArgs),
    /// Run the HTTP server (relay + analytics surfaces)
    Serve(ServeArgs),
    /// Run a worker process (task loop + periodic scheduler)
    Worker(WorkerArgs),
    /// Rank endpoint fingerprints for caching
    CacheAnalysis(CacheAnalysisArgs),
}

impl Command {
    pub fn app_name(&self) -> &'static str {
        match self {
            Command::InitDb(_) => "renderflow-initdb",
            Command::Serve(_) => "renderflow-serve",
            Command::Worker(_) => "renderflow-worker",
            Command::CacheAnalysis(_) => "renderflow-cache-analysis",
        }
    }
}

#[derive(Args)]
pub struct InitDbArgs {
    /// Database URL override
    #[arg(long, env = "RENDERFLOW_DATABASE_URL")]
    pub database_url: Option<String>,
}

#[derive(Args)]
pub struct ServeArgs {
    /// Bind address
    #[arg(long, default_value = "127.0.0.1:8001")]
    pub bind: String,
    #[arg(long, env = "RENDERFLOW_DATABASE_URL")]
    pub database_url: Option<String>,
    /// Event-buffer snapshot file (graceful-restart durability)
    #[arg(long)]
    pub buffer_snapshot: Option<PathBuf>,
}

#[derive(Args)]
pub struct WorkerArgs {
    /// Worker identity; defaults to a generated id
    #[arg(long)]
    pub worker_id: Option<String>,
    #[arg(long, env = "RENDERFLOW_DATABASE_URL")]
    pub database_url: Option<String>,
    /// Skip hosting the periodic scheduler in this process
    #[arg(long)]
    pub without_scheduler: bool,
    #[arg(long)]
    pub buffer_snapshot: Option<PathBuf>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum AnalysisSystem {
    /// Absolute thresholds (production traffic)
    Absolute,
    /// Percentile-relative ranking (sparse traffic)
    Relative,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

#[derive(Args)]
pub struct CacheAnalysisArgs {
    /// Number of top routes to return
    #[arg(short = 'n', long, default_value_t = 10)]
    pub count: usize,
    /// Days of historical data to analyze
    #[arg(short, long, default_value_t = 7)]
    pub days: i64,
    #[arg(long, value_enum, default_value_t = AnalysisSystem::Absolute)]
    pub system: AnalysisSystem,
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,
    /// Minimum avg requests/hour (absolute system only)
    #[arg(long, default_value_t = 10)]
    pub min_requests: i64,
    /// Minimum p95 latency in ms (absolute system only)
    #[arg(long, default_value_t = 100)]
    pub min_latency: i64,
    #[arg(long, env = "RENDERFLOW_DATABASE_URL")]
    pub database_url: Option<String>,
}

pub async fn run(args: Cli) -> Result<()> {
    let settings = match Settings::load() {
        Ok(settings) => settings,
        Err(e) => {
            warn!("Config load failed ({e}); continuing with defaults");
            Settings::default()
        }
    };

    match args.command {
        Command::InitDb(cmd) => init_db(cmd, &settings).await,
        Command::Serve(cmd) => serve(cmd, settings).await,
        Command::Worker(cmd) => worker(cmd, settings).await,
        Command::CacheAnalysis(cmd) => cache_analysis(cmd, &settings).await,
    }
}

async fn open_pool(url_override: Option<String>, settings: &Settings) -> Result<DbPool> {
    let url = url_override.unwrap_or_else(|| settings.database_url.clone());
    let pool = create_pool(DbConfig::from_url(url).with_max_connections(settings.db_pool_size))
        .await
        .context("Failed to open database")?;
    Ok(pool)
}

async fn init_db(cmd: InitDbArgs, settings: &Settings) -> Result<()> {
    let pool = open_pool(cmd.database_url, settings).await?;
    ensure_schema(&pool).await.context("Failed to create schema")?;
    println!("Schema created");
    Ok(())
}

async fn serve(cmd: ServeArgs, settings: Settings) -> Result<()> {
    let pool = open_pool(cmd.database_url, &settings).await?;
    ensure_schema(&pool).await?;

    let bus = Arc::new(ProgressBus::new(&settings.namespace));
    let buffer = Arc::new(EventBuffer::new());
    if let Some(snapshot) = &cmd.buffer_snapshot {
        buffer
            .restore_from(snapshot)
            .context("Failed to restore event buffer snapshot")?;
    }

    let state = AppState::new(pool, bus, buffer.clone(), settings);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&cmd.bind)
        .await
        .with_context(|| format!("Failed to bind {}", cmd.bind))?;
    info!("Serving on {}", cmd.bind);

    tokio::select! {
        served = axum::serve(listener, app).into_future() => {
            served.context("Server error")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    if let Some(snapshot) = &cmd.buffer_snapshot {
        buffer
            .snapshot_to(snapshot)
            .context("Failed to snapshot event buffer")?;
        info!("Event buffer snapshot written to {}", snapshot.display());
    }
    Ok(())
}

async fn worker(cmd: WorkerArgs, settings: Settings) -> Result<()> {
    let pool = open_pool(cmd.database_url, &settings).await?;
    ensure_schema(&pool).await?;

    let worker_id = cmd
        .worker_id
        .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4()));
    let queue = Arc::new(TaskQueue::new(pool.clone()));
    let buffer = Arc::new(EventBuffer::new());
    if let Some(snapshot) = &cmd.buffer_snapshot {
        buffer.restore_from(snapshot)?;
    }

    let ctx = WorkerContext {
        pool,
        queue: queue.clone(),
        bus: Arc::new(ProgressBus::new(&settings.namespace)),
        buffer: buffer.clone(),
        settings: settings.clone(),
    };

    let shutdown = CancellationToken::new();
    let scheduler_handle = if !cmd.without_scheduler {
        let schedule = PeriodicSet::from_settings(&settings)
            .context("Invalid scheduled-task cron spec")?;
        Some(tokio::spawn(run_scheduler(
            queue.clone(),
            schedule,
            shutdown.clone(),
        )))
    } else {
        None
    };

    let mut worker = Worker::new(WorkerConfig::new(worker_id, &settings), ctx);
    let worker_shutdown = worker.shutdown_token();

    let exit = tokio::select! {
        exit = worker.run() => exit?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
            worker_shutdown.cancel();
            WorkerExit::Stopped
        }
    };

    shutdown.cancel();
    if let Some(handle) = scheduler_handle {
        let _ = handle.await;
    }
    if let Some(snapshot) = &cmd.buffer_snapshot {
        buffer.snapshot_to(snapshot)?;
    }

    match exit {
        // The supervisor restarts recycled workers; a clean exit code is the
        // signal that this was intentional.
        WorkerExit::Recycle => info!("Worker recycled"),
        WorkerExit::Stopped => info!("Worker stopped"),
    }
    Ok(())
}

async fn cache_analysis(cmd: CacheAnalysisArgs, settings: &Settings) -> Result<()> {
    let pool = open_pool(cmd.database_url, settings).await?;

    let routes = match cmd.system {
        AnalysisSystem::Absolute => {
            println!(
                "Analyzing route analytics (last {} days)\nSystem 1: Absolute Thresholds\nFilters: min {} req/hr, min {}ms latency\n",
                cmd.days, cmd.min_requests, cmd.min_latency
            );
            top_routes_absolute(
                &pool,
                cmd.count,
                cmd.days,
                AbsoluteParams {
                    min_requests_per_hour: cmd.min_requests as f64,
                    min_latency_ms: cmd.min_latency as f64,
                },
            )
            .await?
        }
        AnalysisSystem::Relative => {
            println!(
                "Analyzing route analytics (last {} days)\nSystem 2: Relative Ranking (percentile-based)\n",
                cmd.days
            );
            top_routes_relative(&pool, cmd.count, cmd.days).await?
        }
    };

    if routes.is_empty() {
        println!("No routes found matching criteria.");
        return Ok(());
    }

    match cmd.format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&routes)?);
        }
        OutputFormat::Table => {
            println!("Top {} routes recommended for caching:\n", routes.len());
            print_table(&routes, cmd.system);
        }
    }
    Ok(())
}

fn print_table(routes: &[RouteCachePriority], system: AnalysisSystem) {
    let score_header = match system {
        AnalysisSystem::Absolute => "Priority Score",
        AnalysisSystem::Relative => "Score (weighted pct)",
    };
    println!(
        "{:<4} {:<6} {:<42} {:>10} {:>12} {:>12} {:>20} {:>12}",
        "Rank", "Method", "Route", "Req/Hr", "P95 (ms)", "Users", score_header, "Success"
    );
    for (index, route) in routes.iter().enumerate() {
        let score = route
            .cache_priority_score
            .or(route.priority_score)
            .unwrap_or(0.0);
        let mut path = route.route.clone();
        if path.len() > 40 {
            path.truncate(37);
            path.push_str("...");
        }
        println!(
            "{:<4} {:<6} {:<42} {:>10.0} {:>12.0} {:>12.0} {:>20.1} {:>11.1}%",
            index + 1,
            route.method,
            path,
            route.avg_hourly_requests,
            route.avg_p95_latency_ms,
            route.avg_unique_users,
            score,
            route.success_rate * 100.0
        );
    }
}
