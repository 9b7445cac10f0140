use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use partition_exec::shutdown::install_shutdown_handler;
use partition_exec::{
    AsyncJobExecutor, ConnectionConfig, ExecError, JobExecutor, PoolConfig, Task, TaskJob,
};

#[derive(Parser, Debug)]
#[command(name = "partition-exec")]
#[command(version)]
#[command(about = "Locality-aware task execution on a local worker pool")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a synthetic job and print results in completion order
    Run(RunArgs),

    /// Provision a pool and list its workers
    Workers {
        /// Pool options as JSON, e.g. '{"workers": 2}'
        #[arg(long, default_value = "{}")]
        pool_config: String,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Number of tasks in the job
    #[arg(long, default_value = "8")]
    tasks: usize,

    /// Pool options as JSON, e.g. '{"workers": 2, "threads_per_worker": 1}'
    #[arg(long, default_value = "{}")]
    pool_config: String,

    /// Executor variant
    #[arg(long, default_value = "sync")]
    mode: Mode,

    /// Base sleep per task; earlier tasks sleep longer
    #[arg(long, default_value = "100")]
    delay_ms: u64,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Debug, Clone, ValueEnum)]
enum Mode {
    Sync,
    Async,
}

// =============================================================================
// Synthetic Job
// =============================================================================

struct SleepTask {
    index: usize,
    delay: Duration,
}

struct Sample {
    index: usize,
    thread: String,
}

impl Task for SleepTask {
    type Output = Sample;

    fn run(&self) -> anyhow::Result<Sample> {
        std::thread::sleep(self.delay);
        Ok(Sample {
            index: self.index,
            thread: std::thread::current()
                .name()
                .unwrap_or("unnamed")
                .to_string(),
        })
    }
}

fn synthetic_job(tasks: usize, base_delay: Duration) -> TaskJob<SleepTask> {
    TaskJob::new((0..tasks).map(|index| SleepTask {
        index,
        delay: base_delay * (tasks - index) as u32,
    }))
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct ResultRow {
    index: usize,
    thread: String,
    elapsed_ms: u64,
}

#[derive(Serialize, Default)]
struct RunOutput {
    job_id: String,
    results: Vec<ResultRow>,
    error: Option<String>,
}

impl RunOutput {
    fn record(&mut self, item: Result<Sample, ExecError>, started: Instant) -> bool {
        match item {
            Ok(sample) => {
                self.results.push(ResultRow {
                    index: sample.index,
                    thread: sample.thread,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
                true
            }
            Err(e) => {
                self.error = Some(e.to_string());
                false
            }
        }
    }
}

#[derive(Serialize)]
struct WorkersOutput {
    address: String,
    workers: Vec<String>,
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn run_sync(
    pool_config: PoolConfig,
    job: TaskJob<SleepTask>,
    shutdown: CancellationToken,
) -> anyhow::Result<RunOutput> {
    let executor = tokio::task::spawn_blocking(move || {
        JobExecutor::make_local(pool_config, ConnectionConfig::default())
    })
    .await??;

    let results = executor.run_job(&job)?;
    let job_id = results.job_id();
    let started = Instant::now();

    let mut collector = tokio::task::spawn_blocking(move || {
        let mut output = RunOutput {
            job_id: job_id.to_string(),
            ..Default::default()
        };
        for item in results {
            if !output.record(item, started) {
                break;
            }
        }
        output
    });

    let output = tokio::select! {
        output = &mut collector => output?,
        _ = shutdown.cancelled() => {
            executor.cancel_job_id(job_id);
            collector.await?
        }
    };

    tokio::task::spawn_blocking(move || executor.close()).await?;
    Ok(output)
}

async fn run_async(
    pool_config: PoolConfig,
    job: TaskJob<SleepTask>,
    shutdown: CancellationToken,
) -> anyhow::Result<RunOutput> {
    let executor = AsyncJobExecutor::make_local(pool_config, ConnectionConfig::default()).await?;

    let mut results = executor.run_job(&job)?;
    let job_id = results.job_id();
    let started = Instant::now();
    let mut output = RunOutput {
        job_id: job_id.to_string(),
        ..Default::default()
    };

    let mut cancel_sent = false;
    loop {
        tokio::select! {
            item = results.next() => match item {
                Some(item) => {
                    if !output.record(item, started) {
                        break;
                    }
                }
                None => break,
            },
            _ = shutdown.cancelled(), if !cancel_sent => {
                executor.cancel_job_id(job_id);
                cancel_sent = true;
            }
        }
    }

    drop(results);
    executor.close().await;
    Ok(output)
}

async fn handle_run(args: RunArgs) -> anyhow::Result<()> {
    let pool_config = PoolConfig::from_json(&args.pool_config)?;
    let shutdown = install_shutdown_handler()?;
    let job = synthetic_job(args.tasks, Duration::from_millis(args.delay_ms));

    let output = match args.mode {
        Mode::Sync => run_sync(pool_config, job, shutdown).await?,
        Mode::Async => run_async(pool_config, job, shutdown).await?,
    };

    match args.output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Job ID: {}", output.job_id);
            println!();
            println!("{:<8} {:<20} ELAPSED", "TASK", "THREAD");
            println!("{}", "-".repeat(40));
            for row in &output.results {
                println!("{:<8} {:<20} {}ms", row.index, row.thread, row.elapsed_ms);
            }
            println!();
            println!("{} of {} tasks completed", output.results.len(), args.tasks);
            if let Some(error) = &output.error {
                println!("Stopped: {}", error);
            }
        }
    }
    Ok(())
}

async fn handle_workers(pool_config: String, output_format: OutputFormat) -> anyhow::Result<()> {
    let pool_config = PoolConfig::from_json(&pool_config)?;
    let executor = AsyncJobExecutor::make_local(pool_config, ConnectionConfig::default()).await?;
    let workers = executor.workers()?;
    let output = WorkersOutput {
        address: executor.address().to_string(),
        workers: workers.iter().map(|w| w.to_string()).collect(),
    };
    executor.close().await;

    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Pool: {}", output.address);
            println!("{}", "=".repeat(40));
            for worker in &output.workers {
                println!("{}", worker);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Run(run_args) => handle_run(run_args).await?,
        Commands::Workers {
            pool_config,
            output,
        } => handle_workers(pool_config, output).await?,
    }

    Ok(())
}
