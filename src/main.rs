use std::collections::BTreeMap;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;

use fanout::checkpoint::CheckpointStore;
use fanout::cli::{Cli, Command, RunArgs};
use fanout::config::FanoutConfig;
use fanout::executor::{EchoExecutor, HttpExecutor, WorkExecutor};
use fanout::health::HealthMonitor;
use fanout::logging;
use fanout::normalize::normalize_file;
use fanout::orchestrator::Orchestrator;
use fanout::output::{JsonlSink, write_report};
use fanout::ui::JobProgress;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    logging::init(cli.verbose)?;
    let config = FanoutConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Run(args) => run(args, config).await,
        Command::Inspect { checkpoint } => inspect(&checkpoint).await,
    }
}

async fn run(args: RunArgs, mut config: FanoutConfig) -> Result<ExitCode> {
    args.apply(&mut config);

    let format = args.format.map(Into::into);
    let items = normalize_file(&args.input, format, &config.normalize_options())
        .with_context(|| format!("failed to read input {}", args.input.display()))?;

    let executor: Arc<dyn WorkExecutor> = if args.dry_run {
        Arc::new(EchoExecutor)
    } else {
        if config.endpoint.is_empty() {
            bail!(
                "no endpoint configured: pass --endpoint, set FANOUT_ENDPOINT \
                 or add `endpoint` to fanout.toml"
            );
        }
        let http = HttpExecutor::new(config.endpoint.as_str())
            .context("failed to build HTTP client")?
            .with_query_param(config.query_param.as_str());
        Arc::new(http)
    };

    let sink = JsonlSink::open(&config.output_dir).await?;
    let progress = Arc::new(JobProgress::new());
    let mut orchestrator = Orchestrator::new(config.job_config(), executor)
        .with_health_monitor(Arc::new(HealthMonitor::new(config.health.clone())))
        .with_result_sink(Arc::new(sink))
        .with_observer(progress.clone());
    if let Some(path) = args.checkpoint_path(&config) {
        orchestrator = orchestrator.with_checkpoint_store(Arc::new(CheckpointStore::open(path)));
    }

    let token = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, letting in-flight items finish");
            token.cancel();
        }
    });

    let result = match orchestrator.run(items).await {
        Ok(result) => result,
        Err(e) => {
            progress.abandon();
            return Err(e.into());
        }
    };
    write_report(&config.output_dir, &result).await?;
    progress.finish(&result);

    Ok(if result.cancelled {
        ExitCode::from(130)
    } else if result.failed > 0 || result.aborted {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

async fn inspect(path: &Path) -> Result<ExitCode> {
    if !path.exists() {
        bail!("checkpoint {} does not exist", path.display());
    }
    let checkpoint = CheckpointStore::open(path).load().await?;

    let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
    for pointer in checkpoint.result_pointers.values() {
        *by_status.entry(pointer.status.to_string()).or_default() += 1;
    }

    println!("checkpoint: {}", path.display());
    if let Some(saved_at) = checkpoint.saved_at {
        println!("saved at:   {saved_at}");
    }
    println!("completed:  {}", checkpoint.len());
    for (status, count) in by_status {
        println!("  {status:<8} {count}");
    }
    Ok(ExitCode::SUCCESS)
}
