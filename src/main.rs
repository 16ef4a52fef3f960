use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use harvest::cli::{self, Cli, Commands};
use harvest::gateway::{FailureReason, SimulatedGateway};
use harvest::telemetry::init_logging;
use harvest::{cancel_pair, AppConfig, Desk, FarmId};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load_from(&cli.config_dir)
        .with_context(|| format!("loading configuration from {}", cli.config_dir.display()))?;
    if let Commands::Plan {
        min_change_bps,
        max_shift_bps,
    } = &cli.command
    {
        if let Some(min_change_bps) = min_change_bps {
            config.planner.min_change_bps = *min_change_bps;
        }
        if let Some(max_shift_bps) = max_shift_bps {
            config.planner.max_single_farm_shift_bps = *max_shift_bps;
        }
    }
    config
        .validate()
        .map_err(|errors| anyhow!("invalid configuration: {}", errors.join("; ")))?;

    let _log_guard = init_logging(&config.logging);

    if !config.dry_run.enabled {
        bail!("no live chain gateway is configured; set dry_run.enabled to use the simulated chain");
    }
    let gateway = Arc::new(SimulatedGateway::from_config(&config.dry_run));
    let mut desk = Desk::new(gateway.clone(), &config);
    desk.resync().await?;

    match cli.command {
        Commands::Snapshot => cli::print_snapshot(&desk.snapshot(), cli.json)?,
        Commands::Plan { .. } => cli::print_plan(&desk.plan()?, cli.json)?,
        Commands::Simulate { reject, retry } => {
            let rejected: Vec<FarmId> = reject.iter().map(FarmId::new).collect();
            for farm in &rejected {
                gateway.reject_farm(farm, FailureReason::UserRejected);
            }

            let plan = desk.plan()?;
            cli::print_plan(&plan, cli.json)?;
            if plan.is_noop() {
                return Ok(());
            }

            let (canceller, cancel) = cancel_pair();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, no further submissions");
                    canceller.cancel();
                }
            });

            let report = desk.execute_cancellable(&plan, &cancel).await?;
            cli::print_report(&report, desk.job(report.job_id), cli.json)?;

            if retry && report.failed > 0 {
                for farm in &rejected {
                    gateway.allow_farm(farm);
                }
                info!(job_id = %report.job_id, "retrying failed entries");
                let report = desk.retry_failed(report.job_id).await?;
                cli::print_report(&report, desk.job(report.job_id), cli.json)?;
            }

            if !cli.json {
                println!();
                cli::print_snapshot(&desk.snapshot(), false)?;
            }
        }
    }

    Ok(())
}
