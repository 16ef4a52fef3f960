use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use serde::Serialize;
use std::path::PathBuf;

use crate::error::Result;
use crate::executor::{EntryStatus, JobOutcome, RebalanceJob, RebalanceReport};
use crate::planner::RebalancePlan;
use crate::registry::{apy, RegistrySnapshot};

#[derive(Parser)]
#[command(name = "harvest")]
#[command(version)]
#[command(about = "Yield-farm allocation planner and rebalancer", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Directory holding default.toml and environment overrides
    #[arg(short, long, default_value = "config", env = "HARVEST_CONFIG_DIR")]
    pub config_dir: PathBuf,

    /// Print machine-readable JSON instead of tables
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show farms, allocation shares and blended APY
    Snapshot,
    /// Compute a rebalance plan without executing it
    Plan {
        /// Minimum blended APY gain per shift step, in bps
        #[arg(long)]
        min_change_bps: Option<u32>,
        /// Maximum share any one farm may gain or lose, in bps
        #[arg(long)]
        max_shift_bps: Option<u32>,
    },
    /// Plan and execute against the simulated chain
    Simulate {
        /// Farms whose allocation updates the chain rejects (repeatable)
        #[arg(long = "reject")]
        reject: Vec<String>,
        /// Lift the rejections and retry failed entries once
        #[arg(long)]
        retry: bool,
    },
}

/// Blended APY (bps, fractional) as a display percentage
fn as_percent(bps: Decimal) -> Decimal {
    (bps / Decimal::ONE_HUNDRED).round_dp(4)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn print_snapshot(snapshot: &RegistrySnapshot, json: bool) -> Result<()> {
    if json {
        return print_json(snapshot);
    }

    println!("{:<16} {:>8} {:>10} {:>8}", "FARM", "APY %", "SHARE %", "ACTIVE");
    for farm in &snapshot.farms {
        println!(
            "{:<16} {:>8} {:>10} {:>8}",
            farm.id,
            apy::to_percent(farm.apy_bps),
            apy::to_percent(farm.allocation_bps),
            if farm.active { "yes" } else { "no" }
        );
    }
    match snapshot.blended_apy {
        Some(blended) => println!("\nBlended APY: {}%", as_percent(blended)),
        None => println!("\nBlended APY: n/a (no active farms)"),
    }
    if !snapshot.settled {
        println!(
            "Warning: active shares sum to {} bps, not fully allocated",
            snapshot.total_active_allocation
        );
    }
    Ok(())
}

pub fn print_plan(plan: &RebalancePlan, json: bool) -> Result<()> {
    if json {
        return print_json(plan);
    }

    println!("Plan {}", plan.plan_id);
    println!("{:<16} {:>8} {:>10} {:>10}", "FARM", "APY %", "CURRENT %", "TARGET %");
    for target in &plan.targets {
        let marker = if target.is_change() { "*" } else { "" };
        println!(
            "{:<16} {:>8} {:>10} {:>10} {}",
            target.farm,
            apy::to_percent(target.apy_bps),
            apy::to_percent(target.current_bps),
            apy::to_percent(target.target_bps),
            marker
        );
    }
    println!(
        "\nBlended APY: {}% -> {}%",
        as_percent(plan.current_apy),
        as_percent(plan.projected_apy)
    );
    if plan.is_noop() {
        println!("No reallocation worth making.");
    }
    Ok(())
}

pub fn print_report(report: &RebalanceReport, job: Option<&RebalanceJob>, json: bool) -> Result<()> {
    if json {
        return print_json(report);
    }

    println!(
        "Job {}: {}% confirmed ({} confirmed, {} failed, {} submissions)",
        report.job_id, report.progress_pct, report.confirmed, report.failed, report.submissions
    );
    if let Some(job) = job {
        for entry in &job.entries {
            let status = match entry.status {
                EntryStatus::Confirmed => "confirmed".to_string(),
                EntryStatus::Failed => match &entry.failure {
                    Some(failure) => failure.to_string(),
                    None => "failed".to_string(),
                },
                EntryStatus::Pending => "pending".to_string(),
                EntryStatus::Submitted => "submitted".to_string(),
            };
            println!(
                "  {:<16} {:>6} -> {:<6} {}",
                entry.farm, entry.from_bps, entry.target_bps, status
            );
        }
    }
    if let JobOutcome::Partial { failed_farms } = &report.outcome {
        let names: Vec<String> = failed_farms.iter().map(|farm| farm.to_string()).collect();
        println!("Partial: {} kept their previous share", names.join(", "));
    }
    Ok(())
}
