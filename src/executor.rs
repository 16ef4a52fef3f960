//! Rebalance Executor
//!
//! Turns a [`RebalancePlan`] into allocation updates on chain. Submissions go
//! out one at a time, largest shift first; confirmations are awaited
//! concurrently and applied to the registry in whatever order they land.

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cancel::CancelSignal;
use crate::config::{ExecutorConfig, RetryConfig};
use crate::domain::FarmId;
use crate::error::GatewayError;
use crate::gateway::{
    await_resolution, idempotency_key, ChainGateway, FailureReason, OperationHandle, Resolution,
    WriteOp,
};
use crate::planner::RebalancePlan;
use crate::registry::{FarmRegistry, RegistrySnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Submitted,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryFailure {
    /// Declined before the gateway accepted it
    Rejected(FailureReason),
    /// Accepted, then failed on chain
    Reverted(FailureReason),
    /// Gateway could not be reached while submitting or observing
    Unavailable(String),
    /// Never submitted because the job was cancelled
    Cancelled,
    /// Confirmed on chain, but the registry refused the new share
    Unrecorded(String),
}

impl std::fmt::Display for EntryFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryFailure::Rejected(reason) => write!(f, "rejected ({reason})"),
            EntryFailure::Reverted(reason) => write!(f, "failed ({reason})"),
            EntryFailure::Unavailable(detail) => write!(f, "unavailable ({detail})"),
            EntryFailure::Cancelled => write!(f, "cancelled"),
            EntryFailure::Unrecorded(detail) => write!(f, "unrecorded ({detail})"),
        }
    }
}

impl From<GatewayError> for EntryFailure {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Rejected(reason) => EntryFailure::Rejected(reason),
            GatewayError::Unavailable(detail) => EntryFailure::Unavailable(detail),
            other => EntryFailure::Unavailable(other.to_string()),
        }
    }
}

/// One allocation update within a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEntry {
    pub farm: FarmId,
    pub from_bps: u32,
    pub target_bps: u32,
    pub status: EntryStatus,
    pub handle: Option<OperationHandle>,
    pub failure: Option<EntryFailure>,
    pub attempts: u32,
}

impl JobEntry {
    fn fail(&mut self, failure: EntryFailure) {
        warn!(farm = %self.farm, %failure, "allocation update failed");
        self.status = EntryStatus::Failed;
        self.failure = Some(failure);
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, EntryStatus::Confirmed | EntryStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum JobOutcome {
    Success,
    Partial { failed_farms: Vec<FarmId> },
    InProgress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceJob {
    pub job_id: JobId,
    pub plan_id: Uuid,
    /// Submission order: largest shift first
    pub entries: Vec<JobEntry>,
    /// Farms in the order their confirmations arrived
    pub confirmation_order: Vec<FarmId>,
    pub total_submissions: usize,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RebalanceJob {
    /// Build the job for `plan` without touching the chain
    pub fn from_plan(plan: &RebalancePlan) -> Self {
        let mut entries: Vec<JobEntry> = plan
            .changes()
            .map(|target| JobEntry {
                farm: target.farm.clone(),
                from_bps: target.current_bps,
                target_bps: target.target_bps,
                status: EntryStatus::Pending,
                handle: None,
                failure: None,
                attempts: 0,
            })
            .collect();
        // stable: ties keep registry order
        entries.sort_by_key(|entry| std::cmp::Reverse(entry.from_bps.abs_diff(entry.target_bps)));

        Self {
            job_id: JobId::new(),
            plan_id: plan.plan_id,
            entries,
            confirmation_order: Vec::new(),
            total_submissions: 0,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn outcome(&self) -> JobOutcome {
        if self.entries.iter().any(|entry| !entry.is_terminal()) {
            return JobOutcome::InProgress;
        }
        let failed_farms = self.failed_farms();
        if failed_farms.is_empty() {
            JobOutcome::Success
        } else {
            JobOutcome::Partial { failed_farms }
        }
    }

    pub fn failed_farms(&self) -> Vec<FarmId> {
        self.entries
            .iter()
            .filter(|entry| entry.status == EntryStatus::Failed)
            .map(|entry| entry.farm.clone())
            .collect()
    }

    pub fn confirmed_count(&self) -> usize {
        self.count(EntryStatus::Confirmed)
    }

    pub fn failed_count(&self) -> usize {
        self.count(EntryStatus::Failed)
    }

    /// Share of entries confirmed, 0..=100; an empty job is complete
    pub fn progress_pct(&self) -> u32 {
        if self.entries.is_empty() {
            return 100;
        }
        (self.confirmed_count() * 100 / self.entries.len()) as u32
    }

    pub fn report(&self, submissions: usize) -> RebalanceReport {
        RebalanceReport {
            job_id: self.job_id,
            outcome: self.outcome(),
            progress_pct: self.progress_pct(),
            confirmed: self.confirmed_count(),
            failed: self.failed_count(),
            submissions,
        }
    }

    fn count(&self, status: EntryStatus) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.status == status)
            .count()
    }
}

/// Summary of one execute or retry run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceReport {
    pub job_id: JobId,
    pub outcome: JobOutcome,
    pub progress_pct: u32,
    pub confirmed: usize,
    pub failed: usize,
    /// Gateway submissions made by this run
    pub submissions: usize,
}

pub struct RebalanceExecutor {
    gateway: Arc<dyn ChainGateway>,
    poll_interval: Duration,
    retry: RetryConfig,
    snapshots: Option<Arc<watch::Sender<RegistrySnapshot>>>,
}

impl RebalanceExecutor {
    pub fn new(gateway: Arc<dyn ChainGateway>, config: &ExecutorConfig, retry: RetryConfig) -> Self {
        Self {
            gateway,
            poll_interval: config.poll_interval(),
            retry,
            snapshots: None,
        }
    }

    /// Publish a registry snapshot after every confirmed update
    pub fn with_snapshots(mut self, snapshots: Arc<watch::Sender<RegistrySnapshot>>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    /// Execute `plan` against the chain, updating `registry` as confirmations arrive
    pub async fn execute(
        &self,
        plan: &RebalancePlan,
        registry: &mut FarmRegistry,
        cancel: &CancelSignal,
    ) -> RebalanceJob {
        let mut job = RebalanceJob::from_plan(plan);
        info!(
            job_id = %job.job_id,
            plan_id = %plan.plan_id,
            entries = job.entries.len(),
            "starting rebalance job"
        );

        let pending: Vec<usize> = (0..job.entries.len()).collect();
        self.run(&mut job, pending, registry, cancel).await;
        job
    }

    /// Re-submit only the failed entries of `job` with their original targets
    pub async fn retry_failed(
        &self,
        job: &mut RebalanceJob,
        registry: &mut FarmRegistry,
        cancel: &CancelSignal,
    ) -> RebalanceReport {
        let failed: Vec<usize> = job
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.status == EntryStatus::Failed)
            .map(|(index, _)| index)
            .collect();

        if failed.is_empty() {
            debug!(job_id = %job.job_id, "no failed entries to retry");
            return job.report(0);
        }

        info!(job_id = %job.job_id, entries = failed.len(), "retrying failed entries");
        for &index in &failed {
            let entry = &mut job.entries[index];
            entry.status = EntryStatus::Pending;
            entry.failure = None;
            entry.handle = None;
        }
        job.finished_at = None;

        let submissions = self.run(job, failed, registry, cancel).await;
        job.report(submissions)
    }

    #[instrument(skip_all, fields(job_id = %job.job_id))]
    async fn run(
        &self,
        job: &mut RebalanceJob,
        pending: Vec<usize>,
        registry: &mut FarmRegistry,
        cancel: &CancelSignal,
    ) -> usize {
        let mut in_flight = FuturesUnordered::new();
        let mut submissions = 0;
        let job_key = job.job_id.to_string();

        for (position, &index) in pending.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(
                    discarded = pending.len() - position,
                    "job cancelled, discarding unsubmitted entries"
                );
                for &rest in &pending[position..] {
                    job.entries[rest].fail(EntryFailure::Cancelled);
                }
                break;
            }

            let entry = &mut job.entries[index];
            entry.attempts += 1;
            let op = WriteOp::SetAllocation {
                farm: entry.farm.clone(),
                allocation_bps: entry.target_bps,
            };
            let key = idempotency_key(&[
                &job_key,
                entry.farm.as_str(),
                &entry.target_bps.to_string(),
                &entry.attempts.to_string(),
            ]);

            submissions += 1;
            match self.gateway.submit(&op, &key).await {
                Ok(handle) => {
                    debug!(farm = %entry.farm, %handle, target_bps = entry.target_bps, "allocation update submitted");
                    entry.status = EntryStatus::Submitted;
                    entry.handle = Some(handle.clone());
                    in_flight.push(self.confirmation(index, handle));
                }
                Err(err) => entry.fail(err.into()),
            }

            // apply whatever already resolved before the next submission
            while let Some(Some((index, result))) = in_flight.next().now_or_never() {
                self.settle(job, index, result, registry);
            }
        }

        while let Some((index, result)) = in_flight.next().await {
            self.settle(job, index, result, registry);
        }

        job.total_submissions += submissions;
        job.finished_at = Some(Utc::now());
        info!(
            confirmed = job.confirmed_count(),
            failed = job.failed_count(),
            submissions,
            "rebalance run finished"
        );
        submissions
    }

    fn confirmation(
        &self,
        index: usize,
        handle: OperationHandle,
    ) -> impl Future<Output = (usize, Result<Resolution, GatewayError>)> + Send + 'static {
        let gateway = Arc::clone(&self.gateway);
        let poll_interval = self.poll_interval;
        let retry = self.retry.clone();
        async move {
            let result = await_resolution(gateway.as_ref(), &handle, poll_interval, &retry).await;
            (index, result)
        }
    }

    fn settle(
        &self,
        job: &mut RebalanceJob,
        index: usize,
        result: Result<Resolution, GatewayError>,
        registry: &mut FarmRegistry,
    ) {
        let entry = &mut job.entries[index];
        match result {
            Ok(Resolution::Confirmed(_)) => {
                if let Err(err) = registry.set_allocation(&entry.farm, entry.target_bps) {
                    entry.fail(EntryFailure::Unrecorded(err.to_string()));
                    return;
                }
                entry.status = EntryStatus::Confirmed;
                entry.failure = None;
                job.confirmation_order.push(entry.farm.clone());
                info!(farm = %entry.farm, target_bps = entry.target_bps, "allocation confirmed");
                self.publish(registry);
            }
            Ok(Resolution::Failed(reason)) => entry.fail(EntryFailure::Reverted(reason)),
            Err(err) => entry.fail(EntryFailure::Unavailable(err.to_string())),
        }
    }

    fn publish(&self, registry: &FarmRegistry) {
        if let Some(snapshots) = &self.snapshots {
            snapshots.send_replace(registry.snapshot());
        }
    }
}
