//! Single owner of the allocation core.
//!
//! The desk holds the registry, positions, jobs and transfers and exposes the
//! operations the presentation layer drives. Every mutation goes through
//! `&mut self`; readers subscribe to registry snapshots.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::cancel::CancelSignal;
use crate::config::{AppConfig, PlannerConfig, RetryConfig};
use crate::domain::{ChainId, Farm, PositionKey, YieldPosition};
use crate::error::{HarvestError, Result, TokenizationError};
use crate::executor::{JobId, RebalanceExecutor, RebalanceJob, RebalanceReport};
use crate::gateway::{call_with_retry, ChainGateway, ReadOp};
use crate::planner::{self, RebalancePlan};
use crate::registry::{FarmRegistry, RegistrySnapshot};
use crate::tokenization::{MintBurnReceipt, TokenizationController};
use crate::transfer::{
    ReconcileOutcome, TransferCoordinator, TransferId, TransferRequest, TransferStatus,
};

/// What a full resync rebuilt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResyncSummary {
    pub farms: usize,
    pub active_farms: usize,
    pub settled: bool,
    pub positions: usize,
    /// Positions whose balance could not be re-read
    pub stale_positions: Vec<PositionKey>,
}

pub struct Desk {
    gateway: Arc<dyn ChainGateway>,
    retry: RetryConfig,
    planner: PlannerConfig,
    registry: FarmRegistry,
    executor: RebalanceExecutor,
    tokenization: TokenizationController,
    transfers: TransferCoordinator,
    jobs: HashMap<JobId, RebalanceJob>,
    transfer_requests: HashMap<TransferId, TransferRequest>,
    snapshots: Arc<watch::Sender<RegistrySnapshot>>,
}

impl Desk {
    pub fn new(gateway: Arc<dyn ChainGateway>, config: &AppConfig) -> Self {
        let registry = FarmRegistry::new();
        let (snapshots, _) = watch::channel(registry.snapshot());
        let snapshots = Arc::new(snapshots);

        let executor = RebalanceExecutor::new(gateway.clone(), &config.executor, config.retry.clone())
            .with_snapshots(Arc::clone(&snapshots));
        let tokenization =
            TokenizationController::new(gateway.clone(), &config.executor, config.retry.clone());
        let transfers = TransferCoordinator::new(gateway.clone(), &config.bridge, config.retry.clone());

        Self {
            gateway,
            retry: config.retry.clone(),
            planner: config.planner.clone(),
            registry,
            executor,
            tokenization,
            transfers,
            jobs: HashMap::new(),
            transfer_requests: HashMap::new(),
            snapshots,
        }
    }

    /// Replace the transfer coordinator, e.g. to shorten the bridge timeout
    pub fn with_transfers(mut self, transfers: TransferCoordinator) -> Self {
        self.transfers = transfers;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<RegistrySnapshot> {
        self.snapshots.subscribe()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        self.registry.snapshot()
    }

    pub fn registry(&self) -> &FarmRegistry {
        &self.registry
    }

    pub fn best_farm(&self) -> Option<&Farm> {
        self.registry.best_farm()
    }

    /// Insert or update a farm discovered outside a full resync
    pub fn upsert_farm(&mut self, farm: Farm) -> Result<bool> {
        let discovered = self.registry.upsert(farm)?;
        self.publish();
        Ok(discovered)
    }

    /// Apply a farm list delivered by the APY refresher
    pub fn apply_apy_update(&mut self, farms: Vec<Farm>) -> Result<()> {
        self.registry.sync_from(farms)?;
        self.publish();
        Ok(())
    }

    pub fn plan(&self) -> Result<RebalancePlan> {
        planner::plan(
            self.registry.farms(),
            self.planner.min_change_bps,
            self.planner.max_single_farm_shift_bps,
        )
    }

    pub async fn execute(&mut self, plan: &RebalancePlan) -> Result<RebalanceReport> {
        self.execute_cancellable(plan, &CancelSignal::never()).await
    }

    /// Execute `plan`; the job is kept for `retry_failed` until dismissed
    pub async fn execute_cancellable(
        &mut self,
        plan: &RebalancePlan,
        cancel: &CancelSignal,
    ) -> Result<RebalanceReport> {
        self.ensure_current(plan)?;

        let job = self.executor.execute(plan, &mut self.registry, cancel).await;
        let report = job.report(job.total_submissions);
        info!(
            job_id = %job.job_id,
            progress_pct = report.progress_pct,
            outcome = ?report.outcome,
            "rebalance job finished"
        );
        self.jobs.insert(job.job_id, job);
        Ok(report)
    }

    pub async fn retry_failed(&mut self, job_id: JobId) -> Result<RebalanceReport> {
        let job = self
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| HarvestError::JobNotFound(job_id.to_string()))?;
        Ok(self
            .executor
            .retry_failed(job, &mut self.registry, &CancelSignal::never())
            .await)
    }

    pub fn job(&self, job_id: JobId) -> Option<&RebalanceJob> {
        self.jobs.get(&job_id)
    }

    pub fn dismiss_job(&mut self, job_id: JobId) -> Option<RebalanceJob> {
        self.jobs.remove(&job_id)
    }

    pub async fn request_mint(
        &mut self,
        key: PositionKey,
        amount: Decimal,
    ) -> std::result::Result<MintBurnReceipt, TokenizationError> {
        self.tokenization.request_mint(key, amount).await
    }

    pub async fn request_burn(
        &mut self,
        key: PositionKey,
        amount: Decimal,
    ) -> std::result::Result<MintBurnReceipt, TokenizationError> {
        self.tokenization.request_burn(key, amount).await
    }

    pub fn position(&self, key: &PositionKey) -> Option<&YieldPosition> {
        self.tokenization.position(key)
    }

    /// Start tracking `key` with a fresh balance read
    pub async fn track_position(&mut self, key: &PositionKey) -> Result<YieldPosition> {
        Ok(self.tokenization.resync_position(key).await?)
    }

    pub async fn initiate_transfer(
        &mut self,
        source: ChainId,
        target: ChainId,
        asset: &str,
        amount: Decimal,
        available_balance: Decimal,
    ) -> Result<TransferRequest> {
        let request = self
            .transfers
            .initiate(source, target, asset, amount, available_balance)
            .await?;
        self.transfer_requests.insert(request.id, request.clone());
        Ok(request)
    }

    pub async fn poll_transfer(&mut self, id: TransferId) -> Result<TransferStatus> {
        let request = self
            .transfer_requests
            .get_mut(&id)
            .ok_or_else(|| HarvestError::TransferNotFound(id.to_string()))?;
        Ok(self.transfers.poll(request).await?)
    }

    pub async fn reconcile_transfer(&mut self, id: TransferId) -> Result<ReconcileOutcome> {
        let request = self
            .transfer_requests
            .get_mut(&id)
            .ok_or_else(|| HarvestError::TransferNotFound(id.to_string()))?;
        Ok(self.transfers.reconcile(request).await?)
    }

    pub fn transfer(&self, id: TransferId) -> Option<&TransferRequest> {
        self.transfer_requests.get(&id)
    }

    /// Rebuild the registry and every known position from fresh reads
    pub async fn resync(&mut self) -> Result<ResyncSummary> {
        let farms = call_with_retry(self.gateway.as_ref(), &ReadOp::ListFarms, &self.retry)
            .await?
            .into_farms()?;
        self.registry.sync_from(farms)?;
        self.publish();

        let keys = self.tokenization.known_keys();
        let mut stale_positions = Vec::new();
        for key in &keys {
            if let Err(err) = self.tokenization.resync_position(key).await {
                warn!(%key, %err, "position resync failed");
                stale_positions.push(key.clone());
            }
        }

        let summary = ResyncSummary {
            farms: self.registry.len(),
            active_farms: self.registry.list_active().len(),
            settled: self.registry.is_settled(),
            positions: keys.len(),
            stale_positions,
        };
        info!(
            farms = summary.farms,
            active = summary.active_farms,
            settled = summary.settled,
            positions = summary.positions,
            "resync complete"
        );
        Ok(summary)
    }

    /// A plan is executable only against the registry state it was made from
    fn ensure_current(&self, plan: &RebalancePlan) -> Result<()> {
        let active = self.registry.list_active();
        if active.len() != plan.targets.len() {
            return Err(HarvestError::StalePlan(format!(
                "plan {} covers {} farms, registry has {} active",
                plan.plan_id,
                plan.targets.len(),
                active.len()
            )));
        }

        for target in &plan.targets {
            let farm = self
                .registry
                .get(&target.farm)
                .ok_or_else(|| HarvestError::UnknownFarm(target.farm.to_string()))?;
            if !farm.active || farm.allocation_bps != target.current_bps {
                return Err(HarvestError::StalePlan(format!(
                    "{} is at {} bps, plan assumed {}",
                    farm.id, farm.allocation_bps, target.current_bps
                )));
            }
        }
        Ok(())
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.registry.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::SimulatedGateway;

    fn desk(gateway: Arc<SimulatedGateway>) -> Desk {
        let mut config = AppConfig::default_config();
        config.executor.poll_interval_ms = 1;
        config.retry.min_delay_ms = 1;
        config.retry.max_delay_ms = 2;
        Desk::new(gateway, &config)
    }

    #[tokio::test]
    async fn resync_populates_registry_and_publishes() {
        let gateway = Arc::new(SimulatedGateway::new(vec![
            Farm::new("Aave", 500, 6000),
            Farm::new("Curve", 800, 4000),
        ]));
        let mut desk = desk(gateway);
        let rx = desk.subscribe();
        assert!(rx.borrow().farms.is_empty());

        let summary = desk.resync().await.unwrap();

        assert_eq!(summary.farms, 2);
        assert!(summary.settled);
        assert_eq!(rx.borrow().farms.len(), 2);
        assert_eq!(desk.best_farm().unwrap().id.as_str(), "Curve");
    }

    #[tokio::test]
    async fn stale_plan_is_refused() {
        let gateway = Arc::new(SimulatedGateway::new(vec![
            Farm::new("A", 500, 5000),
            Farm::new("B", 800, 5000),
        ]));
        let mut desk = desk(gateway.clone());
        desk.resync().await.unwrap();
        let plan = desk.plan().unwrap();

        desk.upsert_farm(Farm::new("A", 500, 4000)).unwrap();

        assert!(matches!(
            desk.execute(&plan).await,
            Err(HarvestError::StalePlan(_))
        ));
        assert_eq!(gateway.submit_calls(), 0);
    }

    #[tokio::test]
    async fn unknown_job_and_transfer_are_reported() {
        let mut desk = desk(Arc::new(SimulatedGateway::new(vec![])));

        assert!(matches!(
            desk.retry_failed(JobId::new()).await,
            Err(HarvestError::JobNotFound(_))
        ));
        assert!(matches!(
            desk.poll_transfer(TransferId::new()).await,
            Err(HarvestError::TransferNotFound(_))
        ));
    }

    #[tokio::test]
    async fn plan_on_empty_registry_fails() {
        let desk = desk(Arc::new(SimulatedGateway::new(vec![])));
        assert!(matches!(desk.plan(), Err(HarvestError::EmptyRegistry)));
    }
}
