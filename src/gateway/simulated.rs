//! In-memory chain for dry runs and tests.
//!
//! Operations confirm after a configurable number of status polls and apply
//! their effects (allocation change, balance change, bridge lock) at that
//! moment. Rejections, reverts, unavailable reads or status polls and slow
//! bridge releases can be scripted. Farms are listed with their APY in basis
//! points unless another unit is quoted for them.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

use super::{
    ApyQuote, ChainGateway, FailureReason, FarmRecord, GatewayValue, OperationHandle, OperationStatus, ReadOp,
    ReleaseStatus, WriteOp,
};
use crate::config::DryRunConfig;
use crate::domain::{Farm, FarmId, PositionKey};
use crate::error::GatewayError;
use crate::transfer::TransferId;

struct SimOperation {
    op: WriteOp,
    polls_remaining: u32,
    revert: Option<FailureReason>,
    resolved: Option<OperationStatus>,
}

struct SimBridge {
    reads_until_release: u32,
    failure: Option<FailureReason>,
}

#[derive(Default)]
struct SimState {
    farms: Vec<Farm>,
    quotes: HashMap<FarmId, ApyQuote>,
    balances: HashMap<PositionKey, Decimal>,
    operations: HashMap<OperationHandle, SimOperation>,
    by_idempotency_key: HashMap<String, OperationHandle>,
    bridges: HashMap<TransferId, SimBridge>,
    next_operation: u64,
    confirmation_polls: u32,
    farm_confirmation_polls: HashMap<FarmId, u32>,
    rejected_farms: HashMap<FarmId, FailureReason>,
    reverted_farms: HashMap<FarmId, FailureReason>,
    next_rejections: VecDeque<FailureReason>,
    next_reverts: VecDeque<FailureReason>,
    unavailable_reads: u32,
    unavailable_status_reads: u32,
    release_reads: u32,
    release_failure: Option<FailureReason>,
}

pub struct SimulatedGateway {
    state: Mutex<SimState>,
    submit_calls: AtomicUsize,
    read_calls: AtomicUsize,
}

impl SimulatedGateway {
    pub fn new(farms: Vec<Farm>) -> Self {
        Self {
            state: Mutex::new(SimState {
                farms,
                ..SimState::default()
            }),
            submit_calls: AtomicUsize::new(0),
            read_calls: AtomicUsize::new(0),
        }
    }

    /// Seed from the `[dry_run]` configuration section
    pub fn from_config(config: &DryRunConfig) -> Self {
        let farms = config
            .farms
            .iter()
            .map(|seed| Farm::new(seed.protocol.as_str(), seed.apy_bps, seed.allocation_bps))
            .collect();
        let gateway = Self::new(farms);
        gateway.set_confirmation_polls(config.confirmation_polls);
        gateway.set_release_reads(config.release_polls);
        gateway
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_balance(self, key: PositionKey, balance: Decimal) -> Self {
        self.state().balances.insert(key, balance);
        self
    }

    /// Status polls answered with `Pending` before an operation resolves
    pub fn set_confirmation_polls(&self, polls: u32) {
        self.state().confirmation_polls = polls;
    }

    pub fn set_farm_confirmation_polls(&self, farm: &FarmId, polls: u32) {
        self.state().farm_confirmation_polls.insert(farm.clone(), polls);
    }

    /// Allocation updates for `farm` are declined at submission
    pub fn reject_farm(&self, farm: &FarmId, reason: FailureReason) {
        self.state().rejected_farms.insert(farm.clone(), reason);
    }

    /// Allocation updates for `farm` are accepted, then fail on-chain
    pub fn revert_farm(&self, farm: &FarmId, reason: FailureReason) {
        self.state().reverted_farms.insert(farm.clone(), reason);
    }

    /// Clear scripted rejections and reverts for `farm`
    pub fn allow_farm(&self, farm: &FarmId) {
        let mut state = self.state();
        state.rejected_farms.remove(farm);
        state.reverted_farms.remove(farm);
    }

    /// Decline the next submission, whatever it is
    pub fn reject_next_submission(&self, reason: FailureReason) {
        self.state().next_rejections.push_back(reason);
    }

    /// Accept the next submission, then fail it on-chain
    pub fn revert_next_submission(&self, reason: FailureReason) {
        self.state().next_reverts.push_back(reason);
    }

    /// The next `count` reads fail with `Unavailable`
    pub fn fail_next_reads(&self, count: u32) {
        self.state().unavailable_reads = count;
    }

    /// The next `count` status polls fail with `Unavailable`
    pub fn fail_next_status_reads(&self, count: u32) {
        self.state().unavailable_status_reads = count;
    }

    /// Release reads answered with `Pending` after a bridge lock confirms
    pub fn set_release_reads(&self, reads: u32) {
        self.state().release_reads = reads;
    }

    pub fn fail_releases(&self, reason: FailureReason) {
        self.state().release_failure = Some(reason);
    }

    /// List `farm` with its APY in another unit until the farm is next replaced
    pub fn quote_apy(&self, farm: &FarmId, quote: ApyQuote) {
        self.state().quotes.insert(farm.clone(), quote);
    }

    pub fn set_farm(&self, farm: Farm) {
        let mut state = self.state();
        state.quotes.remove(&farm.id);
        match state.farms.iter_mut().find(|existing| existing.id == farm.id) {
            Some(existing) => *existing = farm,
            None => state.farms.push(farm),
        }
    }

    pub fn farm(&self, id: &FarmId) -> Option<Farm> {
        self.state().farms.iter().find(|farm| &farm.id == id).cloned()
    }

    pub fn balance(&self, key: &PositionKey) -> Decimal {
        self.state()
            .balances
            .get(key)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Every `submit` call received, replays and rejections included
    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn read_calls(&self) -> usize {
        self.read_calls.load(Ordering::SeqCst)
    }

    /// Distinct operations accepted
    pub fn accepted_operations(&self) -> usize {
        self.state().operations.len()
    }
}

impl SimState {
    fn record(&self, farm: &Farm) -> FarmRecord {
        let mut record = FarmRecord::from(farm.clone());
        if let Some(quote) = self.quotes.get(&farm.id) {
            record.apy = quote.clone();
        }
        record
    }

    fn confirmation_polls_for(&self, op: &WriteOp) -> u32 {
        match op {
            WriteOp::SetAllocation { farm, .. } => self
                .farm_confirmation_polls
                .get(farm)
                .copied()
                .unwrap_or(self.confirmation_polls),
            _ => self.confirmation_polls,
        }
    }

    fn rejection_for(&mut self, op: &WriteOp) -> Option<FailureReason> {
        if let Some(reason) = self.next_rejections.pop_front() {
            return Some(reason);
        }
        match op {
            WriteOp::SetAllocation { farm, .. } => self.rejected_farms.get(farm).cloned(),
            _ => None,
        }
    }

    fn revert_for(&mut self, op: &WriteOp) -> Option<FailureReason> {
        if let Some(reason) = self.next_reverts.pop_front() {
            return Some(reason);
        }
        match op {
            WriteOp::SetAllocation { farm, .. } => self.reverted_farms.get(farm).cloned(),
            _ => None,
        }
    }

    /// Apply a confirmed write, or report the revert the chain would produce
    fn apply(&mut self, op: &WriteOp) -> OperationStatus {
        match op {
            WriteOp::SetAllocation {
                farm,
                allocation_bps,
            } => match self.farms.iter_mut().find(|existing| &existing.id == farm) {
                Some(existing) => {
                    existing.allocation_bps = *allocation_bps;
                    OperationStatus::Confirmed(GatewayValue::Unit)
                }
                None => OperationStatus::Failed(FailureReason::Unknown(format!(
                    "unknown farm {farm}"
                ))),
            },
            WriteOp::Mint { key, amount } => {
                if *amount <= Decimal::ZERO {
                    return OperationStatus::Failed(FailureReason::RevertedInvalidAmount);
                }
                let balance = self.balances.entry(key.clone()).or_insert(Decimal::ZERO);
                *balance += *amount;
                OperationStatus::Confirmed(GatewayValue::Balance(*balance))
            }
            WriteOp::Burn { key, amount } => {
                if *amount <= Decimal::ZERO {
                    return OperationStatus::Failed(FailureReason::RevertedInvalidAmount);
                }
                let balance = self.balances.entry(key.clone()).or_insert(Decimal::ZERO);
                if *balance < *amount {
                    return OperationStatus::Failed(FailureReason::RevertedInsufficientBalance);
                }
                *balance -= *amount;
                OperationStatus::Confirmed(GatewayValue::Balance(*balance))
            }
            WriteOp::BridgeLock { transfer, .. } => {
                self.bridges.insert(
                    *transfer,
                    SimBridge {
                        reads_until_release: self.release_reads,
                        failure: self.release_failure.clone(),
                    },
                );
                OperationStatus::Confirmed(GatewayValue::Unit)
            }
        }
    }

    fn release_status(&mut self, transfer: &TransferId) -> GatewayValue {
        match self.bridges.get_mut(transfer) {
            None => GatewayValue::Release(ReleaseStatus::Pending),
            Some(bridge) if bridge.reads_until_release > 0 => {
                bridge.reads_until_release -= 1;
                GatewayValue::Release(ReleaseStatus::Pending)
            }
            Some(bridge) => match &bridge.failure {
                Some(reason) => GatewayValue::ReleaseFailed(reason.clone()),
                None => GatewayValue::Release(ReleaseStatus::Released),
            },
        }
    }
}

#[async_trait]
impl ChainGateway for SimulatedGateway {
    async fn call(&self, op: &ReadOp) -> Result<GatewayValue, GatewayError> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();

        if state.unavailable_reads > 0 {
            state.unavailable_reads -= 1;
            return Err(GatewayError::Unavailable("simulated outage".to_string()));
        }

        match op {
            ReadOp::ListFarms => Ok(GatewayValue::Farms(
                state.farms.iter().map(|farm| state.record(farm)).collect(),
            )),
            ReadOp::FarmState { farm } => state
                .farms
                .iter()
                .find(|existing| &existing.id == farm)
                .map(|existing| GatewayValue::Farm(state.record(existing)))
                .ok_or_else(|| {
                    GatewayError::Rejected(FailureReason::Unknown(format!("unknown farm {farm}")))
                }),
            ReadOp::PositionBalance { key } => Ok(GatewayValue::Balance(
                state.balances.get(key).copied().unwrap_or(Decimal::ZERO),
            )),
            ReadOp::BridgeRelease { transfer } => Ok(state.release_status(transfer)),
        }
    }

    async fn submit(
        &self,
        op: &WriteOp,
        idempotency_key: &str,
    ) -> Result<OperationHandle, GatewayError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();

        if let Some(handle) = state.by_idempotency_key.get(idempotency_key) {
            debug!(%handle, "replayed submission");
            return Ok(handle.clone());
        }

        if let Some(reason) = state.rejection_for(op) {
            info!(operation = op.name(), %reason, "simulated rejection");
            return Err(GatewayError::Rejected(reason));
        }

        state.next_operation += 1;
        let handle = OperationHandle::new(format!("sim-{}", state.next_operation));
        let polls_remaining = state.confirmation_polls_for(op);
        let revert = state.revert_for(op);

        state
            .by_idempotency_key
            .insert(idempotency_key.to_string(), handle.clone());
        state.operations.insert(
            handle.clone(),
            SimOperation {
                op: op.clone(),
                polls_remaining,
                revert,
                resolved: None,
            },
        );
        debug!(%handle, operation = op.name(), "simulated operation accepted");
        Ok(handle)
    }

    async fn operation_status(
        &self,
        handle: &OperationHandle,
    ) -> Result<OperationStatus, GatewayError> {
        let mut state = self.state();

        if state.unavailable_status_reads > 0 {
            state.unavailable_status_reads -= 1;
            return Err(GatewayError::Unavailable("simulated outage".to_string()));
        }

        let (op, revert) = {
            let operation = state.operations.get_mut(handle).ok_or_else(|| {
                GatewayError::Rejected(FailureReason::Unknown(format!(
                    "unknown operation {handle}"
                )))
            })?;

            if let Some(resolved) = &operation.resolved {
                return Ok(resolved.clone());
            }
            if operation.polls_remaining > 0 {
                operation.polls_remaining -= 1;
                return Ok(OperationStatus::Pending);
            }
            (operation.op.clone(), operation.revert.take())
        };

        let status = match revert {
            Some(reason) => OperationStatus::Failed(reason),
            None => state.apply(&op),
        };

        if let Some(operation) = state.operations.get_mut(handle) {
            operation.resolved = Some(status.clone());
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TokenKind;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn allocation_applies_on_confirmation() {
        let gateway = SimulatedGateway::new(vec![Farm::new("Aave", 500, 10_000)]);
        gateway.set_confirmation_polls(1);

        let op = WriteOp::SetAllocation {
            farm: "Aave".into(),
            allocation_bps: 4000,
        };
        let handle = gateway.submit(&op, "k1").await.unwrap();

        assert_eq!(
            gateway.operation_status(&handle).await.unwrap(),
            OperationStatus::Pending
        );
        assert_eq!(gateway.farm(&"Aave".into()).unwrap().allocation_bps, 10_000);

        assert_eq!(
            gateway.operation_status(&handle).await.unwrap(),
            OperationStatus::Confirmed(GatewayValue::Unit)
        );
        assert_eq!(gateway.farm(&"Aave".into()).unwrap().allocation_bps, 4000);
    }

    #[tokio::test]
    async fn replayed_key_returns_original_handle() {
        let gateway = SimulatedGateway::new(vec![]);
        let key = PositionKey::new("0xabc", TokenKind::Yield);
        let op = WriteOp::Mint {
            key: key.clone(),
            amount: dec!(5),
        };

        let first = gateway.submit(&op, "same").await.unwrap();
        let second = gateway.submit(&op, "same").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(gateway.accepted_operations(), 1);
        assert_eq!(gateway.submit_calls(), 2);

        gateway.operation_status(&first).await.unwrap();
        gateway.operation_status(&first).await.unwrap();
        assert_eq!(gateway.balance(&key), dec!(5));
    }

    #[tokio::test]
    async fn burn_beyond_balance_reverts() {
        let key = PositionKey::new("0xabc", TokenKind::Principal);
        let gateway = SimulatedGateway::new(vec![]).with_balance(key.clone(), dec!(3));

        let handle = gateway
            .submit(
                &WriteOp::Burn {
                    key: key.clone(),
                    amount: dec!(4),
                },
                "burn",
            )
            .await
            .unwrap();

        assert_eq!(
            gateway.operation_status(&handle).await.unwrap(),
            OperationStatus::Failed(FailureReason::RevertedInsufficientBalance)
        );
        assert_eq!(gateway.balance(&key), dec!(3));
    }
}
