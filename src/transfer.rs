//! Cross-Chain Transfer Coordinator
//!
//! A transfer locks funds on the source chain, waits for the bridge and then
//! for the release on the target chain:
//!
//! ```text
//! Draft -> Submitted -> Bridging -> Completed
//!            |            |
//!            +------------+--> Failed(reason)
//! ```
//!
//! Progress is driven by [`TransferCoordinator::poll`], which never submits
//! anything; the only write is the lock made by
//! [`TransferCoordinator::initiate`].

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{BridgeConfig, RetryConfig};
use crate::domain::ChainId;
use crate::error::{GatewayError, TransferError};
use crate::gateway::{
    call_with_retry, idempotency_key, status_with_retry, ChainGateway, FailureReason,
    OperationHandle, OperationStatus, ReadOp, ReleaseStatus, WriteOp,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(Uuid);

impl TransferId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferFailure {
    /// The source-chain lock was declined before acceptance
    LockRejected(FailureReason),
    /// The source-chain lock failed on chain
    LockFailed(FailureReason),
    ReleaseFailed(FailureReason),
    /// Bridging took longer than the configured timeout; funds may still arrive
    BridgeTimeout,
    /// The lock could not be submitted or observed
    Unavailable(String),
}

impl std::fmt::Display for TransferFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferFailure::LockRejected(reason) => write!(f, "lock rejected ({reason})"),
            TransferFailure::LockFailed(reason) => write!(f, "lock failed ({reason})"),
            TransferFailure::ReleaseFailed(reason) => write!(f, "release failed ({reason})"),
            TransferFailure::BridgeTimeout => write!(f, "bridge timeout"),
            TransferFailure::Unavailable(detail) => write!(f, "unavailable ({detail})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Draft,
    Submitted,
    Bridging,
    Completed,
    Failed(TransferFailure),
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Failed(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            TransferStatus::Draft => "draft",
            TransferStatus::Submitted => "submitted",
            TransferStatus::Bridging => "bridging",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed(_) => "failed",
        }
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferStatus::Failed(failure) => write!(f, "failed: {failure}"),
            other => f.write_str(other.name()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub id: TransferId,
    pub source: ChainId,
    pub target: ChainId,
    pub asset: String,
    pub amount: Decimal,
    pub status: TransferStatus,
    pub lock_handle: Option<OperationHandle>,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub bridging_since: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TransferRequest {
    fn fail(&mut self, failure: TransferFailure) {
        warn!(transfer = %self.id, %failure, "transfer failed");
        self.status = TransferStatus::Failed(failure);
    }

    fn complete(&mut self) {
        info!(transfer = %self.id, target = %self.target, amount = %self.amount, "transfer completed");
        self.status = TransferStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    fn invalid(&self, action: &str) -> TransferError {
        TransferError::InvalidStatus {
            status: self.status.name().to_string(),
            action: action.to_string(),
        }
    }
}

/// Result of re-checking a timed-out transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// The release landed after the timeout
    Completed,
    /// Still in flight; nothing is assumed lost
    Unresolved,
    PermanentlyFailed(FailureReason),
}

pub struct TransferCoordinator {
    gateway: Arc<dyn ChainGateway>,
    bridge_timeout: Duration,
    poll_interval: Duration,
    retry: RetryConfig,
}

impl TransferCoordinator {
    pub fn new(gateway: Arc<dyn ChainGateway>, config: &BridgeConfig, retry: RetryConfig) -> Self {
        Self {
            gateway,
            bridge_timeout: config.timeout(),
            poll_interval: config.poll_interval(),
            retry,
        }
    }

    pub fn with_bridge_timeout(mut self, timeout: Duration) -> Self {
        self.bridge_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Validate and lock funds on the source chain.
    ///
    /// `available_balance` is supplied by the caller. Validation failures
    /// return an error without any gateway I/O; a lock that is rejected comes
    /// back as a request in `Failed` status.
    pub async fn initiate(
        &self,
        source: ChainId,
        target: ChainId,
        asset: impl Into<String>,
        amount: Decimal,
        available_balance: Decimal,
    ) -> Result<TransferRequest, TransferError> {
        if source == target {
            return Err(TransferError::SameChain {
                chain: source.to_string(),
            });
        }
        if amount <= Decimal::ZERO {
            return Err(TransferError::InvalidAmount { amount });
        }
        if available_balance < amount {
            return Err(TransferError::InsufficientBalance {
                chain: source.to_string(),
                available: available_balance,
                requested: amount,
            });
        }

        let mut request = TransferRequest {
            id: TransferId::new(),
            source,
            target,
            asset: asset.into(),
            amount,
            status: TransferStatus::Draft,
            lock_handle: None,
            created_at: Utc::now(),
            submitted_at: None,
            bridging_since: None,
            completed_at: None,
        };

        let op = WriteOp::BridgeLock {
            transfer: request.id,
            source: request.source.clone(),
            target: request.target.clone(),
            asset: request.asset.clone(),
            amount,
        };
        let key = idempotency_key(&[&request.id.to_string(), op.name()]);

        match self.gateway.submit(&op, &key).await {
            Ok(handle) => {
                info!(
                    transfer = %request.id,
                    source = %request.source,
                    target = %request.target,
                    asset = %request.asset,
                    %amount,
                    %handle,
                    "bridge lock submitted"
                );
                request.lock_handle = Some(handle);
                request.submitted_at = Some(Utc::now());
                request.status = TransferStatus::Submitted;
            }
            Err(GatewayError::Rejected(reason)) => {
                request.fail(TransferFailure::LockRejected(reason))
            }
            Err(err) => request.fail(TransferFailure::Unavailable(err.to_string())),
        }
        Ok(request)
    }

    /// Advance `request` as far as the chain currently allows.
    ///
    /// Never submits. Terminal requests are returned unchanged without I/O. A
    /// gateway outage leaves the request untouched so the poll can be repeated.
    pub async fn poll(&self, request: &mut TransferRequest) -> Result<TransferStatus, TransferError> {
        loop {
            match &request.status {
                TransferStatus::Draft => return Err(request.invalid("polled")),
                TransferStatus::Completed | TransferStatus::Failed(_) => {
                    return Ok(request.status.clone())
                }
                TransferStatus::Submitted => {
                    let handle = request
                        .lock_handle
                        .clone()
                        .ok_or_else(|| request.invalid("polled without a lock handle"))?;

                    match status_with_retry(self.gateway.as_ref(), &handle, &self.retry).await? {
                        OperationStatus::Pending => {
                            debug!(transfer = %request.id, "lock pending");
                            return Ok(request.status.clone());
                        }
                        OperationStatus::Confirmed(_) => {
                            info!(transfer = %request.id, "lock confirmed, bridging");
                            request.status = TransferStatus::Bridging;
                            request.bridging_since = Some(Utc::now());
                        }
                        OperationStatus::Failed(reason) => {
                            request.fail(TransferFailure::LockFailed(reason));
                        }
                    }
                }
                TransferStatus::Bridging => {
                    match self.release_status(request.id).await? {
                        Ok(ReleaseStatus::Released) => request.complete(),
                        Ok(ReleaseStatus::Pending) => {
                            if self.bridging_elapsed(request) >= self.bridge_timeout {
                                request.fail(TransferFailure::BridgeTimeout);
                            } else {
                                debug!(transfer = %request.id, "release pending");
                            }
                        }
                        Err(reason) => request.fail(TransferFailure::ReleaseFailed(reason)),
                    }
                    return Ok(request.status.clone());
                }
            }
        }
    }

    /// Poll until the request reaches a terminal status
    pub async fn await_completion(
        &self,
        request: &mut TransferRequest,
    ) -> Result<TransferStatus, TransferError> {
        loop {
            let status = self.poll(request).await?;
            if status.is_terminal() {
                return Ok(status);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Re-check the bridge for a transfer that failed with a timeout
    pub async fn reconcile(
        &self,
        request: &mut TransferRequest,
    ) -> Result<ReconcileOutcome, TransferError> {
        if request.status != TransferStatus::Failed(TransferFailure::BridgeTimeout) {
            return Err(request.invalid("reconciled"));
        }

        let outcome = match self.release_status(request.id).await? {
            Ok(ReleaseStatus::Released) => {
                request.complete();
                ReconcileOutcome::Completed
            }
            Ok(ReleaseStatus::Pending) => ReconcileOutcome::Unresolved,
            Err(reason) => {
                request.fail(TransferFailure::ReleaseFailed(reason.clone()));
                ReconcileOutcome::PermanentlyFailed(reason)
            }
        };
        info!(transfer = %request.id, ?outcome, "transfer reconciled");
        Ok(outcome)
    }

    async fn release_status(
        &self,
        transfer: TransferId,
    ) -> Result<Result<ReleaseStatus, FailureReason>, TransferError> {
        let read = ReadOp::BridgeRelease { transfer };
        let value = call_with_retry(self.gateway.as_ref(), &read, &self.retry).await?;
        Ok(value.into_release()?)
    }

    fn bridging_elapsed(&self, request: &TransferRequest) -> Duration {
        request
            .bridging_since
            .and_then(|since| (Utc::now() - since).to_std().ok())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{MockChainGateway, SimulatedGateway};
    use rust_decimal_macros::dec;

    fn retry() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            min_delay_ms: 1,
            max_delay_ms: 2,
        }
    }

    fn coordinator(gateway: Arc<dyn ChainGateway>) -> TransferCoordinator {
        TransferCoordinator::new(gateway, &BridgeConfig::default(), retry())
            .with_poll_interval(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn same_chain_is_rejected_without_io() {
        // a mock with no expectations panics on any call
        let coordinator = coordinator(Arc::new(MockChainGateway::new()));

        let err = coordinator
            .initiate("avalanche".into(), "Avalanche".into(), "AVAX", dec!(5), dec!(100))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            TransferError::SameChain {
                chain: "avalanche".to_string()
            }
        );
    }

    #[tokio::test]
    async fn amount_and_balance_are_validated_before_io() {
        let coordinator = coordinator(Arc::new(MockChainGateway::new()));

        let err = coordinator
            .initiate("ethereum".into(), "avalanche".into(), "AVAX", dec!(0), dec!(100))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidAmount { .. }));

        let err = coordinator
            .initiate("ethereum".into(), "avalanche".into(), "AVAX", dec!(5), dec!(4))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InsufficientBalance { .. }));
    }

    #[tokio::test]
    async fn transfer_walks_through_every_stage() {
        let gateway = Arc::new(SimulatedGateway::new(vec![]));
        gateway.set_confirmation_polls(1);
        gateway.set_release_reads(1);
        let coordinator = coordinator(gateway.clone());

        let mut request = coordinator
            .initiate("ethereum".into(), "avalanche".into(), "AVAX", dec!(5), dec!(10))
            .await
            .unwrap();
        assert_eq!(request.status, TransferStatus::Submitted);

        assert_eq!(
            coordinator.poll(&mut request).await.unwrap(),
            TransferStatus::Submitted
        );
        assert_eq!(
            coordinator.poll(&mut request).await.unwrap(),
            TransferStatus::Bridging
        );
        assert_eq!(
            coordinator.poll(&mut request).await.unwrap(),
            TransferStatus::Completed
        );
        assert!(request.completed_at.is_some());
        assert_eq!(gateway.submit_calls(), 1);

        let reads = gateway.read_calls();
        coordinator.poll(&mut request).await.unwrap();
        assert_eq!(gateway.read_calls(), reads);
    }

    #[tokio::test]
    async fn rejected_lock_fails_the_request() {
        let gateway = Arc::new(SimulatedGateway::new(vec![]));
        gateway.reject_next_submission(FailureReason::UserRejected);
        let coordinator = coordinator(gateway.clone());

        let request = coordinator
            .initiate("ethereum".into(), "avalanche".into(), "AVAX", dec!(5), dec!(10))
            .await
            .unwrap();

        assert_eq!(
            request.status,
            TransferStatus::Failed(TransferFailure::LockRejected(FailureReason::UserRejected))
        );
        assert!(request.lock_handle.is_none());
    }

    #[tokio::test]
    async fn timed_out_bridge_reconciles_to_completed() {
        let gateway = Arc::new(SimulatedGateway::new(vec![]));
        gateway.set_release_reads(1);
        let coordinator = coordinator(gateway.clone()).with_bridge_timeout(Duration::ZERO);

        let mut request = coordinator
            .initiate("ethereum".into(), "avalanche".into(), "USDC", dec!(5), dec!(10))
            .await
            .unwrap();
        let status = coordinator.poll(&mut request).await.unwrap();
        assert_eq!(status, TransferStatus::Failed(TransferFailure::BridgeTimeout));

        let outcome = coordinator.reconcile(&mut request).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Completed);
        assert_eq!(request.status, TransferStatus::Completed);
        assert_eq!(gateway.submit_calls(), 1);
    }

    #[tokio::test]
    async fn reconcile_keeps_pending_bridge_unresolved() {
        let gateway = Arc::new(SimulatedGateway::new(vec![]));
        gateway.set_release_reads(5);
        let coordinator = coordinator(gateway.clone()).with_bridge_timeout(Duration::ZERO);

        let mut request = coordinator
            .initiate("ethereum".into(), "avalanche".into(), "USDC", dec!(5), dec!(10))
            .await
            .unwrap();
        coordinator.poll(&mut request).await.unwrap();

        let outcome = coordinator.reconcile(&mut request).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Unresolved);
        assert_eq!(
            request.status,
            TransferStatus::Failed(TransferFailure::BridgeTimeout)
        );
    }

    #[tokio::test]
    async fn reconcile_reports_permanent_release_failure() {
        let gateway = Arc::new(SimulatedGateway::new(vec![]));
        gateway.set_release_reads(1);
        gateway.fail_releases(FailureReason::Unknown("relayer dropped message".to_string()));
        let coordinator = coordinator(gateway.clone()).with_bridge_timeout(Duration::ZERO);

        let mut request = coordinator
            .initiate("ethereum".into(), "avalanche".into(), "USDC", dec!(5), dec!(10))
            .await
            .unwrap();
        coordinator.poll(&mut request).await.unwrap();

        let outcome = coordinator.reconcile(&mut request).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::PermanentlyFailed(_)));
        assert!(matches!(
            request.status,
            TransferStatus::Failed(TransferFailure::ReleaseFailed(_))
        ));
    }

    #[tokio::test]
    async fn only_timeouts_can_be_reconciled() {
        let gateway = Arc::new(SimulatedGateway::new(vec![]));
        let coordinator = coordinator(gateway.clone());

        let mut request = coordinator
            .initiate("ethereum".into(), "avalanche".into(), "USDC", dec!(5), dec!(10))
            .await
            .unwrap();

        assert!(matches!(
            coordinator.reconcile(&mut request).await,
            Err(TransferError::InvalidStatus { .. })
        ));
    }

    #[tokio::test]
    async fn outage_during_poll_leaves_request_unchanged() {
        let gateway = Arc::new(SimulatedGateway::new(vec![]));
        let coordinator = coordinator(gateway.clone());

        let mut bridging = coordinator
            .initiate("ethereum".into(), "avalanche".into(), "USDC", dec!(1), dec!(10))
            .await
            .unwrap();
        bridging.status = TransferStatus::Bridging;
        bridging.bridging_since = Some(Utc::now());
        gateway.fail_next_reads(10);

        let err = coordinator.poll(&mut bridging).await.unwrap_err();
        assert!(matches!(err, TransferError::Gateway(_)));
        assert_eq!(bridging.status, TransferStatus::Bridging);
    }

    #[tokio::test]
    async fn await_completion_drives_to_terminal_status() {
        let gateway = Arc::new(SimulatedGateway::new(vec![]));
        gateway.set_confirmation_polls(2);
        gateway.set_release_reads(2);
        let coordinator = coordinator(gateway.clone());

        let mut request = coordinator
            .initiate("ethereum".into(), "avalanche".into(), "AVAX", dec!(5), dec!(10))
            .await
            .unwrap();

        let status = coordinator.await_completion(&mut request).await.unwrap();
        assert_eq!(status, TransferStatus::Completed);
    }
}
