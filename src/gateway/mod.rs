//! Chain Gateway capability
//!
//! The core never talks to a chain directly. Reads go through [`ChainGateway::call`],
//! writes through [`ChainGateway::submit`], which returns as soon as the operation
//! is accepted; its outcome is observed with [`ChainGateway::operation_status`].

pub mod simulated;

use async_trait::async_trait;
use backon::Retryable;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::domain::{ChainId, Farm, FarmId, PositionKey};
use crate::error::GatewayError;
use crate::registry::apy;
use crate::transfer::TransferId;

pub use simulated::SimulatedGateway;

/// Why an operation did not go through
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The signer declined the action
    UserRejected,
    RevertedInvalidAmount,
    RevertedInsufficientBalance,
    Unknown(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::UserRejected => write!(f, "user rejected"),
            FailureReason::RevertedInvalidAmount => write!(f, "reverted: invalid amount"),
            FailureReason::RevertedInsufficientBalance => {
                write!(f, "reverted: insufficient balance")
            }
            FailureReason::Unknown(detail) => write!(f, "unknown: {detail}"),
        }
    }
}

/// APY in the unit its data source reports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "unit", content = "value")]
pub enum ApyQuote {
    Bps(u32),
    /// `7.5` for 7.5%
    Percent(Decimal),
    /// `0.075` for 7.5%
    Fraction(Decimal),
    /// Annual lending rate that compounds daily
    DailyCompounded(Decimal),
}

impl ApyQuote {
    pub fn to_bps(&self) -> crate::error::Result<u32> {
        match self {
            ApyQuote::Bps(bps) => Ok(*bps),
            ApyQuote::Percent(percent) => apy::from_percent(*percent),
            ApyQuote::Fraction(fraction) => apy::from_fraction(*fraction),
            ApyQuote::DailyCompounded(rate) => apy::from_daily_compounded_rate(*rate),
        }
    }
}

/// A farm as the gateway lists it, before unit conversion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FarmRecord {
    pub id: FarmId,
    pub apy: ApyQuote,
    pub allocation_bps: u32,
    pub active: bool,
}

impl FarmRecord {
    pub fn into_farm(self) -> Result<Farm, GatewayError> {
        let apy_bps = self
            .apy
            .to_bps()
            .map_err(|err| GatewayError::InvalidQuote {
                farm: self.id.to_string(),
                detail: err.to_string(),
            })?;
        Ok(Farm {
            id: self.id,
            apy_bps,
            allocation_bps: self.allocation_bps,
            active: self.active,
        })
    }
}

impl From<Farm> for FarmRecord {
    fn from(farm: Farm) -> Self {
        Self {
            id: farm.id,
            apy: ApyQuote::Bps(farm.apy_bps),
            allocation_bps: farm.allocation_bps,
            active: farm.active,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadOp {
    ListFarms,
    FarmState { farm: FarmId },
    PositionBalance { key: PositionKey },
    /// Status of the target-chain release for a bridged transfer
    BridgeRelease { transfer: TransferId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOp {
    SetAllocation {
        farm: FarmId,
        allocation_bps: u32,
    },
    Mint {
        key: PositionKey,
        amount: Decimal,
    },
    Burn {
        key: PositionKey,
        amount: Decimal,
    },
    /// Lock (or burn) on the source chain; the bridge releases on the target
    BridgeLock {
        transfer: TransferId,
        source: ChainId,
        target: ChainId,
        asset: String,
        amount: Decimal,
    },
}

impl WriteOp {
    pub fn name(&self) -> &'static str {
        match self {
            WriteOp::SetAllocation { .. } => "set_allocation",
            WriteOp::Mint { .. } => "mint",
            WriteOp::Burn { .. } => "burn",
            WriteOp::BridgeLock { .. } => "bridge_lock",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    Pending,
    Released,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayValue {
    Farms(Vec<FarmRecord>),
    Farm(FarmRecord),
    Balance(Decimal),
    Release(ReleaseStatus),
    /// Release reported as failed by the bridge
    ReleaseFailed(FailureReason),
    Unit,
}

impl GatewayValue {
    fn kind(&self) -> &'static str {
        match self {
            GatewayValue::Farms(_) => "farms",
            GatewayValue::Farm(_) => "farm",
            GatewayValue::Balance(_) => "balance",
            GatewayValue::Release(_) => "release",
            GatewayValue::ReleaseFailed(_) => "release_failed",
            GatewayValue::Unit => "unit",
        }
    }

    fn unexpected(self, expected: &str) -> GatewayError {
        GatewayError::UnexpectedResponse {
            expected: expected.to_string(),
            actual: self.kind().to_string(),
        }
    }

    /// Farm list with every APY converted to basis points
    pub fn into_farms(self) -> Result<Vec<Farm>, GatewayError> {
        match self {
            GatewayValue::Farms(records) => {
                records.into_iter().map(FarmRecord::into_farm).collect()
            }
            other => Err(other.unexpected("farms")),
        }
    }

    pub fn into_balance(self) -> Result<Decimal, GatewayError> {
        match self {
            GatewayValue::Balance(balance) => Ok(balance),
            other => Err(other.unexpected("balance")),
        }
    }

    pub fn into_release(self) -> Result<Result<ReleaseStatus, FailureReason>, GatewayError> {
        match self {
            GatewayValue::Release(status) => Ok(Ok(status)),
            GatewayValue::ReleaseFailed(reason) => Ok(Err(reason)),
            other => Err(other.unexpected("release")),
        }
    }
}

/// Reference to an accepted write operation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationHandle(String);

impl OperationHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OperationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    Pending,
    Confirmed(GatewayValue),
    Failed(FailureReason),
}

/// Terminal state of a submitted operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Confirmed(GatewayValue),
    Failed(FailureReason),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainGateway: Send + Sync {
    async fn call(&self, op: &ReadOp) -> Result<GatewayValue, GatewayError>;

    /// Returns once the operation is accepted (or rejected); never waits for confirmation.
    ///
    /// Gateways should treat a repeated `idempotency_key` as a replay of the
    /// same operation and return the original handle.
    async fn submit(
        &self,
        op: &WriteOp,
        idempotency_key: &str,
    ) -> Result<OperationHandle, GatewayError>;

    async fn operation_status(
        &self,
        handle: &OperationHandle,
    ) -> Result<OperationStatus, GatewayError>;
}

/// Deterministic key for a write so replays of the same intent can be de-duplicated
pub fn idempotency_key(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Read with exponential backoff on transient unavailability.
///
/// Rejections and malformed responses are returned immediately.
pub async fn call_with_retry(
    gateway: &dyn ChainGateway,
    op: &ReadOp,
    retry: &RetryConfig,
) -> Result<GatewayValue, GatewayError> {
    (|| async move { gateway.call(op).await })
        .retry(retry.backoff())
        .when(GatewayError::is_transient)
        .notify(|err: &GatewayError, delay: Duration| {
            warn!(?op, %err, ?delay, "gateway read unavailable, retrying");
        })
        .await
}

/// Single status read of a submitted operation, retried on transient unavailability
pub async fn status_with_retry(
    gateway: &dyn ChainGateway,
    handle: &OperationHandle,
    retry: &RetryConfig,
) -> Result<OperationStatus, GatewayError> {
    (|| async move { gateway.operation_status(handle).await })
        .retry(retry.backoff())
        .when(GatewayError::is_transient)
        .notify(|err: &GatewayError, delay: Duration| {
            warn!(%handle, %err, ?delay, "operation status unavailable, retrying");
        })
        .await
}

/// Poll a submitted operation until it resolves.
///
/// Status reads are retried with backoff; an exhausted retry budget surfaces
/// as `Unavailable` and never triggers a re-submission.
pub async fn await_resolution(
    gateway: &dyn ChainGateway,
    handle: &OperationHandle,
    poll_interval: Duration,
    retry: &RetryConfig,
) -> Result<Resolution, GatewayError> {
    loop {
        match status_with_retry(gateway, handle, retry).await? {
            OperationStatus::Pending => {
                debug!(%handle, "operation pending");
                tokio::time::sleep(poll_interval).await;
            }
            OperationStatus::Confirmed(value) => return Ok(Resolution::Confirmed(value)),
            OperationStatus::Failed(reason) => return Ok(Resolution::Failed(reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TokenKind;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            min_delay_ms: 1,
            max_delay_ms: 5,
        }
    }

    #[test]
    fn idempotency_key_is_deterministic_and_separated() {
        let a = idempotency_key(&["job", "Aave", "2000"]);
        let b = idempotency_key(&["job", "Aave", "2000"]);
        let c = idempotency_key(&["jobAave", "2000"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn value_accessors_reject_wrong_variant() {
        assert_eq!(
            GatewayValue::Balance(dec!(5)).into_balance().unwrap(),
            dec!(5)
        );
        assert!(matches!(
            GatewayValue::Unit.into_farms(),
            Err(GatewayError::UnexpectedResponse { .. })
        ));
    }

    fn record(id: &str, apy: ApyQuote) -> FarmRecord {
        FarmRecord {
            id: id.into(),
            apy,
            allocation_bps: 5000,
            active: true,
        }
    }

    #[test]
    fn listed_apys_are_converted_to_bps() {
        let farms = GatewayValue::Farms(vec![
            record("Aave", ApyQuote::Percent(dec!(7.5))),
            record("Compound", ApyQuote::Fraction(dec!(0.042))),
            record("Venus", ApyQuote::DailyCompounded(dec!(0.05))),
            record("Curve", ApyQuote::Bps(800)),
        ])
        .into_farms()
        .unwrap();

        let apys: Vec<u32> = farms.iter().map(|farm| farm.apy_bps).collect();
        assert_eq!(apys, vec![750, 420, 513, 800]);
        assert_eq!(farms[0].allocation_bps, 5000);
    }

    #[test]
    fn unconvertible_quote_fails_the_whole_list() {
        let result = GatewayValue::Farms(vec![
            record("Aave", ApyQuote::Percent(dec!(7.5))),
            record("Compound", ApyQuote::Percent(dec!(-1))),
        ])
        .into_farms();

        match result {
            Err(GatewayError::InvalidQuote { farm, .. }) => assert_eq!(farm, "Compound"),
            other => panic!("expected invalid quote, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reads_retry_transient_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = attempts.clone();

        let mut gateway = MockChainGateway::new();
        gateway.expect_call().times(3).returning(move |_| {
            if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(GatewayError::Unavailable("rpc timeout".to_string()))
            } else {
                Ok(GatewayValue::Balance(dec!(42)))
            }
        });

        let op = ReadOp::PositionBalance {
            key: PositionKey::new("0xabc", TokenKind::Yield),
        };
        let value = call_with_retry(&gateway, &op, &fast_retry()).await.unwrap();

        assert_eq!(value, GatewayValue::Balance(dec!(42)));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn reads_do_not_retry_rejections() {
        let mut gateway = MockChainGateway::new();
        gateway
            .expect_call()
            .times(1)
            .returning(|_| Err(GatewayError::Rejected(FailureReason::UserRejected)));

        let result = call_with_retry(&gateway, &ReadOp::ListFarms, &fast_retry()).await;
        assert_eq!(
            result,
            Err(GatewayError::Rejected(FailureReason::UserRejected))
        );
    }

    #[tokio::test]
    async fn resolution_waits_out_pending_polls() {
        let polls = Arc::new(AtomicUsize::new(0));
        let seen = polls.clone();

        let mut gateway = MockChainGateway::new();
        gateway.expect_operation_status().returning(move |_| {
            if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                Ok(OperationStatus::Pending)
            } else {
                Ok(OperationStatus::Failed(FailureReason::RevertedInvalidAmount))
            }
        });

        let resolution = await_resolution(
            &gateway,
            &OperationHandle::new("op-1"),
            Duration::from_millis(1),
            &fast_retry(),
        )
        .await
        .unwrap();

        assert_eq!(
            resolution,
            Resolution::Failed(FailureReason::RevertedInvalidAmount)
        );
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }
}
