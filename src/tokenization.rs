//! Position Tokenization Controller
//!
//! Mint and burn requests against yield positions. An amount is reserved
//! synchronously before anything is submitted, so concurrent requests on one
//! position can never overdraw it. After confirmation the balance is re-read
//! from the chain; the controller never computes it locally.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ExecutorConfig, RetryConfig};
use crate::domain::{PositionKey, YieldPosition};
use crate::error::{GatewayError, TokenizationError};
use crate::gateway::{
    await_resolution, call_with_retry, idempotency_key, status_with_retry, ChainGateway,
    FailureReason, OperationHandle, OperationStatus, ReadOp, Resolution, WriteOp,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MintBurnSide {
    Mint,
    Burn,
}

impl MintBurnSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            MintBurnSide::Mint => "mint",
            MintBurnSide::Burn => "burn",
        }
    }
}

impl std::fmt::Display for MintBurnSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-facing classification of a failed mint or burn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    UserRejected,
    InvalidAmount,
    InsufficientBalance,
    Unknown(String),
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::UserRejected => write!(f, "user rejected"),
            FailureKind::InvalidAmount => write!(f, "invalid amount"),
            FailureKind::InsufficientBalance => write!(f, "insufficient balance"),
            FailureKind::Unknown(detail) => write!(f, "unknown: {detail}"),
        }
    }
}

impl From<FailureReason> for FailureKind {
    fn from(reason: FailureReason) -> Self {
        match reason {
            FailureReason::UserRejected => FailureKind::UserRejected,
            FailureReason::RevertedInvalidAmount => FailureKind::InvalidAmount,
            FailureReason::RevertedInsufficientBalance => FailureKind::InsufficientBalance,
            FailureReason::Unknown(detail) => FailureKind::Unknown(detail),
        }
    }
}

impl From<GatewayError> for FailureKind {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Rejected(reason) => reason.into(),
            other => FailureKind::Unknown(other.to_string()),
        }
    }
}

/// A reserved amount awaiting settlement on chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintBurnTicket {
    pub ticket_id: Uuid,
    pub key: PositionKey,
    pub side: MintBurnSide,
    pub amount: Decimal,
}

/// How a ticket ended on chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// `balance` is `None` when the follow-up balance read failed
    Confirmed { balance: Option<Decimal> },
    Failed(FailureKind),
    /// Accepted, but the outcome could not be observed
    Unobserved {
        handle: OperationHandle,
        detail: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementOutcome {
    pub ticket: MintBurnTicket,
    pub settlement: Settlement,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintBurnReceipt {
    pub ticket_id: Uuid,
    pub key: PositionKey,
    pub side: MintBurnSide,
    pub amount: Decimal,
    pub balance: Decimal,
    pub pending: Decimal,
    /// Balance could not be re-read; call `resync_position` before trusting it
    pub stale: bool,
    pub settled_at: DateTime<Utc>,
}

/// Chain-side half of a request; owns everything it needs so it can be spawned
pub struct PendingSettlement {
    gateway: Arc<dyn ChainGateway>,
    ticket: MintBurnTicket,
    poll_interval: Duration,
    retry: RetryConfig,
}

impl PendingSettlement {
    pub fn ticket(&self) -> &MintBurnTicket {
        &self.ticket
    }

    pub async fn run(self) -> SettlementOutcome {
        let settlement = self.settle().await;
        SettlementOutcome {
            ticket: self.ticket,
            settlement,
        }
    }

    async fn settle(&self) -> Settlement {
        let ticket = &self.ticket;
        let op = match ticket.side {
            MintBurnSide::Mint => WriteOp::Mint {
                key: ticket.key.clone(),
                amount: ticket.amount,
            },
            MintBurnSide::Burn => WriteOp::Burn {
                key: ticket.key.clone(),
                amount: ticket.amount,
            },
        };
        let idempotency = idempotency_key(&[&ticket.ticket_id.to_string(), ticket.side.as_str()]);

        let handle = match self.gateway.submit(&op, &idempotency).await {
            Ok(handle) => handle,
            Err(err) => return Settlement::Failed(err.into()),
        };
        debug!(ticket = %ticket.ticket_id, %handle, "mint/burn submitted");

        match await_resolution(self.gateway.as_ref(), &handle, self.poll_interval, &self.retry)
            .await
        {
            Ok(Resolution::Confirmed(_)) => {}
            Ok(Resolution::Failed(reason)) => return Settlement::Failed(reason.into()),
            Err(err) => {
                return Settlement::Unobserved {
                    handle,
                    detail: err.to_string(),
                }
            }
        }

        let read = ReadOp::PositionBalance {
            key: ticket.key.clone(),
        };
        let balance = match call_with_retry(self.gateway.as_ref(), &read, &self.retry)
            .await
            .and_then(|value| value.into_balance())
        {
            Ok(balance) => Some(balance),
            Err(err) => {
                warn!(key = %ticket.key, %err, "balance re-read failed after confirmation");
                None
            }
        };
        Settlement::Confirmed { balance }
    }
}

pub struct TokenizationController {
    gateway: Arc<dyn ChainGateway>,
    poll_interval: Duration,
    retry: RetryConfig,
    positions: HashMap<PositionKey, YieldPosition>,
    reservations: HashMap<Uuid, MintBurnTicket>,
    /// Accepted tickets whose outcome is unknown; their amount stays reserved
    unresolved: HashMap<Uuid, (MintBurnTicket, OperationHandle)>,
}

impl TokenizationController {
    pub fn new(gateway: Arc<dyn ChainGateway>, config: &ExecutorConfig, retry: RetryConfig) -> Self {
        Self {
            gateway,
            poll_interval: config.poll_interval(),
            retry,
            positions: HashMap::new(),
            reservations: HashMap::new(),
            unresolved: HashMap::new(),
        }
    }

    pub fn position(&self, key: &PositionKey) -> Option<&YieldPosition> {
        self.positions.get(key)
    }

    pub fn positions(&self) -> impl Iterator<Item = &YieldPosition> {
        self.positions.values()
    }

    pub fn known_keys(&self) -> Vec<PositionKey> {
        self.positions.keys().cloned().collect()
    }

    /// Reserve `amount` against `key`. Validation happens here, before any I/O.
    pub fn reserve(
        &mut self,
        key: PositionKey,
        side: MintBurnSide,
        amount: Decimal,
    ) -> Result<MintBurnTicket, TokenizationError> {
        if amount <= Decimal::ZERO {
            return Err(TokenizationError::InvalidAmount { amount });
        }

        let position = self
            .positions
            .entry(key.clone())
            .or_insert_with(|| YieldPosition::new(key.clone(), Decimal::ZERO));

        if side == MintBurnSide::Burn && position.available() < amount {
            return Err(TokenizationError::InsufficientBalance {
                available: position.available(),
                requested: amount,
            });
        }

        position.pending += amount;
        let ticket = MintBurnTicket {
            ticket_id: Uuid::new_v4(),
            key,
            side,
            amount,
        };
        info!(
            ticket = %ticket.ticket_id,
            key = %ticket.key,
            side = %side,
            %amount,
            pending = %position.pending,
            "amount reserved"
        );
        self.reservations.insert(ticket.ticket_id, ticket.clone());
        Ok(ticket)
    }

    /// Chain-side work for a reserved ticket
    pub fn settlement(&self, ticket: &MintBurnTicket) -> PendingSettlement {
        PendingSettlement {
            gateway: Arc::clone(&self.gateway),
            ticket: ticket.clone(),
            poll_interval: self.poll_interval,
            retry: self.retry.clone(),
        }
    }

    /// Record the outcome of a ticket.
    ///
    /// The reservation is released on confirmation or an explicit failure. An
    /// unobserved outcome keeps it, since the operation may still land; it is
    /// settled by `resync_position`.
    pub fn complete(
        &mut self,
        outcome: SettlementOutcome,
    ) -> Result<MintBurnReceipt, TokenizationError> {
        let ticket = self
            .reservations
            .remove(&outcome.ticket.ticket_id)
            .ok_or_else(|| TokenizationError::UnknownTicket(outcome.ticket.ticket_id.to_string()))?;

        let position = self
            .positions
            .entry(ticket.key.clone())
            .or_insert_with(|| YieldPosition::new(ticket.key.clone(), Decimal::ZERO));

        match outcome.settlement {
            Settlement::Confirmed { balance } => {
                position.pending = (position.pending - ticket.amount).max(Decimal::ZERO);
                match balance {
                    Some(balance) => {
                        position.balance = balance;
                        position.stale = false;
                    }
                    None => position.stale = true,
                }
                info!(
                    ticket = %ticket.ticket_id,
                    key = %ticket.key,
                    side = %ticket.side,
                    balance = %position.balance,
                    stale = position.stale,
                    "mint/burn confirmed"
                );
                Ok(MintBurnReceipt {
                    ticket_id: ticket.ticket_id,
                    key: ticket.key,
                    side: ticket.side,
                    amount: ticket.amount,
                    balance: position.balance,
                    pending: position.pending,
                    stale: position.stale,
                    settled_at: Utc::now(),
                })
            }
            Settlement::Failed(reason) => {
                position.pending = (position.pending - ticket.amount).max(Decimal::ZERO);
                warn!(ticket = %ticket.ticket_id, key = %ticket.key, %reason, "mint/burn failed");
                Err(TokenizationError::Failed { reason })
            }
            Settlement::Unobserved { handle, detail } => {
                warn!(
                    ticket = %ticket.ticket_id,
                    key = %ticket.key,
                    %handle,
                    %detail,
                    pending = %position.pending,
                    "mint/burn outcome unknown, amount stays reserved"
                );
                position.stale = true;
                self.unresolved.insert(ticket.ticket_id, (ticket, handle));
                Err(TokenizationError::Failed {
                    reason: FailureKind::Unknown(detail),
                })
            }
        }
    }

    pub async fn request_mint(
        &mut self,
        key: PositionKey,
        amount: Decimal,
    ) -> Result<MintBurnReceipt, TokenizationError> {
        self.request(key, MintBurnSide::Mint, amount).await
    }

    pub async fn request_burn(
        &mut self,
        key: PositionKey,
        amount: Decimal,
    ) -> Result<MintBurnReceipt, TokenizationError> {
        self.request(key, MintBurnSide::Burn, amount).await
    }

    async fn request(
        &mut self,
        key: PositionKey,
        side: MintBurnSide,
        amount: Decimal,
    ) -> Result<MintBurnReceipt, TokenizationError> {
        let ticket = self.reserve(key, side, amount)?;
        let outcome = self.settlement(&ticket).run().await;
        self.complete(outcome)
    }

    /// Amount held by tickets whose outcome is still unknown
    pub fn unresolved_amount(&self, key: &PositionKey) -> Decimal {
        self.unresolved
            .values()
            .filter(|(ticket, _)| &ticket.key == key)
            .map(|(ticket, _)| ticket.amount)
            .sum()
    }

    /// Replace the tracked balance with a fresh read.
    ///
    /// Unresolved tickets on `key` are re-checked first and their reservation
    /// is released once the chain reports an outcome. In-flight reservations
    /// are kept, and the position stays stale while any ticket is unresolved.
    pub async fn resync_position(&mut self, key: &PositionKey) -> Result<YieldPosition, GatewayError> {
        let released = self.resolve_unresolved(key).await;
        let position = self
            .positions
            .entry(key.clone())
            .or_insert_with(|| YieldPosition::new(key.clone(), Decimal::ZERO));
        position.pending = (position.pending - released).max(Decimal::ZERO);

        let read = ReadOp::PositionBalance { key: key.clone() };
        let balance = call_with_retry(self.gateway.as_ref(), &read, &self.retry)
            .await?
            .into_balance()?;

        let still_unresolved = self.unresolved_amount(key) > Decimal::ZERO;
        let position = self
            .positions
            .entry(key.clone())
            .or_insert_with(|| YieldPosition::new(key.clone(), Decimal::ZERO));
        position.balance = balance;
        position.stale = still_unresolved;
        debug!(%key, %balance, pending = %position.pending, stale = position.stale, "position resynced");
        Ok(position.clone())
    }

    /// Total amount of unresolved tickets on `key` that have since resolved
    async fn resolve_unresolved(&mut self, key: &PositionKey) -> Decimal {
        let candidates: Vec<(Uuid, OperationHandle)> = self
            .unresolved
            .iter()
            .filter(|(_, (ticket, _))| &ticket.key == key)
            .map(|(id, (_, handle))| (*id, handle.clone()))
            .collect();

        let mut released = Decimal::ZERO;
        for (ticket_id, handle) in candidates {
            match status_with_retry(self.gateway.as_ref(), &handle, &self.retry).await {
                Ok(OperationStatus::Pending) => {
                    debug!(ticket = %ticket_id, %handle, "unresolved mint/burn still pending");
                }
                Ok(status) => {
                    if let Some((ticket, _)) = self.unresolved.remove(&ticket_id) {
                        info!(ticket = %ticket_id, %handle, ?status, "unresolved mint/burn settled");
                        released += ticket.amount;
                    }
                }
                Err(err) => {
                    warn!(ticket = %ticket_id, %handle, %err, "unresolved mint/burn still unobservable");
                }
            }
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TokenKind;
    use crate::gateway::SimulatedGateway;
    use rust_decimal_macros::dec;

    fn key() -> PositionKey {
        PositionKey::new("0xabc", TokenKind::Yield)
    }

    fn controller(gateway: Arc<SimulatedGateway>) -> TokenizationController {
        TokenizationController::new(
            gateway,
            &ExecutorConfig { poll_interval_ms: 1 },
            RetryConfig {
                max_retries: 2,
                min_delay_ms: 1,
                max_delay_ms: 2,
            },
        )
    }

    #[tokio::test]
    async fn confirmed_mint_takes_balance_from_chain() {
        let gateway = Arc::new(SimulatedGateway::new(vec![]).with_balance(key(), dec!(5)));
        let mut controller = controller(gateway.clone());

        let receipt = controller.request_mint(key(), dec!(10)).await.unwrap();

        assert_eq!(receipt.balance, dec!(15));
        assert_eq!(receipt.pending, Decimal::ZERO);
        assert!(!receipt.stale);
        assert_eq!(controller.position(&key()).unwrap().balance, dec!(15));
    }

    #[tokio::test]
    async fn rejected_mint_releases_reservation() {
        let gateway = Arc::new(SimulatedGateway::new(vec![]));
        gateway.reject_next_submission(FailureReason::UserRejected);
        let mut controller = controller(gateway.clone());

        let err = controller.request_mint(key(), dec!(10)).await.unwrap_err();

        assert_eq!(err.reason(), FailureKind::UserRejected);
        let position = controller.position(&key()).unwrap();
        assert_eq!(position.balance, Decimal::ZERO);
        assert_eq!(position.pending, Decimal::ZERO);
    }

    #[tokio::test]
    async fn overdraw_is_rejected_before_any_io() {
        let gateway = Arc::new(SimulatedGateway::new(vec![]).with_balance(key(), dec!(3)));
        let mut controller = controller(gateway.clone());
        controller.resync_position(&key()).await.unwrap();

        let err = controller.request_burn(key(), dec!(4)).await.unwrap_err();

        assert_eq!(
            err,
            TokenizationError::InsufficientBalance {
                available: dec!(3),
                requested: dec!(4)
            }
        );
        assert_eq!(controller.position(&key()).unwrap().pending, Decimal::ZERO);
        assert_eq!(gateway.submit_calls(), 0);
    }

    #[tokio::test]
    async fn non_positive_amounts_are_invalid() {
        let gateway = Arc::new(SimulatedGateway::new(vec![]));
        let mut controller = controller(gateway.clone());

        for amount in [Decimal::ZERO, dec!(-1)] {
            let err = controller.request_mint(key(), amount).await.unwrap_err();
            assert_eq!(err.reason(), FailureKind::InvalidAmount);
        }
        assert_eq!(gateway.submit_calls(), 0);
        assert_eq!(gateway.read_calls(), 0);
    }

    #[tokio::test]
    async fn concurrent_burns_serialize_on_reservation() {
        let gateway = Arc::new(SimulatedGateway::new(vec![]).with_balance(key(), dec!(100)));
        let mut controller = controller(gateway.clone());
        controller.resync_position(&key()).await.unwrap();

        let first = controller
            .reserve(key(), MintBurnSide::Burn, dec!(60))
            .unwrap();
        let second = controller.reserve(key(), MintBurnSide::Burn, dec!(60));
        assert!(matches!(
            second,
            Err(TokenizationError::InsufficientBalance { .. })
        ));
        assert_eq!(controller.position(&key()).unwrap().pending, dec!(60));

        let outcome = tokio::spawn(controller.settlement(&first).run())
            .await
            .unwrap();
        let receipt = controller.complete(outcome).unwrap();

        assert_eq!(receipt.balance, dec!(40));
        assert_eq!(receipt.pending, Decimal::ZERO);
    }

    #[tokio::test]
    async fn on_chain_revert_is_classified() {
        let gateway = Arc::new(SimulatedGateway::new(vec![]).with_balance(key(), dec!(10)));
        gateway.revert_next_submission(FailureReason::RevertedInsufficientBalance);
        let mut controller = controller(gateway.clone());
        controller.resync_position(&key()).await.unwrap();

        let err = controller.request_burn(key(), dec!(5)).await.unwrap_err();

        assert_eq!(err.reason(), FailureKind::InsufficientBalance);
        let position = controller.position(&key()).unwrap();
        assert_eq!(position.balance, dec!(10));
        assert_eq!(position.pending, Decimal::ZERO);
        assert_eq!(gateway.submit_calls(), 1);
    }

    #[tokio::test]
    async fn failed_balance_read_marks_position_stale() {
        let gateway = Arc::new(SimulatedGateway::new(vec![]));
        let mut controller = controller(gateway.clone());
        gateway.fail_next_reads(10);

        let receipt = controller.request_mint(key(), dec!(2)).await.unwrap();
        assert!(receipt.stale);
        assert_eq!(receipt.pending, Decimal::ZERO);

        gateway.fail_next_reads(0);
        let position = controller.resync_position(&key()).await.unwrap();
        assert_eq!(position.balance, dec!(2));
        assert!(!position.stale);
    }

    #[tokio::test]
    async fn unobserved_burn_keeps_reservation_until_resolved() {
        let gateway = Arc::new(SimulatedGateway::new(vec![]).with_balance(key(), dec!(100)));
        let mut controller = controller(gateway.clone());
        controller.resync_position(&key()).await.unwrap();
        gateway.fail_next_status_reads(50);

        let err = controller.request_burn(key(), dec!(60)).await.unwrap_err();
        assert!(matches!(err.reason(), FailureKind::Unknown(_)));

        let position = controller.position(&key()).unwrap();
        assert_eq!(position.pending, dec!(60));
        assert!(position.stale);
        assert_eq!(controller.unresolved_amount(&key()), dec!(60));
        assert!(matches!(
            controller.reserve(key(), MintBurnSide::Burn, dec!(60)),
            Err(TokenizationError::InsufficientBalance { .. })
        ));

        // still unobservable: the reservation survives a resync
        let position = controller.resync_position(&key()).await.unwrap();
        assert_eq!(position.pending, dec!(60));
        assert!(position.stale);

        gateway.fail_next_status_reads(0);
        let position = controller.resync_position(&key()).await.unwrap();
        assert_eq!(position.balance, dec!(40));
        assert_eq!(position.pending, Decimal::ZERO);
        assert!(!position.stale);
        assert_eq!(controller.unresolved_amount(&key()), Decimal::ZERO);
        assert_eq!(gateway.submit_calls(), 1);
    }

    #[test]
    fn completing_unknown_ticket_fails() {
        let gateway = Arc::new(SimulatedGateway::new(vec![]));
        let mut controller = controller(gateway);
        let outcome = SettlementOutcome {
            ticket: MintBurnTicket {
                ticket_id: Uuid::new_v4(),
                key: key(),
                side: MintBurnSide::Mint,
                amount: dec!(1),
            },
            settlement: Settlement::Confirmed { balance: None },
        };

        assert!(matches!(
            controller.complete(outcome),
            Err(TokenizationError::UnknownTicket(_))
        ));
    }
}
