use rust_decimal::Decimal;
use thiserror::Error;

use crate::gateway::FailureReason;
use crate::tokenization::FailureKind;

/// Main error type for the allocation core
#[derive(Error, Debug)]
pub enum HarvestError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Validation errors (caught before any gateway I/O)
    #[error("Registry has no active farms")]
    EmptyRegistry,

    #[error("Unknown farm: {0}")]
    UnknownFarm(String),

    #[error("Invalid allocation: {0}")]
    InvalidAllocation(String),

    #[error("Plan is stale: {0}")]
    StalePlan(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    // Component errors
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Tokenization error: {0}")]
    Tokenization(#[from] TokenizationError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    // Lookup errors
    #[error("Rebalance job not found: {0}")]
    JobNotFound(String),

    #[error("Transfer not found: {0}")]
    TransferNotFound(String),
}

/// Result type alias for HarvestError
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Errors raised by a chain gateway before or while observing an operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Gateway could not be reached; reads may be retried, writes never
    #[error("Gateway unavailable: {0}")]
    Unavailable(String),

    /// Gateway declined the request before accepting it
    #[error("Gateway rejected request: {0}")]
    Rejected(FailureReason),

    #[error("Unexpected gateway response: expected {expected}, got {actual}")]
    UnexpectedResponse { expected: String, actual: String },

    /// A listed APY could not be converted to basis points
    #[error("Invalid APY quote for {farm}: {detail}")]
    InvalidQuote { farm: String, detail: String },
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Unavailable(_))
    }
}

/// Errors for mint/burn requests against a yield position
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenizationError {
    #[error("Invalid amount: {amount}")]
    InvalidAmount { amount: Decimal },

    #[error("Insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance {
        available: Decimal,
        requested: Decimal,
    },

    #[error("Operation failed: {reason}")]
    Failed { reason: FailureKind },

    #[error("Unknown ticket: {0}")]
    UnknownTicket(String),
}

impl TokenizationError {
    /// Classify this error for user-facing reporting
    pub fn reason(&self) -> FailureKind {
        match self {
            TokenizationError::InvalidAmount { .. } => FailureKind::InvalidAmount,
            TokenizationError::InsufficientBalance { .. } => FailureKind::InsufficientBalance,
            TokenizationError::Failed { reason } => reason.clone(),
            TokenizationError::UnknownTicket(ticket) => {
                FailureKind::Unknown(format!("unknown ticket {ticket}"))
            }
        }
    }
}

/// Validation and lifecycle errors for cross-chain transfers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("Source and target chain are the same: {chain}")]
    SameChain { chain: String },

    #[error("Invalid amount: {amount}")]
    InvalidAmount { amount: Decimal },

    #[error("Insufficient balance on {chain}: available {available}, requested {requested}")]
    InsufficientBalance {
        chain: String,
        available: Decimal,
        requested: Decimal,
    },

    #[error("Transfer in status {status} cannot be {action}")]
    InvalidStatus { status: String, action: String },

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),
}
