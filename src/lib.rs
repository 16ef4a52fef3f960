pub mod cancel;
pub mod cli;
pub mod config;
pub mod desk;
pub mod domain;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod planner;
pub mod refresher;
pub mod registry;
pub mod telemetry;
pub mod tokenization;
pub mod transfer;

pub use cancel::{cancel_pair, CancelSignal, Canceller};
pub use config::AppConfig;
pub use desk::{Desk, ResyncSummary};
pub use domain::{
    ChainId, Farm, FarmId, PositionKey, TokenKind, YieldPosition, FULL_ALLOCATION_BPS,
};
pub use error::{GatewayError, HarvestError, Result, TokenizationError, TransferError};
pub use executor::{
    EntryFailure, EntryStatus, JobEntry, JobId, JobOutcome, RebalanceExecutor, RebalanceJob,
    RebalanceReport,
};
pub use gateway::{
    ApyQuote, ChainGateway, FailureReason, FarmRecord, GatewayValue, OperationHandle, OperationStatus, ReadOp,
    ReleaseStatus, WriteOp,
};
pub use planner::{plan, PlanTarget, RebalancePlan};
pub use refresher::ApyRefresher;
pub use registry::{FarmRegistry, RegistrySnapshot};
pub use tokenization::{FailureKind, MintBurnReceipt, MintBurnSide, TokenizationController};
pub use transfer::{
    ReconcileOutcome, TransferCoordinator, TransferFailure, TransferId, TransferRequest,
    TransferStatus,
};
