use crate::domain::dispute::DisputeStatus;
use crate::domain::ledger::EntryId;
use crate::domain::order::{EscrowStatus, EligibilityStatus};
use crate::domain::payout::PayoutStatus;
use crate::domain::seller::RiskStatus;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, SettlementError>;

/// Coarse classification used by handlers to pick a response and a retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    InvalidState,
    InsufficientFunds,
    InvariantViolation,
    Gateway,
    CriticalDrift,
    Internal,
}

impl ErrorKind {
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::InvalidState => 409,
            ErrorKind::InsufficientFunds => 402,
            ErrorKind::Gateway => 502,
            ErrorKind::InvariantViolation | ErrorKind::CriticalDrift | ErrorKind::Internal => 500,
        }
    }
}

#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Order not found: {0}")]
    OrderNotFound(String),
    #[error("Seller not found: {0}")]
    SellerNotFound(String),
    #[error("Payout not found: {0}")]
    PayoutNotFound(Uuid),
    #[error("Order {order_id} has no gateway payment reference")]
    MissingPaymentReference { order_id: String },
    #[error("Order {order_id} escrow is {status:?}, expected Held")]
    InvalidEscrowStatus { order_id: String, status: EscrowStatus },
    #[error("Order {order_id} is already {status:?}")]
    AlreadyEligible {
        order_id: String,
        status: EligibilityStatus,
    },
    #[error("Seller {seller_id} has risk status {status:?}, force release requires Active")]
    SellerStatusBlocked { seller_id: String, status: RiskStatus },
    #[error("Order {order_id} has no open dispute (found {status:?})")]
    NoOpenDispute {
        order_id: String,
        status: Option<DisputeStatus>,
    },
    #[error("Payout for order {order_id} is already {status:?}")]
    PayoutAlreadyActiveOrDone { order_id: String, status: PayoutStatus },
    #[error("Ledger entry {0} already exists and cannot be modified")]
    ImmutableEntry(EntryId),
    #[error("Ledger entry with external id {0} already exists")]
    DuplicateExternalId(String),
    #[error("Insufficient funds: available {available}, required {required}")]
    InsufficientFunds { available: i64, required: i64 },
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
    #[error("Gateway error: {0}")]
    GatewayError(String),
    #[error("Payout reservation failed: {0}")]
    PhaseAFailed(#[source] Box<SettlementError>),
    #[error(
        "Recording {context} failed after gateway operation {external_ref} succeeded; manual reconciliation required: {source}"
    )]
    CriticalDrift {
        context: String,
        external_ref: String,
        #[source]
        source: Box<SettlementError>,
    },
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[cfg(feature = "storage-rocksdb")]
    #[error("RocksDB error: {0}")]
    RocksDbError(#[from] rocksdb::Error),
    #[error("Internal error: {0}")]
    InternalError(Box<dyn std::error::Error + Send + Sync>),
}

impl SettlementError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SettlementError::ValidationError(_)
            | SettlementError::MissingPaymentReference { .. }
            | SettlementError::CsvError(_) => ErrorKind::Validation,
            SettlementError::OrderNotFound(_)
            | SettlementError::SellerNotFound(_)
            | SettlementError::PayoutNotFound(_) => ErrorKind::NotFound,
            SettlementError::InvalidEscrowStatus { .. }
            | SettlementError::AlreadyEligible { .. }
            | SettlementError::SellerStatusBlocked { .. }
            | SettlementError::NoOpenDispute { .. }
            | SettlementError::PayoutAlreadyActiveOrDone { .. }
            | SettlementError::ImmutableEntry(_)
            | SettlementError::DuplicateExternalId(_) => ErrorKind::InvalidState,
            SettlementError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            SettlementError::InvariantViolation(_) => ErrorKind::InvariantViolation,
            SettlementError::GatewayError(_) => ErrorKind::Gateway,
            SettlementError::CriticalDrift { .. } => ErrorKind::CriticalDrift,
            SettlementError::PhaseAFailed(inner) => inner.kind(),
            SettlementError::IoError(_)
            | SettlementError::SerializationError(_)
            | SettlementError::InternalError(_) => ErrorKind::Internal,
            #[cfg(feature = "storage-rocksdb")]
            SettlementError::RocksDbError(_) => ErrorKind::Internal,
        }
    }

    /// Whether the caller may retry. Gateway failures are retried through a new
    /// payout attempt, never by replaying the same attempt key.
    pub fn is_retryable(&self) -> bool {
        match self {
            SettlementError::PhaseAFailed(inner) => inner.kind() == ErrorKind::Internal,
            other => matches!(other.kind(), ErrorKind::Gateway | ErrorKind::Internal),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        SettlementError::InternalError(Box::new(std::io::Error::other(message.into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let err = SettlementError::InvalidEscrowStatus {
            order_id: "ord_1".to_string(),
            status: EscrowStatus::Released,
        };
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(err.kind().http_status(), 409);
        assert!(!err.is_retryable());

        let err = SettlementError::GatewayError("card_declined".to_string());
        assert_eq!(err.kind().http_status(), 502);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_phase_a_failure_inherits_kind() {
        let err = SettlementError::PhaseAFailed(Box::new(SettlementError::internal("disk full")));
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.is_retryable());

        let err = SettlementError::PhaseAFailed(Box::new(SettlementError::ValidationError(
            "bad metadata".to_string(),
        )));
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_drift_is_never_retryable() {
        let err = SettlementError::CriticalDrift {
            context: format!("payout {}", Uuid::new_v4()),
            external_ref: "tr_1".to_string(),
            source: Box::new(SettlementError::internal("commit failed")),
        };
        assert_eq!(err.kind(), ErrorKind::CriticalDrift);
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("manual reconciliation"));
    }
}
