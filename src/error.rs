use crate::domain::Partition;
use rust_decimal::Decimal;
use thiserror::Error;

/// Errors raised by the reconciliation and allocation pipeline.
///
/// Gateway and pool failures follow the payment taxonomy: only
/// `GatewayUnavailable` is transient. A transition attempted against a
/// terminal transaction is not an error and never surfaces here.
#[derive(Error, Debug)]
pub enum PaymentError {
    #[error("Payment gateway unavailable: {0}")]
    GatewayUnavailable(String),
    #[error("Payment gateway rejected the request: {0}")]
    GatewayRejected(String),
    #[error("Amount mismatch: expected {expected}, gateway reported {paid}")]
    AmountMismatch { expected: Decimal, paid: Decimal },
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("No available voucher in partition {0}")]
    PoolExhausted(Partition),
    #[error("Voucher delivery failed: {0}")]
    NotificationFailed(String),
    #[error("Duplicate transaction reference: {0}")]
    DuplicateReference(String),
    #[error("Duplicate voucher code: {0}")]
    DuplicateVoucher(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "storage-rocksdb")]
    #[error("Storage error: {0}")]
    StorageError(#[from] rocksdb::Error),
    #[error("Internal error: {0}")]
    InternalError(Box<dyn std::error::Error + Send + Sync>),
}

impl PaymentError {
    /// Returns `true` when the caller may retry the same operation later
    /// and expect a different outcome.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::GatewayUnavailable(_))
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::InternalError(Box::new(std::io::Error::other(message.into())))
    }
}

impl From<serde_json::Error> for PaymentError {
    fn from(err: serde_json::Error) -> Self {
        Self::InternalError(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, PaymentError>;
