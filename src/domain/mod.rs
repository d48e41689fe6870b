//! Domain model for payment confirmation and voucher allocation.
//!
//! Entities here carry the state-machine rules; the stores in
//! `infrastructure` are responsible for applying them atomically.

pub mod ids;
pub mod money;
pub mod ports;
pub mod transaction;
pub mod voucher;

pub use ids::{DistributionPointId, PackageId, Partition, Reference, ResellerId, VoucherCode};
pub use money::Amount;
pub use transaction::{
    ChargeRequest, DeliveryState, FailureReason, ProviderDetails, Resolution, Transaction,
    TransactionState, Transition,
};
pub use voucher::{Claim, Voucher, VoucherCredentials, VoucherStatus};
