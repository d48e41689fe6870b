use super::ids::{Partition, Reference, VoucherCode};
use super::money::Amount;
use super::transaction::{DeliveryState, ProviderDetails, Resolution, Transaction, Transition};
use super::voucher::{Claim, Voucher, VoucherCredentials};
use crate::error::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;

/// Durable record of payment attempts.
///
/// `transition_to` and `bind_voucher` are each a single conditional write:
/// implementations must apply the domain rule and persist the result
/// without a window in which another caller can interleave.
#[async_trait]
pub trait TransactionLedger: Send + Sync {
    /// Fails with `DuplicateReference` if the reference was ever recorded.
    async fn record_created(&self, tx: Transaction) -> Result<()>;
    async fn get(&self, reference: &Reference) -> Result<Option<Transaction>>;
    /// Moves a pending transaction to `resolution`. Against a terminal
    /// transaction this is a no-op reporting the stored state.
    async fn transition_to(
        &self,
        reference: &Reference,
        resolution: Resolution,
        details: ProviderDetails,
    ) -> Result<Transition>;
    /// Attaches provider identifiers learned outside a transition, such as
    /// the access code returned by charge initialization.
    async fn record_provider_details(
        &self,
        reference: &Reference,
        details: ProviderDetails,
    ) -> Result<()>;
    async fn bind_voucher(&self, reference: &Reference, code: &VoucherCode) -> Result<Transaction>;
    async fn record_delivery(&self, reference: &Reference, delivery: DeliveryState) -> Result<()>;
    /// Looks a transaction up by the id its provider currently knows it by,
    /// for callbacks that do not echo our reference.
    async fn find_by_provider_id(
        &self,
        provider_transaction_id: &str,
    ) -> Result<Option<Transaction>>;
    async fn get_all(&self) -> Result<Vec<Transaction>>;
}

/// The shared pool of allocatable vouchers, partitioned by
/// `(package, distribution point)`.
#[async_trait]
pub trait VoucherStore: Send + Sync {
    /// Fails with `DuplicateVoucher` if the code exists.
    async fn insert(&self, voucher: Voucher) -> Result<()>;
    async fn get(&self, code: &VoucherCode) -> Result<Option<Voucher>>;
    /// Atomically claims one available voucher of `partition` for
    /// `reference`, or returns the voucher the reference already holds.
    /// This is the only path that may set a voucher to `claimed`.
    async fn claim(
        &self,
        partition: Partition,
        reference: &Reference,
        customer_contact: &str,
    ) -> Result<Claim>;
    async fn claimed_by(&self, reference: &Reference) -> Result<Option<Voucher>>;
    async fn count_available(&self, partition: Partition) -> Result<usize>;
}

/// A charge to start with the provider.
#[derive(Debug, Clone)]
pub struct ChargeInstruction {
    pub reference: Reference,
    pub amount: Amount,
    pub payer_contact: String,
    pub metadata: serde_json::Value,
}

/// What the payer is told after a charge starts: a hosted checkout page to
/// open, or a prompt already pushed to their phone.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChargeHandle {
    pub reference: Reference,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip)]
    pub provider_transaction_id: Option<String>,
}

/// How the provider classifies a charge right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderVerdict {
    Settled,
    /// Not settled yet; may still succeed.
    InFlight,
    /// Definitively not going to settle.
    Declined,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verification {
    pub verdict: ProviderVerdict,
    pub paid_amount: Option<Decimal>,
    pub provider_status: String,
    pub provider_receipt: Option<String>,
    pub provider_transaction_id: Option<String>,
}

impl Verification {
    pub fn settled(&self) -> bool {
        self.verdict == ProviderVerdict::Settled
    }

    pub fn details(&self) -> ProviderDetails {
        ProviderDetails {
            provider_status: Some(self.provider_status.clone()),
            provider_transaction_id: self.provider_transaction_id.clone(),
            provider_receipt: self.provider_receipt.clone(),
            paid_amount: self.paid_amount,
        }
    }
}

/// External payment provider.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &str;
    /// Fails with `GatewayUnavailable` on transport errors and
    /// `GatewayRejected` on provider-side validation failures.
    async fn initialize(&self, instruction: &ChargeInstruction) -> Result<ChargeHandle>;
    /// Read-only status query, safe to repeat. Non-success provider states
    /// are reported through the verdict, never as errors. Providers that
    /// track charges by their own id read it from `transaction.provider`.
    async fn verify(&self, transaction: &Transaction) -> Result<Verification>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct VoucherDelivery {
    pub reference: Reference,
    pub recipient: String,
    pub credentials: VoucherCredentials,
}

/// Fire-and-forget delivery of voucher credentials to the payer.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, delivery: &VoucherDelivery) -> Result<()>;
}

pub type TransactionLedgerRef = Arc<dyn TransactionLedger>;
pub type VoucherStoreRef = Arc<dyn VoucherStore>;
pub type PaymentGatewayRef = Arc<dyn PaymentGateway>;
pub type NotifierRef = Arc<dyn Notifier>;
