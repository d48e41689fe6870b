use super::ids::{DistributionPointId, PackageId, Partition, Reference, ResellerId, VoucherCode};
use super::money::Amount;
use crate::error::{PaymentError, Result};
use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The provider reported a definitive non-success status.
    GatewayRejected,
    /// Paid amount differs from the requested amount. Flagged for audit.
    AmountMismatch,
    /// Still unsettled when the pending window elapsed.
    Expired,
    /// The charge could not be started with the provider.
    InitializationFailed,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GatewayRejected => "gateway_rejected",
            Self::AmountMismatch => "amount_mismatch",
            Self::Expired => "expired",
            Self::InitializationFailed => "initialization_failed",
        }
    }
}

/// Lifecycle of a payment attempt: `pending` → `completed` | `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TransactionState {
    Pending,
    Completed,
    Failed { reason: FailureReason },
}

impl TransactionState {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_pending()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            Self::Failed { reason } => Some(*reason),
            _ => None,
        }
    }
}

/// A terminal state a pending transaction may be moved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Completed,
    Failed(FailureReason),
}

impl From<Resolution> for TransactionState {
    fn from(resolution: Resolution) -> Self {
        match resolution {
            Resolution::Completed => Self::Completed,
            Resolution::Failed(reason) => Self::Failed { reason },
        }
    }
}

/// Identifiers and figures reported by the payment provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderDetails {
    pub provider_status: Option<String>,
    pub provider_transaction_id: Option<String>,
    pub provider_receipt: Option<String>,
    pub paid_amount: Option<Decimal>,
}

impl ProviderDetails {
    /// Fills the fields `other` knows about, keeping ours where it is silent.
    fn merge(&mut self, other: ProviderDetails) {
        if other.provider_status.is_some() {
            self.provider_status = other.provider_status;
        }
        if other.provider_transaction_id.is_some() {
            self.provider_transaction_id = other.provider_transaction_id;
        }
        if other.provider_receipt.is_some() {
            self.provider_receipt = other.provider_receipt;
        }
        if other.paid_amount.is_some() {
            self.paid_amount = other.paid_amount;
        }
    }
}

/// Outcome of the best-effort voucher delivery to the payer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryState {
    #[default]
    NotAttempted,
    /// A send is under way. Claimed by the caller that is about to contact
    /// the payer, so no other path starts a second send for it.
    Sending {
        since: DateTime<Utc>,
        /// Attempts completed before this one.
        attempts: u32,
    },
    Sent {
        at: DateTime<Utc>,
    },
    Failed {
        attempts: u32,
        last_error: String,
    },
}

impl DeliveryState {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::NotAttempted => 0,
            Self::Sending { attempts, .. } => *attempts,
            Self::Sent { .. } => 1,
            Self::Failed { attempts, .. } => *attempts,
        }
    }
}

/// What the payer asked for when starting a charge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeRequest {
    pub amount: Amount,
    pub payer_contact: String,
    pub package_id: PackageId,
    pub distribution_point_id: DistributionPointId,
    pub reseller_id: ResellerId,
}

/// One payment attempt, as recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub reference: Reference,
    pub payer_contact: String,
    pub amount: Amount,
    pub package_id: PackageId,
    pub distribution_point_id: DistributionPointId,
    pub reseller_id: ResellerId,
    pub gateway: String,
    #[serde(flatten)]
    pub state: TransactionState,
    #[serde(default)]
    pub provider: ProviderDetails,
    pub voucher_code: Option<VoucherCode>,
    #[serde(default)]
    pub delivery: DeliveryState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new(
        reference: Reference,
        request: ChargeRequest,
        gateway: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            reference,
            payer_contact: request.payer_contact,
            amount: request.amount,
            package_id: request.package_id,
            distribution_point_id: request.distribution_point_id,
            reseller_id: request.reseller_id,
            gateway: gateway.into(),
            state: TransactionState::Pending,
            provider: ProviderDetails::default(),
            voucher_code: None,
            delivery: DeliveryState::NotAttempted,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn partition(&self) -> Partition {
        Partition::new(self.package_id, self.distribution_point_id)
    }

    /// Moves a pending transaction to a terminal state.
    ///
    /// Returns the state observed before the call. A terminal transaction is
    /// left untouched, so only the caller that sees `Pending` returned has
    /// performed the transition.
    pub fn resolve(
        &mut self,
        resolution: Resolution,
        details: ProviderDetails,
        at: DateTime<Utc>,
    ) -> TransactionState {
        let previous = self.state;
        if previous.is_terminal() {
            return previous;
        }
        self.state = resolution.into();
        self.provider.merge(details);
        self.updated_at = at;
        previous
    }

    pub fn annotate(&mut self, details: ProviderDetails, at: DateTime<Utc>) {
        self.provider.merge(details);
        self.updated_at = at;
    }

    /// Binds the claimed voucher. Set-once: rebinding the same code is a
    /// no-op returning `false`, a different code is rejected.
    pub fn bind_voucher(&mut self, code: &VoucherCode, at: DateTime<Utc>) -> Result<bool> {
        if self.state != TransactionState::Completed {
            return Err(PaymentError::InvalidState(format!(
                "Cannot bind a voucher to {} transaction {}",
                self.state.as_str(),
                self.reference
            )));
        }
        match &self.voucher_code {
            Some(existing) if existing == code => Ok(false),
            Some(existing) => Err(PaymentError::InvalidState(format!(
                "Transaction {} is already bound to voucher {}",
                self.reference, existing
            ))),
            None => {
                self.voucher_code = Some(code.clone());
                self.updated_at = at;
                Ok(true)
            }
        }
    }

    /// Records a delivery outcome. A sent delivery is never downgraded.
    pub fn record_delivery(&mut self, delivery: DeliveryState, at: DateTime<Utc>) {
        if matches!(self.delivery, DeliveryState::Sent { .. }) {
            return;
        }
        self.delivery = delivery;
        self.updated_at = at;
    }

    pub fn awaits_voucher(&self) -> bool {
        self.state == TransactionState::Completed && self.voucher_code.is_none()
    }

    /// Whether the pending window has elapsed. Terminal transactions never expire.
    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
        self.state.is_pending() && now.signed_duration_since(self.created_at) >= ttl
    }
}

/// Result of an atomic ledger transition.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub previous: TransactionState,
    pub transaction: Transaction,
}

impl Transition {
    /// `true` only for the caller whose write moved the transaction out of
    /// `pending`. Everyone else observed an already-terminal record.
    pub fn performed(&self) -> bool {
        self.previous.is_pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn pending() -> Transaction {
        let request = ChargeRequest {
            amount: Amount::new(dec!(50)).unwrap(),
            payer_contact: "0712345678".to_string(),
            package_id: PackageId(1),
            distribution_point_id: DistributionPointId(2),
            reseller_id: ResellerId(3),
        };
        Transaction::new(Reference::new("TXN1").unwrap(), request, "paystack", Utc::now())
    }

    #[test]
    fn test_resolve_is_monotonic() {
        let mut tx = pending();
        let previous = tx.resolve(Resolution::Completed, ProviderDetails::default(), Utc::now());
        assert_eq!(previous, TransactionState::Pending);
        assert_eq!(tx.state, TransactionState::Completed);

        let previous = tx.resolve(
            Resolution::Failed(FailureReason::Expired),
            ProviderDetails::default(),
            Utc::now(),
        );
        assert_eq!(previous, TransactionState::Completed);
        assert_eq!(tx.state, TransactionState::Completed);
    }

    #[test]
    fn test_failed_never_becomes_completed() {
        let mut tx = pending();
        tx.resolve(
            Resolution::Failed(FailureReason::AmountMismatch),
            ProviderDetails::default(),
            Utc::now(),
        );
        let previous = tx.resolve(Resolution::Completed, ProviderDetails::default(), Utc::now());
        assert_eq!(
            previous,
            TransactionState::Failed {
                reason: FailureReason::AmountMismatch
            }
        );
        assert_eq!(tx.state.failure_reason(), Some(FailureReason::AmountMismatch));
    }

    #[test]
    fn test_resolve_merges_provider_details() {
        let mut tx = pending();
        tx.provider.provider_transaction_id = Some("access-1".to_string());
        tx.resolve(
            Resolution::Completed,
            ProviderDetails {
                provider_status: Some("success".to_string()),
                provider_receipt: Some("RCPT9".to_string()),
                paid_amount: Some(dec!(50)),
                ..Default::default()
            },
            Utc::now(),
        );
        assert_eq!(tx.provider.provider_transaction_id.as_deref(), Some("access-1"));
        assert_eq!(tx.provider.provider_receipt.as_deref(), Some("RCPT9"));
    }

    #[test]
    fn test_bind_voucher_is_set_once() {
        let mut tx = pending();
        let code = VoucherCode::new("V1").unwrap();
        assert!(matches!(
            tx.bind_voucher(&code, Utc::now()),
            Err(PaymentError::InvalidState(_))
        ));

        tx.resolve(Resolution::Completed, ProviderDetails::default(), Utc::now());
        assert!(tx.bind_voucher(&code, Utc::now()).unwrap());
        assert!(!tx.bind_voucher(&code, Utc::now()).unwrap());
        assert!(
            tx.bind_voucher(&VoucherCode::new("V2").unwrap(), Utc::now())
                .is_err()
        );
        assert_eq!(tx.voucher_code, Some(code));
    }

    #[test]
    fn test_sent_delivery_is_not_downgraded() {
        let mut tx = pending();
        tx.record_delivery(DeliveryState::Sent { at: Utc::now() }, Utc::now());
        tx.record_delivery(
            DeliveryState::Failed {
                attempts: 1,
                last_error: "boom".to_string(),
            },
            Utc::now(),
        );
        assert!(matches!(tx.delivery, DeliveryState::Sent { .. }));
    }

    #[test]
    fn test_sending_keeps_attempt_count() {
        let mut tx = pending();
        tx.record_delivery(
            DeliveryState::Failed {
                attempts: 2,
                last_error: "timeout".to_string(),
            },
            Utc::now(),
        );
        tx.record_delivery(
            DeliveryState::Sending {
                since: Utc::now(),
                attempts: tx.delivery.attempts(),
            },
            Utc::now(),
        );
        assert_eq!(tx.delivery.attempts(), 2);

        let json = serde_json::to_value(&tx.delivery).unwrap();
        assert_eq!(json["status"], "sending");
    }

    #[test]
    fn test_expiry_window() {
        let tx = pending();
        let later = tx.created_at + TimeDelta::seconds(120);
        assert!(tx.is_expired(Duration::from_secs(60), later));
        assert!(!tx.is_expired(Duration::from_secs(600), later));
    }

    #[test]
    fn test_state_serializes_flat() {
        let mut tx = pending();
        tx.resolve(
            Resolution::Failed(FailureReason::Expired),
            ProviderDetails::default(),
            Utc::now(),
        );
        let json = serde_json::to_value(&tx).unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["reason"], "expired");

        let back: Transaction = serde_json::from_value(json).unwrap();
        assert_eq!(back, tx);
    }
}
