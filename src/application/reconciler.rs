use super::allocator::{Allocation, Allocator};
use crate::domain::ports::{PaymentGatewayRef, ProviderVerdict, TransactionLedgerRef, Verification};
use crate::domain::{FailureReason, Reference, Resolution, Transaction, TransactionState};
use crate::error::{PaymentError, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// What happened to the voucher when a reconcile call completed a payment.
#[derive(Debug, Clone, PartialEq)]
pub enum AllocationOutcome {
    Allocated(Allocation),
    /// The pool had nothing left; the payment stays completed but unbound.
    Exhausted,
    /// Allocation failed for another reason and is left to the sweep.
    Deferred(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutcome {
    /// The ledger entry as stored after this call.
    pub transaction: Transaction,
    /// `true` only for the call that moved the transaction out of `pending`.
    pub transitioned: bool,
    /// Set only when this call performed the transition to `completed`.
    pub allocation: Option<AllocationOutcome>,
}

impl ReconcileOutcome {
    fn unchanged(transaction: Transaction) -> Self {
        Self {
            transaction,
            transitioned: false,
            allocation: None,
        }
    }
}

/// Drives transactions from `pending` to a terminal state.
pub struct Reconciler {
    ledger: TransactionLedgerRef,
    gateway: PaymentGatewayRef,
    allocator: Arc<Allocator>,
    pending_ttl: Option<Duration>,
}

impl Reconciler {
    pub fn new(
        ledger: TransactionLedgerRef,
        gateway: PaymentGatewayRef,
        allocator: Arc<Allocator>,
        pending_ttl: Option<Duration>,
    ) -> Self {
        Self {
            ledger,
            gateway,
            allocator,
            pending_ttl,
        }
    }

    /// Verifies a pending transaction with the gateway and applies the result.
    ///
    /// Terminal transactions are returned as stored without contacting the
    /// gateway. A transport failure leaves the transaction `pending` and is
    /// returned as a retryable `GatewayUnavailable`. Of any number of
    /// concurrent calls for one reference, only the one whose ledger write
    /// performed the transition invokes the allocator.
    #[instrument(skip(self), fields(reference = %reference))]
    pub async fn reconcile(&self, reference: &Reference) -> Result<ReconcileOutcome> {
        let tx = self
            .ledger
            .get(reference)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("transaction {reference}")))?;

        if tx.state.is_terminal() {
            debug!(state = tx.state.as_str(), "already terminal");
            return Ok(ReconcileOutcome::unchanged(tx));
        }

        let expired = self
            .pending_ttl
            .is_some_and(|ttl| tx.is_expired(ttl, Utc::now()));

        let verification = self.gateway.verify(&tx).await.inspect_err(|e| {
            if e.is_retryable() {
                warn!(error = %e, "verification deferred; transaction stays pending");
            }
        })?;

        let Some(resolution) = decide(&tx, &verification, expired) else {
            debug!(provider_status = %verification.provider_status, "not settled yet");
            return Ok(ReconcileOutcome::unchanged(tx));
        };

        let transition = self
            .ledger
            .transition_to(reference, resolution, verification.details())
            .await?;

        if !transition.performed() {
            debug!(
                state = transition.transaction.state.as_str(),
                "transition already performed by another caller"
            );
            return Ok(ReconcileOutcome::unchanged(transition.transaction));
        }

        let transaction = transition.transaction;
        info!(state = transaction.state.as_str(), "transaction resolved");

        let allocation = if transaction.state == TransactionState::Completed {
            Some(self.allocate_for(&transaction).await)
        } else {
            None
        };

        Ok(ReconcileOutcome {
            transaction,
            transitioned: true,
            allocation,
        })
    }

    async fn allocate_for(&self, tx: &Transaction) -> AllocationOutcome {
        match self
            .allocator
            .allocate(&tx.reference, tx.partition(), &tx.payer_contact)
            .await
        {
            Ok(allocation) => AllocationOutcome::Allocated(allocation),
            Err(PaymentError::PoolExhausted(_)) => AllocationOutcome::Exhausted,
            Err(e) => {
                error!(error = %e, "allocation deferred to sweep");
                AllocationOutcome::Deferred(e.to_string())
            }
        }
    }
}

/// Maps a gateway verification onto a ledger resolution. `None` keeps the
/// transaction pending.
fn decide(tx: &Transaction, verification: &Verification, expired: bool) -> Option<Resolution> {
    match verification.verdict {
        ProviderVerdict::Settled => match verification.paid_amount {
            Some(paid) if tx.amount.matches(paid) => Some(Resolution::Completed),
            paid => {
                let mismatch = PaymentError::AmountMismatch {
                    expected: tx.amount.value(),
                    paid: paid.unwrap_or_default(),
                };
                warn!(audit = true, reference = %tx.reference, error = %mismatch, "settled amount does not match charge");
                Some(Resolution::Failed(FailureReason::AmountMismatch))
            }
        },
        ProviderVerdict::Declined => Some(Resolution::Failed(FailureReason::GatewayRejected)),
        ProviderVerdict::InFlight if expired => Some(Resolution::Failed(FailureReason::Expired)),
        ProviderVerdict::InFlight => None,
    }
}
