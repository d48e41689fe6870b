use super::allocator::{Allocation, Allocator};
use super::reconciler::{AllocationOutcome, Reconciler};
use crate::config::EngineConfig;
use crate::domain::ports::{
    ChargeHandle, ChargeInstruction, NotifierRef, PaymentGatewayRef, TransactionLedgerRef,
    VoucherStoreRef,
};
use crate::domain::{
    ChargeRequest, DeliveryState, FailureReason, ProviderDetails, Reference, Resolution,
    Transaction, TransactionState, Voucher, VoucherCredentials,
};
use crate::error::{PaymentError, Result};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const BINDING_POLL: Duration = Duration::from_millis(20);

/// Which entry point asked for a confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Webhook,
    Poll,
    Manual,
    Sweep,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Webhook => "webhook",
            Self::Poll => "poll",
            Self::Manual => "manual",
            Self::Sweep => "sweep",
        };
        f.write_str(name)
    }
}

/// The result every confirmation entry point hands back to its caller.
#[derive(Debug, Clone, PartialEq)]
pub struct Confirmation {
    pub transaction: Transaction,
    pub voucher: Option<Voucher>,
    /// Completed, but no voucher could be bound.
    pub backlog: bool,
}

/// Poll response: the current outcome of a payment, with credentials once
/// a voucher is bound.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusView {
    pub reference: Reference,
    pub state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voucher: Option<VoucherCredentials>,
    pub voucher_backlog: bool,
    pub delivery: DeliveryState,
    pub retryable: bool,
}

impl StatusView {
    fn new(transaction: &Transaction, voucher: Option<&Voucher>, retryable: bool) -> Self {
        Self {
            reference: transaction.reference.clone(),
            state: transaction.state.as_str(),
            failure_reason: transaction.state.failure_reason(),
            voucher: voucher.map(VoucherCredentials::from),
            voucher_backlog: voucher.is_none() && transaction.awaits_voucher(),
            delivery: transaction.delivery.clone(),
            retryable,
        }
    }
}

impl From<&Confirmation> for StatusView {
    fn from(confirmation: &Confirmation) -> Self {
        Self::new(
            &confirmation.transaction,
            confirmation.voucher.as_ref(),
            false,
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Pending transactions failed by the timeout path.
    pub expired: usize,
    /// Completed transactions that received their voucher during the sweep.
    pub fulfilled: usize,
    pub redelivered: usize,
    pub still_pending: usize,
    /// Completed transactions still waiting for a voucher.
    pub backlog: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub imported: usize,
    pub skipped: usize,
}

/// The main entry point for the payment pipeline.
///
/// `PaymentEngine` owns the storage and gateway ports and exposes the
/// operations every surface (HTTP, CLI, periodic sweep) calls. It holds no
/// per-request state: the reference is passed explicitly on every call, so
/// a webhook and a browser poll for the same payment need not share anything.
pub struct PaymentEngine {
    ledger: TransactionLedgerRef,
    vouchers: VoucherStoreRef,
    gateway: PaymentGatewayRef,
    allocator: Arc<Allocator>,
    reconciler: Reconciler,
    config: EngineConfig,
}

impl PaymentEngine {
    /// Creates a new `PaymentEngine` instance.
    ///
    /// # Arguments
    ///
    /// * `ledger` - The transaction ledger.
    /// * `vouchers` - The voucher pool.
    /// * `gateway` - The payment provider client.
    /// * `notifier` - Where voucher credentials are delivered.
    /// * `config` - Timeouts and retry policy.
    pub fn new(
        ledger: TransactionLedgerRef,
        vouchers: VoucherStoreRef,
        gateway: PaymentGatewayRef,
        notifier: NotifierRef,
        config: EngineConfig,
    ) -> Self {
        let allocator = Arc::new(Allocator::new(
            ledger.clone(),
            vouchers.clone(),
            notifier,
            &config,
        ));
        let reconciler = Reconciler::new(
            ledger.clone(),
            gateway.clone(),
            allocator.clone(),
            config.pending_ttl,
        );
        Self {
            ledger,
            vouchers,
            gateway,
            allocator,
            reconciler,
            config,
        }
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    /// Starts a charge with the gateway.
    ///
    /// The transaction is recorded `pending` before the gateway is contacted,
    /// so a confirmation can never arrive for a reference the ledger has not
    /// seen. If the gateway refuses or cannot be reached, the entry is failed
    /// with `initialization_failed` and the error is returned.
    #[instrument(skip(self, request), fields(package = %request.package_id, point = %request.distribution_point_id))]
    pub async fn initialize(&self, request: ChargeRequest) -> Result<ChargeHandle> {
        if request.payer_contact.trim().is_empty() {
            return Err(PaymentError::ValidationError(
                "Payer contact is required".to_string(),
            ));
        }

        let reference = Reference::generate(&self.config.reference_prefix);
        let instruction = ChargeInstruction {
            reference: reference.clone(),
            amount: request.amount,
            payer_contact: request.payer_contact.clone(),
            metadata: json!({
                "package_id": request.package_id,
                "distribution_point_id": request.distribution_point_id,
                "reseller_id": request.reseller_id,
            }),
        };
        let tx = Transaction::new(reference.clone(), request, self.gateway.name(), Utc::now());
        self.ledger.record_created(tx).await?;

        match self.gateway.initialize(&instruction).await {
            Ok(handle) => {
                if handle.provider_transaction_id.is_some() {
                    let details = ProviderDetails {
                        provider_transaction_id: handle.provider_transaction_id.clone(),
                        ..Default::default()
                    };
                    self.ledger
                        .record_provider_details(&reference, details)
                        .await?;
                }
                info!(%reference, "charge initialized");
                Ok(handle)
            }
            Err(e) => {
                warn!(%reference, error = %e, "charge initialization failed");
                self.ledger
                    .transition_to(
                        &reference,
                        Resolution::Failed(FailureReason::InitializationFailed),
                        ProviderDetails::default(),
                    )
                    .await?;
                Err(e)
            }
        }
    }

    /// The single Confirmation Surface operation behind webhook, poll and
    /// manual recheck.
    ///
    /// Reconciles the reference and, when the payment is completed, returns
    /// its voucher. Only the caller whose write performed the transition
    /// reaches the allocator. Everyone else reads the voucher the winner
    /// claimed and never touches the pool.
    #[instrument(skip(self), fields(reference = %reference, trigger = %trigger))]
    pub async fn confirm(&self, reference: &Reference, trigger: Trigger) -> Result<Confirmation> {
        let outcome = self.reconciler.reconcile(reference).await?;
        let transaction = outcome.transaction;

        match outcome.allocation {
            Some(AllocationOutcome::Allocated(allocation)) => Ok(allocation.into()),
            Some(AllocationOutcome::Exhausted | AllocationOutcome::Deferred(_)) => {
                Ok(Confirmation {
                    transaction,
                    voucher: None,
                    backlog: true,
                })
            }
            None if transaction.awaits_voucher() => self.claimed_voucher(transaction).await,
            None => {
                let voucher = match &transaction.voucher_code {
                    Some(code) => Some(self.allocator.load(code).await?),
                    None => None,
                };
                Ok(Confirmation {
                    transaction,
                    voucher,
                    backlog: false,
                })
            }
        }
    }

    /// Client poll. Gateway outages are reported as a retryable `pending`
    /// view rather than an error.
    pub async fn status(&self, reference: &Reference) -> Result<StatusView> {
        match self.confirm(reference, Trigger::Poll).await {
            Ok(confirmation) => Ok(StatusView::from(&confirmation)),
            Err(e) if e.is_retryable() => {
                let tx = self
                    .ledger
                    .get(reference)
                    .await?
                    .ok_or_else(|| PaymentError::NotFound(format!("transaction {reference}")))?;
                Ok(StatusView::new(&tx, None, true))
            }
            Err(e) => Err(e),
        }
    }

    /// Recovery pass over the whole ledger.
    ///
    /// Expires stale pending transactions, re-offers unbound completed ones
    /// to the allocator, and retries failed voucher deliveries.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let now = Utc::now();

        for tx in self.ledger.get_all().await? {
            match tx.state {
                TransactionState::Pending => {
                    let stale = self
                        .config
                        .pending_ttl
                        .is_some_and(|ttl| tx.is_expired(ttl, now));
                    if !stale {
                        report.still_pending += 1;
                        continue;
                    }
                    match self.confirm(&tx.reference, Trigger::Sweep).await {
                        Ok(c)
                            if c.transaction.state.failure_reason()
                                == Some(FailureReason::Expired) =>
                        {
                            report.expired += 1
                        }
                        Ok(c) if c.voucher.is_some() => report.fulfilled += 1,
                        Ok(c) if c.backlog => report.backlog += 1,
                        Ok(c) if c.transaction.state.is_pending() => report.still_pending += 1,
                        Ok(_) => {}
                        Err(e) => {
                            warn!(reference = %tx.reference, error = %e, "could not expire transaction");
                            report.still_pending += 1;
                        }
                    }
                }
                TransactionState::Completed if tx.awaits_voucher() => {
                    match self.fulfil(tx).await {
                        Ok(c) if c.voucher.is_some() => report.fulfilled += 1,
                        Ok(_) => report.backlog += 1,
                        Err(e) => {
                            warn!(error = %e, "voucher backlog item not fulfilled");
                            report.backlog += 1;
                        }
                    }
                }
                TransactionState::Completed if self.needs_redelivery(&tx, now) => {
                    match self.redeliver(&tx).await {
                        Ok(DeliveryState::Sent { .. }) => report.redelivered += 1,
                        Ok(_) => {}
                        Err(e) => warn!(reference = %tx.reference, error = %e, "redelivery failed"),
                    }
                }
                _ => {}
            }
        }

        info!(
            expired = report.expired,
            fulfilled = report.fulfilled,
            redelivered = report.redelivered,
            still_pending = report.still_pending,
            backlog = report.backlog,
            "sweep finished"
        );
        Ok(report)
    }

    /// Seeds the pool. Rows that fail to parse or collide with an existing
    /// code are skipped and logged.
    pub async fn import_vouchers<I>(&self, vouchers: I) -> Result<ImportReport>
    where
        I: IntoIterator<Item = Result<Voucher>>,
    {
        let mut report = ImportReport::default();
        for (row, voucher) in vouchers.into_iter().enumerate() {
            let result = match voucher {
                Ok(voucher) => self.vouchers.insert(voucher).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => report.imported += 1,
                Err(
                    e @ (PaymentError::DuplicateVoucher(_)
                    | PaymentError::Csv(_)
                    | PaymentError::ValidationError(_)),
                ) => {
                    warn!(row = row + 1, error = %e, "voucher row skipped");
                    report.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }
        info!(imported = report.imported, skipped = report.skipped, "vouchers imported");
        Ok(report)
    }

    pub async fn transactions(&self) -> Result<Vec<Transaction>> {
        self.ledger.get_all().await
    }

    /// Resolves a provider's own transaction id, as sent in callbacks that
    /// do not echo our reference.
    pub async fn find_by_provider_id(
        &self,
        provider_transaction_id: &str,
    ) -> Result<Option<Transaction>> {
        self.ledger.find_by_provider_id(provider_transaction_id).await
    }

    /// Read-only lookup of the voucher claimed for a completed transaction.
    ///
    /// A transition younger than `binding_wait` may still have its claim in
    /// flight, so the store's claim index is polled until then. After that
    /// an unbound transaction is reported as backlog for the sweep.
    async fn claimed_voucher(&self, transaction: Transaction) -> Result<Confirmation> {
        let reference = transaction.reference.clone();
        let wait = TimeDelta::from_std(self.config.binding_wait).unwrap_or(TimeDelta::zero());
        let deadline = transaction.updated_at + wait;
        loop {
            if let Some(voucher) = self.vouchers.claimed_by(&reference).await? {
                let transaction = self.ledger.get(&reference).await?.unwrap_or(transaction);
                return Ok(Confirmation {
                    transaction,
                    voucher: Some(voucher),
                    backlog: false,
                });
            }
            if Utc::now() >= deadline {
                break;
            }
            tokio::time::sleep(BINDING_POLL).await;
        }
        debug!(%reference, "no voucher claimed yet; left to the sweep");
        Ok(Confirmation {
            transaction,
            voucher: None,
            backlog: true,
        })
    }

    async fn fulfil(&self, transaction: Transaction) -> Result<Confirmation> {
        match self
            .allocator
            .allocate(
                &transaction.reference,
                transaction.partition(),
                &transaction.payer_contact,
            )
            .await
        {
            Ok(allocation) => Ok(allocation.into()),
            Err(PaymentError::PoolExhausted(_)) => Ok(Confirmation {
                transaction,
                voucher: None,
                backlog: true,
            }),
            Err(e) => Err(e),
        }
    }

    /// Unsent and in-progress deliveries are only picked up once they are
    /// older than `delivery_grace`; the caller that bound the voucher may
    /// still be sending.
    fn needs_redelivery(&self, tx: &Transaction, now: DateTime<Utc>) -> bool {
        let grace = TimeDelta::from_std(self.config.delivery_grace).unwrap_or(TimeDelta::MAX);
        let settled_for = |since: DateTime<Utc>| now.signed_duration_since(since) >= grace;
        tx.voucher_code.is_some()
            && match &tx.delivery {
                DeliveryState::NotAttempted => settled_for(tx.updated_at),
                DeliveryState::Sending { since, attempts } => {
                    settled_for(*since) && *attempts < self.config.max_delivery_attempts
                }
                DeliveryState::Failed { attempts, .. } => {
                    *attempts < self.config.max_delivery_attempts
                }
                DeliveryState::Sent { .. } => false,
            }
    }

    async fn redeliver(&self, tx: &Transaction) -> Result<DeliveryState> {
        let code = tx
            .voucher_code
            .as_ref()
            .ok_or_else(|| PaymentError::InvalidState(format!("{} has no voucher", tx.reference)))?;
        let voucher = self.allocator.load(code).await?;
        self.allocator.deliver(tx, &voucher).await
    }
}

impl From<Allocation> for Confirmation {
    fn from(allocation: Allocation) -> Self {
        Self {
            transaction: allocation.transaction,
            voucher: Some(allocation.voucher),
            backlog: false,
        }
    }
}
