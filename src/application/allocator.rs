use crate::config::EngineConfig;
use crate::domain::ports::{NotifierRef, TransactionLedgerRef, VoucherDelivery, VoucherStoreRef};
use crate::domain::{
    Claim, DeliveryState, Partition, Reference, Transaction, TransactionState, Voucher,
    VoucherCode,
};
use crate::error::{PaymentError, Result};
use chrono::Utc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

/// A voucher bound to a completed transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub voucher: Voucher,
    pub transaction: Transaction,
    /// `true` for the one call whose claim moved the voucher out of the pool.
    pub claimed: bool,
}

/// Claims vouchers for completed transactions and writes the binding back
/// onto the ledger.
///
/// Safe to call any number of times for the same reference: the store's
/// claim is keyed by reference, so every call ends up with the same voucher
/// and only the first one depletes the pool.
pub struct Allocator {
    ledger: TransactionLedgerRef,
    vouchers: VoucherStoreRef,
    notifier: NotifierRef,
    bind_attempts: u32,
    bind_backoff: Duration,
}

impl Allocator {
    pub fn new(
        ledger: TransactionLedgerRef,
        vouchers: VoucherStoreRef,
        notifier: NotifierRef,
        config: &EngineConfig,
    ) -> Self {
        Self {
            ledger,
            vouchers,
            notifier,
            bind_attempts: config.bind_attempts.max(1),
            bind_backoff: config.bind_backoff,
        }
    }

    #[instrument(skip(self, customer_contact), fields(reference = %reference, partition = %partition))]
    pub async fn allocate(
        &self,
        reference: &Reference,
        partition: Partition,
        customer_contact: &str,
    ) -> Result<Allocation> {
        let tx = self
            .ledger
            .get(reference)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("transaction {reference}")))?;

        if tx.state != TransactionState::Completed {
            return Err(PaymentError::InvalidState(format!(
                "Cannot allocate for {} transaction {}",
                tx.state.as_str(),
                reference
            )));
        }
        if tx.partition() != partition {
            return Err(PaymentError::ValidationError(format!(
                "Transaction {} belongs to partition {}, not {}",
                reference,
                tx.partition(),
                partition
            )));
        }

        if let Some(code) = &tx.voucher_code {
            let voucher = self.load(code).await?;
            return Ok(Allocation {
                voucher,
                transaction: tx,
                claimed: false,
            });
        }

        let (voucher, claimed) = match self
            .vouchers
            .claim(partition, reference, customer_contact)
            .await?
        {
            Claim::Claimed(voucher) => (voucher, true),
            // Claimed earlier, but the ledger binding did not land.
            Claim::AlreadyClaimed(voucher) => (voucher, false),
            Claim::Exhausted => {
                warn!(backlog = true, "voucher pool exhausted; transaction left unbound");
                return Err(PaymentError::PoolExhausted(partition));
            }
        };

        // The send is marked before the binding becomes visible, so a sweep
        // never finds this transaction bound with nothing in flight.
        if claimed {
            self.mark_sending(&tx).await?;
        }

        let transaction = self.bind(reference, &voucher.code).await?;
        info!(code = %voucher.code, claimed, "voucher bound");

        let mut allocation = Allocation {
            voucher,
            transaction,
            claimed,
        };
        if claimed {
            allocation.transaction.delivery = self
                .send(&allocation.transaction, &allocation.voucher)
                .await?;
        }
        Ok(allocation)
    }

    /// Sends the voucher credentials to the payer and records the outcome.
    /// A failed send is recorded, never returned as an error.
    pub async fn deliver(&self, tx: &Transaction, voucher: &Voucher) -> Result<DeliveryState> {
        self.mark_sending(tx).await?;
        self.send(tx, voucher).await
    }

    async fn mark_sending(&self, tx: &Transaction) -> Result<()> {
        let sending = DeliveryState::Sending {
            since: Utc::now(),
            attempts: tx.delivery.attempts(),
        };
        self.ledger.record_delivery(&tx.reference, sending).await
    }

    async fn send(&self, tx: &Transaction, voucher: &Voucher) -> Result<DeliveryState> {
        let delivery = VoucherDelivery {
            reference: tx.reference.clone(),
            recipient: tx.payer_contact.clone(),
            credentials: voucher.into(),
        };
        let state = match self.notifier.deliver(&delivery).await {
            Ok(()) => {
                info!(reference = %tx.reference, code = %voucher.code, "voucher delivered");
                DeliveryState::Sent { at: Utc::now() }
            }
            Err(e) => {
                warn!(reference = %tx.reference, error = %e, "voucher delivery failed");
                DeliveryState::Failed {
                    attempts: tx.delivery.attempts() + 1,
                    last_error: e.to_string(),
                }
            }
        };
        self.ledger
            .record_delivery(&tx.reference, state.clone())
            .await?;
        Ok(state)
    }

    pub(crate) async fn load(&self, code: &VoucherCode) -> Result<Voucher> {
        self.vouchers
            .get(code)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("voucher {code}")))
    }

    /// Writes the binding onto the ledger, retrying with exponential backoff.
    /// If every attempt fails, the claim stays recorded in the store and a
    /// later `allocate` for the same reference completes the binding.
    async fn bind(&self, reference: &Reference, code: &VoucherCode) -> Result<Transaction> {
        let mut delay = self.bind_backoff;
        let mut attempt = 1;
        loop {
            match self.ledger.bind_voucher(reference, code).await {
                Ok(tx) => return Ok(tx),
                Err(e @ PaymentError::InvalidState(_)) => return Err(e),
                Err(e) if attempt >= self.bind_attempts => {
                    error!(%code, attempts = attempt, error = %e, "voucher claimed but binding failed");
                    return Err(e);
                }
                Err(e) => {
                    warn!(%code, attempt, error = %e, "voucher binding failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{Notifier, TransactionLedger, VoucherStore};
    use crate::domain::{
        Amount, ChargeRequest, DistributionPointId, PackageId, ProviderDetails, ResellerId,
        Resolution, VoucherStatus,
    };
    use crate::infrastructure::in_memory::{InMemoryTransactionLedger, InMemoryVoucherStore};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingNotifier {
        sent: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for CountingNotifier {
        async fn deliver(&self, _delivery: &VoucherDelivery) -> Result<()> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(PaymentError::NotificationFailed("sms down".into()));
            }
            Ok(())
        }
    }

    fn partition() -> Partition {
        Partition::new(PackageId(1), DistributionPointId(2))
    }

    async fn setup(
        vouchers: &[&str],
        notifier: Arc<CountingNotifier>,
    ) -> (Allocator, Arc<InMemoryTransactionLedger>, Arc<InMemoryVoucherStore>) {
        let ledger = Arc::new(InMemoryTransactionLedger::new());
        let store = Arc::new(InMemoryVoucherStore::new());
        for code in vouchers {
            store
                .insert(Voucher::new(
                    VoucherCode::new(*code).unwrap(),
                    PackageId(1),
                    DistributionPointId(2),
                    ResellerId(3),
                ))
                .await
                .unwrap();
        }
        let allocator = Allocator::new(
            ledger.clone(),
            store.clone(),
            notifier,
            &EngineConfig::default(),
        );
        (allocator, ledger, store)
    }

    async fn completed(ledger: &InMemoryTransactionLedger, reference: &str) -> Reference {
        let reference = Reference::new(reference).unwrap();
        let request = ChargeRequest {
            amount: Amount::new(dec!(50)).unwrap(),
            payer_contact: "0712345678".to_string(),
            package_id: PackageId(1),
            distribution_point_id: DistributionPointId(2),
            reseller_id: ResellerId(3),
        };
        ledger
            .record_created(Transaction::new(reference.clone(), request, "test", Utc::now()))
            .await
            .unwrap();
        ledger
            .transition_to(&reference, Resolution::Completed, ProviderDetails::default())
            .await
            .unwrap();
        reference
    }

    #[tokio::test]
    async fn test_allocate_twice_returns_same_voucher() {
        let notifier = Arc::new(CountingNotifier::default());
        let (allocator, ledger, store) = setup(&["V1", "V2"], notifier.clone()).await;
        let reference = completed(&ledger, "TXN1").await;

        let first = allocator
            .allocate(&reference, partition(), "0712345678")
            .await
            .unwrap();
        let second = allocator
            .allocate(&reference, partition(), "0712345678")
            .await
            .unwrap();

        assert!(first.claimed);
        assert!(!second.claimed);
        assert_eq!(first.voucher.code, second.voucher.code);
        assert_eq!(first.voucher.status, VoucherStatus::Claimed);
        assert_eq!(store.count_available(partition()).await.unwrap(), 1);
        assert_eq!(notifier.sent.load(Ordering::SeqCst), 1);

        let tx = ledger.get(&reference).await.unwrap().unwrap();
        assert_eq!(tx.voucher_code, Some(first.voucher.code));
        assert!(matches!(tx.delivery, DeliveryState::Sent { .. }));
    }

    #[tokio::test]
    async fn test_allocate_on_empty_pool_is_exhausted() {
        let (allocator, ledger, _) = setup(&[], Arc::new(CountingNotifier::default())).await;
        let reference = completed(&ledger, "TXN1").await;

        let err = allocator
            .allocate(&reference, partition(), "07")
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::PoolExhausted(p) if p == partition()));

        let tx = ledger.get(&reference).await.unwrap().unwrap();
        assert_eq!(tx.state, TransactionState::Completed);
        assert!(tx.awaits_voucher());
    }

    #[tokio::test]
    async fn test_allocate_rejects_other_partition_and_pending() {
        let (allocator, ledger, _) = setup(&["V1"], Arc::new(CountingNotifier::default())).await;
        let reference = completed(&ledger, "TXN1").await;
        let elsewhere = Partition::new(PackageId(1), DistributionPointId(9));
        assert!(matches!(
            allocator.allocate(&reference, elsewhere, "07").await,
            Err(PaymentError::ValidationError(_))
        ));

        let pending = Reference::new("TXN2").unwrap();
        let request = ChargeRequest {
            amount: Amount::new(dec!(10)).unwrap(),
            payer_contact: "07".to_string(),
            package_id: PackageId(1),
            distribution_point_id: DistributionPointId(2),
            reseller_id: ResellerId(3),
        };
        ledger
            .record_created(Transaction::new(pending.clone(), request, "test", Utc::now()))
            .await
            .unwrap();
        assert!(matches!(
            allocator.allocate(&pending, partition(), "07").await,
            Err(PaymentError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_delivery_failure_is_recorded_not_raised() {
        let notifier = Arc::new(CountingNotifier {
            fail: true,
            ..Default::default()
        });
        let (allocator, ledger, _) = setup(&["V1"], notifier).await;
        let reference = completed(&ledger, "TXN1").await;

        let allocation = allocator
            .allocate(&reference, partition(), "07")
            .await
            .unwrap();
        assert_eq!(allocation.voucher.code.as_str(), "V1");

        let tx = ledger.get(&reference).await.unwrap().unwrap();
        assert_eq!(
            tx.delivery,
            DeliveryState::Failed {
                attempts: 1,
                last_error: "Voucher delivery failed: sms down".to_string()
            }
        );
    }
}
