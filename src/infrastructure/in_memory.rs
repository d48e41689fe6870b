use crate::domain::ports::{TransactionLedger, VoucherStore};
use crate::domain::{
    Claim, DeliveryState, Partition, ProviderDetails, Reference, Resolution, Transaction,
    Transition, Voucher, VoucherCode, VoucherStatus,
};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// A thread-safe in-memory transaction ledger.
///
/// Every conditional write runs under a single write guard, which plays the
/// role a row-level compare-and-set plays in a relational store.
#[derive(Default, Clone)]
pub struct InMemoryTransactionLedger {
    transactions: Arc<RwLock<HashMap<Reference, Transaction>>>,
}

impl InMemoryTransactionLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(reference: &Reference) -> PaymentError {
    PaymentError::NotFound(format!("transaction {reference}"))
}

#[async_trait]
impl TransactionLedger for InMemoryTransactionLedger {
    async fn record_created(&self, tx: Transaction) -> Result<()> {
        let mut transactions = self.transactions.write().await;
        if transactions.contains_key(&tx.reference) {
            return Err(PaymentError::DuplicateReference(tx.reference.to_string()));
        }
        transactions.insert(tx.reference.clone(), tx);
        Ok(())
    }

    async fn get(&self, reference: &Reference) -> Result<Option<Transaction>> {
        let transactions = self.transactions.read().await;
        Ok(transactions.get(reference).cloned())
    }

    async fn transition_to(
        &self,
        reference: &Reference,
        resolution: Resolution,
        details: ProviderDetails,
    ) -> Result<Transition> {
        let mut transactions = self.transactions.write().await;
        let tx = transactions
            .get_mut(reference)
            .ok_or_else(|| not_found(reference))?;
        let previous = tx.resolve(resolution, details, Utc::now());
        Ok(Transition {
            previous,
            transaction: tx.clone(),
        })
    }

    async fn record_provider_details(
        &self,
        reference: &Reference,
        details: ProviderDetails,
    ) -> Result<()> {
        let mut transactions = self.transactions.write().await;
        let tx = transactions
            .get_mut(reference)
            .ok_or_else(|| not_found(reference))?;
        tx.annotate(details, Utc::now());
        Ok(())
    }

    async fn bind_voucher(&self, reference: &Reference, code: &VoucherCode) -> Result<Transaction> {
        let mut transactions = self.transactions.write().await;
        let tx = transactions
            .get_mut(reference)
            .ok_or_else(|| not_found(reference))?;
        tx.bind_voucher(code, Utc::now())?;
        Ok(tx.clone())
    }

    async fn record_delivery(&self, reference: &Reference, delivery: DeliveryState) -> Result<()> {
        let mut transactions = self.transactions.write().await;
        let tx = transactions
            .get_mut(reference)
            .ok_or_else(|| not_found(reference))?;
        tx.record_delivery(delivery, Utc::now());
        Ok(())
    }

    async fn find_by_provider_id(
        &self,
        provider_transaction_id: &str,
    ) -> Result<Option<Transaction>> {
        let transactions = self.transactions.read().await;
        Ok(transactions
            .values()
            .find(|tx| {
                tx.provider.provider_transaction_id.as_deref() == Some(provider_transaction_id)
            })
            .cloned())
    }

    async fn get_all(&self) -> Result<Vec<Transaction>> {
        let transactions = self.transactions.read().await;
        Ok(transactions.values().cloned().collect())
    }
}

#[derive(Default)]
struct Pool {
    vouchers: HashMap<VoucherCode, Voucher>,
    /// Available codes per partition, in claim order.
    available: HashMap<Partition, BTreeSet<VoucherCode>>,
    /// Which voucher each transaction holds. One entry per reference.
    claims: HashMap<Reference, VoucherCode>,
}

/// A thread-safe in-memory voucher pool.
#[derive(Default, Clone)]
pub struct InMemoryVoucherStore {
    pool: Arc<RwLock<Pool>>,
}

impl InMemoryVoucherStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VoucherStore for InMemoryVoucherStore {
    async fn insert(&self, voucher: Voucher) -> Result<()> {
        let mut pool = self.pool.write().await;
        if pool.vouchers.contains_key(&voucher.code) {
            return Err(PaymentError::DuplicateVoucher(voucher.code.to_string()));
        }
        if voucher.status == VoucherStatus::Available {
            pool.available
                .entry(voucher.partition())
                .or_default()
                .insert(voucher.code.clone());
        }
        if let Some(reference) = &voucher.transaction_reference {
            pool.claims.insert(reference.clone(), voucher.code.clone());
        }
        pool.vouchers.insert(voucher.code.clone(), voucher);
        Ok(())
    }

    async fn get(&self, code: &VoucherCode) -> Result<Option<Voucher>> {
        let pool = self.pool.read().await;
        Ok(pool.vouchers.get(code).cloned())
    }

    async fn claim(
        &self,
        partition: Partition,
        reference: &Reference,
        customer_contact: &str,
    ) -> Result<Claim> {
        let now = Utc::now();
        let mut guard = self.pool.write().await;
        let pool = &mut *guard;

        if let Some(code) = pool.claims.get(reference) {
            let voucher = pool.vouchers.get(code).cloned().ok_or_else(|| {
                PaymentError::internal(format!("claim index points at missing voucher {code}"))
            })?;
            return Ok(Claim::AlreadyClaimed(voucher));
        }

        let Some(candidates) = pool.available.get_mut(&partition) else {
            return Ok(Claim::Exhausted);
        };
        // Expired vouchers are skipped but left indexed; the expiry sweep owns them.
        let chosen = candidates
            .iter()
            .find(|code| {
                pool.vouchers
                    .get(*code)
                    .is_some_and(|voucher| voucher.is_claimable(now))
            })
            .cloned();
        let Some(code) = chosen else {
            return Ok(Claim::Exhausted);
        };

        candidates.remove(&code);
        let voucher = pool
            .vouchers
            .get_mut(&code)
            .ok_or_else(|| PaymentError::internal(format!("voucher {code} vanished")))?;
        voucher.claim(reference, customer_contact, now)?;
        pool.claims.insert(reference.clone(), code);
        Ok(Claim::Claimed(voucher.clone()))
    }

    async fn claimed_by(&self, reference: &Reference) -> Result<Option<Voucher>> {
        let pool = self.pool.read().await;
        Ok(pool
            .claims
            .get(reference)
            .and_then(|code| pool.vouchers.get(code))
            .cloned())
    }

    async fn count_available(&self, partition: Partition) -> Result<usize> {
        let now = Utc::now();
        let pool = self.pool.read().await;
        Ok(pool.available.get(&partition).map_or(0, |codes| {
            codes
                .iter()
                .filter(|code| pool.vouchers.get(*code).is_some_and(|v| v.is_claimable(now)))
                .count()
        }))
    }
}
