use crate::domain::ports::{TransactionLedger, VoucherStore};
use crate::domain::{
    Claim, DeliveryState, Partition, ProviderDetails, Reference, Resolution, Transaction,
    Transition, Voucher, VoucherCode, VoucherStatus,
};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use chrono::Utc;
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, ErrorKind, IteratorMode,
    OptimisticTransactionDB, Options, Transaction as DbTransaction,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;

/// Column Family for the transaction ledger, keyed by reference.
pub const CF_TRANSACTIONS: &str = "transactions";
/// Column Family for vouchers, keyed by code.
pub const CF_VOUCHERS: &str = "vouchers";
/// Index of claimable vouchers: partition prefix followed by the code.
pub const CF_AVAILABLE: &str = "available";
/// Which voucher a transaction holds, keyed by reference.
pub const CF_CLAIMS: &str = "claims";
/// Provider transaction id to reference. Entries are never removed, so a
/// lookup is checked against the transaction's current id.
pub const CF_PROVIDER_IDS: &str = "provider_ids";

const MAX_COMMIT_ATTEMPTS: usize = 32;

/// A persistent store implementation using RocksDB.
///
/// Handles storage for both the ledger and the voucher pool using separate
/// Column Families. Every conditional write runs inside an optimistic
/// transaction: keys read with `get_for_update` are validated at commit, so
/// two processes racing on the same record cannot both succeed. Conflicting
/// commits are retried from scratch.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<OptimisticTransactionDB>,
}

type Txn<'a> = DbTransaction<'a, OptimisticTransactionDB>;

fn is_conflict(err: &rocksdb::Error) -> bool {
    matches!(err.kind(), ErrorKind::Busy | ErrorKind::TryAgain)
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| {
        PaymentError::InternalError(Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Serialization error: {}", e),
        )))
    })
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| {
        PaymentError::InternalError(Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Deserialization error: {}", e),
        )))
    })
}

fn available_key(partition: Partition, code: &VoucherCode) -> Vec<u8> {
    let mut key = partition.key_prefix().to_vec();
    key.extend_from_slice(code.as_str().as_bytes());
    key
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path.
    ///
    /// Ensures that the ledger, voucher and index column families exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = [
            CF_TRANSACTIONS,
            CF_VOUCHERS,
            CF_AVAILABLE,
            CF_CLAIMS,
            CF_PROVIDER_IDS,
        ]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));

        let db = OptimisticTransactionDB::open_cf_descriptors(&opts, path, cfs)?;

        Ok(Self { db: Arc::new(db) })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| PaymentError::internal(format!("{name} column family not found")))
    }

    /// Runs `body` in an optimistic transaction and commits it, starting
    /// over whenever the commit loses a race. An `Err` from `body` rolls
    /// back.
    fn atomically<T>(&self, mut body: impl FnMut(&Txn<'_>) -> Result<T>) -> Result<T> {
        for _ in 0..MAX_COMMIT_ATTEMPTS {
            let txn = self.db.transaction();
            let value = body(&txn)?;
            match txn.commit() {
                Ok(()) => return Ok(value),
                Err(e) if is_conflict(&e) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(PaymentError::internal(format!(
            "gave up after {MAX_COMMIT_ATTEMPTS} conflicting commits"
        )))
    }

    /// Read-modify-write of one ledger entry under conflict detection.
    fn update_transaction<T>(
        &self,
        reference: &Reference,
        mut apply: impl FnMut(&mut Transaction) -> Result<(T, bool)>,
    ) -> Result<T> {
        let cf = self.cf(CF_TRANSACTIONS)?;
        let provider_ids = self.cf(CF_PROVIDER_IDS)?;
        self.atomically(|txn| {
            let bytes = txn
                .get_for_update_cf(cf, reference.as_str(), true)?
                .ok_or_else(|| PaymentError::NotFound(format!("transaction {reference}")))?;
            let mut tx: Transaction = decode(&bytes)?;
            let known_id = tx.provider.provider_transaction_id.clone();
            let (value, changed) = apply(&mut tx)?;
            if changed {
                txn.put_cf(cf, reference.as_str(), encode(&tx)?)?;
                match &tx.provider.provider_transaction_id {
                    Some(id) if known_id.as_ref() != Some(id) => {
                        txn.put_cf(provider_ids, id.as_str(), reference.as_str())?;
                    }
                    _ => {}
                }
            }
            Ok(value)
        })
    }

    fn load_voucher(&self, txn: &Txn<'_>, code: &[u8], for_update: bool) -> Result<Option<Voucher>> {
        let cf = self.cf(CF_VOUCHERS)?;
        let bytes = if for_update {
            txn.get_for_update_cf(cf, code, true)?
        } else {
            txn.get_cf(cf, code)?
        };
        bytes.map(|b| decode(&b)).transpose()
    }

    /// Codes indexed as available in `partition`, in key order.
    fn available_codes(&self, partition: Partition) -> Result<Vec<Vec<u8>>> {
        let cf = self.cf(CF_AVAILABLE)?;
        let prefix = partition.key_prefix();
        let mut codes = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            codes.push(key[prefix.len()..].to_vec());
        }
        Ok(codes)
    }
}

#[async_trait]
impl TransactionLedger for RocksDBStore {
    async fn record_created(&self, tx: Transaction) -> Result<()> {
        let cf = self.cf(CF_TRANSACTIONS)?;
        let provider_ids = self.cf(CF_PROVIDER_IDS)?;
        let value = encode(&tx)?;
        self.atomically(|txn| {
            if txn
                .get_for_update_cf(cf, tx.reference.as_str(), true)?
                .is_some()
            {
                return Err(PaymentError::DuplicateReference(tx.reference.to_string()));
            }
            txn.put_cf(cf, tx.reference.as_str(), &value)?;
            if let Some(id) = &tx.provider.provider_transaction_id {
                txn.put_cf(provider_ids, id.as_str(), tx.reference.as_str())?;
            }
            Ok(())
        })
    }

    async fn get(&self, reference: &Reference) -> Result<Option<Transaction>> {
        let cf = self.cf(CF_TRANSACTIONS)?;
        let result = self.db.get_cf(cf, reference.as_str())?;
        result.map(|bytes| decode(&bytes)).transpose()
    }

    async fn transition_to(
        &self,
        reference: &Reference,
        resolution: Resolution,
        details: ProviderDetails,
    ) -> Result<Transition> {
        self.update_transaction(reference, |tx| {
            let previous = tx.resolve(resolution, details.clone(), Utc::now());
            let transition = Transition {
                previous,
                transaction: tx.clone(),
            };
            Ok((transition, previous.is_pending()))
        })
    }

    async fn record_provider_details(
        &self,
        reference: &Reference,
        details: ProviderDetails,
    ) -> Result<()> {
        self.update_transaction(reference, |tx| {
            tx.annotate(details.clone(), Utc::now());
            Ok(((), true))
        })
    }

    async fn bind_voucher(&self, reference: &Reference, code: &VoucherCode) -> Result<Transaction> {
        self.update_transaction(reference, |tx| {
            let changed = tx.bind_voucher(code, Utc::now())?;
            Ok((tx.clone(), changed))
        })
    }

    async fn record_delivery(&self, reference: &Reference, delivery: DeliveryState) -> Result<()> {
        self.update_transaction(reference, |tx| {
            tx.record_delivery(delivery.clone(), Utc::now());
            Ok(((), true))
        })
    }

    async fn find_by_provider_id(
        &self,
        provider_transaction_id: &str,
    ) -> Result<Option<Transaction>> {
        let cf = self.cf(CF_PROVIDER_IDS)?;
        let Some(reference) = self.db.get_cf(cf, provider_transaction_id)? else {
            return Ok(None);
        };
        let reference = Reference::new(String::from_utf8_lossy(&reference))?;
        let tx = TransactionLedger::get(self, &reference).await?;
        Ok(tx.filter(|tx| {
            tx.provider.provider_transaction_id.as_deref() == Some(provider_transaction_id)
        }))
    }

    async fn get_all(&self) -> Result<Vec<Transaction>> {
        let cf = self.cf(CF_TRANSACTIONS)?;
        let mut transactions = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_key, value) = item?;
            transactions.push(decode(&value)?);
        }
        Ok(transactions)
    }
}

#[async_trait]
impl VoucherStore for RocksDBStore {
    async fn insert(&self, voucher: Voucher) -> Result<()> {
        let vouchers = self.cf(CF_VOUCHERS)?;
        let available = self.cf(CF_AVAILABLE)?;
        let claims = self.cf(CF_CLAIMS)?;
        let value = encode(&voucher)?;
        self.atomically(|txn| {
            if txn
                .get_for_update_cf(vouchers, voucher.code.as_str(), true)?
                .is_some()
            {
                return Err(PaymentError::DuplicateVoucher(voucher.code.to_string()));
            }
            txn.put_cf(vouchers, voucher.code.as_str(), &value)?;
            if voucher.status == VoucherStatus::Available {
                txn.put_cf(available, available_key(voucher.partition(), &voucher.code), b"")?;
            }
            if let Some(reference) = &voucher.transaction_reference {
                txn.put_cf(claims, reference.as_str(), voucher.code.as_str())?;
            }
            Ok(())
        })
    }

    async fn get(&self, code: &VoucherCode) -> Result<Option<Voucher>> {
        let cf = self.cf(CF_VOUCHERS)?;
        let result = self.db.get_cf(cf, code.as_str())?;
        result.map(|bytes| decode(&bytes)).transpose()
    }

    async fn claim(
        &self,
        partition: Partition,
        reference: &Reference,
        customer_contact: &str,
    ) -> Result<Claim> {
        let vouchers = self.cf(CF_VOUCHERS)?;
        let available = self.cf(CF_AVAILABLE)?;
        let claims = self.cf(CF_CLAIMS)?;
        self.atomically(|txn| {
            if let Some(code) = txn.get_for_update_cf(claims, reference.as_str(), true)? {
                let voucher = self.load_voucher(txn, &code, false)?.ok_or_else(|| {
                    PaymentError::internal(format!("claim index for {reference} is dangling"))
                })?;
                return Ok(Claim::AlreadyClaimed(voucher));
            }

            let now = Utc::now();
            for code in self.available_codes(partition)? {
                let Some(mut voucher) = self.load_voucher(txn, &code, true)? else {
                    continue;
                };
                // Stale index entries and expired vouchers are skipped.
                if !voucher.is_claimable(now) {
                    continue;
                }
                voucher.claim(reference, customer_contact, now)?;
                txn.put_cf(vouchers, &code, encode(&voucher)?)?;
                txn.delete_cf(available, available_key(partition, &voucher.code))?;
                txn.put_cf(claims, reference.as_str(), &code)?;
                return Ok(Claim::Claimed(voucher));
            }
            Ok(Claim::Exhausted)
        })
    }

    async fn claimed_by(&self, reference: &Reference) -> Result<Option<Voucher>> {
        let claims = self.cf(CF_CLAIMS)?;
        let vouchers = self.cf(CF_VOUCHERS)?;
        let Some(code) = self.db.get_cf(claims, reference.as_str())? else {
            return Ok(None);
        };
        let result = self.db.get_cf(vouchers, code)?;
        result.map(|bytes| decode(&bytes)).transpose()
    }

    async fn count_available(&self, partition: Partition) -> Result<usize> {
        let vouchers = self.cf(CF_VOUCHERS)?;
        let now = Utc::now();
        let mut count = 0;
        for code in self.available_codes(partition)? {
            if let Some(bytes) = self.db.get_cf(vouchers, &code)? {
                let voucher: Voucher = decode(&bytes)?;
                if voucher.is_claimable(now) {
                    count += 1;
                }
            }
        }
        Ok(count)
    }
}
