#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use voucherpay::application::PaymentEngine;
use voucherpay::config::EngineConfig;
use voucherpay::domain::ports::{
    ChargeHandle, ChargeInstruction, Notifier, PaymentGateway, ProviderVerdict,
    TransactionLedger, Verification, VoucherDelivery, VoucherStore,
};
use voucherpay::domain::{
    Amount, ChargeRequest, Claim, DistributionPointId, PackageId, Partition, Reference,
    ResellerId, Transaction, Voucher, VoucherCode,
};
use voucherpay::error::{PaymentError, Result};
use voucherpay::infrastructure::in_memory::{InMemoryTransactionLedger, InMemoryVoucherStore};

#[derive(Clone)]
enum Script {
    Reply(Verification),
    Outage,
}

/// Gateway whose verify answers are set per reference. Unscripted
/// references are reported as still in flight.
#[derive(Default)]
pub struct ScriptedGateway {
    scripts: Mutex<HashMap<String, Script>>,
    pub verify_calls: AtomicUsize,
    pub reject_initialize: bool,
    pub unreachable_initialize: bool,
    /// Held inside `verify` to widen race windows.
    pub delay: Duration,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn rejecting() -> Self {
        Self {
            reject_initialize: true,
            ..Self::default()
        }
    }

    pub fn unreachable() -> Self {
        Self {
            unreachable_initialize: true,
            ..Self::default()
        }
    }

    fn script(&self, reference: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .insert(reference.to_string(), script);
    }

    pub fn settle(&self, reference: &str, paid: Decimal) {
        self.script(
            reference,
            Script::Reply(Verification {
                verdict: ProviderVerdict::Settled,
                paid_amount: Some(paid),
                provider_status: "success".to_string(),
                provider_receipt: Some(format!("RCPT-{reference}")),
                provider_transaction_id: Some("4099260516".to_string()),
            }),
        );
    }

    pub fn decline(&self, reference: &str) {
        self.script(
            reference,
            Script::Reply(Verification {
                verdict: ProviderVerdict::Declined,
                paid_amount: None,
                provider_status: "failed".to_string(),
                provider_receipt: None,
                provider_transaction_id: None,
            }),
        );
    }

    pub fn outage(&self, reference: &str) {
        self.script(reference, Script::Outage);
    }

    /// Back to the unscripted answer: still in flight.
    pub fn recover(&self, reference: &str) {
        self.scripts.lock().unwrap().remove(reference);
    }

    pub fn calls(&self) -> usize {
        self.verify_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn initialize(&self, instruction: &ChargeInstruction) -> Result<ChargeHandle> {
        if self.unreachable_initialize {
            return Err(PaymentError::GatewayUnavailable(
                "connect timeout".to_string(),
            ));
        }
        if self.reject_initialize {
            return Err(PaymentError::GatewayRejected(
                "Amount below minimum".to_string(),
            ));
        }
        Ok(ChargeHandle {
            reference: instruction.reference.clone(),
            redirect_url: Some(format!("https://checkout.test/{}", instruction.reference)),
            message: None,
            provider_transaction_id: Some(format!("ACCESS_{}", instruction.reference)),
        })
    }

    async fn verify(&self, transaction: &Transaction) -> Result<Verification> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(transaction.reference.as_str())
            .cloned();
        match script {
            Some(Script::Reply(verification)) => Ok(verification),
            Some(Script::Outage) => Err(PaymentError::GatewayUnavailable(
                "connection reset by peer".to_string(),
            )),
            None => Ok(Verification {
                verdict: ProviderVerdict::InFlight,
                paid_amount: None,
                provider_status: "ongoing".to_string(),
                provider_receipt: None,
                provider_transaction_id: None,
            }),
        }
    }
}

/// Notifier that records deliveries and can be told to fail.
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<VoucherDelivery>>,
    pub failures_left: AtomicUsize,
    /// Milliseconds spent "sending" before each delivery completes.
    pub latency_ms: AtomicU64,
}

impl RecordingNotifier {
    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn deliver(&self, delivery: &VoucherDelivery) -> Result<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PaymentError::NotificationFailed("SMS API timeout".to_string()));
        }
        self.sent.lock().unwrap().push(delivery.clone());
        Ok(())
    }
}

/// Voucher store wrapper counting how often the pool is actually depleted.
#[derive(Default)]
pub struct CountingVoucherStore {
    inner: InMemoryVoucherStore,
    pub claim_calls: AtomicUsize,
    pub fresh_claims: AtomicUsize,
    /// Held inside `claim` before touching the pool.
    pub claim_delay: Duration,
}

impl CountingVoucherStore {
    pub fn with_claim_delay(claim_delay: Duration) -> Self {
        Self {
            claim_delay,
            ..Self::default()
        }
    }

    pub fn fresh(&self) -> usize {
        self.fresh_claims.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.claim_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VoucherStore for CountingVoucherStore {
    async fn insert(&self, voucher: Voucher) -> Result<()> {
        self.inner.insert(voucher).await
    }

    async fn get(&self, code: &VoucherCode) -> Result<Option<Voucher>> {
        self.inner.get(code).await
    }

    async fn claim(
        &self,
        partition: Partition,
        reference: &Reference,
        customer_contact: &str,
    ) -> Result<Claim> {
        self.claim_calls.fetch_add(1, Ordering::SeqCst);
        if !self.claim_delay.is_zero() {
            tokio::time::sleep(self.claim_delay).await;
        }
        let claim = self
            .inner
            .claim(partition, reference, customer_contact)
            .await?;
        if matches!(claim, Claim::Claimed(_)) {
            self.fresh_claims.fetch_add(1, Ordering::SeqCst);
        }
        Ok(claim)
    }

    async fn claimed_by(&self, reference: &Reference) -> Result<Option<Voucher>> {
        self.inner.claimed_by(reference).await
    }

    async fn count_available(&self, partition: Partition) -> Result<usize> {
        self.inner.count_available(partition).await
    }
}

pub fn partition() -> Partition {
    Partition::new(PackageId(1), DistributionPointId(10))
}

pub fn voucher(code: &str, partition: Partition) -> Voucher {
    Voucher::new(
        VoucherCode::new(code).unwrap(),
        partition.package_id,
        partition.distribution_point_id,
        ResellerId(7),
    )
}

pub fn request(amount: Decimal, partition: Partition) -> ChargeRequest {
    ChargeRequest {
        amount: Amount::new(amount).unwrap(),
        payer_contact: "0712345678".to_string(),
        package_id: partition.package_id,
        distribution_point_id: partition.distribution_point_id,
        reseller_id: ResellerId(7),
    }
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        pending_ttl: Some(Duration::from_secs(15 * 60)),
        bind_backoff: Duration::from_millis(1),
        binding_wait: Duration::from_millis(500),
        ..EngineConfig::default()
    }
}

pub struct Fixture {
    pub engine: Arc<PaymentEngine>,
    pub ledger: Arc<InMemoryTransactionLedger>,
    pub vouchers: Arc<CountingVoucherStore>,
    pub gateway: Arc<ScriptedGateway>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Fixture {
    pub async fn new(codes: &[&str], gateway: ScriptedGateway) -> Self {
        Self::with_store(codes, gateway, CountingVoucherStore::default(), test_config()).await
    }

    pub async fn with_config(
        codes: &[&str],
        gateway: ScriptedGateway,
        config: EngineConfig,
    ) -> Self {
        Self::with_store(codes, gateway, CountingVoucherStore::default(), config).await
    }

    pub async fn with_store(
        codes: &[&str],
        gateway: ScriptedGateway,
        store: CountingVoucherStore,
        config: EngineConfig,
    ) -> Self {
        let ledger = Arc::new(InMemoryTransactionLedger::new());
        let vouchers = Arc::new(store);
        for code in codes {
            vouchers.insert(voucher(code, partition())).await.unwrap();
        }
        let gateway = Arc::new(gateway);
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = Arc::new(PaymentEngine::new(
            ledger.clone(),
            vouchers.clone(),
            gateway.clone(),
            notifier.clone(),
            config,
        ));
        Self {
            engine,
            ledger,
            vouchers,
            gateway,
            notifier,
        }
    }

    /// Records a pending transaction as if `initialize` had created it.
    pub async fn seed_pending(&self, reference: &str, amount: Decimal) -> Reference {
        self.seed_pending_at(reference, amount, partition(), Utc::now())
            .await
    }

    pub async fn seed_pending_at(
        &self,
        reference: &str,
        amount: Decimal,
        partition: Partition,
        created_at: DateTime<Utc>,
    ) -> Reference {
        let reference = Reference::new(reference).unwrap();
        self.ledger
            .record_created(Transaction::new(
                reference.clone(),
                request(amount, partition),
                "scripted",
                created_at,
            ))
            .await
            .unwrap();
        reference
    }

    pub async fn transaction(&self, reference: &Reference) -> Transaction {
        self.ledger.get(reference).await.unwrap().unwrap()
    }
}
