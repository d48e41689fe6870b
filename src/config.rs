use std::time::Duration;

/// Tunables for the reconciliation pipeline.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a transaction may stay `pending` before the timeout path
    /// fails it. `None` disables expiry.
    pub pending_ttl: Option<Duration>,
    /// Attempts at writing the claimed voucher back onto the ledger.
    pub bind_attempts: u32,
    /// Delay before the first binding retry; doubled on each attempt.
    pub bind_backoff: Duration,
    /// Delivery attempts after which the sweep stops re-sending.
    pub max_delivery_attempts: u32,
    /// How long the sweep leaves an unsent or in-progress delivery alone
    /// before assuming its sender died and sending again.
    pub delivery_grace: Duration,
    /// How long a confirmation that lost the transition race waits for the
    /// winner's voucher claim before reporting the voucher as pending.
    pub binding_wait: Duration,
    pub reference_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pending_ttl: Some(Duration::from_secs(15 * 60)),
            bind_attempts: 5,
            bind_backoff: Duration::from_millis(50),
            max_delivery_attempts: 3,
            delivery_grace: Duration::from_secs(60),
            binding_wait: Duration::from_secs(2),
            reference_prefix: "VP".to_string(),
        }
    }
}
