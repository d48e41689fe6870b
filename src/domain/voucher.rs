use super::ids::{DistributionPointId, PackageId, Partition, Reference, ResellerId, VoucherCode};
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoucherStatus {
    Available,
    Claimed,
    Expired,
}

/// One pre-generated access credential in the shared pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Voucher {
    pub code: VoucherCode,
    pub username: Option<String>,
    pub password: Option<String>,
    pub package_id: PackageId,
    pub distribution_point_id: DistributionPointId,
    pub reseller_id: ResellerId,
    pub status: VoucherStatus,
    pub customer_contact: Option<String>,
    pub transaction_reference: Option<Reference>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Voucher {
    pub fn new(
        code: VoucherCode,
        package_id: PackageId,
        distribution_point_id: DistributionPointId,
        reseller_id: ResellerId,
    ) -> Self {
        Self {
            code,
            username: None,
            password: None,
            package_id,
            distribution_point_id,
            reseller_id,
            status: VoucherStatus::Available,
            customer_contact: None,
            transaction_reference: None,
            claimed_at: None,
            expires_at: None,
        }
    }

    pub fn with_credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.username = username.filter(|u| !u.trim().is_empty());
        self.password = password.filter(|p| !p.trim().is_empty());
        self
    }

    pub fn with_expiry(mut self, expires_at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = expires_at;
        self
    }

    pub fn partition(&self) -> Partition {
        Partition::new(self.package_id, self.distribution_point_id)
    }

    /// Login username; the code doubles as username when none was provisioned.
    pub fn username(&self) -> &str {
        self.username.as_deref().unwrap_or(self.code.as_str())
    }

    pub fn password(&self) -> &str {
        self.password.as_deref().unwrap_or(self.code.as_str())
    }

    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == VoucherStatus::Available && self.expires_at.is_none_or(|at| at > now)
    }

    /// Binds the voucher to a transaction. Only an available, unexpired
    /// voucher can be claimed, and only once.
    pub fn claim(
        &mut self,
        reference: &Reference,
        customer_contact: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if !self.is_claimable(at) {
            return Err(PaymentError::InvalidState(format!(
                "Voucher {} is not claimable",
                self.code
            )));
        }
        self.status = VoucherStatus::Claimed;
        self.transaction_reference = Some(reference.clone());
        self.customer_contact = Some(customer_contact.to_string());
        self.claimed_at = Some(at);
        Ok(())
    }
}

/// Result of the store's single conditional claim.
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// This call moved the voucher from `available` to `claimed`.
    Claimed(Voucher),
    /// The transaction already held a voucher; nothing was claimed.
    AlreadyClaimed(Voucher),
    Exhausted,
}

/// What the customer needs to log in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoucherCredentials {
    pub code: String,
    pub username: String,
    pub password: String,
}

impl From<&Voucher> for VoucherCredentials {
    fn from(voucher: &Voucher) -> Self {
        Self {
            code: voucher.code.to_string(),
            username: voucher.username().to_string(),
            password: voucher.password().to_string(),
        }
    }
}
