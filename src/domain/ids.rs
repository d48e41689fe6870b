use crate::error::{PaymentError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

const MAX_REFERENCE_LEN: usize = 100;

/// Caller-visible identifier of one payment attempt. Never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Reference(String);

impl Reference {
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into().trim().to_string();
        if value.is_empty() {
            return Err(PaymentError::ValidationError(
                "Reference must not be empty".to_string(),
            ));
        }
        if value.len() > MAX_REFERENCE_LEN {
            return Err(PaymentError::ValidationError(format!(
                "Reference longer than {MAX_REFERENCE_LEN} characters"
            )));
        }
        Ok(Self(value))
    }

    /// Generates a fresh reference of the form `PREFIX_<uuid>`.
    pub fn generate(prefix: &str) -> Self {
        Self(format!("{prefix}_{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique access code of a voucher.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VoucherCode(String);

impl VoucherCode {
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into().trim().to_string();
        if value.is_empty() {
            return Err(PaymentError::ValidationError(
                "Voucher code must not be empty".to_string(),
            ));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VoucherCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageId(pub u32);

/// A hotspot (router) through which vouchers are redeemed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DistributionPointId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResellerId(pub u32);

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for DistributionPointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ResellerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The `(package, distribution point)` pair bounding which vouchers may
/// satisfy a transaction. Allocation never crosses partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Partition {
    pub package_id: PackageId,
    pub distribution_point_id: DistributionPointId,
}

impl Partition {
    pub fn new(package_id: PackageId, distribution_point_id: DistributionPointId) -> Self {
        Self {
            package_id,
            distribution_point_id,
        }
    }

    /// Big-endian key prefix; orders partitions the same way `Ord` does.
    pub fn key_prefix(&self) -> [u8; 8] {
        let mut key = [0u8; 8];
        key[..4].copy_from_slice(&self.package_id.0.to_be_bytes());
        key[4..].copy_from_slice(&self.distribution_point_id.0.to_be_bytes());
        key
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "package={}/point={}",
            self.package_id, self.distribution_point_id
        )
    }
}
