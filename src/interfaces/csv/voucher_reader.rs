use crate::domain::{DistributionPointId, PackageId, ResellerId, Voucher, VoucherCode};
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::io::Read;

#[derive(Debug, Deserialize)]
struct VoucherRecord {
    code: String,
    username: Option<String>,
    password: Option<String>,
    package_id: u32,
    distribution_point_id: u32,
    reseller_id: u32,
    expires_at: Option<DateTime<Utc>>,
}

impl TryFrom<VoucherRecord> for Voucher {
    type Error = PaymentError;

    fn try_from(record: VoucherRecord) -> Result<Self> {
        Ok(Voucher::new(
            VoucherCode::new(record.code)?,
            PackageId(record.package_id),
            DistributionPointId(record.distribution_point_id),
            ResellerId(record.reseller_id),
        )
        .with_credentials(record.username, record.password)
        .with_expiry(record.expires_at))
    }
}

/// Reads pre-generated vouchers from a CSV source.
///
/// Expects the header
/// `code,username,password,package_id,distribution_point_id,reseller_id,expires_at`;
/// the credential and expiry columns may be left empty.
pub struct VoucherReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> VoucherReader<R> {
    /// Creates a new `VoucherReader` from any `Read` source (e.g., File, Stdin).
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Returns an iterator that lazily reads and validates vouchers, one
    /// `Result` per row.
    pub fn vouchers(self) -> impl Iterator<Item = Result<Voucher>> {
        self.reader.into_deserialize().map(|result| {
            result
                .map_err(PaymentError::from)
                .and_then(|record: VoucherRecord| Voucher::try_from(record))
        })
    }
}
