use crate::domain::ports::{Notifier, VoucherDelivery};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::info;

pub const DEFAULT_TEMPLATE: &str = "Payment received. Your WiFi voucher: {voucher}\n\
Username: {username}\nPassword: {password}\nRef: {reference}";

#[derive(Debug, Clone)]
pub struct SmsConfig {
    pub api_url: String,
    pub api_key: String,
    pub partner_id: String,
    pub sender_id: String,
    pub template: String,
    pub timeout: Duration,
}

/// Bulk SMS API reply: one entry per recipient.
#[derive(Debug, Deserialize)]
struct SendReply {
    #[serde(default)]
    responses: Vec<SendResponse>,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    // Field name as spelled by the provider.
    #[serde(rename = "respose-code")]
    code: Option<i64>,
    #[serde(rename = "response-description")]
    description: Option<String>,
}

/// Sends voucher credentials by SMS through a TextSMS-compatible HTTP API.
pub struct SmsNotifier {
    client: reqwest::Client,
    config: SmsConfig,
}

impl SmsNotifier {
    pub fn new(config: SmsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| PaymentError::InternalError(Box::new(e)))?;
        Ok(Self { client, config })
    }

    fn render(&self, delivery: &VoucherDelivery) -> String {
        render(&self.config.template, delivery)
    }
}

/// Normalizes a Kenyan mobile number to the `2547XXXXXXXX` form the SMS
/// API expects.
pub fn normalize_phone(raw: &str) -> String {
    let digits: String = raw
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '+'))
        .collect();
    if let Some(rest) = digits.strip_prefix('0') {
        format!("254{rest}")
    } else if digits.starts_with("254") {
        digits
    } else {
        format!("254{digits}")
    }
}

fn render(template: &str, delivery: &VoucherDelivery) -> String {
    template
        .replace("{voucher}", &delivery.credentials.code)
        .replace("{username}", &delivery.credentials.username)
        .replace("{password}", &delivery.credentials.password)
        .replace("{reference}", delivery.reference.as_str())
}

#[async_trait]
impl Notifier for SmsNotifier {
    async fn deliver(&self, delivery: &VoucherDelivery) -> Result<()> {
        let mobile = normalize_phone(&delivery.recipient);
        let payload = json!({
            "apikey": self.config.api_key,
            "partnerID": self.config.partner_id,
            "message": self.render(delivery),
            "shortcode": self.config.sender_id,
            "mobile": mobile,
        });

        let response = self
            .client
            .post(&self.config.api_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| PaymentError::NotificationFailed(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(PaymentError::NotificationFailed(format!(
                "SMS API answered HTTP {status}"
            )));
        }

        let reply: SendReply = response
            .json()
            .await
            .map_err(|e| PaymentError::NotificationFailed(format!("unreadable SMS reply: {e}")))?;
        match reply.responses.first() {
            Some(SendResponse {
                code: Some(200), ..
            }) => {
                info!(reference = %delivery.reference, %mobile, "voucher SMS accepted");
                Ok(())
            }
            Some(other) => Err(PaymentError::NotificationFailed(
                other
                    .description
                    .clone()
                    .unwrap_or_else(|| format!("SMS API code {:?}", other.code)),
            )),
            None => Err(PaymentError::NotificationFailed(
                "SMS API returned no response entries".to_string(),
            )),
        }
    }
}

/// Logs deliveries instead of sending them. Used when no SMS API is configured.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, delivery: &VoucherDelivery) -> Result<()> {
        info!(
            reference = %delivery.reference,
            recipient = %delivery.recipient,
            code = %delivery.credentials.code,
            "voucher ready (no SMS gateway configured)"
        );
        Ok(())
    }
}
