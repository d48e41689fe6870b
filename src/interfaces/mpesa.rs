use crate::domain::Transaction;
use crate::domain::ports::{
    ChargeHandle, ChargeInstruction, PaymentGateway, ProviderVerdict, Verification,
};
use crate::error::{PaymentError, Result};
use crate::interfaces::sms::normalize_phone;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{FixedOffset, Utc};
use reqwest::StatusCode;
use rust_decimal::prelude::ToPrimitive;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

pub const SANDBOX_BASE_URL: &str = "https://sandbox.safaricom.co.ke";

/// Daraja timestamps are East Africa Time.
const EAT_OFFSET_SECS: i32 = 3 * 3600;
/// The payer dismissed the prompt or has not answered it yet.
const RESULT_CANCELLED: &str = "1032";
/// Daraja caps `AccountReference` at 12 characters.
const ACCOUNT_REFERENCE_LEN: usize = 12;
/// Tokens are refreshed this long before Daraja says they lapse.
const TOKEN_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct MpesaConfig {
    pub consumer_key: String,
    pub consumer_secret: String,
    /// Paybill or till number receiving the payment.
    pub short_code: String,
    pub passkey: String,
    /// Where Daraja posts the `stkCallback`.
    pub callback_url: String,
    pub base_url: String,
    pub transaction_desc: String,
    pub timeout: Duration,
}

impl MpesaConfig {
    pub fn new(
        consumer_key: impl Into<String>,
        consumer_secret: impl Into<String>,
        short_code: impl Into<String>,
        passkey: impl Into<String>,
        callback_url: impl Into<String>,
    ) -> Self {
        Self {
            consumer_key: consumer_key.into(),
            consumer_secret: consumer_secret.into(),
            short_code: short_code.into(),
            passkey: passkey.into(),
            callback_url: callback_url.into(),
            base_url: SANDBOX_BASE_URL.to_string(),
            transaction_desc: "WiFi voucher".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenReply {
    access_token: String,
    /// Seconds; Daraja sends it as a string.
    #[serde(default)]
    expires_in: Value,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// Every Daraja answer: the acknowledgement fields of a push or query, or
/// the `errorCode`/`errorMessage` envelope of a refused request.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct DarajaReply {
    response_code: Option<String>,
    response_description: Option<String>,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: Option<String>,
    customer_message: Option<String>,
    result_code: Option<Value>,
    result_desc: Option<String>,
    #[serde(rename = "errorCode")]
    error_code: Option<String>,
    #[serde(rename = "errorMessage")]
    error_message: Option<String>,
}

impl DarajaReply {
    fn accepted(&self) -> bool {
        self.response_code.as_deref() == Some("0")
    }

    fn message(&self, status: StatusCode) -> String {
        self.error_message
            .clone()
            .or_else(|| self.response_description.clone())
            .unwrap_or_else(|| format!("HTTP {status}"))
    }
}

/// Result codes come back as `"0"` or `0` depending on the endpoint.
fn code_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Maps an STK query `ResultCode` onto a verdict. Only success is final in
/// the payer's favour; a cancelled or unanswered prompt stays in flight
/// until the pending window expires it.
fn classify(result_code: &str) -> ProviderVerdict {
    match result_code {
        "0" => ProviderVerdict::Settled,
        RESULT_CANCELLED => ProviderVerdict::InFlight,
        _ => ProviderVerdict::Declined,
    }
}

fn password(short_code: &str, passkey: &str, timestamp: &str) -> String {
    STANDARD.encode(format!("{short_code}{passkey}{timestamp}"))
}

fn timestamp() -> String {
    let now = Utc::now();
    match FixedOffset::east_opt(EAT_OFFSET_SECS) {
        Some(eat) => now.with_timezone(&eat).format("%Y%m%d%H%M%S").to_string(),
        None => now.format("%Y%m%d%H%M%S").to_string(),
    }
}

fn account_reference(reference: &str) -> &str {
    let start = reference.len().saturating_sub(ACCOUNT_REFERENCE_LEN);
    reference.get(start..).unwrap_or(reference)
}

fn transport(err: reqwest::Error) -> PaymentError {
    PaymentError::GatewayUnavailable(err.to_string())
}

/// [`PaymentGateway`] backed by Safaricom's Daraja API.
///
/// `initialize` sends an STK push to the payer's phone and records the
/// `CheckoutRequestID`, which `verify` later hands to the STK query.
pub struct MpesaGateway {
    client: reqwest::Client,
    config: MpesaConfig,
    token: Mutex<Option<CachedToken>>,
}

impl MpesaGateway {
    pub fn new(config: MpesaConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| PaymentError::InternalError(Box::new(e)))?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: reqwest::Client, config: MpesaConfig) -> Self {
        Self {
            client,
            config,
            token: Mutex::new(None),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// OAuth bearer token, fetched on first use and reused until shortly
    /// before it lapses.
    async fn token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| Instant::now() < t.refresh_at) {
            return Ok(token.value.clone());
        }

        let response = self
            .client
            .get(self.url("/oauth/v1/generate"))
            .query(&[("grant_type", "client_credentials")])
            .basic_auth(&self.config.consumer_key, Some(&self.config.consumer_secret))
            .send()
            .await
            .map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(PaymentError::GatewayUnavailable(format!(
                "Daraja token request answered HTTP {status}"
            )));
        }
        let reply: TokenReply = response.json().await.map_err(|e| {
            PaymentError::GatewayUnavailable(format!("unreadable Daraja token: {e}"))
        })?;

        let lifetime = code_text(&reply.expires_in)
            .and_then(|secs| secs.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(3599));
        *cached = Some(CachedToken {
            value: reply.access_token.clone(),
            refresh_at: Instant::now() + lifetime.saturating_sub(TOKEN_MARGIN),
        });
        Ok(reply.access_token)
    }

    async fn post(&self, path: &str, body: &Value) -> Result<(StatusCode, DarajaReply)> {
        let token = self.token().await?;
        let response = self
            .client
            .post(self.url(path))
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS
            || matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
        {
            // A stale token is dropped so the next call fetches a new one.
            self.token.lock().await.take();
            return Err(PaymentError::GatewayUnavailable(format!(
                "Daraja answered HTTP {status}"
            )));
        }
        match response.json::<DarajaReply>().await {
            Ok(reply) => Ok((status, reply)),
            Err(e) if status.is_client_error() => Err(PaymentError::GatewayRejected(format!(
                "unreadable Daraja response (HTTP {status}): {e}"
            ))),
            Err(e) => Err(PaymentError::GatewayUnavailable(format!(
                "unreadable Daraja response (HTTP {status}): {e}"
            ))),
        }
    }

    fn in_flight(status: String, checkout_request_id: &str) -> Verification {
        Verification {
            verdict: ProviderVerdict::InFlight,
            paid_amount: None,
            provider_status: status,
            provider_receipt: None,
            provider_transaction_id: Some(checkout_request_id.to_string()),
        }
    }
}

#[async_trait]
impl PaymentGateway for MpesaGateway {
    fn name(&self) -> &str {
        "mpesa"
    }

    async fn initialize(&self, instruction: &ChargeInstruction) -> Result<ChargeHandle> {
        let amount = instruction.amount.value();
        if !amount.fract().is_zero() {
            return Err(PaymentError::GatewayRejected(format!(
                "M-Pesa charges whole shillings only, got {amount}"
            )));
        }
        let amount = amount
            .to_u64()
            .ok_or_else(|| PaymentError::ValidationError("Amount out of range".to_string()))?;
        if instruction.payer_contact.contains('@') {
            return Err(PaymentError::GatewayRejected(
                "M-Pesa needs the payer's phone number".to_string(),
            ));
        }

        let phone = normalize_phone(&instruction.payer_contact);
        let timestamp = timestamp();
        let body = json!({
            "BusinessShortCode": self.config.short_code,
            "Password": password(&self.config.short_code, &self.config.passkey, &timestamp),
            "Timestamp": timestamp,
            "TransactionType": "CustomerPayBillOnline",
            "Amount": amount,
            "PartyA": phone,
            "PartyB": self.config.short_code,
            "PhoneNumber": phone,
            "CallBackURL": self.config.callback_url,
            "AccountReference": account_reference(instruction.reference.as_str()),
            "TransactionDesc": self.config.transaction_desc,
        });

        let (status, reply) = self.post("/mpesa/stkpush/v1/processrequest", &body).await?;
        match reply.checkout_request_id.clone() {
            Some(checkout_request_id) if status.is_success() && reply.accepted() => {
                debug!(reference = %instruction.reference, %checkout_request_id, "stk push accepted");
                Ok(ChargeHandle {
                    reference: instruction.reference.clone(),
                    redirect_url: None,
                    message: reply.customer_message,
                    provider_transaction_id: Some(checkout_request_id),
                })
            }
            _ if status.is_server_error() => {
                Err(PaymentError::GatewayUnavailable(reply.message(status)))
            }
            _ => Err(PaymentError::GatewayRejected(reply.message(status))),
        }
    }

    async fn verify(&self, transaction: &Transaction) -> Result<Verification> {
        let Some(checkout_request_id) = transaction.provider.provider_transaction_id.as_deref()
        else {
            // The push was never acknowledged, so there is nothing to query.
            return Ok(Verification {
                verdict: ProviderVerdict::InFlight,
                paid_amount: None,
                provider_status: "no STK push recorded".to_string(),
                provider_receipt: None,
                provider_transaction_id: None,
            });
        };

        let timestamp = timestamp();
        let body = json!({
            "BusinessShortCode": self.config.short_code,
            "Password": password(&self.config.short_code, &self.config.passkey, &timestamp),
            "Timestamp": timestamp,
            "CheckoutRequestID": checkout_request_id,
        });
        let (status, reply) = match self.post("/mpesa/stkpushquery/v1/query", &body).await {
            Ok(answer) => answer,
            Err(PaymentError::GatewayRejected(message)) => {
                return Ok(Self::in_flight(message, checkout_request_id));
            }
            Err(e) => return Err(e),
        };
        debug!(reference = %transaction.reference, http = %status, "stk query");

        let result_code = reply.result_code.as_ref().and_then(code_text);
        let Some(result_code) = result_code.filter(|_| reply.accepted()) else {
            // Daraja answers a query for a prompt still on the payer's
            // phone with an HTTP 500 "being processed" error.
            let message = reply.message(status);
            if status.is_server_error() && !message.contains("being processed") {
                return Err(PaymentError::GatewayUnavailable(message));
            }
            return Ok(Self::in_flight(message, checkout_request_id));
        };

        let verdict = classify(&result_code);
        Ok(Verification {
            verdict,
            // The push fixed the amount; Daraja only reports whether it was paid.
            paid_amount: (verdict == ProviderVerdict::Settled)
                .then(|| transaction.amount.value()),
            provider_status: reply.result_desc.unwrap_or(result_code),
            provider_receipt: None,
            provider_transaction_id: Some(checkout_request_id.to_string()),
        })
    }
}
