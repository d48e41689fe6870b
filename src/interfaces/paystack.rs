use crate::domain::Transaction;
use crate::domain::ports::{
    ChargeHandle, ChargeInstruction, PaymentGateway, ProviderVerdict, Verification,
};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://api.paystack.co";

#[derive(Debug, Clone)]
pub struct PaystackConfig {
    pub secret_key: String,
    pub base_url: String,
    pub callback_url: Option<String>,
    pub timeout: Duration,
}

impl PaystackConfig {
    pub fn new(secret_key: impl Into<String>) -> Self {
        Self {
            secret_key: secret_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            callback_url: None,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Paystack response envelope shared by every endpoint.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: bool,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct InitializeData {
    authorization_url: String,
    access_code: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct VerifyData {
    status: String,
    /// Minor units.
    amount: Option<i64>,
    id: Option<u64>,
    receipt_number: Option<String>,
    gateway_response: Option<String>,
}

/// [`PaymentGateway`] backed by the Paystack REST API.
pub struct PaystackGateway {
    client: reqwest::Client,
    config: PaystackConfig,
}

impl PaystackGateway {
    pub fn new(config: PaystackConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| PaymentError::InternalError(Box::new(e)))?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: reqwest::Client, config: PaystackConfig) -> Self {
        Self { client, config }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn read<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<(StatusCode, Envelope<T>)> {
        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(PaymentError::GatewayUnavailable(format!(
                "Paystack answered HTTP {status}"
            )));
        }
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(PaymentError::GatewayUnavailable(format!(
                "Paystack refused credentials (HTTP {status})"
            )));
        }
        let envelope = response.json::<Envelope<T>>().await.map_err(|e| {
            let message = format!("unreadable Paystack response (HTTP {status}): {e}");
            if status.is_client_error() {
                PaymentError::GatewayRejected(message)
            } else {
                PaymentError::GatewayUnavailable(message)
            }
        })?;
        Ok((status, envelope))
    }
}

fn transport(err: reqwest::Error) -> PaymentError {
    PaymentError::GatewayUnavailable(err.to_string())
}

/// Maps Paystack's `data.status` onto a verdict. Only the listed
/// failure states are final. `abandoned` is what Paystack reports for a
/// checkout the payer has not finished yet, so it stays in flight until
/// the pending window expires it.
fn classify(status: &str) -> ProviderVerdict {
    match status {
        "success" => ProviderVerdict::Settled,
        "failed" | "reversed" => ProviderVerdict::Declined,
        _ => ProviderVerdict::InFlight,
    }
}

#[async_trait]
impl PaymentGateway for PaystackGateway {
    fn name(&self) -> &str {
        "paystack"
    }

    async fn initialize(&self, instruction: &ChargeInstruction) -> Result<ChargeHandle> {
        let minor = (instruction.amount.value() * Decimal::ONE_HUNDRED)
            .round()
            .to_i64()
            .ok_or_else(|| PaymentError::ValidationError("Amount out of range".to_string()))?;
        let contact_field = if instruction.payer_contact.contains('@') {
            "email"
        } else {
            "phone"
        };
        let mut body = json!({
            "amount": minor,
            "reference": instruction.reference.as_str(),
            "metadata": instruction.metadata,
        });
        body[contact_field] = json!(instruction.payer_contact);
        if let Some(callback) = &self.config.callback_url {
            body["callback_url"] = json!(callback);
        }

        let response = self
            .client
            .post(self.url("/transaction/initialize"))
            .bearer_auth(&self.config.secret_key)
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        let (status, envelope) = Self::read::<InitializeData>(response).await?;

        match envelope.data {
            Some(data) if status.is_success() && envelope.status => Ok(ChargeHandle {
                reference: instruction.reference.clone(),
                redirect_url: Some(data.authorization_url),
                message: None,
                provider_transaction_id: data.access_code,
            }),
            _ => Err(PaymentError::GatewayRejected(if envelope.message.is_empty() {
                format!("HTTP {status}")
            } else {
                envelope.message
            })),
        }
    }

    async fn verify(&self, transaction: &Transaction) -> Result<Verification> {
        let reference = &transaction.reference;
        let response = self
            .client
            .get(self.url(&format!("/transaction/verify/{reference}")))
            .bearer_auth(&self.config.secret_key)
            .send()
            .await
            .map_err(transport)?;
        let (status, envelope) = Self::read::<VerifyData>(response).await?;
        debug!(%reference, http = %status, message = %envelope.message, "paystack verify");

        // An unknown reference is reported with `status: false`; the charge
        // may simply not have reached Paystack yet.
        let data = match envelope.data {
            Some(data) if envelope.status => data,
            _ => {
                return Ok(Verification {
                    verdict: ProviderVerdict::InFlight,
                    paid_amount: None,
                    provider_status: envelope.message,
                    provider_receipt: None,
                    provider_transaction_id: None,
                });
            }
        };

        Ok(Verification {
            verdict: classify(&data.status),
            paid_amount: data
                .amount
                .map(|minor| Decimal::from(minor) / Decimal::ONE_HUNDRED),
            provider_status: data.status,
            provider_receipt: data.receipt_number.or(data.gateway_response),
            provider_transaction_id: data.id.map(|id| id.to_string()),
        })
    }
}
