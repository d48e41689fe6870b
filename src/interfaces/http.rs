use crate::application::{PaymentEngine, StatusView, SweepReport, Trigger};
use crate::domain::ports::ChargeHandle;
use crate::domain::{
    Amount, ChargeRequest, DistributionPointId, PackageId, Reference, ResellerId,
};
use crate::error::PaymentError;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub type AppState = Arc<PaymentEngine>;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/payments", post(initialize))
        .route("/confirm", post(webhook))
        .route("/status", get(status))
        .route("/recheck/:reference", post(recheck))
        .route("/sweep", post(sweep))
        .with_state(state)
}

/// Serves the router on `listener` until the process is stopped.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "listening");
    }
    axum::serve(listener, build_router(state)).await
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error(transparent)]
    Payment(#[from] PaymentError),
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Http { status, message } => {
                (status, Json(serde_json::json!({ "error": message }))).into_response()
            }
            ApiError::Payment(err) => {
                let status = match &err {
                    PaymentError::NotFound(_) => StatusCode::NOT_FOUND,
                    PaymentError::ValidationError(_) => StatusCode::BAD_REQUEST,
                    PaymentError::GatewayRejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
                    PaymentError::GatewayUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (
                    status,
                    Json(serde_json::json!({
                        "error": err.to_string(),
                        "retryable": err.is_retryable(),
                    })),
                )
                    .into_response()
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: env!("CARGO_PKG_NAME"),
    })
}

#[derive(Debug, Deserialize)]
pub struct InitializeRequest {
    pub amount: Decimal,
    pub payer_contact: String,
    pub package_id: u32,
    pub distribution_point_id: u32,
    pub reseller_id: u32,
}

async fn initialize(
    State(engine): State<AppState>,
    Json(request): Json<InitializeRequest>,
) -> Result<Json<ChargeHandle>, ApiError> {
    let request = ChargeRequest {
        amount: Amount::new(request.amount)?,
        payer_contact: request.payer_contact,
        package_id: PackageId(request.package_id),
        distribution_point_id: DistributionPointId(request.distribution_point_id),
        reseller_id: ResellerId(request.reseller_id),
    };
    Ok(Json(engine.initialize(request).await?))
}

/// What a provider push identifies the payment by.
#[derive(Debug, PartialEq)]
enum WebhookSubject {
    Reference(Reference),
    /// M-Pesa callbacks only carry the `CheckoutRequestID`.
    ProviderId(String),
}

/// Pulls the payment out of a provider push: a Paystack event
/// (`{event, data: {reference}}`), an M-Pesa `{Body: {stkCallback}}` or a
/// bare `{reference}` body. `Ok(None)` marks an event we do not act on.
fn webhook_subject(body: &Value) -> Result<Option<WebhookSubject>, ApiError> {
    if let Some(callback) = body.pointer("/Body/stkCallback") {
        let id = callback
            .get("CheckoutRequestID")
            .and_then(Value::as_str)
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| ApiError::bad_request("Missing CheckoutRequestID"))?;
        return Ok(Some(WebhookSubject::ProviderId(id.to_string())));
    }

    let event = body.get("event").and_then(Value::as_str);
    if event.is_some_and(|event| !event.starts_with("charge.")) {
        return Ok(None);
    }
    let raw = body
        .pointer("/data/reference")
        .or_else(|| body.get("reference"))
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::bad_request("Missing payment reference"))?;
    Ok(Some(WebhookSubject::Reference(Reference::new(raw)?)))
}

fn ignored(reason: &str) -> Response {
    (
        StatusCode::OK,
        Json(serde_json::json!({ "status": "ignored", "reason": reason })),
    )
        .into_response()
}

/// Gateway push. Anything the provider should stop redelivering is answered
/// with 200; only transient failures are surfaced so the provider retries.
async fn webhook(
    State(engine): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let reference = match webhook_subject(&body)? {
        None => return Ok(ignored("event")),
        Some(WebhookSubject::Reference(reference)) => reference,
        Some(WebhookSubject::ProviderId(id)) => match engine.find_by_provider_id(&id).await? {
            Some(tx) => tx.reference,
            None => {
                warn!(provider_transaction_id = %id, "webhook for unknown provider id");
                return Ok(ignored("unknown reference"));
            }
        },
    };
    match engine.confirm(&reference, Trigger::Webhook).await {
        Ok(confirmation) => Ok(Json(StatusView::from(&confirmation)).into_response()),
        Err(PaymentError::NotFound(_)) => {
            warn!(%reference, "webhook for unknown reference");
            Ok(ignored("unknown reference"))
        }
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    reference: String,
}

async fn status(
    State(engine): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<StatusView>, ApiError> {
    let reference = Reference::new(query.reference)?;
    Ok(Json(engine.status(&reference).await?))
}

async fn recheck(
    State(engine): State<AppState>,
    Path(reference): Path<String>,
) -> Result<Json<StatusView>, ApiError> {
    let reference = Reference::new(reference)?;
    let confirmation = engine.confirm(&reference, Trigger::Manual).await?;
    Ok(Json(StatusView::from(&confirmation)))
}

async fn sweep(State(engine): State<AppState>) -> Result<Json<SweepReport>, ApiError> {
    Ok(Json(engine.sweep().await?))
}
