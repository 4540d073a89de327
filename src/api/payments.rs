//! Top-up payment endpoints
//!
//! - `POST /api/payment/create`           create an order and hand back the payable artifact
//! - `POST /api/payment/amount`           price a request without creating anything
//! - `GET  /api/payment/status/{order_id}` owner-only order lookup
//! - `GET  /api/payment/orders`           the caller's orders, newest first
//! - `POST /api/payment/callback/{method}` gateway notifications

use crate::error::{AppError, AppResult};
use crate::middleware::error::get_request_id_from_headers;
use crate::payments::error::PaymentError;
use crate::payments::types::{GatewayName, RawCallback};
use crate::services::order_lifecycle::{
    parse_amount, page_window, CreateOrderRequest, LifecycleError, OrderLifecycle,
};
use crate::database::order_repository::PaymentOrder;
use axum::{
    extract::{rejection::JsonRejection, FromRequestParts, Path, Query, RawQuery, State},
    http::{request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bigdecimal::{RoundingMode, ToPrimitive};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, warn};

pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct PaymentApiState {
    pub lifecycle: Arc<OrderLifecycle>,
}

pub fn routes(state: PaymentApiState) -> Router {
    Router::new()
        .route("/api/payment/create", post(create_payment))
        .route("/api/payment/amount", post(preview_amount))
        .route("/api/payment/status/{order_id}", get(get_order_status))
        .route("/api/payment/orders", get(list_orders))
        .route(
            "/api/payment/callback/{method}",
            post(handle_callback).get(handle_callback),
        )
        .with_state(state)
}

// ============================================================================
// Caller identity
// ============================================================================

/// User id asserted by the upstream auth layer in `X-User-Id`.
#[derive(Debug, Clone, Copy)]
pub struct CallerId(pub i64);

impl<S> FromRequestParts<S> for CallerId
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let request_id = get_request_id_from_headers(&parts.headers);
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
            .filter(|id| *id > 0)
            .map(CallerId)
            .ok_or_else(|| {
                AppError::unauthorized("Missing or invalid X-User-Id header")
                    .with_request_id(request_id)
            })
    }
}

// ============================================================================
// Request / response bodies
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreatePaymentBody {
    pub amount: serde_json::Value,
    #[serde(default)]
    pub top_up_code: Option<String>,
    pub payment_method: String,
}

#[derive(Debug, Deserialize)]
pub struct AmountBody {
    pub amount: serde_json::Value,
    #[serde(default)]
    pub top_up_code: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreatePaymentResponse {
    pub success: bool,
    pub message: String,
    pub order_id: String,
    pub data: BTreeMap<String, String>,
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct AmountResponse {
    pub success: bool,
    pub message: String,
    /// Effective amount after discount, rounded to cents.
    pub amount: f64,
    pub count: i64,
}

#[derive(Debug, Serialize)]
pub struct OrderResponse {
    pub success: bool,
    pub message: String,
    pub data: PaymentOrder,
}

#[derive(Debug, Deserialize)]
pub struct OrdersQuery {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct OrderPage {
    pub items: Vec<PaymentOrder>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

#[derive(Debug, Serialize)]
pub struct OrdersResponse {
    pub success: bool,
    pub message: String,
    pub data: OrderPage,
}

#[derive(Debug, Serialize)]
pub struct CallbackAck {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .or_else(|| headers.get("x-real-ip").and_then(|v| v.to_str().ok()))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/payment/create
pub async fn create_payment(
    State(state): State<PaymentApiState>,
    CallerId(user_id): CallerId,
    headers: HeaderMap,
    body: Result<Json<CreatePaymentBody>, JsonRejection>,
) -> AppResult<Json<CreatePaymentResponse>> {
    let request_id = get_request_id_from_headers(&headers);
    let Json(body) = body.map_err(|e| {
        AppError::validation("body", e.body_text()).with_request_id(request_id.clone())
    })?;

    let gateway = GatewayName::from_str(&body.payment_method)
        .map_err(|e| AppError::from(e).with_request_id(request_id.clone()))?;
    let amount =
        parse_amount(&body.amount).map_err(|e| AppError::from(e).with_request_id(request_id.clone()))?;

    let created = state
        .lifecycle
        .create_order(CreateOrderRequest {
            user_id,
            amount,
            gateway,
            discount_code: body.top_up_code,
            client_ip: client_ip(&headers),
        })
        .await
        .map_err(|e| AppError::from(e).with_request_id(request_id.clone()))?;

    info!(
        order_id = %created.order.order_id,
        user_id,
        gateway = %gateway,
        "payment order issued"
    );

    Ok(Json(CreatePaymentResponse {
        success: true,
        message: "success".to_string(),
        order_id: created.order.order_id,
        data: created.artifact.fields,
        url: created.artifact.redirect_target,
    }))
}

/// POST /api/payment/amount
pub async fn preview_amount(
    State(state): State<PaymentApiState>,
    headers: HeaderMap,
    body: Result<Json<AmountBody>, JsonRejection>,
) -> AppResult<Json<AmountResponse>> {
    let request_id = get_request_id_from_headers(&headers);
    let Json(body) = body.map_err(|e| {
        AppError::validation("body", e.body_text()).with_request_id(request_id.clone())
    })?;

    let amount =
        parse_amount(&body.amount).map_err(|e| AppError::from(e).with_request_id(request_id.clone()))?;
    let quote = state
        .lifecycle
        .quote(&amount, body.top_up_code.as_deref())
        .await
        .map_err(|e| AppError::from(e).with_request_id(request_id.clone()))?;

    Ok(Json(AmountResponse {
        success: true,
        message: "success".to_string(),
        amount: quote
            .effective_amount
            .with_scale_round(2, RoundingMode::HalfUp)
            .to_f64()
            .unwrap_or_default(),
        count: quote.quota_count,
    }))
}

/// GET /api/payment/status/{order_id}
pub async fn get_order_status(
    State(state): State<PaymentApiState>,
    CallerId(user_id): CallerId,
    Path(order_id): Path<String>,
    headers: HeaderMap,
) -> AppResult<Json<OrderResponse>> {
    let order = state
        .lifecycle
        .get_order(user_id, &order_id)
        .await
        .map_err(|e| AppError::from(e).with_request_id(get_request_id_from_headers(&headers)))?;

    Ok(Json(OrderResponse {
        success: true,
        message: "success".to_string(),
        data: order,
    }))
}

/// GET /api/payment/orders?page=&page_size=
pub async fn list_orders(
    State(state): State<PaymentApiState>,
    CallerId(user_id): CallerId,
    Query(query): Query<OrdersQuery>,
    headers: HeaderMap,
) -> AppResult<Json<OrdersResponse>> {
    let (items, total) = state
        .lifecycle
        .list_user_orders(user_id, query.page, query.page_size)
        .await
        .map_err(|e| AppError::from(e).with_request_id(get_request_id_from_headers(&headers)))?;

    let (page_size, offset) = page_window(query.page, query.page_size);
    Ok(Json(OrdersResponse {
        success: true,
        message: "success".to_string(),
        data: OrderPage {
            items,
            total,
            page: offset / page_size + 1,
            page_size,
        },
    }))
}

/// POST /api/payment/callback/{method}
///
/// Acknowledges every payload that parsed, whatever happened to the order.
/// Only unreadable payloads, unknown methods and unconfigured gateways are
/// answered with `success: false`.
pub async fn handle_callback(
    State(state): State<PaymentApiState>,
    Path(method): Path<String>,
    RawQuery(query): RawQuery,
    body: String,
) -> Response {
    let gateway = match GatewayName::from_str(&method) {
        Ok(gateway) => gateway,
        Err(e) => {
            warn!(method = %method, "callback for unknown payment method");
            return nack(StatusCode::BAD_REQUEST, e.user_message());
        }
    };

    let callback = RawCallback { body, query };
    match state.lifecycle.resolve_callback(gateway, &callback).await {
        Ok(outcome) => {
            info!(gateway = %gateway, outcome = ?outcome, "callback resolved");
            ack()
        }
        Err(LifecycleError::Payment(e @ PaymentError::MalformedCallback { .. })) => {
            warn!(gateway = %gateway, error = %e, "unparseable callback payload");
            nack(StatusCode::BAD_REQUEST, e.user_message())
        }
        Err(LifecycleError::Payment(
            e @ (PaymentError::ConfigIncomplete { .. } | PaymentError::KeyConfigError { .. }),
        )) => {
            error!(gateway = %gateway, error = %e, "callback for unconfigured gateway");
            nack(StatusCode::SERVICE_UNAVAILABLE, e.user_message())
        }
        Err(e) => {
            if e.is_retryable() {
                error!(gateway = %gateway, error = %e, "callback could not be applied");
            } else {
                warn!(gateway = %gateway, error = %e, "callback rejected");
            }
            ack()
        }
    }
}

fn ack() -> Response {
    (
        StatusCode::OK,
        Json(CallbackAck {
            success: true,
            message: None,
        }),
    )
        .into_response()
}

fn nack(status: StatusCode, message: String) -> Response {
    (
        status,
        Json(CallbackAck {
            success: false,
            message: Some(message),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ip_prefers_first_forwarded_hop() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers), None);
        headers.insert("x-real-ip", "10.0.0.9".parse().expect("header"));
        assert_eq!(client_ip(&headers).as_deref(), Some("10.0.0.9"));
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().expect("header"));
        assert_eq!(client_ip(&headers).as_deref(), Some("203.0.113.7"));
    }

    #[test]
    fn create_body_accepts_string_or_number_amounts() {
        let body: CreatePaymentBody = serde_json::from_value(serde_json::json!({
            "amount": "10.00",
            "payment_method": "alipay"
        }))
        .expect("body");
        assert!(body.top_up_code.is_none());
        assert!(parse_amount(&body.amount).is_ok());

        let body: AmountBody =
            serde_json::from_value(serde_json::json!({"amount": 5, "top_up_code": "WELCOME10"}))
                .expect("body");
        assert_eq!(body.top_up_code.as_deref(), Some("WELCOME10"));
    }
}
