//! Order lifecycle service
//!
//! Creates top-up orders and applies gateway callbacks to them. Status moves
//! `pending -> processing -> success` or `pending -> failed`; the
//! `processing` state is a latch taken by compare-and-set before the ledger is
//! touched, so at most one delivery of a callback can credit an order.

use crate::database::error::DatabaseError;
use crate::database::ledger_repository::{CreditGrant, CreditLedger};
use crate::database::order_repository::{NewPaymentOrder, OrderStatus, OrderStore, PaymentOrder};
use crate::payments::error::PaymentError;
use crate::payments::factory::PaymentGatewayFactory;
use crate::payments::types::{
    CallbackNotice, ExternalStatus, GatewayName, GatewayOrderRequest, PaymentArtifact,
    RawCallback,
};
use crate::services::amount_policy::{to_minor_units, AmountPolicy, AmountPolicyError, AmountQuote};
use bigdecimal::{BigDecimal, RoundingMode, Zero};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

// ============================================================================
// Errors and outcomes
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("invalid amount: {message}")]
    InvalidAmount { message: String },

    #[error(transparent)]
    Payment(#[from] PaymentError),

    /// The order row exists and stays `pending`; the gateway could not issue
    /// a payable artifact for it.
    #[error("gateway call failed for order {order_id}: {source}")]
    GatewayFailed {
        order_id: String,
        #[source]
        source: PaymentError,
    },

    #[error("order not found: {order_id}")]
    OrderNotFound { order_id: String },

    #[error("order {order_id} belongs to another user")]
    Forbidden { order_id: String },

    #[error("callback for order {order_id} rejected: {reason}")]
    SignatureInvalid {
        gateway: GatewayName,
        order_id: String,
        reason: String,
    },

    #[error("credit failed for order {order_id}: {message}")]
    CreditFailed { order_id: String, message: String },

    #[error("database error: {0}")]
    Database(#[from] DatabaseError),
}

impl From<AmountPolicyError> for LifecycleError {
    fn from(e: AmountPolicyError) -> Self {
        LifecycleError::InvalidAmount {
            message: e.to_string(),
        }
    }
}

impl LifecycleError {
    pub fn http_status_code(&self) -> u16 {
        match self {
            LifecycleError::InvalidAmount { .. } => 400,
            LifecycleError::Payment(e) => e.http_status_code(),
            LifecycleError::GatewayFailed { source, .. } => source.http_status_code(),
            LifecycleError::OrderNotFound { .. } => 404,
            LifecycleError::Forbidden { .. } => 403,
            LifecycleError::SignatureInvalid { .. } => 401,
            LifecycleError::CreditFailed { .. } => 500,
            LifecycleError::Database(_) => 500,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            LifecycleError::Payment(e) => e.is_retryable(),
            LifecycleError::GatewayFailed { source, .. } => source.is_retryable(),
            LifecycleError::CreditFailed { .. } => true,
            LifecycleError::Database(e) => e.is_retryable(),
            _ => false,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            LifecycleError::InvalidAmount { message } => message.clone(),
            LifecycleError::Payment(e) => e.user_message(),
            LifecycleError::GatewayFailed { source, .. } => source.user_message(),
            LifecycleError::OrderNotFound { .. } => "Order not found".to_string(),
            LifecycleError::Forbidden { .. } => "You do not have access to this order".to_string(),
            LifecycleError::SignatureInvalid { .. } => "Callback could not be authenticated".to_string(),
            LifecycleError::CreditFailed { .. } => {
                "Payment received but crediting failed; it will be retried".to_string()
            }
            LifecycleError::Database(_) => "Internal storage error".to_string(),
        }
    }
}

/// What a callback did to its order. Every variant is a successful
/// resolution from the gateway's point of view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CallbackOutcome {
    Credited {
        order_id: String,
        user_id: i64,
        quota: i64,
    },
    MarkedFailed {
        order_id: String,
        reason: String,
    },
    /// The order already reached `success` or `failed`.
    AlreadyProcessed {
        order_id: String,
        status: OrderStatus,
    },
    /// Another delivery holds the `processing` latch.
    AlreadyProcessing { order_id: String },
    /// Intermediate gateway status; nothing to apply yet.
    Ignored { order_id: String, raw_status: String },
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone)]
pub struct CreateOrderRequest {
    pub user_id: i64,
    pub amount: BigDecimal,
    pub gateway: GatewayName,
    pub discount_code: Option<String>,
    pub client_ip: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreatedOrder {
    pub order: PaymentOrder,
    pub artifact: PaymentArtifact,
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Apply callbacks whose authenticity could not be confirmed.
    pub allow_unverified_callbacks: bool,
    pub default_client_ip: String,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            allow_unverified_callbacks: false,
            default_client_ip: "127.0.0.1".to_string(),
        }
    }
}

pub const DEFAULT_PAGE_SIZE: i64 = 10;
pub const MAX_PAGE_SIZE: i64 = 100;
const ORDER_ID_MAX_LEN: usize = 32;
const CREATE_ATTEMPTS: usize = 3;
const RESOLVE_ATTEMPTS: usize = 4;

static ORDER_SEQUENCE: AtomicU32 = AtomicU32::new(0);

/// `PAY` + user id + unix seconds + 3-digit process sequence + 4 random hex
/// digits. The user segment keeps only its trailing digits when the whole id
/// would exceed 32 characters.
pub fn generate_order_id(user_id: i64, now: DateTime<Utc>) -> String {
    let sequence = ORDER_SEQUENCE.fetch_add(1, Ordering::Relaxed) % 1000;
    let entropy: u16 = rand::thread_rng().gen();
    let suffix = format!("{}{:03}{:04x}", now.timestamp(), sequence, entropy);

    let user = user_id.unsigned_abs().to_string();
    let room = ORDER_ID_MAX_LEN.saturating_sub(3 + suffix.len());
    let user = if user.len() > room {
        &user[user.len() - room..]
    } else {
        user.as_str()
    };
    format!("PAY{}{}", user, suffix)
}

// ============================================================================
// Service
// ============================================================================

pub struct OrderLifecycle {
    orders: Arc<dyn OrderStore>,
    ledger: Arc<dyn CreditLedger>,
    policy: Arc<AmountPolicy>,
    gateways: Arc<PaymentGatewayFactory>,
    config: LifecycleConfig,
}

impl OrderLifecycle {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        ledger: Arc<dyn CreditLedger>,
        policy: Arc<AmountPolicy>,
        gateways: Arc<PaymentGatewayFactory>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            orders,
            ledger,
            policy,
            gateways,
            config,
        }
    }

    pub fn policy(&self) -> &AmountPolicy {
        &self.policy
    }

    /// Prices a request without creating anything.
    pub async fn quote(
        &self,
        amount: &BigDecimal,
        discount_code: Option<&str>,
    ) -> Result<AmountQuote, LifecycleError> {
        Ok(self.policy.compute(amount, discount_code).await?)
    }

    pub async fn create_order(&self, request: CreateOrderRequest) -> Result<CreatedOrder, LifecycleError> {
        let gateway = self.gateways.get_gateway(request.gateway)?;
        let quote = self
            .policy
            .compute(&request.amount, request.discount_code.as_deref())
            .await?;

        let payable = self.policy.payable_for_quota(quote.quota_count);
        let payable_minor_units = to_minor_units(&payable).unwrap_or(0);
        if quote.quota_count <= 0 || payable_minor_units <= 0 {
            return Err(LifecycleError::InvalidAmount {
                message: format!("amount {} is too small to top up", request.amount),
            });
        }

        let order = self.insert_order(&request, &quote).await?;

        let gateway_request = GatewayOrderRequest {
            order_id: order.order_id.clone(),
            quota_amount: order.quota_amount,
            payable_amount: payable.to_string(),
            payable_minor_units,
            subject: "Quota top-up".to_string(),
            body: format!("Top up {} quota", order.quota_amount),
            client_ip: request
                .client_ip
                .clone()
                .filter(|ip| !ip.trim().is_empty())
                .unwrap_or_else(|| self.config.default_client_ip.clone()),
        };

        match gateway.create_payment(&gateway_request).await {
            Ok(artifact) => {
                info!(
                    order_id = %order.order_id,
                    user_id = order.user_id,
                    gateway = %request.gateway,
                    quota = order.quota_amount,
                    amount = %payable,
                    "payment order created"
                );
                Ok(CreatedOrder { order, artifact })
            }
            Err(e) => {
                warn!(
                    order_id = %order.order_id,
                    gateway = %request.gateway,
                    error = %e,
                    "gateway could not issue payment; order left pending"
                );
                Err(LifecycleError::GatewayFailed {
                    order_id: order.order_id,
                    source: e,
                })
            }
        }
    }

    async fn insert_order(
        &self,
        request: &CreateOrderRequest,
        quote: &AmountQuote,
    ) -> Result<PaymentOrder, LifecycleError> {
        let amount = quote
            .effective_amount
            .with_scale_round(2, RoundingMode::HalfUp);
        let mut last_error = None;

        for _ in 0..CREATE_ATTEMPTS {
            let new_order = NewPaymentOrder {
                order_id: generate_order_id(request.user_id, Utc::now()),
                user_id: request.user_id,
                gateway: request.gateway,
                amount: amount.clone(),
                quota_amount: quote.quota_count,
                discount_code: quote.discount_code.clone(),
            };
            match self.orders.create(new_order).await {
                Ok(order) => return Ok(order),
                Err(e) if e.is_unique_violation() => {
                    warn!(user_id = request.user_id, "order id collision; regenerating");
                    last_error = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(last_error
            .map(LifecycleError::from)
            .unwrap_or_else(|| LifecycleError::InvalidAmount {
                message: "could not allocate an order id".to_string(),
            }))
    }

    /// Parses, authenticates and applies one gateway notification.
    pub async fn resolve_callback(
        &self,
        gateway_name: GatewayName,
        callback: &RawCallback,
    ) -> Result<CallbackOutcome, LifecycleError> {
        let gateway = self.gateways.get_gateway(gateway_name)?;
        let notice = gateway.parse_callback(callback).await?;
        self.apply_notice(notice).await
    }

    /// Applies an already-parsed notification.
    pub async fn apply_notice(&self, notice: CallbackNotice) -> Result<CallbackOutcome, LifecycleError> {
        let order_id = notice.order_id.clone();

        if !notice.signature.is_valid() {
            if self.config.allow_unverified_callbacks {
                warn!(
                    order_id = %order_id,
                    gateway = %notice.gateway,
                    check = ?notice.signature,
                    "applying unverified callback (ALLOW_UNVERIFIED_CALLBACKS)"
                );
            } else {
                warn!(
                    order_id = %order_id,
                    gateway = %notice.gateway,
                    check = ?notice.signature,
                    "callback rejected: authenticity not confirmed"
                );
                return Err(LifecycleError::SignatureInvalid {
                    gateway: notice.gateway,
                    order_id,
                    reason: format!("{:?}", notice.signature),
                });
            }
        }

        for _ in 0..RESOLVE_ATTEMPTS {
            let order = self
                .orders
                .find_by_order_id(&order_id)
                .await?
                .ok_or_else(|| LifecycleError::OrderNotFound {
                    order_id: order_id.clone(),
                })?;

            if order.gateway != notice.gateway.as_str() {
                warn!(
                    order_id = %order_id,
                    order_gateway = %order.gateway,
                    callback_gateway = %notice.gateway,
                    "callback gateway does not match order"
                );
                return Err(LifecycleError::SignatureInvalid {
                    gateway: notice.gateway,
                    order_id,
                    reason: format!("order was issued through {}", order.gateway),
                });
            }

            match order.order_status()? {
                status @ (OrderStatus::Success | OrderStatus::Failed) => {
                    info!(order_id = %order_id, status = %status, "callback for finished order ignored");
                    return Ok(CallbackOutcome::AlreadyProcessed { order_id, status });
                }
                OrderStatus::Processing => {
                    info!(order_id = %order_id, "callback while order is being credited");
                    return Ok(CallbackOutcome::AlreadyProcessing { order_id });
                }
                OrderStatus::Pending => {}
            }

            match &notice.external_status {
                ExternalStatus::InProgress { raw_status } => {
                    info!(order_id = %order_id, raw_status = %raw_status, "intermediate gateway status");
                    return Ok(CallbackOutcome::Ignored {
                        order_id,
                        raw_status: raw_status.clone(),
                    });
                }
                ExternalStatus::Success => {
                    let latched = self
                        .orders
                        .transition_status(&order_id, OrderStatus::Pending, OrderStatus::Processing)
                        .await?;
                    if let Some(order) = latched {
                        return self.credit(order).await;
                    }
                }
                ExternalStatus::Failed { reason } => {
                    let failed = self
                        .orders
                        .transition_status(&order_id, OrderStatus::Pending, OrderStatus::Failed)
                        .await?;
                    if let Some(order) = failed {
                        return Ok(self.mark_failed(order, reason).await);
                    }
                }
            }
            // Lost the compare-and-set; re-read and classify again.
        }

        Ok(CallbackOutcome::AlreadyProcessing { order_id })
    }

    /// Runs with the `processing` latch held.
    async fn credit(&self, order: PaymentOrder) -> Result<CallbackOutcome, LifecycleError> {
        let grant = CreditGrant {
            order_id: order.order_id.clone(),
            user_id: order.user_id,
            quota: order.quota_amount,
        };

        match self.ledger.increase_quota(&grant).await {
            Ok(()) => {}
            Err(e) if e.is_unique_violation() => {
                warn!(order_id = %order.order_id, "ledger already holds this grant; completing order");
            }
            Err(e) => {
                error!(order_id = %order.order_id, error = %e, "quota credit failed; releasing latch");
                if let Err(rollback) = self
                    .orders
                    .transition_status(&order.order_id, OrderStatus::Processing, OrderStatus::Pending)
                    .await
                {
                    error!(
                        order_id = %order.order_id,
                        error = %rollback,
                        "latch release failed; reconciler will recover the order"
                    );
                }
                return Err(LifecycleError::CreditFailed {
                    order_id: order.order_id,
                    message: e.to_string(),
                });
            }
        }

        let completed = self
            .orders
            .transition_status(&order.order_id, OrderStatus::Processing, OrderStatus::Success)
            .await?;
        if completed.is_none() {
            warn!(order_id = %order.order_id, "order left processing before completion was recorded");
        }

        if let Err(e) = self
            .ledger
            .record_log(order.user_id, &format!("online payment top-up {}", order.quota_amount))
            .await
        {
            warn!(order_id = %order.order_id, error = %e, "failed to write top-up log");
        }

        info!(
            order_id = %order.order_id,
            user_id = order.user_id,
            quota = order.quota_amount,
            "payment succeeded; quota credited"
        );
        Ok(CallbackOutcome::Credited {
            order_id: order.order_id,
            user_id: order.user_id,
            quota: order.quota_amount,
        })
    }

    async fn mark_failed(&self, order: PaymentOrder, reason: &str) -> CallbackOutcome {
        if let Err(e) = self
            .ledger
            .record_log(order.user_id, &format!("payment failed: {}", reason))
            .await
        {
            warn!(order_id = %order.order_id, error = %e, "failed to write top-up log");
        }
        warn!(order_id = %order.order_id, reason = %reason, "payment failed");
        CallbackOutcome::MarkedFailed {
            order_id: order.order_id,
            reason: reason.to_string(),
        }
    }

    pub async fn get_order(&self, user_id: i64, order_id: &str) -> Result<PaymentOrder, LifecycleError> {
        let order = self
            .orders
            .find_by_order_id(order_id)
            .await?
            .ok_or_else(|| LifecycleError::OrderNotFound {
                order_id: order_id.to_string(),
            })?;
        if order.user_id != user_id {
            return Err(LifecycleError::Forbidden {
                order_id: order_id.to_string(),
            });
        }
        Ok(order)
    }

    pub async fn list_user_orders(
        &self,
        user_id: i64,
        page: Option<i64>,
        page_size: Option<i64>,
    ) -> Result<(Vec<PaymentOrder>, i64), LifecycleError> {
        let (limit, offset) = page_window(page, page_size);
        Ok(self.orders.list_by_user(user_id, limit, offset).await?)
    }

    pub async fn list_all_orders(
        &self,
        page: Option<i64>,
        page_size: Option<i64>,
    ) -> Result<(Vec<PaymentOrder>, i64), LifecycleError> {
        let (limit, offset) = page_window(page, page_size);
        Ok(self.orders.list_all(limit, offset).await?)
    }
}

/// `(limit, offset)` for a 1-based page; size defaults to 10 and is capped at 100.
pub fn page_window(page: Option<i64>, page_size: Option<i64>) -> (i64, i64) {
    let page = page.filter(|p| *p >= 1).unwrap_or(1);
    let size = page_size
        .filter(|s| *s >= 1)
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .min(MAX_PAGE_SIZE);
    (size, (page - 1).saturating_mul(size))
}

/// Parses a JSON amount (number or string) exactly, without going through
/// binary floating point when a string is given.
pub fn parse_amount(value: &serde_json::Value) -> Result<BigDecimal, LifecycleError> {
    use std::str::FromStr;

    let raw = match value {
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s.trim().to_string(),
        _ => {
            return Err(LifecycleError::InvalidAmount {
                message: "amount must be a number".to_string(),
            })
        }
    };
    let amount = BigDecimal::from_str(&raw).map_err(|_| LifecycleError::InvalidAmount {
        message: format!("amount {} is not a number", raw),
    })?;
    if amount <= BigDecimal::zero() {
        return Err(LifecycleError::InvalidAmount {
            message: format!("amount must be greater than zero, got {}", raw),
        });
    }
    Ok(amount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashSet;

    #[test]
    fn order_ids_are_unique_within_one_second() {
        let now = Utc.timestamp_opt(1_717_000_000, 0).single().expect("valid timestamp");
        let ids: HashSet<String> = (0..500).map(|_| generate_order_id(42, now)).collect();
        assert_eq!(ids.len(), 500);
        assert!(ids.iter().all(|id| id.starts_with("PAY421717000000")));
    }

    #[test]
    fn order_id_never_exceeds_wechat_limit() {
        let now = Utc::now();
        let id = generate_order_id(i64::MAX, now);
        assert!(id.len() <= 32, "{} is {} chars", id, id.len());
        assert!(id.starts_with("PAY"));
    }

    #[test]
    fn page_window_defaults_and_caps() {
        assert_eq!(page_window(None, None), (10, 0));
        assert_eq!(page_window(Some(3), Some(20)), (20, 40));
        assert_eq!(page_window(Some(0), Some(1000)), (100, 0));
        assert_eq!(page_window(Some(-2), Some(-5)), (10, 0));
    }

    #[test]
    fn amount_parsing_accepts_numbers_and_strings() {
        assert_eq!(
            parse_amount(&serde_json::json!(10.5)).expect("number"),
            "10.5".parse::<BigDecimal>().expect("decimal")
        );
        assert_eq!(
            parse_amount(&serde_json::json!("0.10")).expect("string"),
            "0.1".parse::<BigDecimal>().expect("decimal")
        );
        assert!(parse_amount(&serde_json::json!(0)).is_err());
        assert!(parse_amount(&serde_json::json!("ten")).is_err());
        assert!(parse_amount(&serde_json::json!(null)).is_err());
    }

    #[test]
    fn lifecycle_errors_map_to_http_status() {
        assert_eq!(
            LifecycleError::OrderNotFound {
                order_id: "PAY1".to_string()
            }
            .http_status_code(),
            404
        );
        assert_eq!(
            LifecycleError::Forbidden {
                order_id: "PAY1".to_string()
            }
            .http_status_code(),
            403
        );
        assert_eq!(
            LifecycleError::Payment(PaymentError::config_incomplete("alipay", &["ALIPAY_APP_ID"]))
                .http_status_code(),
            503
        );
        assert!(LifecycleError::CreditFailed {
            order_id: "PAY1".to_string(),
            message: "down".to_string()
        }
        .is_retryable());
    }
}
