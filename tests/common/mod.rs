//! Shared fixtures for the integration tests: a scriptable gateway, ledgers
//! that stall or fail, and a wired-up lifecycle on in-memory stores.

#![allow(dead_code)]

use async_trait::async_trait;
use quota_topup_backend::database::discount_code_repository::DiscountCodeStore;
use quota_topup_backend::database::error::{DatabaseError, DatabaseErrorKind};
use quota_topup_backend::database::ledger_repository::{CreditGrant, CreditLedger};
use quota_topup_backend::database::memory::{
    InMemoryCreditLedger, InMemoryDiscountCodeStore, InMemoryOrderStore,
};
use quota_topup_backend::payments::error::{PaymentError, PaymentResult};
use quota_topup_backend::payments::utils::{encode_form_urlencoded, parse_form_urlencoded};
use quota_topup_backend::payments::{
    CallbackNotice, ExternalStatus, GatewayName, GatewayOrderRequest, PaymentArtifact,
    PaymentGateway, PaymentGatewayFactory, RawCallback, SignatureCheck,
};
use quota_topup_backend::services::amount_policy::AmountPolicy;
use quota_topup_backend::services::order_lifecycle::{LifecycleConfig, OrderLifecycle};
use sqlx::types::BigDecimal;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const UNIT_RATE: i64 = 500_000;

pub fn dec(raw: &str) -> BigDecimal {
    BigDecimal::from_str(raw).expect("decimal literal")
}

/// Gateway whose callbacks are form bodies `order_id`, `status`
/// (`success|failed|waiting`) and `signed` (`yes|no|unknown`).
pub struct ScriptedGateway {
    name: GatewayName,
    fail_create: bool,
}

impl ScriptedGateway {
    pub fn new(name: GatewayName) -> Self {
        Self {
            name,
            fail_create: false,
        }
    }

    pub fn failing(name: GatewayName) -> Self {
        Self {
            name,
            fail_create: true,
        }
    }
}

pub fn callback_body(order_id: &str, status: &str, signed: &str) -> String {
    let mut fields = BTreeMap::new();
    fields.insert("order_id".to_string(), order_id.to_string());
    fields.insert("status".to_string(), status.to_string());
    fields.insert("signed".to_string(), signed.to_string());
    encode_form_urlencoded(&fields)
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn create_payment(&self, request: &GatewayOrderRequest) -> PaymentResult<PaymentArtifact> {
        if self.fail_create {
            return Err(PaymentError::GatewayCallFailed {
                gateway: self.name.to_string(),
                message: "merchant suspended".to_string(),
                gateway_code: Some("SYSTEMERROR".to_string()),
                retryable: false,
            });
        }
        let mut fields = BTreeMap::new();
        fields.insert("amount".to_string(), request.payable_amount.clone());
        Ok(PaymentArtifact {
            redirect_target: format!("https://pay.example.com/{}", request.order_id),
            fields,
        })
    }

    async fn parse_callback(&self, callback: &RawCallback) -> PaymentResult<CallbackNotice> {
        let fields = parse_form_urlencoded(&callback.body)?;
        let order_id = fields
            .get("order_id")
            .cloned()
            .ok_or_else(|| PaymentError::MalformedCallback {
                message: "order_id missing".to_string(),
            })?;
        let external_status = match fields.get("status").map(String::as_str) {
            Some("success") => ExternalStatus::Success,
            Some("waiting") => ExternalStatus::InProgress {
                raw_status: "waiting".to_string(),
            },
            other => ExternalStatus::Failed {
                reason: other.unwrap_or("unknown").to_string(),
            },
        };
        let signature = match fields.get("signed").map(String::as_str) {
            Some("yes") => SignatureCheck::Valid,
            Some("no") => SignatureCheck::Invalid {
                reason: "signature mismatch".to_string(),
            },
            _ => SignatureCheck::Unverified {
                reason: "provider unreachable".to_string(),
            },
        };
        Ok(CallbackNotice {
            gateway: self.name,
            order_id,
            external_status,
            signature,
            fields,
        })
    }

    fn name(&self) -> GatewayName {
        self.name
    }
}

/// Counts grant attempts and holds each one open for a while so concurrent
/// callbacks overlap.
pub struct StallingLedger {
    pub inner: InMemoryCreditLedger,
    pub attempts: AtomicUsize,
    pub delay: Duration,
}

impl StallingLedger {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: InMemoryCreditLedger::new(),
            attempts: AtomicUsize::new(0),
            delay,
        }
    }
}

#[async_trait]
impl CreditLedger for StallingLedger {
    async fn increase_quota(&self, grant: &CreditGrant) -> Result<(), DatabaseError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.inner.increase_quota(grant).await
    }

    async fn was_credited(&self, order_id: &str) -> Result<bool, DatabaseError> {
        self.inner.was_credited(order_id).await
    }

    async fn record_log(&self, user_id: i64, content: &str) -> Result<(), DatabaseError> {
        self.inner.record_log(user_id, content).await
    }
}

/// Ledger whose account store is down.
#[derive(Default)]
pub struct UnavailableLedger;

#[async_trait]
impl CreditLedger for UnavailableLedger {
    async fn increase_quota(&self, _grant: &CreditGrant) -> Result<(), DatabaseError> {
        Err(DatabaseError::new(DatabaseErrorKind::ConnectionError {
            message: "connection refused".to_string(),
        }))
    }

    async fn was_credited(&self, _order_id: &str) -> Result<bool, DatabaseError> {
        Ok(false)
    }

    async fn record_log(&self, _user_id: i64, _content: &str) -> Result<(), DatabaseError> {
        Ok(())
    }
}

pub struct Harness {
    pub lifecycle: Arc<OrderLifecycle>,
    pub orders: Arc<InMemoryOrderStore>,
    pub codes: Arc<InMemoryDiscountCodeStore>,
}

pub async fn harness_with(
    gateways: Vec<Arc<dyn PaymentGateway>>,
    ledger: Arc<dyn CreditLedger>,
    allow_unverified_callbacks: bool,
) -> Harness {
    let orders = Arc::new(InMemoryOrderStore::new());
    let codes = Arc::new(InMemoryDiscountCodeStore::new());
    codes
        .insert("WELCOME10", &dec("0.10"), true)
        .await
        .expect("seed code");
    let policy = Arc::new(
        AmountPolicy::new(codes.clone(), BigDecimal::from(UNIT_RATE)).expect("positive rate"),
    );
    let lifecycle = Arc::new(OrderLifecycle::new(
        orders.clone(),
        ledger,
        policy,
        Arc::new(PaymentGatewayFactory::with_gateways(gateways)),
        LifecycleConfig {
            allow_unverified_callbacks,
            ..LifecycleConfig::default()
        },
    ));
    Harness {
        lifecycle,
        orders,
        codes,
    }
}

/// Scripted alipay and wechat gateways on an in-memory ledger.
pub async fn harness(ledger: Arc<dyn CreditLedger>) -> Harness {
    harness_with(
        vec![
            Arc::new(ScriptedGateway::new(GatewayName::Alipay)),
            Arc::new(ScriptedGateway::new(GatewayName::Wechat)),
        ],
        ledger,
        false,
    )
    .await
}
