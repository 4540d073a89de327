//! In-process store implementations for tests and `SKIP_EXTERNALS` runs.

use crate::database::discount_code_repository::{DiscountCode, DiscountCodeStore};
use crate::database::error::{DatabaseError, DatabaseErrorKind};
use crate::database::ledger_repository::{CreditGrant, CreditLedger};
use crate::database::order_repository::{NewPaymentOrder, OrderStatus, OrderStore, PaymentOrder};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::BigDecimal;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;

#[derive(Default)]
pub struct InMemoryOrderStore {
    orders: Mutex<HashMap<String, PaymentOrder>>,
    next_id: Mutex<i64>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides `updated_at`, for exercising time-based sweeps.
    pub async fn set_updated_at(&self, order_id: &str, updated_at: DateTime<Utc>) {
        if let Some(order) = self.orders.lock().await.get_mut(order_id) {
            order.updated_at = updated_at;
        }
    }

    fn page(mut orders: Vec<PaymentOrder>, limit: i64, offset: i64) -> (Vec<PaymentOrder>, i64) {
        let total = orders.len() as i64;
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        let page = orders
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();
        (page, total)
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn create(&self, order: NewPaymentOrder) -> Result<PaymentOrder, DatabaseError> {
        let mut orders = self.orders.lock().await;
        if orders.contains_key(&order.order_id) {
            return Err(DatabaseError::new(DatabaseErrorKind::UniqueViolation {
                constraint: "payment_orders_order_id_key".to_string(),
            }));
        }

        let mut next_id = self.next_id.lock().await;
        *next_id += 1;
        let now = Utc::now();
        let row = PaymentOrder {
            id: *next_id,
            order_id: order.order_id.clone(),
            user_id: order.user_id,
            gateway: order.gateway.as_str().to_string(),
            amount: order.amount,
            quota_amount: order.quota_amount,
            discount_code: order.discount_code,
            status: OrderStatus::Pending.as_str().to_string(),
            created_at: now,
            updated_at: now,
        };
        orders.insert(order.order_id, row.clone());
        Ok(row)
    }

    async fn find_by_order_id(&self, order_id: &str) -> Result<Option<PaymentOrder>, DatabaseError> {
        Ok(self.orders.lock().await.get(order_id).cloned())
    }

    async fn transition_status(
        &self,
        order_id: &str,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<Option<PaymentOrder>, DatabaseError> {
        let mut orders = self.orders.lock().await;
        match orders.get_mut(order_id) {
            Some(order) if order.status == from.as_str() => {
                order.status = to.as_str().to_string();
                order.updated_at = Utc::now();
                Ok(Some(order.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn list_by_user(
        &self,
        user_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<PaymentOrder>, i64), DatabaseError> {
        let orders = self
            .orders
            .lock()
            .await
            .values()
            .filter(|o| o.user_id == user_id)
            .cloned()
            .collect();
        Ok(Self::page(orders, limit, offset))
    }

    async fn list_all(&self, limit: i64, offset: i64) -> Result<(Vec<PaymentOrder>, i64), DatabaseError> {
        let orders = self.orders.lock().await.values().cloned().collect();
        Ok(Self::page(orders, limit, offset))
    }

    async fn find_stale(
        &self,
        status: OrderStatus,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PaymentOrder>, DatabaseError> {
        let mut stale: Vec<PaymentOrder> = self
            .orders
            .lock()
            .await
            .values()
            .filter(|o| o.status == status.as_str() && o.updated_at < updated_before)
            .cloned()
            .collect();
        stale.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        stale.truncate(limit.max(0) as usize);
        Ok(stale)
    }
}

#[derive(Default)]
pub struct InMemoryDiscountCodeStore {
    codes: Mutex<HashMap<String, DiscountCode>>,
}

impl InMemoryDiscountCodeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DiscountCodeStore for InMemoryDiscountCodeStore {
    async fn find_enabled(&self, code: &str) -> Result<Option<DiscountCode>, DatabaseError> {
        Ok(self
            .codes
            .lock()
            .await
            .get(code)
            .filter(|c| c.enabled)
            .cloned())
    }

    async fn insert(
        &self,
        code: &str,
        discount_ratio: &BigDecimal,
        enabled: bool,
    ) -> Result<DiscountCode, DatabaseError> {
        let mut codes = self.codes.lock().await;
        if codes.contains_key(code) {
            return Err(DatabaseError::new(DatabaseErrorKind::UniqueViolation {
                constraint: "topup_codes_code_key".to_string(),
            }));
        }
        let row = DiscountCode {
            id: codes.len() as i64 + 1,
            code: code.to_string(),
            discount_ratio: discount_ratio.clone(),
            enabled,
            created_at: Utc::now(),
        };
        codes.insert(code.to_string(), row.clone());
        Ok(row)
    }
}

#[derive(Default)]
struct LedgerState {
    balances: HashMap<i64, i64>,
    credited: HashSet<String>,
    grants: Vec<CreditGrant>,
    logs: Vec<(i64, String)>,
}

/// Ledger that keeps balances in memory; any user id is accepted.
#[derive(Default)]
pub struct InMemoryCreditLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryCreditLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn balance_of(&self, user_id: i64) -> i64 {
        self.state
            .lock()
            .await
            .balances
            .get(&user_id)
            .copied()
            .unwrap_or(0)
    }

    pub async fn grants(&self) -> Vec<CreditGrant> {
        self.state.lock().await.grants.clone()
    }

    pub async fn logs_for(&self, user_id: i64) -> Vec<String> {
        self.state
            .lock()
            .await
            .logs
            .iter()
            .filter(|(uid, _)| *uid == user_id)
            .map(|(_, content)| content.clone())
            .collect()
    }
}

#[async_trait]
impl CreditLedger for InMemoryCreditLedger {
    async fn increase_quota(&self, grant: &CreditGrant) -> Result<(), DatabaseError> {
        let mut state = self.state.lock().await;
        if !state.credited.insert(grant.order_id.clone()) {
            return Err(DatabaseError::new(DatabaseErrorKind::UniqueViolation {
                constraint: "topup_credits_order_id_key".to_string(),
            }));
        }
        *state.balances.entry(grant.user_id).or_insert(0) += grant.quota;
        state.grants.push(grant.clone());
        Ok(())
    }

    async fn was_credited(&self, order_id: &str) -> Result<bool, DatabaseError> {
        Ok(self.state.lock().await.credited.contains(order_id))
    }

    async fn record_log(&self, user_id: i64, content: &str) -> Result<(), DatabaseError> {
        self.state
            .lock()
            .await
            .logs
            .push((user_id, content.to_string()));
        Ok(())
    }
}
