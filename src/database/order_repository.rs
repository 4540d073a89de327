use crate::database::error::{DatabaseError, DatabaseErrorKind};
use crate::payments::types::GatewayName;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::BigDecimal;
use sqlx::{FromRow, PgPool};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Processing,
    Success,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Processing => "processing",
            OrderStatus::Success => "success",
            OrderStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Success | OrderStatus::Failed)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = DatabaseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(OrderStatus::Pending),
            "processing" => Ok(OrderStatus::Processing),
            "success" => Ok(OrderStatus::Success),
            "failed" => Ok(OrderStatus::Failed),
            other => Err(DatabaseError::new(DatabaseErrorKind::Unknown {
                message: format!("unknown order status: {}", other),
            })),
        }
    }
}

/// Payment order entity
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct PaymentOrder {
    pub id: i64,
    pub order_id: String,
    pub user_id: i64,
    pub gateway: String,
    /// Effective currency amount after any discount.
    pub amount: BigDecimal,
    pub quota_amount: i64,
    pub discount_code: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentOrder {
    pub fn order_status(&self) -> Result<OrderStatus, DatabaseError> {
        OrderStatus::from_str(&self.status)
    }
}

#[derive(Debug, Clone)]
pub struct NewPaymentOrder {
    pub order_id: String,
    pub user_id: i64,
    pub gateway: GatewayName,
    pub amount: BigDecimal,
    pub quota_amount: i64,
    pub discount_code: Option<String>,
}

/// Persistence for payment orders. Status changes go through
/// `transition_status`, a compare-and-set on the current status.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Inserts a new order in `pending`.
    async fn create(&self, order: NewPaymentOrder) -> Result<PaymentOrder, DatabaseError>;

    async fn find_by_order_id(&self, order_id: &str) -> Result<Option<PaymentOrder>, DatabaseError>;

    /// Moves the order from `from` to `to` only if it is still in `from`.
    /// Returns `None` when the order was not in `from` (or does not exist).
    async fn transition_status(
        &self,
        order_id: &str,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<Option<PaymentOrder>, DatabaseError>;

    /// Newest first, with the total row count for the user.
    async fn list_by_user(
        &self,
        user_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<PaymentOrder>, i64), DatabaseError>;

    async fn list_all(&self, limit: i64, offset: i64) -> Result<(Vec<PaymentOrder>, i64), DatabaseError>;

    /// Orders sitting in `status` whose last update is older than `updated_before`.
    async fn find_stale(
        &self,
        status: OrderStatus,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PaymentOrder>, DatabaseError>;
}

const ORDER_COLUMNS: &str =
    "id, order_id, user_id, gateway, amount, quota_amount, discount_code, status, created_at, updated_at";

/// Postgres-backed order store
pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn create(&self, order: NewPaymentOrder) -> Result<PaymentOrder, DatabaseError> {
        sqlx::query_as::<_, PaymentOrder>(&format!(
            "INSERT INTO payment_orders (order_id, user_id, gateway, amount, quota_amount, discount_code, status)
             VALUES ($1, $2, $3, $4, $5, $6, 'pending')
             RETURNING {}",
            ORDER_COLUMNS
        ))
        .bind(&order.order_id)
        .bind(order.user_id)
        .bind(order.gateway.as_str())
        .bind(&order.amount)
        .bind(order.quota_amount)
        .bind(&order.discount_code)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn find_by_order_id(&self, order_id: &str) -> Result<Option<PaymentOrder>, DatabaseError> {
        sqlx::query_as::<_, PaymentOrder>(&format!(
            "SELECT {} FROM payment_orders WHERE order_id = $1",
            ORDER_COLUMNS
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn transition_status(
        &self,
        order_id: &str,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<Option<PaymentOrder>, DatabaseError> {
        sqlx::query_as::<_, PaymentOrder>(&format!(
            "UPDATE payment_orders
             SET status = $3, updated_at = NOW()
             WHERE order_id = $1 AND status = $2
             RETURNING {}",
            ORDER_COLUMNS
        ))
        .bind(order_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn list_by_user(
        &self,
        user_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<PaymentOrder>, i64), DatabaseError> {
        let orders = sqlx::query_as::<_, PaymentOrder>(&format!(
            "SELECT {} FROM payment_orders
             WHERE user_id = $1
             ORDER BY created_at DESC, id DESC
             LIMIT $2 OFFSET $3",
            ORDER_COLUMNS
        ))
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM payment_orders WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        Ok((orders, total))
    }

    async fn list_all(&self, limit: i64, offset: i64) -> Result<(Vec<PaymentOrder>, i64), DatabaseError> {
        let orders = sqlx::query_as::<_, PaymentOrder>(&format!(
            "SELECT {} FROM payment_orders
             ORDER BY created_at DESC, id DESC
             LIMIT $1 OFFSET $2",
            ORDER_COLUMNS
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM payment_orders")
            .fetch_one(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        Ok((orders, total))
    }

    async fn find_stale(
        &self,
        status: OrderStatus,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PaymentOrder>, DatabaseError> {
        sqlx::query_as::<_, PaymentOrder>(&format!(
            "SELECT {} FROM payment_orders
             WHERE status = $1 AND updated_at < $2
             ORDER BY updated_at ASC
             LIMIT $3",
            ORDER_COLUMNS
        ))
        .bind(status.as_str())
        .bind(updated_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }
}
