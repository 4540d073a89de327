use crate::database::error::DatabaseError;
use async_trait::async_trait;
use serde::Serialize;
use sqlx::types::BigDecimal;
use sqlx::{FromRow, PgPool};

/// Top-up discount code entity
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct DiscountCode {
    pub id: i64,
    pub code: String,
    /// Fraction taken off the amount, e.g. `0.10`.
    pub discount_ratio: BigDecimal,
    pub enabled: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[async_trait]
pub trait DiscountCodeStore: Send + Sync {
    /// Looks up an enabled code; disabled and unknown codes both yield `None`.
    async fn find_enabled(&self, code: &str) -> Result<Option<DiscountCode>, DatabaseError>;

    async fn insert(
        &self,
        code: &str,
        discount_ratio: &BigDecimal,
        enabled: bool,
    ) -> Result<DiscountCode, DatabaseError>;
}

pub struct PgDiscountCodeStore {
    pool: PgPool,
}

impl PgDiscountCodeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DiscountCodeStore for PgDiscountCodeStore {
    async fn find_enabled(&self, code: &str) -> Result<Option<DiscountCode>, DatabaseError> {
        sqlx::query_as::<_, DiscountCode>(
            "SELECT id, code, discount_ratio, enabled, created_at
             FROM topup_codes
             WHERE code = $1 AND enabled = TRUE",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn insert(
        &self,
        code: &str,
        discount_ratio: &BigDecimal,
        enabled: bool,
    ) -> Result<DiscountCode, DatabaseError> {
        sqlx::query_as::<_, DiscountCode>(
            "INSERT INTO topup_codes (code, discount_ratio, enabled)
             VALUES ($1, $2, $3)
             RETURNING id, code, discount_ratio, enabled, created_at",
        )
        .bind(code)
        .bind(discount_ratio)
        .bind(enabled)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }
}
