use crate::database::error::{DatabaseError, DatabaseErrorKind};
use async_trait::async_trait;
use sqlx::PgPool;
use tracing::info;

/// One quota grant, keyed by the order that paid for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditGrant {
    pub order_id: String,
    pub user_id: i64,
    pub quota: i64,
}

/// Account balance collaborator. Increments are atomic and a second grant
/// for the same `order_id` is refused with `UniqueViolation`.
#[async_trait]
pub trait CreditLedger: Send + Sync {
    async fn increase_quota(&self, grant: &CreditGrant) -> Result<(), DatabaseError>;

    async fn was_credited(&self, order_id: &str) -> Result<bool, DatabaseError>;

    /// Appends a user-visible top-up log line.
    async fn record_log(&self, user_id: i64, content: &str) -> Result<(), DatabaseError>;
}

pub struct PgCreditLedger {
    pool: PgPool,
}

impl PgCreditLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CreditLedger for PgCreditLedger {
    async fn increase_quota(&self, grant: &CreditGrant) -> Result<(), DatabaseError> {
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

        let inserted = sqlx::query(
            "INSERT INTO topup_credits (order_id, user_id, quota)
             VALUES ($1, $2, $3)
             ON CONFLICT (order_id) DO NOTHING",
        )
        .bind(&grant.order_id)
        .bind(grant.user_id)
        .bind(grant.quota)
        .execute(&mut *tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
            return Err(DatabaseError::new(DatabaseErrorKind::UniqueViolation {
                constraint: "topup_credits_order_id_key".to_string(),
            }));
        }

        let updated = sqlx::query("UPDATE users SET quota = quota + $2 WHERE id = $1")
            .bind(grant.user_id)
            .bind(grant.quota)
            .execute(&mut *tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        if updated.rows_affected() == 0 {
            tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
            return Err(DatabaseError::new(DatabaseErrorKind::NotFound {
                entity: "User".to_string(),
                id: grant.user_id.to_string(),
            }));
        }

        tx.commit().await.map_err(DatabaseError::from_sqlx)?;
        info!(
            order_id = %grant.order_id,
            user_id = grant.user_id,
            quota = grant.quota,
            "quota credited"
        );
        Ok(())
    }

    async fn was_credited(&self, order_id: &str) -> Result<bool, DatabaseError> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM topup_credits WHERE order_id = $1)",
        )
        .bind(order_id)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn record_log(&self, user_id: i64, content: &str) -> Result<(), DatabaseError> {
        sqlx::query("INSERT INTO topup_logs (user_id, content) VALUES ($1, $2)")
            .bind(user_id)
            .bind(content)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }
}
