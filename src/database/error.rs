use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum DatabaseErrorKind {
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    #[error("unique constraint violated: {constraint}")]
    UniqueViolation { constraint: String },

    #[error("connection error: {message}")]
    ConnectionError { message: String },

    #[error("connection pool exhausted")]
    PoolExhausted,

    #[error("query failed: {message}")]
    QueryError { message: String },

    #[error("unknown database error: {message}")]
    Unknown { message: String },
}

#[derive(Debug, Clone, Error)]
#[error("{kind}")]
pub struct DatabaseError {
    pub kind: DatabaseErrorKind,
}

impl DatabaseError {
    pub fn new(kind: DatabaseErrorKind) -> Self {
        Self { kind }
    }

    pub fn from_sqlx(error: sqlx::Error) -> Self {
        let kind = match error {
            sqlx::Error::RowNotFound => DatabaseErrorKind::NotFound {
                entity: "row".to_string(),
                id: String::new(),
            },
            sqlx::Error::PoolTimedOut => DatabaseErrorKind::PoolExhausted,
            sqlx::Error::PoolClosed => DatabaseErrorKind::ConnectionError {
                message: "pool closed".to_string(),
            },
            sqlx::Error::Io(e) => DatabaseErrorKind::ConnectionError {
                message: e.to_string(),
            },
            sqlx::Error::Tls(e) => DatabaseErrorKind::ConnectionError {
                message: e.to_string(),
            },
            sqlx::Error::Database(db) => {
                if db.is_unique_violation() {
                    DatabaseErrorKind::UniqueViolation {
                        constraint: db.constraint().unwrap_or("unknown").to_string(),
                    }
                } else {
                    DatabaseErrorKind::QueryError {
                        message: db.message().to_string(),
                    }
                }
            }
            other => DatabaseErrorKind::Unknown {
                message: other.to_string(),
            },
        };
        Self { kind }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            DatabaseErrorKind::ConnectionError { .. } | DatabaseErrorKind::PoolExhausted
        )
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self.kind, DatabaseErrorKind::UniqueViolation { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.kind, DatabaseErrorKind::NotFound { .. })
    }
}
