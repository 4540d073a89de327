use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use quota_topup_backend::api::payments::{self, PaymentApiState};
use quota_topup_backend::config::AppConfig;
use quota_topup_backend::database::discount_code_repository::{
    DiscountCodeStore, PgDiscountCodeStore,
};
use quota_topup_backend::database::ledger_repository::{CreditLedger, PgCreditLedger};
use quota_topup_backend::database::memory::{
    InMemoryCreditLedger, InMemoryDiscountCodeStore, InMemoryOrderStore,
};
use quota_topup_backend::database::order_repository::{OrderStore, PgOrderStore};
use quota_topup_backend::database::{init_pool_from_config, run_migrations};
use quota_topup_backend::health::{HealthChecker, HealthState, HealthStatus};
use quota_topup_backend::logging::{init_tracing, mask_secret};
use quota_topup_backend::middleware::logging::{request_logging_middleware, UuidRequestId};
use quota_topup_backend::payments::PaymentGatewayFactory;
use quota_topup_backend::services::amount_policy::AmountPolicy;
use quota_topup_backend::services::order_lifecycle::{LifecycleConfig, OrderLifecycle};
use quota_topup_backend::workers::order_reconciler::OrderReconcilerWorker;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

async fn shutdown_signal_with_notify(shutdown_tx: watch::Sender<bool>) {
    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
}

struct Stores {
    orders: Arc<dyn OrderStore>,
    codes: Arc<dyn DiscountCodeStore>,
    ledger: Arc<dyn CreditLedger>,
    pool: Option<sqlx::PgPool>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    init_tracing(&config.logging);
    config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.server.host,
        port = config.server.port,
        public_address = %config.server.public_address,
        "Starting quota top-up backend"
    );

    let stores = if config.skip_externals {
        warn!("SKIP_EXTERNALS=true: using in-memory stores, nothing is persisted");
        Stores {
            orders: Arc::new(InMemoryOrderStore::new()),
            codes: Arc::new(InMemoryDiscountCodeStore::new()),
            ledger: Arc::new(InMemoryCreditLedger::new()),
            pool: None,
        }
    } else {
        info!("Initializing database connection pool...");
        let pool = init_pool_from_config(&config.database).await.map_err(|e| {
            error!("Failed to initialize database pool: {}", e);
            e
        })?;
        run_migrations(&pool).await?;
        info!(
            max_connections = pool.options().get_max_connections(),
            "Database connection pool initialized"
        );
        Stores {
            orders: Arc::new(PgOrderStore::new(pool.clone())),
            codes: Arc::new(PgDiscountCodeStore::new(pool.clone())),
            ledger: Arc::new(PgCreditLedger::new(pool.clone())),
            pool: Some(pool),
        }
    };

    if !config.gateways.alipay.app_id.is_empty() {
        info!(app_id = %mask_secret(&config.gateways.alipay.app_id), "Alipay settings loaded");
    }
    if !config.gateways.wechat.mch_id.is_empty() {
        info!(mch_id = %mask_secret(&config.gateways.wechat.mch_id), "WeChat Pay settings loaded");
    }
    let gateways = Arc::new(PaymentGatewayFactory::from_settings(config.gateways.clone()));
    if gateways.list_available_gateways().is_empty() {
        warn!("No payment gateway is configured; order creation will be refused");
    }

    let policy = Arc::new(AmountPolicy::new(
        stores.codes.clone(),
        config.topup.quota_per_unit.clone(),
    )?);
    let lifecycle = Arc::new(OrderLifecycle::new(
        stores.orders.clone(),
        stores.ledger.clone(),
        policy,
        gateways.clone(),
        LifecycleConfig {
            allow_unverified_callbacks: config.topup.allow_unverified_callbacks,
            ..LifecycleConfig::default()
        },
    ));
    if config.topup.allow_unverified_callbacks {
        warn!("ALLOW_UNVERIFIED_CALLBACKS=true: unauthenticated callbacks will be applied");
    }

    let health_checker = HealthChecker::new(stores.pool.clone(), gateways);

    let (worker_shutdown_tx, worker_shutdown_rx) = watch::channel(false);
    let reconciler = OrderReconcilerWorker::new(
        stores.orders.clone(),
        stores.ledger.clone(),
        config.reconciler.clone(),
    );
    let reconciler_handle = tokio::spawn(reconciler.run(worker_shutdown_rx));

    let app = Router::new()
        .route("/health", get(health))
        .with_state(health_checker)
        .merge(payments::routes(PaymentApiState { lifecycle }))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
                .layer(TraceLayer::new_for_http())
                .layer(axum::middleware::from_fn(request_logging_middleware))
                .layer(PropagateRequestIdLayer::x_request_id()),
        );

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to address {}: {}", addr, e);
        e
    })?;

    info!(address = %addr, "Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_with_notify(worker_shutdown_tx.clone()))
        .await?;

    let _ = worker_shutdown_tx.send(true);
    if tokio::time::timeout(Duration::from_secs(5), reconciler_handle)
        .await
        .is_err()
    {
        error!("Timed out waiting for order reconciler shutdown");
    }

    info!("Server shutdown complete");
    Ok(())
}

async fn health(
    State(checker): State<HealthChecker>,
) -> Result<Json<HealthStatus>, (StatusCode, Json<HealthStatus>)> {
    let status = checker.check_health().await;
    if status.status == HealthState::Unhealthy {
        error!("Health check failed - service unhealthy");
        return Err((StatusCode::SERVICE_UNAVAILABLE, Json(status)));
    }
    Ok(Json(status))
}
