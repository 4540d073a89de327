use crate::database::error::DatabaseError;
use crate::database::ledger_repository::CreditLedger;
use crate::database::order_repository::{OrderStatus, OrderStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

// ---------------------------------------------------------------------------
// Custom error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ReconcilerError {
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("stale threshold {0:?} is out of range")]
    InvalidThreshold(Duration),
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OrderReconcilerConfig {
    /// How often the worker wakes up.
    pub poll_interval: Duration,
    /// An order must have sat in `processing` at least this long before the
    /// worker touches it.
    pub stale_after: Duration,
    pub batch_size: i64,
}

impl Default for OrderReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(300),
            batch_size: 100,
        }
    }
}

impl OrderReconcilerConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Zero or unparseable values keep the default.
    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        cfg.poll_interval = Duration::from_secs(
            var("RECONCILER_INTERVAL_SECS")
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(cfg.poll_interval.as_secs()),
        );
        cfg.stale_after = Duration::from_secs(
            var("RECONCILER_STALE_AFTER_SECS")
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(cfg.stale_after.as_secs()),
        );
        cfg.batch_size = var("RECONCILER_BATCH_SIZE")
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(cfg.batch_size);
        cfg
    }
}

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub examined: usize,
    pub completed: usize,
    pub released: usize,
    pub skipped: usize,
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Recovers orders stranded in `processing` after a crash between the latch
/// write and the terminal write. Credited orders are completed, the rest are
/// released back to `pending` so a redelivered callback can settle them.
pub struct OrderReconcilerWorker {
    orders: Arc<dyn OrderStore>,
    ledger: Arc<dyn CreditLedger>,
    config: OrderReconcilerConfig,
}

impl OrderReconcilerWorker {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        ledger: Arc<dyn CreditLedger>,
        config: OrderReconcilerConfig,
    ) -> Self {
        Self {
            orders,
            ledger,
            config,
        }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            stale_after_secs = self.config.stale_after.as_secs(),
            batch_size = self.config.batch_size,
            "order reconciler worker started"
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("order reconciler worker stopping");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.run_cycle().await {
                        Ok(report) if report.examined > 0 => {
                            info!(
                                examined = report.examined,
                                completed = report.completed,
                                released = report.released,
                                skipped = report.skipped,
                                "order reconciler cycle finished"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "order reconciler cycle failed"),
                    }
                }
            }
        }

        info!("order reconciler worker stopped");
    }

    pub async fn run_cycle(&self) -> Result<ReconcileReport, ReconcilerError> {
        let stale_after = chrono::Duration::from_std(self.config.stale_after)
            .map_err(|_| ReconcilerError::InvalidThreshold(self.config.stale_after))?;
        let cutoff = chrono::Utc::now() - stale_after;

        let stranded = self
            .orders
            .find_stale(OrderStatus::Processing, cutoff, self.config.batch_size)
            .await?;

        let mut report = ReconcileReport {
            examined: stranded.len(),
            ..ReconcileReport::default()
        };

        for order in stranded {
            let credited = match self.ledger.was_credited(&order.order_id).await {
                Ok(credited) => credited,
                Err(e) => {
                    error!(order_id = %order.order_id, error = %e, "ledger lookup failed");
                    report.skipped += 1;
                    continue;
                }
            };

            let target = if credited {
                OrderStatus::Success
            } else {
                OrderStatus::Pending
            };

            match self
                .orders
                .transition_status(&order.order_id, OrderStatus::Processing, target)
                .await
            {
                Ok(Some(_)) if credited => {
                    info!(order_id = %order.order_id, "stranded order completed");
                    report.completed += 1;
                }
                Ok(Some(_)) => {
                    warn!(order_id = %order.order_id, "stranded order released to pending");
                    report.released += 1;
                }
                Ok(None) => {
                    report.skipped += 1;
                }
                Err(e) => {
                    error!(order_id = %order.order_id, error = %e, "failed to reconcile order");
                    report.skipped += 1;
                }
            }
        }

        Ok(report)
    }
}
