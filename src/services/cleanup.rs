use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    entities::order::{self, Entity as OrderEntity, OrderStatus},
    errors::ServiceError,
    services::order_status::OrderStatusService,
};

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupSummary {
    /// A sweep was already in flight and this trigger was dropped.
    pub skipped: bool,
    pub examined: usize,
    pub cancelled: usize,
    pub failed: usize,
}

/// Periodic sweep that cancels orders stuck in `pending` past the
/// configured timeout. Time-triggered rather than request-triggered, so a
/// re-entrant trigger while a sweep is active is a no-op, not queued.
pub struct OrderCleanupService {
    db: Arc<DatabaseConnection>,
    order_status: Arc<OrderStatusService>,
    pending_timeout: chrono::Duration,
    running: Mutex<()>,
}

impl OrderCleanupService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        order_status: Arc<OrderStatusService>,
        pending_timeout_hours: i64,
    ) -> Self {
        Self {
            db,
            order_status,
            pending_timeout: chrono::Duration::hours(pending_timeout_hours),
            running: Mutex::new(()),
        }
    }

    /// Runs one sweep. A single order's cancellation failure is logged and
    /// skipped; it never aborts the sweep for the remaining orders.
    #[instrument(skip(self))]
    pub async fn sweep_once(&self) -> Result<CleanupSummary, ServiceError> {
        let Ok(_guard) = self.running.try_lock() else {
            debug!("cleanup sweep already in flight; dropping trigger");
            return Ok(CleanupSummary {
                skipped: true,
                ..CleanupSummary::default()
            });
        };

        let cutoff = Utc::now() - self.pending_timeout;
        let stale = OrderEntity::find()
            .filter(order::Column::Status.eq(OrderStatus::Pending))
            .filter(order::Column::OrderDate.lt(cutoff))
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        let mut summary = CleanupSummary {
            examined: stale.len(),
            ..CleanupSummary::default()
        };

        for order_row in stale {
            match self
                .order_status
                .cancel_order(
                    order_row.id,
                    Some(format!(
                        "pending since {}, past the {}h timeout",
                        order_row.order_date,
                        self.pending_timeout.num_hours()
                    )),
                )
                .await
            {
                Ok(_) => summary.cancelled += 1,
                Err(e) => {
                    warn!(order_id = %order_row.id, error = %e, "failed to cancel stale order");
                    summary.failed += 1;
                }
            }
        }

        if summary.examined > 0 {
            info!(
                examined = summary.examined,
                cancelled = summary.cancelled,
                failed = summary.failed,
                "cleanup sweep finished"
            );
        }
        Ok(summary)
    }

    /// Spawns the recurring sweep on its own task.
    pub fn spawn(self: Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep_once().await {
                    error!("cleanup sweep failed: {}", e);
                }
            }
        })
    }
}
