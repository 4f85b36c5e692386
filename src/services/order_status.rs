use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    Set, TransactionTrait,
};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    entities::{
        order::{ActiveModel as OrderActiveModel, Entity as OrderEntity, Model as OrderModel, OrderStatus},
        order_audit,
        refund::{self, Entity as RefundEntity, RefundStatus},
    },
    errors::ServiceError,
    events::{Event, EventSender},
};

/// The authoritative set of legal order status transitions and their side
/// effects. Every status write in the system goes through this layer.
#[derive(Clone)]
pub struct OrderStatusService {
    db: Arc<DatabaseConnection>,
    event_sender: Option<Arc<EventSender>>,
}

impl OrderStatusService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Option<Arc<EventSender>>) -> Self {
        Self { db, event_sender }
    }

    /// Validates if a status transition is allowed.
    pub fn is_valid_transition(from_status: OrderStatus, to_status: OrderStatus) -> bool {
        use OrderStatus::*;
        match (from_status, to_status) {
            // Staged orders become real once payment is confirmed
            (PendingPayment, Pending) => true,
            (PendingPayment, Processing) => true,

            (Pending, Processing) => true,
            (Pending, Shipped) => true,

            (Processing, Shipped) => true,

            (Shipped, Delivered) => true,

            // Cancellation branches from any pre-delivered state
            (PendingPayment, Cancelled)
            | (Pending, Cancelled)
            | (Processing, Cancelled)
            | (Shipped, Cancelled) => true,

            // Return flow branches from delivered
            (Delivered, ReturnProcessing) => true,
            (ReturnProcessing, Returned) => true,

            // Re-entering the same status is a no-op write
            _ if from_status == to_status => true,

            _ => false,
        }
    }

    /// Applies a validated status change to an order inside the caller's
    /// connection or transaction. Entering `shipped` / `delivered` stamps
    /// the matching timestamp exactly once; a re-entry never re-stamps.
    pub async fn apply_status_change<C: ConnectionTrait>(
        conn: &C,
        order: OrderModel,
        new_status: OrderStatus,
    ) -> Result<OrderModel, ServiceError> {
        let old_status = order.status;
        if !Self::is_valid_transition(old_status, new_status) {
            error!(
                "Invalid status transition from {} to {}",
                old_status, new_status
            );
            return Err(ServiceError::ValidationError(format!(
                "Cannot transition from status '{}' to '{}'",
                old_status, new_status
            )));
        }

        let now = Utc::now();
        let version = order.version;
        let shipped_at = order.shipped_at;
        let delivered_at = order.delivered_at;

        let mut active: OrderActiveModel = order.into();
        active.status = Set(new_status);
        active.updated_at = Set(Some(now));
        active.version = Set(version + 1);

        if new_status == OrderStatus::Shipped && shipped_at.is_none() {
            active.shipped_at = Set(Some(now));
        }
        if new_status == OrderStatus::Delivered && delivered_at.is_none() {
            active.delivered_at = Set(Some(now));
        }

        active.update(conn).await.map_err(ServiceError::db_error)
    }

    /// Updates the status of an order with validation.
    #[instrument(skip(self), fields(order_id = %order_id, new_status = %new_status))]
    pub async fn update_status(
        &self,
        order_id: Uuid,
        new_status: OrderStatus,
    ) -> Result<OrderModel, ServiceError> {
        let db = &*self.db;
        let txn = db.begin().await.map_err(|e| {
            error!("Failed to begin transaction: {}", e);
            ServiceError::db_error(e)
        })?;

        let order = OrderEntity::find_by_id(order_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                warn!(order_id = %order_id, "Order not found for status update");
                ServiceError::NotFound(format!("Order {} not found", order_id))
            })?;

        let old_status = order.status;
        let updated = Self::apply_status_change(&txn, order, new_status).await?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(
            "Order {} status updated from '{}' to '{}'",
            order_id, old_status, new_status
        );

        if let Some(event_sender) = &self.event_sender {
            if let Err(e) = event_sender
                .send(Event::OrderStatusChanged {
                    order_id,
                    old_status,
                    new_status,
                })
                .await
            {
                warn!(error = %e, order_id = %order_id, "Failed to send status changed event");
            }
        }

        Ok(updated)
    }

    /// Parses a caller-supplied status string and updates the order.
    /// Unrecognized statuses are rejected before any write.
    #[instrument(skip(self), fields(order_id = %order_id, new_status = %new_status))]
    pub async fn update_status_str(
        &self,
        order_id: Uuid,
        new_status: &str,
    ) -> Result<OrderModel, ServiceError> {
        let status = OrderStatus::from_str(new_status).map_err(|_| {
            ServiceError::ValidationError(format!("Invalid status: {}", new_status))
        })?;
        self.update_status(order_id, status).await
    }

    /// Cancels an order and records an audit entry.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn cancel_order(
        &self,
        order_id: Uuid,
        reason: Option<String>,
    ) -> Result<OrderModel, ServiceError> {
        let updated = self.update_status(order_id, OrderStatus::Cancelled).await?;

        let audit = order_audit::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            action: Set("cancelled".to_string()),
            detail: Set(reason),
            created_at: Set(Utc::now()),
        };
        audit
            .insert(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        if let Some(event_sender) = &self.event_sender {
            if let Err(e) = event_sender.send(Event::OrderCancelled(order_id)).await {
                warn!(error = %e, order_id = %order_id, "Failed to send order cancelled event");
            }
        }

        Ok(updated)
    }

    /// Attaches a tracking number, independent of the order's status.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn set_tracking_number(
        &self,
        order_id: Uuid,
        tracking_number: String,
    ) -> Result<OrderModel, ServiceError> {
        let db = &*self.db;

        let order = OrderEntity::find_by_id(order_id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let version = order.version;
        let mut active: OrderActiveModel = order.into();
        active.tracking_number = Set(Some(tracking_number.clone()));
        active.updated_at = Set(Some(Utc::now()));
        active.version = Set(version + 1);

        let updated = active.update(db).await.map_err(ServiceError::db_error)?;
        info!(order_id = %order_id, tracking_number = %tracking_number, "tracking number attached");
        Ok(updated)
    }

    /// Recomputes the order's refunded total from its `succeeded` refunds.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn refresh_refund_total(&self, order_id: Uuid) -> Result<OrderModel, ServiceError> {
        let db = &*self.db;

        let order = OrderEntity::find_by_id(order_id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let refunds = RefundEntity::find()
            .filter(refund::Column::OrderId.eq(order_id))
            .filter(refund::Column::Status.eq(RefundStatus::Succeeded))
            .all(db)
            .await
            .map_err(ServiceError::db_error)?;

        let refunded_total: Decimal = refunds.iter().map(|r| r.amount).sum();

        let version = order.version;
        let mut active: OrderActiveModel = order.into();
        active.refunded_amount = Set(refunded_total);
        active.updated_at = Set(Some(Utc::now()));
        active.version = Set(version + 1);

        let updated = active.update(db).await.map_err(ServiceError::db_error)?;
        info!(order_id = %order_id, refunded_total = %refunded_total, "refund total refreshed");
        Ok(updated)
    }

    /// Retrieves an order by id.
    pub async fn get_order(&self, order_id: Uuid) -> Result<Option<OrderModel>, ServiceError> {
        OrderEntity::find_by_id(order_id)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use OrderStatus::*;

    #[rstest]
    #[case(PendingPayment, Processing, true)]
    #[case(PendingPayment, Pending, true)]
    #[case(PendingPayment, Cancelled, true)]
    #[case(Pending, Processing, true)]
    #[case(Pending, Shipped, true)]
    #[case(Processing, Shipped, true)]
    #[case(Shipped, Delivered, true)]
    #[case(Shipped, Cancelled, true)]
    #[case(Delivered, ReturnProcessing, true)]
    #[case(ReturnProcessing, Returned, true)]
    #[case(Delivered, Cancelled, false)]
    #[case(Delivered, Shipped, false)]
    #[case(Cancelled, Processing, false)]
    #[case(Returned, Delivered, false)]
    #[case(Processing, Delivered, false)]
    #[case(PendingPayment, Shipped, false)]
    fn transition_table(
        #[case] from: OrderStatus,
        #[case] to: OrderStatus,
        #[case] allowed: bool,
    ) {
        assert_eq!(OrderStatusService::is_valid_transition(from, to), allowed);
    }

    #[rstest]
    #[case(Pending)]
    #[case(Processing)]
    #[case(Shipped)]
    #[case(Delivered)]
    fn self_transition_is_allowed(#[case] status: OrderStatus) {
        assert!(OrderStatusService::is_valid_transition(status, status));
    }

    #[test]
    fn unknown_status_string_fails_to_parse() {
        assert!(OrderStatus::from_str("teleported").is_err());
        assert_eq!(
            OrderStatus::from_str("return_processing").unwrap(),
            ReturnProcessing
        );
    }
}
