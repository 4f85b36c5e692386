use std::fmt;

use sea_orm::{
    ColumnTrait, ConnectionTrait, EntityTrait, JoinType, PaginatorTrait, QueryFilter, QuerySelect,
    RelationTrait,
};
use uuid::Uuid;

use crate::{
    entities::{
        order,
        order_item::{self, Entity as OrderItemEntity},
    },
    errors::ServiceError,
};

/// A requested service slot: one product on one date at one time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRequest {
    pub product_id: Uuid,
    pub product_name: String,
    pub date: String,
    pub time: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationConflict {
    pub product_id: Uuid,
    pub product_name: String,
    pub date: String,
    pub time: String,
}

impl fmt::Display for ReservationConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on {} at {}",
            self.product_name, self.date, self.time
        )
    }
}

/// Detects double-bookings of reservation slots.
///
/// Detection alone is advisory: callers staging orders must re-run the
/// check on the staging transaction itself, so the query and the item
/// insert are serialized against a concurrent checkout of the same slot.
pub struct ReservationConflictDetector;

impl ReservationConflictDetector {
    /// Returns every requested slot that collides with an order item of a
    /// non-cancelled order. Staged (`pending_payment`) orders count: a
    /// slot is blocked from the moment it is staged until the stage is
    /// purged.
    pub async fn find_conflicts<C: ConnectionTrait>(
        conn: &C,
        requests: &[ReservationRequest],
    ) -> Result<Vec<ReservationConflict>, ServiceError> {
        let mut conflicts = Vec::new();

        for request in requests {
            let taken = OrderItemEntity::find()
                .join(JoinType::InnerJoin, order_item::Relation::Order.def())
                .filter(order_item::Column::IsReservation.eq(true))
                .filter(order_item::Column::ProductId.eq(request.product_id))
                .filter(order_item::Column::ReservationDate.eq(request.date.clone()))
                .filter(order_item::Column::ReservationTime.eq(request.time.clone()))
                .filter(order::Column::Status.ne(order::OrderStatus::Cancelled))
                .count(conn)
                .await
                .map_err(ServiceError::db_error)?;

            if taken > 0 {
                conflicts.push(ReservationConflict {
                    product_id: request.product_id,
                    product_name: request.product_name.clone(),
                    date: request.date.clone(),
                    time: request.time.clone(),
                });
            }
        }

        Ok(conflicts)
    }

    /// Like [`find_conflicts`], but maps a non-empty result into a
    /// `Conflict` error naming every colliding slot so the caller can
    /// resubmit a corrected cart.
    ///
    /// [`find_conflicts`]: Self::find_conflicts
    pub async fn ensure_no_conflicts<C: ConnectionTrait>(
        conn: &C,
        requests: &[ReservationRequest],
    ) -> Result<(), ServiceError> {
        let conflicts = Self::find_conflicts(conn, requests).await?;
        if conflicts.is_empty() {
            return Ok(());
        }

        let slots = conflicts
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Err(ServiceError::Conflict(format!(
            "Reservation slot already booked: {}",
            slots
        )))
    }
}
