use std::sync::Arc;

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QuerySelect, Set,
    TransactionError, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::{
    entities::{
        order::{Entity as OrderEntity, OrderStatus},
        order_item::{self, Entity as OrderItemEntity},
        product::{self, Entity as ProductEntity},
        stock_operation::{self, Entity as StockOperationEntity, StockDirection},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::order_status::OrderStatusService,
};

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateStockOperationRequest {
    pub product_id: Uuid,
    pub direction: StockDirection,
    #[validate(range(min = 1, message = "Quantity must be positive"))]
    pub quantity: i32,
    pub reason: Option<String>,
    /// Order this movement ships against; only meaningful for `out`.
    pub order_id: Option<Uuid>,
    pub performed_by: Uuid,
}

/// Status side effect applied to a linked order.
#[derive(Debug, Clone, Serialize)]
pub struct OrderStatusEffect {
    pub order_id: Uuid,
    pub old_status: OrderStatus,
    pub new_status: OrderStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct StockOperationOutcome {
    pub operation: stock_operation::Model,
    /// Present when the linked order was advanced to `shipped`.
    pub order_effect: Option<OrderStatusEffect>,
    /// Whether cumulative stock-out for the linked order's product now
    /// covers the ordered quantity. Reporting only; it forces no
    /// transition beyond the single `shipped` step.
    pub order_fulfilled: Option<bool>,
}

/// Records stock movements against a product and keeps the product's live
/// quantity consistent with the ledger.
#[derive(Clone)]
pub struct StockOperationService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl StockOperationService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    /// Creates one stock operation atomically: the product quantity read,
    /// the delta check, the ledger insert and the quantity write-back all
    /// happen in a single transaction with the product row locked, so
    /// concurrent movements on the same product cannot lose updates.
    #[instrument(skip(self, request), fields(product_id = %request.product_id, direction = %request.direction, quantity = request.quantity))]
    pub async fn create_operation(
        &self,
        request: CreateStockOperationRequest,
    ) -> Result<StockOperationOutcome, ServiceError> {
        request.validate()?;

        let outcome = self
            .db
            .transaction::<_, StockOperationOutcome, ServiceError>(move |txn| {
                Box::pin(async move {
                    let product_row = ProductEntity::find_by_id(request.product_id)
                        .lock_exclusive()
                        .one(txn)
                        .await
                        .map_err(ServiceError::db_error)?
                        .ok_or_else(|| {
                            ServiceError::NotFound(format!(
                                "Product {} not found",
                                request.product_id
                            ))
                        })?;

                    let previous_quantity = product_row.quantity;
                    let new_quantity = match request.direction {
                        StockDirection::In => previous_quantity + request.quantity,
                        StockDirection::Out => previous_quantity - request.quantity,
                    };
                    if new_quantity < 0 {
                        return Err(ServiceError::InsufficientStock(format!(
                            "Product {} has {} in stock; cannot remove {}",
                            request.product_id, previous_quantity, request.quantity
                        )));
                    }

                    let now = Utc::now();
                    let operation = stock_operation::ActiveModel {
                        id: Set(Uuid::new_v4()),
                        product_id: Set(request.product_id),
                        direction: Set(request.direction),
                        quantity: Set(request.quantity),
                        reason: Set(request.reason.clone()),
                        order_id: Set(request.order_id),
                        previous_quantity: Set(previous_quantity),
                        new_quantity: Set(new_quantity),
                        performed_by: Set(request.performed_by),
                        created_at: Set(now),
                    }
                    .insert(txn)
                    .await
                    .map_err(ServiceError::db_error)?;

                    let mut product_active: product::ActiveModel = product_row.into();
                    product_active.quantity = Set(new_quantity);
                    product_active.updated_at = Set(Some(now));
                    product_active
                        .update(txn)
                        .await
                        .map_err(ServiceError::db_error)?;

                    // Stock-out against an order may advance it to shipped;
                    // any other status leaves the order untouched while the
                    // movement itself still stands.
                    let mut order_effect = None;
                    let mut order_fulfilled = None;
                    if request.direction == StockDirection::Out {
                        if let Some(order_id) = request.order_id {
                            let order_row = OrderEntity::find_by_id(order_id)
                                .one(txn)
                                .await
                                .map_err(ServiceError::db_error)?
                                .ok_or_else(|| {
                                    ServiceError::NotFound(format!(
                                        "Order {} not found",
                                        order_id
                                    ))
                                })?;

                            let old_status = order_row.status;
                            if matches!(
                                old_status,
                                OrderStatus::Pending | OrderStatus::Processing
                            ) {
                                OrderStatusService::apply_status_change(
                                    txn,
                                    order_row,
                                    OrderStatus::Shipped,
                                )
                                .await?;
                                order_effect = Some(OrderStatusEffect {
                                    order_id,
                                    old_status,
                                    new_status: OrderStatus::Shipped,
                                });
                            }

                            order_fulfilled = Some(
                                order_product_fulfilled(txn, order_id, request.product_id)
                                    .await?,
                            );
                        }
                    }

                    Ok(StockOperationOutcome {
                        operation,
                        order_effect,
                        order_fulfilled,
                    })
                })
            })
            .await
            .map_err(|e| match e {
                TransactionError::Connection(db_err) => ServiceError::db_error(db_err),
                TransactionError::Transaction(service_err) => service_err,
            })?;

        info!(
            operation_id = %outcome.operation.id,
            new_quantity = outcome.operation.new_quantity,
            "stock operation recorded"
        );
        if let Err(e) = self
            .event_sender
            .send(Event::StockAdjusted {
                product_id: outcome.operation.product_id,
                direction: outcome.operation.direction,
                quantity: outcome.operation.quantity,
                new_quantity: outcome.operation.new_quantity,
            })
            .await
        {
            warn!(error = %e, "Failed to send stock adjusted event");
        }
        if let Some(effect) = &outcome.order_effect {
            if let Err(e) = self
                .event_sender
                .send(Event::OrderStatusChanged {
                    order_id: effect.order_id,
                    old_status: effect.old_status,
                    new_status: effect.new_status,
                })
                .await
            {
                warn!(error = %e, "Failed to send status changed event");
            }
        }

        Ok(outcome)
    }

    /// Lists the ledger for a product, newest first.
    #[instrument(skip(self))]
    pub async fn list_for_product(
        &self,
        product_id: Uuid,
    ) -> Result<Vec<stock_operation::Model>, ServiceError> {
        use sea_orm::QueryOrder;

        StockOperationEntity::find()
            .filter(stock_operation::Column::ProductId.eq(product_id))
            .order_by_desc(stock_operation::Column::CreatedAt)
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)
    }
}

/// Whether stock-out movements for (order, product) cover the quantity the
/// order's items name for that product.
async fn order_product_fulfilled<C: sea_orm::ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    product_id: Uuid,
) -> Result<bool, ServiceError> {
    let ordered: i64 = OrderItemEntity::find()
        .filter(order_item::Column::OrderId.eq(order_id))
        .filter(order_item::Column::ProductId.eq(product_id))
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?
        .iter()
        .map(|item| i64::from(item.quantity))
        .sum();

    let shipped: i64 = StockOperationEntity::find()
        .filter(stock_operation::Column::OrderId.eq(order_id))
        .filter(stock_operation::Column::ProductId.eq(product_id))
        .filter(stock_operation::Column::Direction.eq(StockDirection::Out))
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?
        .iter()
        .map(|op| i64::from(op.quantity))
        .sum();

    Ok(ordered > 0 && shipped >= ordered)
}
