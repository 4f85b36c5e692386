use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    Set, TransactionError, TransactionTrait,
};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::{
    entities::{
        order::{self, Entity as OrderEntity, OrderStatus},
        order_item,
        product::{self, Entity as ProductEntity},
    },
    errors::{CheckoutFinalizationError, ServiceError},
    events::{Event, EventSender},
    services::{
        addresses::ShippingAddress,
        payment_gateway::{GatewaySession, PaymentGateway, PAYMENT_STATUS_PAID},
    },
};

/// Who a payment session belongs to, read from its metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOwner {
    Customer(Uuid),
    Guest,
}

/// Extracts the session owner from metadata. Absence of both a customer id
/// and the guest marker is fatal: the session cannot be attributed.
pub fn session_owner(
    metadata: &HashMap<String, String>,
) -> Result<SessionOwner, CheckoutFinalizationError> {
    if let Some(raw) = metadata.get("customer_id") {
        let id = Uuid::parse_str(raw).map_err(|_| CheckoutFinalizationError::MissingOwner)?;
        return Ok(SessionOwner::Customer(id));
    }
    if metadata.get("guest").map(String::as_str) == Some("true") {
        return Ok(SessionOwner::Guest);
    }
    Err(CheckoutFinalizationError::MissingOwner)
}

/// Resolves a complete shipping address from the session: the metadata
/// snapshot first, then the processor's recorded shipping fields.
pub fn resolve_shipping(
    session: &GatewaySession,
) -> Result<ShippingAddress, CheckoutFinalizationError> {
    let candidate = session
        .metadata
        .get("shipping_address")
        .and_then(|raw| ShippingAddress::from_json(raw))
        .or_else(|| session.shipping_address.clone());

    match candidate {
        Some(address) if address.validate().is_ok() => Ok(address),
        _ => Err(CheckoutFinalizationError::MissingShippingAddress),
    }
}

struct RefreshContext {
    session_id: String,
    payment_intent_id: Option<String>,
    address_json: String,
    guest_email: Option<String>,
    guest_name: Option<String>,
    guest_phone: Option<String>,
    now: DateTime<Utc>,
}

/// Converts a *paid* payment session into committed local orders exactly
/// once, no matter how many times it is invoked or from which trigger.
///
/// The client completion endpoint and the processor webhook both call
/// [`finalize_session`]; a per-session advisory lock serializes concurrent
/// invocations in-process, and the storage-level unique index on
/// (session id, seller id) backs the invariant across processes.
///
/// [`finalize_session`]: Self::finalize_session
pub struct CheckoutCompletionService {
    db: Arc<DatabaseConnection>,
    gateway: Arc<dyn PaymentGateway>,
    event_sender: Arc<EventSender>,
    session_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CheckoutCompletionService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        gateway: Arc<dyn PaymentGateway>,
        event_sender: Arc<EventSender>,
    ) -> Self {
        Self {
            db,
            gateway,
            event_sender,
            session_locks: DashMap::new(),
        }
    }

    /// Ensures the session is finalized and returns every order id it
    /// produced or touched. The return shape is identical whether this is
    /// the first call or a replay; callers cannot (and must not) tell the
    /// difference.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn finalize_session(
        &self,
        session_id: &str,
        expected_customer: Option<Uuid>,
    ) -> Result<Vec<Uuid>, ServiceError> {
        let lock = self
            .session_locks
            .entry(session_id.to_string())
            .or_default()
            .clone();
        let guard = lock.lock().await;

        let result = self.finalize_locked(session_id, expected_customer).await;

        drop(guard);
        self.session_locks
            .remove_if(session_id, |_, v| Arc::strong_count(v) <= 2);

        result
    }

    async fn finalize_locked(
        &self,
        session_id: &str,
        expected_customer: Option<Uuid>,
    ) -> Result<Vec<Uuid>, ServiceError> {
        let session = self.gateway.retrieve_session(session_id).await?;

        let owner = session_owner(&session.metadata)?;

        if let Some(expected) = expected_customer {
            if owner != SessionOwner::Customer(expected) {
                return Err(CheckoutFinalizationError::OwnershipMismatch.into());
            }
        }

        if session.payment_status != PAYMENT_STATUS_PAID {
            return Err(
                CheckoutFinalizationError::NotPaid(session.payment_status.clone()).into(),
            );
        }

        let shipping = resolve_shipping(&session)?;
        let address_json = shipping.to_json()?;

        let is_guest = owner == SessionOwner::Guest;
        let context = RefreshContext {
            session_id: session_id.to_string(),
            payment_intent_id: session.payment_intent_id.clone(),
            address_json,
            guest_email: is_guest
                .then(|| {
                    session
                        .metadata
                        .get("guest_email")
                        .cloned()
                        .or_else(|| session.customer_email.clone())
                })
                .flatten(),
            guest_name: is_guest
                .then(|| {
                    session
                        .metadata
                        .get("guest_name")
                        .cloned()
                        .or_else(|| session.customer_name.clone())
                })
                .flatten(),
            guest_phone: is_guest
                .then(|| {
                    session
                        .metadata
                        .get("guest_phone")
                        .cloned()
                        .or_else(|| session.customer_phone.clone())
                })
                .flatten(),
            now: Utc::now(),
        };

        let existing = OrderEntity::find()
            .filter(order::Column::StripeSessionId.eq(session_id))
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        let order_ids = if existing.is_empty() {
            self.commit_from_session(&session, owner, context).await?
        } else {
            // Replay: a duplicate webhook, or the webhook racing the
            // client's completion call.
            self.refresh_in_txn(context).await?
        };

        info!(
            session_id = %session_id,
            orders = order_ids.len(),
            "payment session finalized"
        );
        if let Err(e) = self
            .event_sender
            .send(Event::OrdersCommitted {
                session_id: session_id.to_string(),
                order_ids: order_ids.clone(),
            })
            .await
        {
            warn!(error = %e, "Failed to send orders committed event");
        }

        Ok(order_ids)
    }

    /// First-time finalization: rebuild the order set from the processor's
    /// own record of what was purchased, never from client-supplied state.
    async fn commit_from_session(
        &self,
        session: &GatewaySession,
        owner: SessionOwner,
        context: RefreshContext,
    ) -> Result<Vec<Uuid>, ServiceError> {
        // Gateway calls stay outside the transaction: their latency is
        // unbounded relative to a held database connection.
        let purchased = self
            .gateway
            .list_session_line_items(&context.session_id)
            .await?;
        let purchased: Vec<_> = purchased.into_iter().filter(|i| i.quantity > 0).collect();
        if purchased.is_empty() {
            return Err(CheckoutFinalizationError::EmptySession.into());
        }

        let mut product_ids = Vec::with_capacity(purchased.len());
        for item in &purchased {
            let id = item.product_id.ok_or_else(|| {
                ServiceError::InternalError(format!(
                    "purchased item '{}' carries no product reference",
                    item.description
                ))
            })?;
            product_ids.push(id);
        }

        let products = ProductEntity::find()
            .filter(product::Column::Id.is_in(product_ids.clone()))
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;
        let products: HashMap<Uuid, product::Model> =
            products.into_iter().map(|p| (p.id, p)).collect();

        struct CommitLine {
            product: product::Model,
            quantity: i32,
            price: Decimal,
        }

        let mut lines = Vec::with_capacity(purchased.len());
        for (item, product_id) in purchased.iter().zip(product_ids) {
            let product = products.get(&product_id).cloned().ok_or_else(|| {
                ServiceError::InternalError(format!(
                    "purchased item references unknown product {}",
                    product_id
                ))
            })?;
            lines.push(CommitLine {
                product,
                quantity: item.quantity,
                price: Decimal::from(item.unit_amount) / Decimal::from(100),
            });
        }

        // Re-derive per-seller groups, preserving first-seen seller order.
        let mut groups: Vec<(Uuid, String, Vec<CommitLine>)> = Vec::new();
        for line in lines {
            let seller_id = line.product.seller_id;
            match groups.iter_mut().find(|(id, _, _)| *id == seller_id) {
                Some((_, _, items)) => items.push(line),
                None => groups.push((seller_id, line.product.seller_name.clone(), vec![line])),
            }
        }

        let customer_id = match owner {
            SessionOwner::Customer(id) => Some(id),
            SessionOwner::Guest => None,
        };

        self.db
            .transaction::<_, Vec<Uuid>, ServiceError>(move |txn| {
                Box::pin(async move {
                    // A staging transaction may have slipped in between the
                    // idempotency lookup and here; the unique index on
                    // (session id, seller id) makes the insert path safe,
                    // and re-checking turns the race into a refresh.
                    let existing = OrderEntity::find()
                        .filter(order::Column::StripeSessionId.eq(context.session_id.clone()))
                        .all(txn)
                        .await
                        .map_err(ServiceError::db_error)?;
                    if !existing.is_empty() {
                        return refresh_existing(txn, existing, &context).await;
                    }

                    let mut order_ids = Vec::with_capacity(groups.len());
                    for (seller_id, seller_name, items) in &groups {
                        let order_id = Uuid::new_v4();
                        let total: Decimal = items
                            .iter()
                            .map(|l| l.price * Decimal::from(l.quantity))
                            .sum();

                        order::ActiveModel {
                            id: Set(order_id),
                            customer_id: Set(customer_id),
                            seller_id: Set(*seller_id),
                            seller_name: Set(seller_name.clone()),
                            status: Set(OrderStatus::Processing),
                            total_amount: Set(total),
                            refunded_amount: Set(Decimal::ZERO),
                            shipping_address: Set(context.address_json.clone()),
                            payment_method: Set(Some("card".to_string())),
                            stripe_session_id: Set(Some(context.session_id.clone())),
                            payment_intent_id: Set(context.payment_intent_id.clone()),
                            tracking_number: Set(None),
                            guest_email: Set(context.guest_email.clone()),
                            guest_name: Set(context.guest_name.clone()),
                            guest_phone: Set(context.guest_phone.clone()),
                            order_date: Set(context.now),
                            shipped_at: Set(None),
                            delivered_at: Set(None),
                            created_at: Set(context.now),
                            updated_at: Set(Some(context.now)),
                            version: Set(1),
                        }
                        .insert(txn)
                        .await
                        .map_err(ServiceError::db_error)?;

                        for line in items {
                            order_item::ActiveModel {
                                id: Set(Uuid::new_v4()),
                                order_id: Set(order_id),
                                product_id: Set(line.product.id),
                                product_name: Set(line.product.name.clone()),
                                product_image: Set(line.product.image.clone()),
                                quantity: Set(line.quantity),
                                price: Set(line.price),
                                subtotal: Set(line.price * Decimal::from(line.quantity)),
                                is_reservation: Set(false),
                                reservation_date: Set(None),
                                reservation_time: Set(None),
                                reservation_note: Set(None),
                                created_at: Set(context.now),
                            }
                            .insert(txn)
                            .await
                            .map_err(ServiceError::db_error)?;
                        }

                        order_ids.push(order_id);
                    }

                    Ok(order_ids)
                })
            })
            .await
            .map_err(|e| match e {
                TransactionError::Connection(db_err) => ServiceError::db_error(db_err),
                TransactionError::Transaction(service_err) => service_err,
            })
    }

    async fn refresh_in_txn(&self, context: RefreshContext) -> Result<Vec<Uuid>, ServiceError> {
        self.db
            .transaction::<_, Vec<Uuid>, ServiceError>(move |txn| {
                Box::pin(async move {
                    let existing = OrderEntity::find()
                        .filter(order::Column::StripeSessionId.eq(context.session_id.clone()))
                        .all(txn)
                        .await
                        .map_err(ServiceError::db_error)?;
                    refresh_existing(txn, existing, &context).await
                })
            })
            .await
            .map_err(|e| match e {
                TransactionError::Connection(db_err) => ServiceError::db_error(db_err),
                TransactionError::Transaction(service_err) => service_err,
            })
    }
}

/// Refreshes orders already bound to the session: payment binding, order
/// date and shipping snapshot are rewritten; staged orders are promoted to
/// `processing` exactly once; any other status is left untouched, so a
/// replay never regresses or advances an order.
async fn refresh_existing<C: ConnectionTrait>(
    conn: &C,
    existing: Vec<order::Model>,
    context: &RefreshContext,
) -> Result<Vec<Uuid>, ServiceError> {
    let mut order_ids = Vec::with_capacity(existing.len());

    for order_model in existing {
        let order_id = order_model.id;
        let status = order_model.status;
        let version = order_model.version;

        let mut active: order::ActiveModel = order_model.into();
        active.payment_method = Set(Some("card".to_string()));
        active.stripe_session_id = Set(Some(context.session_id.clone()));
        active.payment_intent_id = Set(context.payment_intent_id.clone());
        active.order_date = Set(context.now);
        active.shipping_address = Set(context.address_json.clone());
        if context.guest_email.is_some() {
            active.guest_email = Set(context.guest_email.clone());
            active.guest_name = Set(context.guest_name.clone());
            active.guest_phone = Set(context.guest_phone.clone());
        }
        if status == OrderStatus::PendingPayment {
            active.status = Set(OrderStatus::Processing);
        }
        active.updated_at = Set(Some(context.now));
        active.version = Set(version + 1);

        active.update(conn).await.map_err(ServiceError::db_error)?;
        order_ids.push(order_id);
    }

    Ok(order_ids)
}
