use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QuerySelect, Set, TransactionError, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    entities::{
        order::{self, Entity as OrderEntity, OrderStatus},
        order_item::{self, Entity as OrderItemEntity},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        addresses::{AddressResolver, AddressSelection},
        payment_gateway::{CreateSessionRequest, PaymentGateway, SessionLineItem},
        reservations::{ReservationConflictDetector, ReservationRequest},
    },
};

/// One line of the cart payload handed to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CheckoutItemInput {
    pub product_id: Uuid,
    pub product_name: String,
    pub product_image: Option<String>,
    pub seller_id: Uuid,
    pub seller_name: String,
    pub quantity: i32,
    pub price: Decimal,
    #[serde(default)]
    pub is_reservation: bool,
    pub reservation_date: Option<String>,
    pub reservation_time: Option<String>,
    pub reservation_note: Option<String>,
}

/// Items belonging to one seller; becomes exactly one order.
#[derive(Debug, Clone)]
pub struct SellerGroup {
    pub seller_id: Uuid,
    pub seller_name: String,
    pub items: Vec<CheckoutItemInput>,
    pub total: Decimal,
}

/// Who is checking out.
#[derive(Debug, Clone)]
pub enum CheckoutCustomer {
    Registered { id: Uuid, email: Option<String> },
    Guest {
        email: String,
        name: Option<String>,
        phone: Option<String>,
    },
}

impl CheckoutCustomer {
    fn customer_id(&self) -> Option<Uuid> {
        match self {
            Self::Registered { id, .. } => Some(*id),
            Self::Guest { .. } => None,
        }
    }

    fn email(&self) -> Option<String> {
        match self {
            Self::Registered { email, .. } => email.clone(),
            Self::Guest { email, .. } => Some(email.clone()),
        }
    }
}

#[derive(Debug)]
pub struct CheckoutRequest {
    pub items: Vec<CheckoutItemInput>,
    pub address: AddressSelection,
}

/// Where to send the customer to pay.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CheckoutRedirect {
    pub session_id: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct CheckoutSettings {
    pub success_url: String,
    pub cancel_url: String,
    pub currency: String,
}

/// Drops invalid lines (non-positive quantity or price); an empty result
/// after filtering is itself rejected.
pub fn sanitize_items(
    items: Vec<CheckoutItemInput>,
) -> Result<Vec<CheckoutItemInput>, ServiceError> {
    let items: Vec<_> = items
        .into_iter()
        .filter(|item| item.quantity > 0 && item.price > Decimal::ZERO)
        .collect();
    if items.is_empty() {
        return Err(ServiceError::ValidationError(
            "Cart is empty or contains no purchasable items".to_string(),
        ));
    }
    Ok(items)
}

/// Partitions cart lines per seller, preserving first-seen seller order.
/// A multi-seller cart yields one group, and later one order, per seller.
pub fn group_items_by_seller(items: Vec<CheckoutItemInput>) -> Vec<SellerGroup> {
    let mut groups: Vec<SellerGroup> = Vec::new();
    for item in items {
        let line_total = item.price * Decimal::from(item.quantity);
        match groups.iter_mut().find(|g| g.seller_id == item.seller_id) {
            Some(group) => {
                group.total += line_total;
                group.items.push(item);
            }
            None => groups.push(SellerGroup {
                seller_id: item.seller_id,
                seller_name: item.seller_name.clone(),
                total: line_total,
                items: vec![item],
            }),
        }
    }
    groups
}

/// Converts a Decimal price into minor currency units for the processor.
pub fn minor_units(price: Decimal) -> Result<i64, ServiceError> {
    (price * Decimal::from(100))
        .round()
        .to_i64()
        .ok_or_else(|| ServiceError::ValidationError(format!("Price out of range: {}", price)))
}

fn reservation_requests(
    items: &[CheckoutItemInput],
) -> Result<Vec<ReservationRequest>, ServiceError> {
    let mut requests = Vec::new();
    for item in items.iter().filter(|i| i.is_reservation) {
        match (&item.reservation_date, &item.reservation_time) {
            (Some(date), Some(time)) => requests.push(ReservationRequest {
                product_id: item.product_id,
                product_name: item.product_name.clone(),
                date: date.clone(),
                time: time.clone(),
            }),
            _ => {
                return Err(ServiceError::ValidationError(format!(
                    "Reservation item '{}' is missing its date or time",
                    item.product_name
                )))
            }
        }
    }
    Ok(requests)
}

/// Orchestrates checkout: validates the cart, resolves the shipping
/// address, stages speculative orders and requests a hosted payment
/// session, rolling everything back when any step after session creation
/// fails.
#[derive(Clone)]
pub struct CheckoutService {
    db: Arc<DatabaseConnection>,
    gateway: Arc<dyn PaymentGateway>,
    addresses: AddressResolver,
    event_sender: Arc<EventSender>,
    settings: CheckoutSettings,
}

impl CheckoutService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        gateway: Arc<dyn PaymentGateway>,
        event_sender: Arc<EventSender>,
        settings: CheckoutSettings,
    ) -> Self {
        let addresses = AddressResolver::new(db.clone());
        Self {
            db,
            gateway,
            addresses,
            event_sender,
            settings,
        }
    }

    /// Validates the cart, stages one `pending_payment` order per seller
    /// and returns the hosted payment session redirect.
    ///
    /// Side effect: staged orders exist in storage before payment
    /// completes; they are purged (not cancelled) when the session dies.
    #[instrument(skip(self, customer, request), fields(items = request.items.len()))]
    pub async fn create_checkout_session(
        &self,
        customer: CheckoutCustomer,
        request: CheckoutRequest,
    ) -> Result<CheckoutRedirect, ServiceError> {
        let items = sanitize_items(request.items)?;
        let customer_id = customer.customer_id();

        let shipping = self
            .addresses
            .resolve(customer_id, &request.address)
            .await?;
        let address_json = shipping.to_json()?;

        let requests = reservation_requests(&items)?;
        ReservationConflictDetector::ensure_no_conflicts(&*self.db, &requests).await?;

        let groups = group_items_by_seller(items.clone());

        let save_address = matches!(request.address, AddressSelection::New { save: true, .. });
        let mut metadata = HashMap::new();
        match &customer {
            CheckoutCustomer::Registered { id, .. } => {
                metadata.insert("customer_id".to_string(), id.to_string());
            }
            CheckoutCustomer::Guest { email, name, phone } => {
                metadata.insert("guest".to_string(), "true".to_string());
                metadata.insert("guest_email".to_string(), email.clone());
                if let Some(name) = name {
                    metadata.insert("guest_name".to_string(), name.clone());
                }
                if let Some(phone) = phone {
                    metadata.insert("guest_phone".to_string(), phone.clone());
                }
            }
        }
        metadata.insert("save_address".to_string(), save_address.to_string());
        metadata.insert("shipping_address".to_string(), address_json.clone());
        metadata.insert("item_count".to_string(), items.len().to_string());
        metadata.insert("seller_count".to_string(), groups.len().to_string());

        let mut line_items = Vec::with_capacity(items.len());
        for item in &items {
            line_items.push(SessionLineItem {
                product_id: item.product_id,
                name: item.product_name.clone(),
                unit_amount: minor_units(item.price)?,
                quantity: item.quantity,
            });
        }

        let created = self
            .gateway
            .create_checkout_session(CreateSessionRequest {
                currency: self.settings.currency.clone(),
                customer_email: customer.email(),
                line_items,
                metadata,
                success_url: self.settings.success_url.clone(),
                cancel_url: self.settings.cancel_url.clone(),
            })
            .await?;

        let session_id = created.id.clone();
        match self
            .stage_orders(&session_id, &customer, &groups, &requests, &address_json)
            .await
        {
            Ok(order_ids) => {
                info!(
                    session_id = %session_id,
                    orders = order_ids.len(),
                    "checkout session created and orders staged"
                );
                if let Err(e) = self
                    .event_sender
                    .send(Event::OrdersStaged {
                        session_id: session_id.clone(),
                        order_ids,
                    })
                    .await
                {
                    warn!(error = %e, "Failed to send orders staged event");
                }
                Ok(CheckoutRedirect {
                    session_id,
                    url: created.url,
                })
            }
            Err(err) => {
                // The session exists but its staged orders do not: undo
                // both sides so the customer can retry cleanly.
                if let Err(purge_err) = self.purge_staged_orders(&session_id).await {
                    warn!(error = %purge_err, session_id = %session_id, "compensation purge failed");
                }
                if let Err(expire_err) = self.gateway.expire_session(&session_id).await {
                    warn!(error = %expire_err, session_id = %session_id, "compensation expire failed");
                }

                match err {
                    conflict @ ServiceError::Conflict(_) => Err(conflict),
                    other => {
                        error!(error = %other, session_id = %session_id, "order staging failed");
                        Err(ServiceError::ExternalServiceError(
                            "Checkout could not be completed; please retry".to_string(),
                        ))
                    }
                }
            }
        }
    }

    /// Stages one order per seller group inside a single transaction, with
    /// the reservation check re-validated on the same transaction so two
    /// customers cannot book one slot concurrently.
    async fn stage_orders(
        &self,
        session_id: &str,
        customer: &CheckoutCustomer,
        groups: &[SellerGroup],
        reservation_checks: &[ReservationRequest],
        address_json: &str,
    ) -> Result<Vec<Uuid>, ServiceError> {
        let session_id = session_id.to_string();
        let customer = customer.clone();
        let groups = groups.to_vec();
        let reservation_checks = reservation_checks.to_vec();
        let address_json = address_json.to_string();

        self.db
            .transaction::<_, Vec<Uuid>, ServiceError>(move |txn| {
                Box::pin(async move {
                    purge_staged_on(txn, &session_id).await?;
                    ReservationConflictDetector::ensure_no_conflicts(txn, &reservation_checks)
                        .await?;

                    let (guest_email, guest_name, guest_phone) = match &customer {
                        CheckoutCustomer::Guest { email, name, phone } => {
                            (Some(email.clone()), name.clone(), phone.clone())
                        }
                        CheckoutCustomer::Registered { .. } => (None, None, None),
                    };

                    let now = Utc::now();
                    let mut order_ids = Vec::with_capacity(groups.len());
                    for group in &groups {
                        let order_id = Uuid::new_v4();
                        order::ActiveModel {
                            id: Set(order_id),
                            customer_id: Set(customer.customer_id()),
                            seller_id: Set(group.seller_id),
                            seller_name: Set(group.seller_name.clone()),
                            status: Set(OrderStatus::PendingPayment),
                            total_amount: Set(group.total),
                            refunded_amount: Set(Decimal::ZERO),
                            shipping_address: Set(address_json.clone()),
                            payment_method: Set(None),
                            stripe_session_id: Set(Some(session_id.clone())),
                            payment_intent_id: Set(None),
                            tracking_number: Set(None),
                            guest_email: Set(guest_email.clone()),
                            guest_name: Set(guest_name.clone()),
                            guest_phone: Set(guest_phone.clone()),
                            order_date: Set(now),
                            shipped_at: Set(None),
                            delivered_at: Set(None),
                            created_at: Set(now),
                            updated_at: Set(Some(now)),
                            version: Set(1),
                        }
                        .insert(txn)
                        .await
                        .map_err(ServiceError::db_error)?;

                        for item in &group.items {
                            order_item::ActiveModel {
                                id: Set(Uuid::new_v4()),
                                order_id: Set(order_id),
                                product_id: Set(item.product_id),
                                product_name: Set(item.product_name.clone()),
                                product_image: Set(item.product_image.clone()),
                                quantity: Set(item.quantity),
                                price: Set(item.price),
                                subtotal: Set(item.price * Decimal::from(item.quantity)),
                                is_reservation: Set(item.is_reservation),
                                reservation_date: Set(item.reservation_date.clone()),
                                reservation_time: Set(item.reservation_time.clone()),
                                reservation_note: Set(item.reservation_note.clone()),
                                created_at: Set(now),
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

    /// Deletes staged (`pending_payment`) orders bound to a session,
    /// together with their items. Used by the expiry webhook and by
    /// compensation after a staging failure.
    #[instrument(skip(self))]
    pub async fn purge_staged_orders(&self, session_id: &str) -> Result<u64, ServiceError> {
        let session_id = session_id.to_string();
        let purged = self
            .db
            .transaction::<_, u64, ServiceError>(move |txn| {
                Box::pin(async move { purge_staged_on(txn, &session_id).await })
            })
            .await
            .map_err(|e| match e {
                TransactionError::Connection(db_err) => ServiceError::db_error(db_err),
                TransactionError::Transaction(service_err) => service_err,
            })?;

        if purged > 0 {
            info!(purged = purged, "staged orders purged");
        }
        Ok(purged)
    }
}

/// Deletes staged orders for a session on the given connection.
async fn purge_staged_on<C: ConnectionTrait>(
    conn: &C,
    session_id: &str,
) -> Result<u64, ServiceError> {
    let staged: Vec<Uuid> = OrderEntity::find()
        .select_only()
        .column(order::Column::Id)
        .filter(order::Column::StripeSessionId.eq(session_id))
        .filter(order::Column::Status.eq(OrderStatus::PendingPayment))
        .into_tuple()
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?;

    if staged.is_empty() {
        return Ok(0);
    }

    OrderItemEntity::delete_many()
        .filter(order_item::Column::OrderId.is_in(staged.clone()))
        .exec(conn)
        .await
        .map_err(ServiceError::db_error)?;

    let deleted = OrderEntity::delete_many()
        .filter(order::Column::Id.is_in(staged))
        .exec(conn)
        .await
        .map_err(ServiceError::db_error)?;

    Ok(deleted.rows_affected)
}
