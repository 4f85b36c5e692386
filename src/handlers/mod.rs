pub mod checkout;
pub mod orders;
pub mod stock_operations;
pub mod webhooks;

use std::sync::Arc;

use async_trait::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};
use uuid::Uuid;

use crate::{
    config::AppConfig,
    db::DbPool,
    errors::ServiceError,
    events::EventSender,
    services::{
        checkout::{CheckoutService, CheckoutSettings},
        cleanup::OrderCleanupService,
        finalization::CheckoutCompletionService,
        order_status::OrderStatusService,
        payment_gateway::PaymentGateway,
        stock::StockOperationService,
    },
};

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub checkout: Arc<CheckoutService>,
    pub completion: Arc<CheckoutCompletionService>,
    pub order_status: Arc<OrderStatusService>,
    pub stock: Arc<StockOperationService>,
    pub cleanup: Arc<OrderCleanupService>,
}

impl AppServices {
    pub fn new(
        db: Arc<DbPool>,
        gateway: Arc<dyn PaymentGateway>,
        event_sender: Arc<EventSender>,
        config: &AppConfig,
    ) -> Self {
        let checkout = Arc::new(CheckoutService::new(
            db.clone(),
            gateway.clone(),
            event_sender.clone(),
            CheckoutSettings {
                success_url: config.checkout_success_url.clone(),
                cancel_url: config.checkout_cancel_url.clone(),
                currency: config.currency.clone(),
            },
        ));
        let completion = Arc::new(CheckoutCompletionService::new(
            db.clone(),
            gateway,
            event_sender.clone(),
        ));
        let order_status = Arc::new(OrderStatusService::new(
            db.clone(),
            Some(event_sender.clone()),
        ));
        let stock = Arc::new(StockOperationService::new(db.clone(), event_sender));
        let cleanup = Arc::new(OrderCleanupService::new(
            db,
            order_status.clone(),
            config.pending_order_timeout_hours,
        ));

        Self {
            checkout,
            completion,
            order_status,
            stock,
            cleanup,
        }
    }
}

/// Authenticated customer identity. Token issuance and verification live
/// outside this service; the gateway in front of it resolves the session
/// and forwards the customer id in the `x-customer-id` header.
#[derive(Debug, Clone, Copy)]
pub struct CustomerIdentity(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for CustomerIdentity
where
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get("x-customer-id")
            .and_then(|value| value.to_str().ok())
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .map(CustomerIdentity)
            .ok_or_else(|| {
                ServiceError::Unauthorized("missing or invalid customer identity".to_string())
            })
    }
}

/// Staff identity forwarded by the admin gateway in `x-staff-id`.
#[derive(Debug, Clone, Copy)]
pub struct StaffIdentity(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for StaffIdentity
where
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get("x-staff-id")
            .and_then(|value| value.to_str().ok())
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .map(StaffIdentity)
            .ok_or_else(|| {
                ServiceError::Unauthorized("missing or invalid staff identity".to_string())
            })
    }
}
