use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    errors::ServiceError,
    handlers::CustomerIdentity,
    services::{
        addresses::{AddressSelection, ShippingAddress},
        checkout::{CheckoutCustomer, CheckoutItemInput, CheckoutRequest},
    },
    ApiResponse, AppState,
};

#[derive(Debug, Deserialize, ToSchema)]
pub struct GuestContact {
    pub email: String,
    pub name: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateCheckoutSessionRequest {
    pub items: Vec<CheckoutItemInput>,
    /// Reference to a saved address; mutually exclusive with `address`.
    pub saved_address_id: Option<Uuid>,
    /// Freshly supplied address.
    pub address: Option<ShippingAddress>,
    /// Persist `address` as a new saved address for the customer.
    #[serde(default)]
    pub save_address: bool,
    /// Contact details when checking out without an account.
    pub guest: Option<GuestContact>,
    /// Customer email used for the hosted payment page.
    pub email: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CompleteCheckoutRequest {
    pub session_id: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CompleteCheckoutResponse {
    pub order_ids: Vec<Uuid>,
}

// POST /api/v1/checkout/sessions
#[utoipa::path(
    post,
    path = "/api/v1/checkout/sessions",
    request_body = CreateCheckoutSessionRequest,
    responses(
        (status = 201, description = "Hosted payment session created; orders staged"),
        (status = 400, description = "Empty cart or incomplete address", body = crate::errors::ErrorResponse),
        (status = 403, description = "Saved address not owned by caller", body = crate::errors::ErrorResponse),
        (status = 409, description = "Reservation slot conflict", body = crate::errors::ErrorResponse),
        (status = 502, description = "Payment processor unavailable", body = crate::errors::ErrorResponse)
    ),
    tag = "Checkout"
)]
pub async fn create_checkout_session(
    State(state): State<AppState>,
    customer: Option<CustomerIdentity>,
    Json(payload): Json<CreateCheckoutSessionRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let customer = match (customer, payload.guest) {
        (Some(CustomerIdentity(id)), _) => CheckoutCustomer::Registered {
            id,
            email: payload.email,
        },
        (None, Some(guest)) => CheckoutCustomer::Guest {
            email: guest.email,
            name: guest.name,
            phone: guest.phone,
        },
        (None, None) => {
            return Err(ServiceError::Unauthorized(
                "checkout requires a customer identity or guest contact details".to_string(),
            ))
        }
    };

    let address = match (payload.saved_address_id, payload.address) {
        (Some(address_id), _) => AddressSelection::Saved { address_id },
        (None, Some(address)) => AddressSelection::New {
            address,
            save: payload.save_address,
        },
        (None, None) => {
            return Err(ServiceError::ValidationError(
                "a saved address id or a shipping address is required".to_string(),
            ))
        }
    };

    let redirect = state
        .services
        .checkout
        .create_checkout_session(
            customer,
            CheckoutRequest {
                items: payload.items,
                address,
            },
        )
        .await?;

    Ok((StatusCode::CREATED, Json(ApiResponse::success(redirect))))
}

// POST /api/v1/checkout/complete
#[utoipa::path(
    post,
    path = "/api/v1/checkout/complete",
    request_body = CompleteCheckoutRequest,
    responses(
        (status = 200, description = "Session finalized; order ids returned", body = CompleteCheckoutResponse),
        (status = 400, description = "Session unpaid or unusable", body = crate::errors::ErrorResponse),
        (status = 403, description = "Session owned by another customer", body = crate::errors::ErrorResponse)
    ),
    tag = "Checkout"
)]
pub async fn complete_checkout(
    State(state): State<AppState>,
    customer: Option<CustomerIdentity>,
    Json(payload): Json<CompleteCheckoutRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let order_ids = state
        .services
        .completion
        .finalize_session(&payload.session_id, customer.map(|c| c.0))
        .await?;

    Ok((
        StatusCode::OK,
        Json(ApiResponse::success(CompleteCheckoutResponse { order_ids })),
    ))
}
