use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Marketplace API",
        version = "1.0.0",
        description = r#"
Multi-seller marketplace backend.

The checkout pipeline stages one speculative order per seller when a
hosted payment session is created, finalizes paid sessions exactly once
(from the client completion call or the payment webhook, whichever lands
first), and drives the order status state machine as stock is moved.
"#
    ),
    paths(
        crate::handlers::checkout::create_checkout_session,
        crate::handlers::checkout::complete_checkout,
        crate::handlers::webhooks::payment_webhook,
        crate::handlers::orders::get_order,
        crate::handlers::orders::update_order_status,
        crate::handlers::orders::set_tracking_number,
        crate::handlers::stock_operations::create_stock_operation,
        crate::handlers::stock_operations::list_product_stock_operations,
    ),
    components(schemas(
        crate::errors::ErrorResponse,
        crate::handlers::checkout::CreateCheckoutSessionRequest,
        crate::handlers::checkout::GuestContact,
        crate::handlers::checkout::CompleteCheckoutRequest,
        crate::handlers::checkout::CompleteCheckoutResponse,
        crate::handlers::orders::UpdateOrderStatusRequest,
        crate::handlers::orders::SetTrackingNumberRequest,
        crate::handlers::stock_operations::CreateStockOperationPayload,
        crate::services::addresses::ShippingAddress,
        crate::services::checkout::CheckoutItemInput,
        crate::services::checkout::CheckoutRedirect,
    )),
    tags(
        (name = "Checkout", description = "Checkout session orchestration and completion"),
        (name = "Payments", description = "Payment processor webhook surface"),
        (name = "Orders", description = "Order state machine and mutation layer"),
        (name = "Stock", description = "Stock operation ledger"),
    )
)]
pub struct ApiDoc;

/// Swagger UI mounted at `/docs`, serving the OpenAPI document at
/// `/api-docs/openapi.json`.
pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi())
}
