use std::str::FromStr;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    entities::stock_operation::StockDirection,
    errors::ServiceError,
    handlers::StaffIdentity,
    services::stock::CreateStockOperationRequest,
    ApiResponse, AppState,
};

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateStockOperationPayload {
    pub product_id: Uuid,
    /// `in` or `out`
    pub direction: String,
    pub quantity: i32,
    pub reason: Option<String>,
    pub order_id: Option<Uuid>,
}

// POST /api/v1/stock-operations
#[utoipa::path(
    post,
    path = "/api/v1/stock-operations",
    request_body = CreateStockOperationPayload,
    responses(
        (status = 201, description = "Ledger entry created; any order status effect reported"),
        (status = 400, description = "Invalid direction or quantity", body = crate::errors::ErrorResponse),
        (status = 404, description = "Product or linked order not found", body = crate::errors::ErrorResponse),
        (status = 422, description = "Insufficient stock", body = crate::errors::ErrorResponse)
    ),
    tag = "Stock"
)]
pub async fn create_stock_operation(
    State(state): State<AppState>,
    staff: StaffIdentity,
    Json(payload): Json<CreateStockOperationPayload>,
) -> Result<impl IntoResponse, ServiceError> {
    let direction = StockDirection::from_str(&payload.direction).map_err(|_| {
        ServiceError::ValidationError(format!(
            "Invalid stock direction: {} (expected 'in' or 'out')",
            payload.direction
        ))
    })?;

    let outcome = state
        .services
        .stock
        .create_operation(CreateStockOperationRequest {
            product_id: payload.product_id,
            direction,
            quantity: payload.quantity,
            reason: payload.reason,
            order_id: payload.order_id,
            performed_by: staff.0,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(ApiResponse::success(outcome))))
}

// GET /api/v1/products/:id/stock-operations
#[utoipa::path(
    get,
    path = "/api/v1/products/{id}/stock-operations",
    params(("id" = Uuid, Path, description = "Product id")),
    responses(
        (status = 200, description = "Ledger entries for the product, newest first")
    ),
    tag = "Stock"
)]
pub async fn list_product_stock_operations(
    State(state): State<AppState>,
    _staff: StaffIdentity,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let operations = state.services.stock.list_for_product(id).await?;
    Ok(Json(ApiResponse::success(operations)))
}
