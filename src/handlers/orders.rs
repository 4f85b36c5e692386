use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    entities::{
        order,
        order_item::{self, Entity as OrderItemEntity},
    },
    errors::ServiceError,
    handlers::StaffIdentity,
    ApiResponse, AppState,
};

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateOrderStatusRequest {
    pub status: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SetTrackingNumberRequest {
    pub tracking_number: String,
}

#[derive(Debug, Serialize)]
pub struct OrderDetailResponse {
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
}

// GET /api/v1/orders/:id
#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Order with its items"),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = state
        .services
        .order_status
        .get_order(id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", id)))?;

    let items = OrderItemEntity::find()
        .filter(order_item::Column::OrderId.eq(id))
        .all(&*state.db)
        .await
        .map_err(ServiceError::db_error)?;

    Ok(Json(ApiResponse::success(OrderDetailResponse {
        order,
        items,
    })))
}

// PUT /api/v1/orders/:id/status
#[utoipa::path(
    put,
    path = "/api/v1/orders/{id}/status",
    params(("id" = Uuid, Path, description = "Order id")),
    request_body = UpdateOrderStatusRequest,
    responses(
        (status = 200, description = "Status updated"),
        (status = 400, description = "Unknown status or illegal transition", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
pub async fn update_order_status(
    State(state): State<AppState>,
    _staff: StaffIdentity,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateOrderStatusRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let updated = state
        .services
        .order_status
        .update_status_str(id, &payload.status)
        .await?;

    Ok((StatusCode::OK, Json(ApiResponse::success(updated))))
}

// PUT /api/v1/orders/:id/tracking
#[utoipa::path(
    put,
    path = "/api/v1/orders/{id}/tracking",
    params(("id" = Uuid, Path, description = "Order id")),
    request_body = SetTrackingNumberRequest,
    responses(
        (status = 200, description = "Tracking number attached"),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
pub async fn set_tracking_number(
    State(state): State<AppState>,
    _staff: StaffIdentity,
    Path(id): Path<Uuid>,
    Json(payload): Json<SetTrackingNumberRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let updated = state
        .services
        .order_status
        .set_tracking_number(id, payload.tracking_number)
        .await?;

    Ok((StatusCode::OK, Json(ApiResponse::success(updated))))
}
