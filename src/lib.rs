//! Marketplace API Library
//!
//! Core of the multi-seller marketplace backend: the checkout-to-order
//! finalization pipeline, the order status state machine, the stock
//! operation ledger and the pending-order cleanup sweep.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod migrator;
pub mod openapi;
pub mod services;

use axum::{
    routing::{get, post, put},
    Router,
};
use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use std::sync::Arc;
use utoipa::ToSchema;

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: config::AppConfig,
    pub event_sender: events::EventSender,
    pub services: handlers::AppServices,
}

// Common response wrapper
#[derive(Serialize, ToSchema)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    pub timestamp: String,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// Builds the v1 API router.
pub fn api_v1_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/checkout/sessions",
            post(handlers::checkout::create_checkout_session),
        )
        .route(
            "/checkout/complete",
            post(handlers::checkout::complete_checkout),
        )
        .route(
            "/payments/webhook",
            post(handlers::webhooks::payment_webhook),
        )
        .route("/orders/:id", get(handlers::orders::get_order))
        .route(
            "/orders/:id/status",
            put(handlers::orders::update_order_status),
        )
        .route(
            "/orders/:id/tracking",
            put(handlers::orders::set_tracking_number),
        )
        .route(
            "/stock-operations",
            post(handlers::stock_operations::create_stock_operation),
        )
        .route(
            "/products/:id/stock-operations",
            get(handlers::stock_operations::list_product_stock_operations),
        )
}

#[cfg(test)]
mod response_tests {
    use super::*;

    #[test]
    fn success_response_carries_data() {
        let response = ApiResponse::success("ok");
        assert!(response.success);
        assert_eq!(response.data, Some("ok"));
        assert!(response.message.is_none());
    }

    #[test]
    fn error_response_carries_message() {
        let response: ApiResponse<()> = ApiResponse::error("boom".to_string());
        assert!(!response.success);
        assert_eq!(response.message.as_deref(), Some("boom"));
    }
}
