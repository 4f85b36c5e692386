//! Shared test harness: an in-memory SQLite database with the full schema,
//! real services, and a scripted payment gateway double.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ConnectOptions, Database, DatabaseConnection, Set};
use sea_orm_migration::MigratorTrait;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use uuid::Uuid;

use marketplace_api::{
    config::AppConfig,
    entities::{customer_address, order, order_item, product},
    errors::ServiceError,
    events::EventSender,
    handlers::AppServices,
    migrator::Migrator,
    services::payment_gateway::{
        CreateSessionRequest, CreatedSession, GatewaySession, PaymentGateway, PurchasedLineItem,
    },
};

pub const WEBHOOK_SECRET: &str = "whsec_test_secret";

/// Payment gateway double backed by in-memory session state. Sessions are
/// created unpaid; tests flip them to paid with [`ScriptedGateway::mark_paid`].
#[derive(Default)]
pub struct ScriptedGateway {
    counter: AtomicUsize,
    pub sessions: Mutex<HashMap<String, GatewaySession>>,
    pub line_items: Mutex<HashMap<String, Vec<PurchasedLineItem>>>,
    pub expired: Mutex<Vec<String>>,
    /// When set, the next created session reuses this id.
    pub fixed_session_id: Mutex<Option<String>>,
}

impl ScriptedGateway {
    pub async fn mark_paid(&self, session_id: &str, payment_intent: &str) {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(session_id)
            .expect("session to mark as paid");
        session.payment_status = "paid".to_string();
        session.payment_intent_id = Some(payment_intent.to_string());
    }

    /// Registers a session that did not originate from this process, as if
    /// it had been created by another instance sharing the processor.
    pub async fn register_session(&self, session: GatewaySession, items: Vec<PurchasedLineItem>) {
        let id = session.id.clone();
        self.sessions.lock().await.insert(id.clone(), session);
        self.line_items.lock().await.insert(id, items);
    }

    pub async fn expired_sessions(&self) -> Vec<String> {
        self.expired.lock().await.clone()
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn create_checkout_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<CreatedSession, ServiceError> {
        let id = match self.fixed_session_id.lock().await.clone() {
            Some(fixed) => fixed,
            None => format!(
                "cs_test_{}",
                self.counter.fetch_add(1, Ordering::SeqCst) + 1
            ),
        };

        let session = GatewaySession {
            id: id.clone(),
            payment_status: "unpaid".to_string(),
            payment_intent_id: None,
            metadata: request.metadata.clone(),
            customer_email: request.customer_email.clone(),
            customer_name: None,
            customer_phone: None,
            shipping_address: None,
        };
        let items = request
            .line_items
            .iter()
            .map(|item| PurchasedLineItem {
                product_id: Some(item.product_id),
                description: item.name.clone(),
                quantity: item.quantity,
                unit_amount: item.unit_amount,
            })
            .collect();

        self.sessions.lock().await.insert(id.clone(), session);
        self.line_items.lock().await.insert(id.clone(), items);

        Ok(CreatedSession {
            url: format!("https://pay.example/session/{}", id),
            id,
        })
    }

    async fn retrieve_session(&self, session_id: &str) -> Result<GatewaySession, ServiceError> {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| {
                ServiceError::ExternalServiceError(format!("no such session: {}", session_id))
            })
    }

    async fn list_session_line_items(
        &self,
        session_id: &str,
    ) -> Result<Vec<PurchasedLineItem>, ServiceError> {
        Ok(self
            .line_items
            .lock()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn expire_session(&self, session_id: &str) -> Result<(), ServiceError> {
        self.expired.lock().await.push(session_id.to_string());
        if let Some(session) = self.sessions.lock().await.get_mut(session_id) {
            session.payment_status = "expired".to_string();
        }
        Ok(())
    }
}

pub fn test_config() -> AppConfig {
    AppConfig {
        database_url: "sqlite::memory:".to_string(),
        host: "127.0.0.1".to_string(),
        port: 0,
        environment: "development".to_string(),
        log_level: "debug".to_string(),
        log_json: false,
        auto_migrate: true,
        db_max_connections: 1,
        db_min_connections: 1,
        payment_secret_key: "sk_test_key".to_string(),
        payment_api_base: "https://api.stripe.example".to_string(),
        payment_webhook_secret: Some(WEBHOOK_SECRET.to_string()),
        payment_webhook_tolerance_secs: 300,
        payment_timeout_secs: 5,
        checkout_success_url: "https://shop.example/checkout/success".to_string(),
        checkout_cancel_url: "https://shop.example/checkout/cancel".to_string(),
        currency: "usd".to_string(),
        pending_order_timeout_hours: 24,
        cleanup_interval_secs: 3600,
    }
}

pub struct TestApp {
    pub db: Arc<DatabaseConnection>,
    pub gateway: Arc<ScriptedGateway>,
    pub services: AppServices,
    pub config: AppConfig,
    pub event_sender: EventSender,
}

impl TestApp {
    pub async fn new() -> Self {
        // A single pooled connection keeps every session on the same
        // in-memory database.
        let mut options = ConnectOptions::new("sqlite::memory:".to_string());
        options.max_connections(1).min_connections(1);
        let db = Database::connect(options)
            .await
            .expect("sqlite in-memory connection");
        Migrator::up(&db, None).await.expect("migrations");
        let db = Arc::new(db);

        let (event_tx, event_rx) = mpsc::channel(1024);
        let event_sender = EventSender::new(event_tx);
        tokio::spawn(marketplace_api::events::process_events(event_rx));

        let config = test_config();
        let gateway = Arc::new(ScriptedGateway::default());
        let gateway_dyn: Arc<dyn PaymentGateway> = gateway.clone();
        let services = AppServices::new(
            db.clone(),
            gateway_dyn,
            Arc::new(event_sender.clone()),
            &config,
        );

        Self {
            db,
            gateway,
            services,
            config,
            event_sender,
        }
    }

    pub fn state(&self) -> marketplace_api::AppState {
        marketplace_api::AppState {
            db: self.db.clone(),
            config: self.config.clone(),
            event_sender: self.event_sender.clone(),
            services: self.services.clone(),
        }
    }

    pub fn router(&self) -> axum::Router {
        axum::Router::new()
            .nest("/api/v1", marketplace_api::api_v1_routes())
            .with_state(self.state())
    }

    pub async fn seed_product(
        &self,
        seller_id: Uuid,
        seller_name: &str,
        name: &str,
        price: Decimal,
        quantity: i32,
    ) -> product::Model {
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            seller_id: Set(seller_id),
            seller_name: Set(seller_name.to_string()),
            name: Set(name.to_string()),
            image: Set(Some(format!("https://img.example/{}.jpg", name))),
            price: Set(price),
            quantity: Set(quantity),
            created_at: Set(Utc::now()),
            updated_at: Set(None),
        }
        .insert(&*self.db)
        .await
        .expect("seed product")
    }

    pub async fn seed_address(&self, customer_id: Uuid) -> customer_address::Model {
        customer_address::ActiveModel {
            id: Set(Uuid::new_v4()),
            customer_id: Set(customer_id),
            recipient_name: Set("Test Recipient".to_string()),
            phone: Set("+1-555-0100".to_string()),
            line1: Set("42 Harbor Street".to_string()),
            line2: Set(None),
            city: Set("Portland".to_string()),
            state: Set("OR".to_string()),
            postal_code: Set("97201".to_string()),
            country: Set("US".to_string()),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.db)
        .await
        .expect("seed address")
    }

    /// Inserts an order directly, bypassing the pipeline. Used to arrange
    /// lifecycle and cleanup scenarios.
    pub async fn seed_order(
        &self,
        status: order::OrderStatus,
        order_date: chrono::DateTime<Utc>,
        session_id: Option<&str>,
    ) -> order::Model {
        let now = Utc::now();
        order::ActiveModel {
            id: Set(Uuid::new_v4()),
            customer_id: Set(Some(Uuid::new_v4())),
            seller_id: Set(Uuid::new_v4()),
            seller_name: Set("Seeded Seller".to_string()),
            status: Set(status),
            total_amount: Set(Decimal::new(2000, 2)),
            refunded_amount: Set(Decimal::ZERO),
            shipping_address: Set("{}".to_string()),
            payment_method: Set(Some("card".to_string())),
            stripe_session_id: Set(session_id.map(str::to_string)),
            payment_intent_id: Set(None),
            tracking_number: Set(None),
            guest_email: Set(None),
            guest_name: Set(None),
            guest_phone: Set(None),
            order_date: Set(order_date),
            shipped_at: Set(None),
            delivered_at: Set(None),
            created_at: Set(now),
            updated_at: Set(Some(now)),
            version: Set(1),
        }
        .insert(&*self.db)
        .await
        .expect("seed order")
    }

    pub async fn seed_order_item(
        &self,
        order_id: Uuid,
        product_id: Uuid,
        quantity: i32,
        price: Decimal,
    ) -> order_item::Model {
        order_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            product_id: Set(product_id),
            product_name: Set("Seeded Item".to_string()),
            product_image: Set(None),
            quantity: Set(quantity),
            price: Set(price),
            subtotal: Set(price * Decimal::from(quantity)),
            is_reservation: Set(false),
            reservation_date: Set(None),
            reservation_time: Set(None),
            reservation_note: Set(None),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.db)
        .await
        .expect("seed order item")
    }
}

/// A complete, valid shipping address for checkout payloads.
pub fn shipping_address() -> marketplace_api::services::addresses::ShippingAddress {
    marketplace_api::services::addresses::ShippingAddress {
        recipient_name: "Jamie Doe".to_string(),
        phone: "+1-555-0123".to_string(),
        line1: "7 Cannery Row".to_string(),
        line2: None,
        city: "Monterey".to_string(),
        state: "CA".to_string(),
        postal_code: "93940".to_string(),
        country: "US".to_string(),
    }
}
