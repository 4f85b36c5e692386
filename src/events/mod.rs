use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::entities::order::OrderStatus;
use crate::entities::stock_operation::StockDirection;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

// Define the various events that can occur in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    /// Staged orders were created for a new payment session
    OrdersStaged {
        session_id: String,
        order_ids: Vec<Uuid>,
    },
    /// A paid session was converted into committed orders
    OrdersCommitted {
        session_id: String,
        order_ids: Vec<Uuid>,
    },
    /// Staged orders bound to a session were purged
    StagedOrdersPurged { session_id: String, count: u64 },
    OrderStatusChanged {
        order_id: Uuid,
        old_status: OrderStatus,
        new_status: OrderStatus,
    },
    OrderCancelled(Uuid),
    StockAdjusted {
        product_id: Uuid,
        direction: StockDirection,
        quantity: i32,
        new_quantity: i32,
    },
    CheckoutSessionExpired { session_id: String },
    /// Generic event for custom messages
    Generic {
        message: String,
        timestamp: DateTime<Utc>,
        metadata: serde_json::Value,
    },
}

impl Event {
    /// Create a generic event with string data
    pub fn with_data(data: String) -> Self {
        Event::Generic {
            message: data,
            timestamp: Utc::now(),
            metadata: serde_json::Value::Null,
        }
    }
}

/// Processes incoming events. Today this is a structured-log sink; it is
/// the seam where outbound integrations (notifications, analytics) attach.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::OrdersStaged {
                session_id,
                order_ids,
            } => {
                info!(
                    session_id = %session_id,
                    count = order_ids.len(),
                    "orders staged for payment session"
                );
            }
            Event::OrdersCommitted {
                session_id,
                order_ids,
            } => {
                info!(
                    session_id = %session_id,
                    count = order_ids.len(),
                    "orders committed for paid session"
                );
            }
            Event::StagedOrdersPurged { session_id, count } => {
                info!(session_id = %session_id, count = count, "staged orders purged");
            }
            Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
            } => {
                info!(
                    order_id = %order_id,
                    old_status = %old_status,
                    new_status = %new_status,
                    "order status changed"
                );
            }
            Event::OrderCancelled(order_id) => {
                info!(order_id = %order_id, "order cancelled");
            }
            Event::StockAdjusted {
                product_id,
                direction,
                quantity,
                new_quantity,
            } => {
                info!(
                    product_id = %product_id,
                    direction = %direction,
                    quantity = quantity,
                    new_quantity = new_quantity,
                    "stock adjusted"
                );
            }
            Event::CheckoutSessionExpired { session_id } => {
                info!(session_id = %session_id, "checkout session expired");
            }
            Event::Generic { message, .. } => {
                info!("event: {}", message);
            }
        }
    }

    warn!("Event processing loop has ended");
}
