use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Lifecycle states for a marketplace order.
///
/// `PendingPayment` rows are speculative: they exist only while a hosted
/// payment session is open and are purged, never cancelled, when the
/// session expires before payment.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    #[sea_orm(string_value = "pending_payment")]
    PendingPayment,
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "processing")]
    Processing,
    #[sea_orm(string_value = "shipped")]
    Shipped,
    #[sea_orm(string_value = "delivered")]
    Delivered,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
    #[sea_orm(string_value = "return_processing")]
    ReturnProcessing,
    #[sea_orm(string_value = "returned")]
    Returned,
}

/// One seller's slice of a checkout. A multi-seller cart produces one row
/// per seller, all bound to the same payment session id.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Owning customer; `None` for guest orders, which carry the
    /// `guest_*` contact fields instead.
    pub customer_id: Option<Uuid>,

    pub seller_id: Uuid,
    pub seller_name: String,
    pub status: OrderStatus,
    pub total_amount: Decimal,
    /// Sum of succeeded refunds, maintained by the mutation layer.
    pub refunded_amount: Decimal,
    /// JSON snapshot copied at order-creation time, not a live reference.
    pub shipping_address: String,
    pub payment_method: Option<String>,
    pub stripe_session_id: Option<String>,
    pub payment_intent_id: Option<String>,
    pub tracking_number: Option<String>,
    pub guest_email: Option<String>,
    pub guest_name: Option<String>,
    pub guest_phone: Option<String>,
    pub order_date: DateTime<Utc>,
    pub shipped_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub version: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItems,
    #[sea_orm(has_many = "super::refund::Entity")]
    Refunds,
    #[sea_orm(has_many = "super::stock_operation::Entity")]
    StockOperations,
    #[sea_orm(has_many = "super::order_audit::Entity")]
    Audits,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItems.def()
    }
}

impl Related<super::refund::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Refunds.def()
    }
}

impl Related<super::stock_operation::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::StockOperations.def()
    }
}

impl Related<super::order_audit::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Audits.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
