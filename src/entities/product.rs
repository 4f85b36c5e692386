use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Catalog product. `quantity` is the live on-hand stock count; it is only
/// ever mutated through the stock operation ledger.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "products")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub seller_id: Uuid,
    pub seller_name: String,
    pub name: String,
    pub image: Option<String>,
    pub price: Decimal,
    pub quantity: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::stock_operation::Entity")]
    StockOperations,
}

impl Related<super::stock_operation::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::StockOperations.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
