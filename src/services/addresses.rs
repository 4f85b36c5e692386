use std::sync::Arc;

use chrono::Utc;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    entities::customer_address::{self, Entity as CustomerAddress},
    errors::ServiceError,
};

/// Shipping address snapshot. Orders store this serialized as JSON; the
/// saved-address row it may have been copied from can change or disappear
/// without affecting historical orders.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct ShippingAddress {
    #[validate(length(min = 1, message = "Recipient name is required"))]
    pub recipient_name: String,
    #[validate(length(min = 1, message = "Phone is required"))]
    pub phone: String,
    #[validate(length(min = 1, message = "Address line is required"))]
    pub line1: String,
    pub line2: Option<String>,
    #[validate(length(min = 1, message = "City is required"))]
    pub city: String,
    #[validate(length(min = 1, message = "State is required"))]
    pub state: String,
    #[validate(length(min = 1, message = "Postal code is required"))]
    pub postal_code: String,
    #[validate(length(min = 1, message = "Country is required"))]
    pub country: String,
}

impl ShippingAddress {
    pub fn to_json(&self) -> Result<String, ServiceError> {
        serde_json::to_string(self)
            .map_err(|e| ServiceError::InternalError(format!("address serialization: {}", e)))
    }

    pub fn from_json(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}

impl From<customer_address::Model> for ShippingAddress {
    fn from(model: customer_address::Model) -> Self {
        Self {
            recipient_name: model.recipient_name,
            phone: model.phone,
            line1: model.line1,
            line2: model.line2,
            city: model.city,
            state: model.state,
            postal_code: model.postal_code,
            country: model.country,
        }
    }
}

/// How the caller names the shipping address for a checkout.
#[derive(Debug, Clone)]
pub enum AddressSelection {
    /// Reference to a saved address; must belong to the requesting customer.
    Saved { address_id: Uuid },
    /// Freshly supplied address, optionally persisted for reuse.
    New { address: ShippingAddress, save: bool },
}

/// Resolves a checkout request's address selection into a concrete snapshot.
#[derive(Clone)]
pub struct AddressResolver {
    db: Arc<DatabaseConnection>,
}

impl AddressResolver {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Resolves the shipping address for a checkout.
    ///
    /// Saved addresses are ownership-checked against the requesting
    /// customer; fresh addresses are validated field by field and, when
    /// requested by an authenticated customer, persisted as a new saved
    /// address.
    #[instrument(skip(self, selection))]
    pub async fn resolve(
        &self,
        customer_id: Option<Uuid>,
        selection: &AddressSelection,
    ) -> Result<ShippingAddress, ServiceError> {
        match selection {
            AddressSelection::Saved { address_id } => {
                let record = CustomerAddress::find_by_id(*address_id)
                    .one(&*self.db)
                    .await
                    .map_err(ServiceError::db_error)?
                    .ok_or_else(|| {
                        ServiceError::NotFound(format!("Address {} not found", address_id))
                    })?;

                match customer_id {
                    Some(owner) if record.customer_id == owner => Ok(record.into()),
                    _ => Err(ServiceError::Forbidden(
                        "Address does not belong to the requesting customer".to_string(),
                    )),
                }
            }
            AddressSelection::New { address, save } => {
                address.validate()?;

                if *save {
                    if let Some(owner) = customer_id {
                        let row = customer_address::ActiveModel {
                            id: Set(Uuid::new_v4()),
                            customer_id: Set(owner),
                            recipient_name: Set(address.recipient_name.clone()),
                            phone: Set(address.phone.clone()),
                            line1: Set(address.line1.clone()),
                            line2: Set(address.line2.clone()),
                            city: Set(address.city.clone()),
                            state: Set(address.state.clone()),
                            postal_code: Set(address.postal_code.clone()),
                            country: Set(address.country.clone()),
                            created_at: Set(Utc::now()),
                        };
                        let saved = row.insert(&*self.db).await.map_err(ServiceError::db_error)?;
                        info!(address_id = %saved.id, customer_id = %owner, "saved new shipping address");
                    }
                }

                Ok(address.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address() -> ShippingAddress {
        ShippingAddress {
            recipient_name: "Ada Lovelace".to_string(),
            phone: "+1-555-0100".to_string(),
            line1: "1 Analytical Way".to_string(),
            line2: None,
            city: "London".to_string(),
            state: "LDN".to_string(),
            postal_code: "EC1A".to_string(),
            country: "GB".to_string(),
        }
    }

    #[test]
    fn complete_address_validates() {
        assert!(address().validate().is_ok());
    }

    #[test]
    fn blank_required_field_is_rejected() {
        let mut addr = address();
        addr.city = String::new();
        assert!(addr.validate().is_err());
    }

    #[test]
    fn json_snapshot_round_trips() {
        let addr = address();
        let raw = addr.to_json().unwrap();
        let restored = ShippingAddress::from_json(&raw).unwrap();
        assert_eq!(restored.recipient_name, addr.recipient_name);
        assert_eq!(restored.postal_code, addr.postal_code);
    }
}
