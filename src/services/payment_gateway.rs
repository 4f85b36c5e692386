use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::{errors::ServiceError, services::addresses::ShippingAddress};

type HmacSha256 = Hmac<Sha256>;

/// Webhook event types this pipeline consumes.
pub const EVENT_SESSION_COMPLETED: &str = "checkout.session.completed";
pub const EVENT_ASYNC_PAYMENT_SUCCEEDED: &str = "checkout.session.async_payment_succeeded";
pub const EVENT_SESSION_EXPIRED: &str = "checkout.session.expired";

/// Session payment state reported by the processor once the customer paid.
pub const PAYMENT_STATUS_PAID: &str = "paid";

/// Line item sent to the processor when creating a hosted session.
/// `unit_amount` is in minor currency units.
#[derive(Debug, Clone)]
pub struct SessionLineItem {
    pub product_id: Uuid,
    pub name: String,
    pub unit_amount: i64,
    pub quantity: i32,
}

#[derive(Debug, Clone)]
pub struct CreateSessionRequest {
    pub currency: String,
    pub customer_email: Option<String>,
    pub line_items: Vec<SessionLineItem>,
    /// Carried verbatim on the session; enough to reconstruct the order
    /// set if the session is later read back without local state.
    pub metadata: HashMap<String, String>,
    pub success_url: String,
    pub cancel_url: String,
}

/// A hosted session the customer is redirected to.
#[derive(Debug, Clone)]
pub struct CreatedSession {
    pub id: String,
    pub url: String,
}

/// A payment session read back from the processor. The single source of
/// truth for "did the customer pay".
#[derive(Debug, Clone, Default)]
pub struct GatewaySession {
    pub id: String,
    pub payment_status: String,
    pub payment_intent_id: Option<String>,
    pub metadata: HashMap<String, String>,
    pub customer_email: Option<String>,
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    /// Shipping details the processor collected, if any.
    pub shipping_address: Option<ShippingAddress>,
}

/// A purchased line item read back from the processor on first-time
/// finalization, so committed orders are built without trusting
/// client-supplied state.
#[derive(Debug, Clone)]
pub struct PurchasedLineItem {
    pub product_id: Option<Uuid>,
    pub description: String,
    pub quantity: i32,
    pub unit_amount: i64,
}

/// A verified, parsed webhook event.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub id: String,
    pub event_type: String,
    pub session_id: Option<String>,
    pub raw: Value,
}

/// The capability contract this pipeline requires from the payment
/// processor. Implementations must bound every call with a network-level
/// timeout; none of these may be held inside a database transaction.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Creates a hosted payment session. A response without a redirect URL
    /// is treated as a failed call.
    async fn create_checkout_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<CreatedSession, ServiceError>;

    /// Retrieves payment status, metadata and customer/shipping data.
    async fn retrieve_session(&self, session_id: &str) -> Result<GatewaySession, ServiceError>;

    /// Lists the items actually purchased in the session.
    async fn list_session_line_items(
        &self,
        session_id: &str,
    ) -> Result<Vec<PurchasedLineItem>, ServiceError>;

    /// Best-effort session expiry; callers log failures instead of
    /// escalating them.
    async fn expire_session(&self, session_id: &str) -> Result<(), ServiceError>;
}

/// HTTP client for a Stripe-compatible hosted-checkout REST surface.
pub struct StripeGateway {
    client: reqwest::Client,
    api_base: String,
    secret_key: String,
}

impl StripeGateway {
    pub fn new(api_base: String, secret_key: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_base,
            secret_key,
        }
    }

    async fn read_json(&self, response: reqwest::Response) -> Result<Value, ServiceError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ServiceError::ExternalServiceError(format!("payment gateway: {}", e)))?;
        if !status.is_success() {
            return Err(ServiceError::ExternalServiceError(format!(
                "payment gateway returned {}: {}",
                status,
                body.chars().take(256).collect::<String>()
            )));
        }
        serde_json::from_str(&body).map_err(|e| {
            ServiceError::ExternalServiceError(format!("payment gateway response: {}", e))
        })
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    #[instrument(skip(self, request), fields(items = request.line_items.len()))]
    async fn create_checkout_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<CreatedSession, ServiceError> {
        let mut form: Vec<(String, String)> = vec![
            ("mode".to_string(), "payment".to_string()),
            ("success_url".to_string(), request.success_url),
            ("cancel_url".to_string(), request.cancel_url),
        ];
        if let Some(email) = request.customer_email {
            form.push(("customer_email".to_string(), email));
        }
        for (key, value) in &request.metadata {
            form.push((format!("metadata[{}]", key), value.clone()));
        }
        for (idx, item) in request.line_items.iter().enumerate() {
            form.push((
                format!("line_items[{}][quantity]", idx),
                item.quantity.to_string(),
            ));
            form.push((
                format!("line_items[{}][price_data][currency]", idx),
                request.currency.clone(),
            ));
            form.push((
                format!("line_items[{}][price_data][unit_amount]", idx),
                item.unit_amount.to_string(),
            ));
            form.push((
                format!("line_items[{}][price_data][product_data][name]", idx),
                item.name.clone(),
            ));
            form.push((
                format!(
                    "line_items[{}][price_data][product_data][metadata][product_id]",
                    idx
                ),
                item.product_id.to_string(),
            ));
        }

        let response = self
            .client
            .post(format!("{}/v1/checkout/sessions", self.api_base))
            .bearer_auth(&self.secret_key)
            .form(&form)
            .send()
            .await
            .map_err(|e| ServiceError::ExternalServiceError(format!("payment gateway: {}", e)))?;
        let json = self.read_json(response).await?;

        let id = json
            .get("id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                ServiceError::ExternalServiceError("session response missing id".to_string())
            })?;
        let url = json
            .get("url")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                ServiceError::ExternalServiceError(
                    "session response missing redirect url".to_string(),
                )
            })?;

        Ok(CreatedSession { id, url })
    }

    #[instrument(skip(self))]
    async fn retrieve_session(&self, session_id: &str) -> Result<GatewaySession, ServiceError> {
        let response = self
            .client
            .get(format!(
                "{}/v1/checkout/sessions/{}",
                self.api_base, session_id
            ))
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(|e| ServiceError::ExternalServiceError(format!("payment gateway: {}", e)))?;
        let json = self.read_json(response).await?;
        Ok(parse_session(&json))
    }

    #[instrument(skip(self))]
    async fn list_session_line_items(
        &self,
        session_id: &str,
    ) -> Result<Vec<PurchasedLineItem>, ServiceError> {
        let response = self
            .client
            .get(format!(
                "{}/v1/checkout/sessions/{}/line_items",
                self.api_base, session_id
            ))
            .bearer_auth(&self.secret_key)
            .query(&[("limit", "100"), ("expand[]", "data.price.product")])
            .send()
            .await
            .map_err(|e| ServiceError::ExternalServiceError(format!("payment gateway: {}", e)))?;
        let json = self.read_json(response).await?;

        let items = json
            .get("data")
            .and_then(|v| v.as_array())
            .map(|rows| rows.iter().map(parse_line_item).collect())
            .unwrap_or_default();
        Ok(items)
    }

    #[instrument(skip(self))]
    async fn expire_session(&self, session_id: &str) -> Result<(), ServiceError> {
        let response = self
            .client
            .post(format!(
                "{}/v1/checkout/sessions/{}/expire",
                self.api_base, session_id
            ))
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(|e| ServiceError::ExternalServiceError(format!("payment gateway: {}", e)))?;
        self.read_json(response).await.map(|_| ())
    }
}

fn string_field(json: &Value, key: &str) -> Option<String> {
    json.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

/// Maps a raw session object into the gateway-neutral shape.
pub fn parse_session(json: &Value) -> GatewaySession {
    let metadata = json
        .get("metadata")
        .and_then(|v| v.as_object())
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();

    // payment_intent arrives as an id string, or as an object when expanded
    let payment_intent_id = match json.get("payment_intent") {
        Some(Value::String(id)) => Some(id.clone()),
        Some(Value::Object(obj)) => obj.get("id").and_then(|v| v.as_str()).map(str::to_string),
        _ => None,
    };

    let customer_details = json.get("customer_details");
    let customer_email = customer_details
        .and_then(|d| string_field(d, "email"))
        .or_else(|| string_field(json, "customer_email"));
    let customer_name = customer_details.and_then(|d| string_field(d, "name"));
    let customer_phone = customer_details.and_then(|d| string_field(d, "phone"));

    let shipping_address = json.get("shipping_details").and_then(|shipping| {
        let address = shipping.get("address")?;
        Some(ShippingAddress {
            recipient_name: string_field(shipping, "name").unwrap_or_default(),
            phone: customer_phone.clone().unwrap_or_default(),
            line1: string_field(address, "line1").unwrap_or_default(),
            line2: string_field(address, "line2"),
            city: string_field(address, "city").unwrap_or_default(),
            state: string_field(address, "state").unwrap_or_default(),
            postal_code: string_field(address, "postal_code").unwrap_or_default(),
            country: string_field(address, "country").unwrap_or_default(),
        })
    });

    GatewaySession {
        id: string_field(json, "id").unwrap_or_default(),
        payment_status: string_field(json, "payment_status").unwrap_or_default(),
        payment_intent_id,
        metadata,
        customer_email,
        customer_name,
        customer_phone,
        shipping_address,
    }
}

fn parse_line_item(json: &Value) -> PurchasedLineItem {
    let price = json.get("price");
    let product_id = price
        .and_then(|p| p.get("product"))
        .and_then(|p| p.get("metadata"))
        .and_then(|m| m.get("product_id"))
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok());
    let unit_amount = price
        .and_then(|p| p.get("unit_amount"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);

    PurchasedLineItem {
        product_id,
        description: string_field(json, "description").unwrap_or_default(),
        quantity: json.get("quantity").and_then(|v| v.as_i64()).unwrap_or(0) as i32,
        unit_amount,
    }
}

/// Verifies a webhook signature header of the form `t=<ts>,v1=<hex hmac>`
/// and parses the payload into a [`WebhookEvent`].
///
/// The signed payload is `"{t}.{body}"` authenticated with HMAC-SHA256
/// under the endpoint secret. Timestamps outside the tolerance window are
/// rejected, as is any signature mismatch, without processing the body as
/// trusted input.
pub fn verify_webhook_signature(
    payload: &[u8],
    signature_header: &str,
    secret: &str,
    tolerance_secs: u64,
) -> Result<WebhookEvent, ServiceError> {
    let mut timestamp = "";
    let mut signature = "";
    for part in signature_header.split(',') {
        let mut it = part.trim().splitn(2, '=');
        match (it.next(), it.next()) {
            (Some("t"), Some(val)) => timestamp = val,
            (Some("v1"), Some(val)) => signature = val,
            _ => {}
        }
    }

    if timestamp.is_empty() || signature.is_empty() {
        return Err(ServiceError::ValidationError(
            "malformed webhook signature header".to_string(),
        ));
    }

    let ts: i64 = timestamp.parse().map_err(|_| {
        ServiceError::ValidationError("malformed webhook signature timestamp".to_string())
    })?;
    let now = chrono::Utc::now().timestamp();
    if (now - ts).unsigned_abs() > tolerance_secs {
        warn!("webhook signature timestamp outside tolerance window");
        return Err(ServiceError::ValidationError(
            "webhook signature timestamp outside tolerance".to_string(),
        ));
    }

    let expected = compute_signature(payload, timestamp, secret)?;
    if !constant_time_eq(&expected, signature) {
        return Err(ServiceError::ValidationError(
            "invalid webhook signature".to_string(),
        ));
    }

    let raw: Value = serde_json::from_slice(payload)
        .map_err(|e| ServiceError::ValidationError(format!("invalid webhook payload: {}", e)))?;
    let session_id = raw
        .get("data")
        .and_then(|d| d.get("object"))
        .and_then(|o| o.get("id"))
        .and_then(|v| v.as_str())
        .map(str::to_string);

    Ok(WebhookEvent {
        id: string_field(&raw, "id").unwrap_or_default(),
        event_type: string_field(&raw, "type").unwrap_or_default(),
        session_id,
        raw,
    })
}

/// Builds the signature header value for a payload, as the processor would.
/// Exists so webhook clients and tests can produce verifiable deliveries.
pub fn signature_header(payload: &[u8], secret: &str, timestamp: i64) -> String {
    let ts = timestamp.to_string();
    let sig = compute_signature(payload, &ts, secret).unwrap_or_default();
    format!("t={},v1={}", ts, sig)
}

fn compute_signature(payload: &[u8], timestamp: &str, secret: &str) -> Result<String, ServiceError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| ServiceError::InternalError("webhook secret unusable as hmac key".into()))?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        res |= x ^ y;
    }
    res == 0
}
