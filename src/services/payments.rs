//! Payment handoff to Paystack, plus cash on delivery.
//!
//! Paystack orders get a hosted checkout session after creation. The
//! payment is finalized either by the customer's redirect (`verify`) or by
//! a signed `charge.success` webhook; both run the same idempotent
//! finalization, which marks the order paid, confirms it and takes stock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::{prelude::ToPrimitive, Decimal, RoundingStrategy};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use sha2::Sha512;
use std::{sync::Arc, time::Duration};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    config::PaystackConfig,
    entities::order::{self, Entity as OrderEntity, OrderStatus, PaymentMethod, PaymentStatus},
    errors::ServiceError,
    events::{Event, EventSender},
    services::inventory,
    services::order_status::{transition_in_txn, StatusUpdate},
};

type HmacSha512 = Hmac<Sha512>;

pub const PAYSTACK_SIGNATURE_HEADER: &str = "x-paystack-signature";

/// Hosted checkout request sent to the gateway
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentSessionRequest {
    pub order_id: Uuid,
    pub email: String,
    /// Amount in minor units (pesewas, kobo, cents)
    pub amount: i64,
    pub currency: String,
    pub reference: String,
    pub callback_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSession {
    pub authorization_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_code: Option<String>,
    pub reference: String,
}

/// Gateway's view of a transaction
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentVerification {
    pub reference: String,
    pub status: String,
    pub amount: i64,
    pub paid_at: Option<DateTime<Utc>>,
    pub gateway_response: Option<String>,
}

impl PaymentVerification {
    pub fn is_success(&self) -> bool {
        self.status.eq_ignore_ascii_case("success")
    }
}

/// What the client should do to pay for a freshly created order
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentHandoff {
    pub method: PaymentMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn initialize(
        &self,
        request: &PaymentSessionRequest,
    ) -> Result<PaymentSession, ServiceError>;

    async fn verify(&self, reference: &str) -> Result<PaymentVerification, ServiceError>;
}

/// Converts a major-unit amount to the gateway's integer minor units
pub fn to_minor_units(amount: Decimal) -> Result<i64, ServiceError> {
    (amount * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| ServiceError::ValidationError(format!("Amount {} is out of range", amount)))
}

/// Checks a Paystack webhook signature: hex HMAC-SHA512 of the raw body
pub fn verify_webhook_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha512::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Paystack REST client
#[derive(Clone)]
pub struct PaystackGateway {
    client: reqwest::Client,
    base_url: String,
    secret_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct InitializeBody<'a> {
    email: &'a str,
    amount: i64,
    currency: &'a str,
    reference: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    callback_url: Option<&'a str>,
    metadata: InitializeMetadata,
}

#[derive(Debug, Serialize)]
struct InitializeMetadata {
    order_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct PaystackEnvelope<T> {
    status: bool,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct InitializeData {
    authorization_url: String,
    #[serde(default)]
    access_code: Option<String>,
    reference: String,
}

#[derive(Debug, Deserialize)]
struct TransactionData {
    reference: String,
    status: String,
    amount: i64,
    #[serde(default, alias = "paidAt")]
    paid_at: Option<DateTime<Utc>>,
    #[serde(default)]
    gateway_response: Option<String>,
}

impl From<TransactionData> for PaymentVerification {
    fn from(data: TransactionData) -> Self {
        Self {
            reference: data.reference,
            status: data.status,
            amount: data.amount,
            paid_at: data.paid_at,
            gateway_response: data.gateway_response,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WebhookEvent {
    event: String,
    data: TransactionData,
}

impl PaystackGateway {
    pub fn new(
        base_url: impl Into<String>,
        secret_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::InternalError(format!("payment client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret_key: secret_key.filter(|key| !key.trim().is_empty()),
        })
    }

    pub fn from_config(config: &PaystackConfig) -> Result<Self, ServiceError> {
        Self::new(
            config.base_url.clone(),
            config.secret_key.clone(),
            config.timeout(),
        )
    }
}

#[async_trait]
impl PaymentGateway for PaystackGateway {
    #[instrument(skip(self, request), fields(reference = %request.reference))]
    async fn initialize(
        &self,
        request: &PaymentSessionRequest,
    ) -> Result<PaymentSession, ServiceError> {
        let secret = self.secret_key.as_ref().ok_or_else(|| {
            ServiceError::PaymentInitFailed("payment gateway is not configured".to_string())
        })?;

        let body = InitializeBody {
            email: &request.email,
            amount: request.amount,
            currency: &request.currency,
            reference: &request.reference,
            callback_url: request.callback_url.as_deref(),
            metadata: InitializeMetadata {
                order_id: request.order_id,
            },
        };

        let response = self
            .client
            .post(format!("{}/transaction/initialize", self.base_url))
            .bearer_auth(secret)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                warn!("Payment initialization request failed: {}", e);
                ServiceError::PaymentInitFailed(e.to_string())
            })?;

        let status = response.status();
        let envelope: PaystackEnvelope<InitializeData> = response.json().await.map_err(|e| {
            ServiceError::PaymentInitFailed(format!("invalid gateway response: {}", e))
        })?;

        match envelope.data {
            Some(data) if status.is_success() && envelope.status => Ok(PaymentSession {
                authorization_url: data.authorization_url,
                access_code: data.access_code,
                reference: data.reference,
            }),
            _ => Err(ServiceError::PaymentInitFailed(
                envelope
                    .message
                    .unwrap_or_else(|| format!("gateway returned status {}", status)),
            )),
        }
    }

    #[instrument(skip(self))]
    async fn verify(&self, reference: &str) -> Result<PaymentVerification, ServiceError> {
        let secret = self.secret_key.as_ref().ok_or_else(|| {
            ServiceError::ExternalServiceError("payment gateway is not configured".to_string())
        })?;

        let response = self
            .client
            .get(format!("{}/transaction/verify/{}", self.base_url, reference))
            .bearer_auth(secret)
            .send()
            .await
            .map_err(|e| {
                warn!("Payment verification request failed: {}", e);
                ServiceError::ExternalServiceError(e.to_string())
            })?;

        let status = response.status();
        let envelope: PaystackEnvelope<TransactionData> = response.json().await.map_err(|e| {
            ServiceError::ExternalServiceError(format!("invalid gateway response: {}", e))
        })?;

        match envelope.data {
            Some(data) if status.is_success() && envelope.status => Ok(data.into()),
            _ if status == reqwest::StatusCode::NOT_FOUND => Err(ServiceError::NotFound(
                format!("Transaction {} not found", reference),
            )),
            _ => Err(ServiceError::ExternalServiceError(
                envelope
                    .message
                    .unwrap_or_else(|| format!("gateway returned status {}", status)),
            )),
        }
    }
}

#[derive(Clone)]
pub struct PaymentService {
    db: Arc<DatabaseConnection>,
    gateway: Arc<dyn PaymentGateway>,
    event_sender: EventSender,
    currency: String,
    callback_url: Option<String>,
    webhook_secret: Option<String>,
}

impl PaymentService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        gateway: Arc<dyn PaymentGateway>,
        event_sender: EventSender,
        currency: impl Into<String>,
        config: &PaystackConfig,
    ) -> Self {
        Self {
            db,
            gateway,
            event_sender,
            currency: currency.into(),
            callback_url: config.callback_url.clone(),
            webhook_secret: config.secret_key.clone().filter(|s| !s.trim().is_empty()),
        }
    }

    /// Starts payment for a new order. Gateway failures are reported in the
    /// handoff instead of failing the already committed order.
    pub async fn handoff(&self, order: &order::Model) -> PaymentHandoff {
        match order.payment_method {
            PaymentMethod::Cod => PaymentHandoff {
                method: PaymentMethod::Cod,
                authorization_url: None,
                reference: None,
                error: None,
            },
            PaymentMethod::Paystack => match self.start_session(order).await {
                Ok(session) => PaymentHandoff {
                    method: PaymentMethod::Paystack,
                    authorization_url: Some(session.authorization_url),
                    reference: Some(session.reference),
                    error: None,
                },
                Err(e) => {
                    warn!(order_id = %order.id, "payment handoff failed: {}", e);
                    PaymentHandoff {
                        method: PaymentMethod::Paystack,
                        authorization_url: None,
                        reference: None,
                        error: Some(e.response_message()),
                    }
                }
            },
        }
    }

    /// Creates (or re-creates) a hosted checkout session for an order
    #[instrument(skip(self, user), fields(user_id = %user.user_id))]
    pub async fn initialize(
        &self,
        user: &AuthUser,
        order_id: Uuid,
    ) -> Result<PaymentSession, ServiceError> {
        let order = OrderEntity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        if !user.can_access(&order.user_id) {
            return Err(ServiceError::Forbidden(
                "You do not have access to this order".to_string(),
            ));
        }
        if order.payment_method != PaymentMethod::Paystack {
            return Err(ServiceError::BadRequest(
                "Order is not paid online".to_string(),
            ));
        }
        if order.payment_status == PaymentStatus::Paid {
            return Err(ServiceError::BadRequest("Order is already paid".to_string()));
        }
        if order.status != OrderStatus::Pending {
            return Err(ServiceError::invalid_transition(
                order.status,
                OrderStatus::Confirmed,
            ));
        }

        self.start_session(&order).await
    }

    async fn start_session(&self, order: &order::Model) -> Result<PaymentSession, ServiceError> {
        let request = PaymentSessionRequest {
            order_id: order.id,
            email: order.shipping_address.email.clone(),
            amount: to_minor_units(order.total_amount)?,
            currency: self.currency.clone(),
            reference: order.order_number.clone(),
            callback_url: self.callback_url.clone(),
        };

        let session = match self.gateway.initialize(&request).await {
            Ok(session) => session,
            Err(e) => {
                metrics::counter!("storefront.payments", 1, "outcome" => "init_failed");
                return Err(match e {
                    ServiceError::PaymentInitFailed(_) => e,
                    other => ServiceError::PaymentInitFailed(other.to_string()),
                });
            }
        };

        let mut active: order::ActiveModel = order.clone().into();
        active.payment_reference = Set(Some(session.reference.clone()));
        active.updated_at = Set(Utc::now());
        active.update(&*self.db).await?;

        metrics::counter!("storefront.payments", 1, "outcome" => "initialized");
        self.event_sender
            .send_or_log(Event::PaymentInitialized {
                order_id: order.id,
                reference: session.reference.clone(),
            })
            .await;

        info!(order_id = %order.id, reference = %session.reference, "payment session created");
        Ok(session)
    }

    /// Verifies a payment on the customer's behalf after the redirect
    #[instrument(skip(self, user), fields(user_id = %user.user_id))]
    pub async fn verify(
        &self,
        user: &AuthUser,
        reference: &str,
    ) -> Result<order::Model, ServiceError> {
        let order = self.find_by_reference(reference).await?.ok_or_else(|| {
            ServiceError::NotFound(format!("No order for payment reference {}", reference))
        })?;

        if !user.can_access(&order.user_id) {
            return Err(ServiceError::Forbidden(
                "You do not have access to this order".to_string(),
            ));
        }
        if order.payment_status == PaymentStatus::Paid {
            return Ok(order);
        }

        let verification = self.gateway.verify(reference).await?;
        self.finalize(order.id, verification).await
    }

    /// Handles a Paystack webhook delivery.
    ///
    /// Unknown references and non-charge events are acknowledged and
    /// ignored so the gateway stops retrying them.
    #[instrument(skip(self, body, signature))]
    pub async fn handle_webhook(
        &self,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<(), ServiceError> {
        let secret = self.webhook_secret.as_deref().ok_or_else(|| {
            ServiceError::Unauthorized("webhook signing is not configured".to_string())
        })?;
        let signature = signature
            .ok_or_else(|| ServiceError::Unauthorized("missing webhook signature".to_string()))?;
        if !verify_webhook_signature(secret, body, signature) {
            warn!("Payment webhook signature verification failed");
            return Err(ServiceError::Unauthorized(
                "invalid webhook signature".to_string(),
            ));
        }

        let event: WebhookEvent = serde_json::from_slice(body)
            .map_err(|e| ServiceError::BadRequest(format!("invalid webhook payload: {}", e)))?;

        if event.event != "charge.success" {
            info!(event = %event.event, "ignoring payment webhook event");
            return Ok(());
        }

        let reference = event.data.reference.clone();
        let Some(order) = self.find_by_reference(&reference).await? else {
            warn!(%reference, "webhook for unknown payment reference");
            return Ok(());
        };
        if order.payment_status == PaymentStatus::Paid {
            info!(%reference, "webhook for an order that is already paid");
            return Ok(());
        }

        match self.finalize(order.id, event.data.into()).await {
            Ok(_) | Err(ServiceError::PaymentFailed(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn find_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<order::Model>, ServiceError> {
        Ok(OrderEntity::find()
            .filter(
                Condition::any()
                    .add(order::Column::PaymentReference.eq(reference))
                    .add(order::Column::OrderNumber.eq(reference)),
            )
            .one(&*self.db)
            .await?)
    }

    /// Applies a gateway verdict to an order exactly once.
    ///
    /// A successful charge marks the order paid and confirms it, taking
    /// stock. If stock has run out the order stays pending and paid for
    /// manual review, as does a line whose size the product no longer
    /// offers. Anything else marks the payment failed.
    #[instrument(skip(self, verification), fields(reference = %verification.reference))]
    pub async fn finalize(
        &self,
        order_id: Uuid,
        verification: PaymentVerification,
    ) -> Result<order::Model, ServiceError> {
        let txn = self.db.begin().await?;

        let order = OrderEntity::find_by_id(order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        if order.payment_status == PaymentStatus::Paid {
            txn.commit().await?;
            return Ok(order);
        }

        let expected = to_minor_units(order.total_amount)?;
        let succeeded = verification.is_success() && verification.amount >= expected;

        if !succeeded {
            let reason = if verification.is_success() {
                format!(
                    "amount paid {} is less than the order total {}",
                    verification.amount, expected
                )
            } else {
                verification
                    .gateway_response
                    .clone()
                    .unwrap_or_else(|| format!("payment {}", verification.status))
            };

            let mut active: order::ActiveModel = order.into();
            active.payment_status = Set(PaymentStatus::Failed);
            active.payment_reference = Set(Some(verification.reference.clone()));
            active.updated_at = Set(Utc::now());
            active.update(&txn).await?;
            txn.commit().await?;

            metrics::counter!("storefront.payments", 1, "outcome" => "failed");
            warn!(%order_id, %reason, "payment not successful");
            self.event_sender
                .send_or_log(Event::PaymentFailed {
                    order_id,
                    reference: verification.reference,
                    reason: reason.clone(),
                })
                .await;
            return Err(ServiceError::PaymentFailed(reason));
        }

        let now = Utc::now();
        let total_amount = order.total_amount;
        let mut active: order::ActiveModel = order.into();
        active.payment_status = Set(PaymentStatus::Paid);
        active.payment_reference = Set(Some(verification.reference.clone()));
        active.paid_at = Set(Some(verification.paid_at.unwrap_or(now)));
        active.updated_at = Set(now);
        let paid = active.update(&txn).await?;

        let mut events = vec![Event::PaymentSucceeded {
            order_id,
            reference: verification.reference.clone(),
            amount: total_amount,
        }];

        let order = if paid.status == OrderStatus::Pending {
            let update = StatusUpdate::to(OrderStatus::Confirmed).with_note("Payment confirmed");
            match transition_in_txn(&txn, paid.clone(), update).await {
                Ok(outcome) => {
                    events.extend(outcome.events);
                    outcome.order
                }
                Err(e) if inventory::is_stock_shortfall(&e) => {
                    error!(%order_id, error = %e, "paid order could not be confirmed from stock; needs manual review");
                    paid
                }
                Err(e) => return Err(e),
            }
        } else {
            warn!(%order_id, status = %paid.status, "payment received for an order that is no longer pending");
            paid
        };

        txn.commit().await?;

        metrics::counter!("storefront.payments", 1, "outcome" => "success");
        info!(%order_id, reference = %verification.reference, "payment confirmed");
        for event in events {
            self.event_sender.send_or_log(event).await;
        }

        Ok(order)
    }
}
