//! `PayPal` Orders v2 client.
//!
//! Every request is bounded by the configured timeout. A capture is attempted once;
//! a capture that times out surfaces as [`GatewayError::Timeout`] and is left to the
//! caller (the customer retries from the return URL, which is idempotent locally).

use crate::config::GatewayConfig;
use rentflow_core::ports::{CaptureStatus, GatewayError, GatewayOrder, PaymentGateway};
use rentflow_core::types::{GatewayToken, Money, PayerId, ReservationId};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

/// Access tokens are refreshed this long before the provider expires them.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    refresh_at: Instant,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    id: String,
    status: String,
    #[serde(default)]
    links: Vec<Link>,
}

#[derive(Debug, Deserialize)]
struct Link {
    href: String,
    rel: String,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    name: String,
    #[serde(default)]
    details: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    issue: String,
}

impl ErrorResponse {
    fn has_issue(&self, issue: &str) -> bool {
        self.details.iter().any(|detail| detail.issue == issue)
    }
}

fn transport(error: reqwest::Error) -> GatewayError {
    if error.is_timeout() {
        GatewayError::Timeout
    } else {
        GatewayError::Transport(error.to_string())
    }
}

fn approval_link(order: &OrderResponse) -> Option<&str> {
    order
        .links
        .iter()
        .find(|link| link.rel == "approve" || link.rel == "payer-action")
        .map(|link| link.href.as_str())
}

/// Map an unprocessable capture answer: an order captured by an earlier attempt counts
/// as completed, anything else the provider refused is a decline.
fn capture_refusal(error: &ErrorResponse) -> CaptureStatus {
    if error.has_issue("ORDER_ALREADY_CAPTURED") {
        CaptureStatus::Completed
    } else {
        CaptureStatus::Declined
    }
}

/// Payment gateway backed by the `PayPal` REST API.
pub struct PayPalGateway {
    client: Client,
    config: GatewayConfig,
    token: Mutex<Option<CachedToken>>,
}

impl PayPalGateway {
    /// Create a client for `config.base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] if the HTTP client cannot be built.
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(transport)?;

        Ok(Self {
            client,
            config,
            token: Mutex::new(None),
        })
    }

    async fn access_token(&self) -> Result<String, GatewayError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let response = self
            .client
            .post(format!("{}/v1/oauth2/token", self.config.base_url))
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(transport)?;

        match response.status() {
            StatusCode::OK => {
                let body: AccessTokenResponse = response
                    .json()
                    .await
                    .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
                let lifetime = Duration::from_secs(body.expires_in)
                    .saturating_sub(TOKEN_REFRESH_MARGIN);
                *cached = Some(CachedToken {
                    value: body.access_token.clone(),
                    refresh_at: Instant::now() + lifetime,
                });
                tracing::debug!(expires_in = body.expires_in, "Gateway access token refreshed");
                Ok(body.access_token)
            },
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(GatewayError::Rejected(format!(
                    "token request failed with {status}: {body}"
                )))
            },
        }
    }

    async fn forget_token(&self) {
        *self.token.lock().await = None;
    }

    async fn create(
        &self,
        amount: Money,
        reservation: ReservationId,
    ) -> Result<GatewayOrder, GatewayError> {
        let access_token = self.access_token().await?;
        let body = json!({
            "intent": "CAPTURE",
            "purchase_units": [{
                "reference_id": reservation.to_string(),
                "amount": {
                    "currency_code": self.config.currency,
                    "value": amount.to_string(),
                },
            }],
            "application_context": {
                "return_url": self.config.return_url,
                "cancel_url": self.config.cancel_url,
                "user_action": "PAY_NOW",
            },
        });

        let response = self
            .client
            .post(format!("{}/v2/checkout/orders", self.config.base_url))
            .bearer_auth(access_token)
            .header("PayPal-Request-Id", Uuid::new_v4().to_string())
            .json(&body)
            .send()
            .await
            .map_err(transport)?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => {
                let order: OrderResponse = response
                    .json()
                    .await
                    .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
                let approval_url = approval_link(&order)
                    .ok_or_else(|| {
                        GatewayError::InvalidResponse(format!(
                            "order {} has no approval link",
                            order.id
                        ))
                    })?
                    .to_string();

                tracing::info!(
                    token = %order.id,
                    reservation_id = %reservation,
                    amount = %amount,
                    "Gateway order created"
                );
                Ok(GatewayOrder {
                    token: GatewayToken::new(order.id),
                    approval_url,
                })
            },
            StatusCode::UNAUTHORIZED => {
                self.forget_token().await;
                Err(GatewayError::Transport("access token rejected".to_string()))
            },
            status if status.is_server_error() => Err(GatewayError::Transport(format!(
                "order creation failed with {status}"
            ))),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(GatewayError::Rejected(format!("{status}: {body}")))
            },
        }
    }

    async fn capture(
        &self,
        token: &GatewayToken,
        payer: &PayerId,
    ) -> Result<CaptureStatus, GatewayError> {
        let access_token = self.access_token().await?;
        let response = self
            .client
            .post(format!(
                "{}/v2/checkout/orders/{token}/capture",
                self.config.base_url
            ))
            .bearer_auth(access_token)
            .header("PayPal-Request-Id", format!("capture-{token}"))
            .json(&json!({}))
            .send()
            .await
            .map_err(transport)?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => {
                let order: OrderResponse = response
                    .json()
                    .await
                    .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
                if order.status == "COMPLETED" {
                    tracing::info!(%token, %payer, "Gateway capture completed");
                    Ok(CaptureStatus::Completed)
                } else {
                    tracing::warn!(%token, %payer, status = %order.status, "Gateway capture not completed");
                    Ok(CaptureStatus::Declined)
                }
            },
            StatusCode::UNPROCESSABLE_ENTITY => {
                let error: ErrorResponse = response.json().await.unwrap_or_default();
                let status = capture_refusal(&error);
                tracing::warn!(%token, %payer, name = %error.name, ?status, "Gateway refused capture");
                Ok(status)
            },
            StatusCode::UNAUTHORIZED => {
                self.forget_token().await;
                Err(GatewayError::Transport("access token rejected".to_string()))
            },
            status if status.is_server_error() => Err(GatewayError::Transport(format!(
                "capture failed with {status}"
            ))),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(GatewayError::Rejected(format!("{status}: {body}")))
            },
        }
    }
}

impl PaymentGateway for PayPalGateway {
    fn create_order(
        &self,
        amount: Money,
        reservation: ReservationId,
    ) -> Pin<Box<dyn Future<Output = Result<GatewayOrder, GatewayError>> + Send + '_>> {
        Box::pin(self.create(amount, reservation))
    }

    fn capture_order<'a>(
        &'a self,
        token: &'a GatewayToken,
        payer: &'a PayerId,
    ) -> Pin<Box<dyn Future<Output = Result<CaptureStatus, GatewayError>> + Send + 'a>> {
        Box::pin(self.capture(token, payer))
    }
}
