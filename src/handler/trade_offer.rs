//! Jobs `TRADE_OFFER_CREATE`: schema do payload e handler do gateway.
//!
//! O handler encaminha cada tentativa para um gateway HTTP de ofertas.
//! Falhas do gateway viram mensagens que o classificador de retry do worker
//! reconhece; rejeições que um retry não resolve são marcadas como fatais.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use super::{JobContext, JobHandler};
use crate::error::{HandlerError, Result, SchedulerError};

const IDEMPOTENCY_HEADER: &str = "idempotency-key";

fn default_app_id() -> u32 {
    440
}

fn default_context_id() -> String {
    "2".to_string()
}

/// Payload de um job `TRADE_OFFER_CREATE`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeOfferCreatePayload {
    pub from_bot_name: String,
    pub to_bot_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_bot_trade_token: Option<String>,
    #[serde(default = "default_app_id")]
    pub app_id: u32,
    #[serde(default = "default_context_id")]
    pub context_id: String,
    pub sku: String,
    pub amount: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TradeOfferCreatePayload {
    pub fn new(
        from_bot_name: impl Into<String>,
        to_bot_name: impl Into<String>,
        sku: impl Into<String>,
        amount: u32,
    ) -> Self {
        Self {
            from_bot_name: from_bot_name.into(),
            to_bot_name: to_bot_name.into(),
            to_bot_trade_token: None,
            app_id: default_app_id(),
            context_id: default_context_id(),
            sku: sku.into(),
            amount,
            message: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.from_bot_name.trim().is_empty() {
            return Err(SchedulerError::Validation("fromBotName must not be empty".into()));
        }
        if self.to_bot_name.trim().is_empty() {
            return Err(SchedulerError::Validation("toBotName must not be empty".into()));
        }
        if self.sku.trim().is_empty() {
            return Err(SchedulerError::Validation("sku must not be empty".into()));
        }
        if self.amount == 0 {
            return Err(SchedulerError::Validation("amount must be a positive integer".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TradeOfferRequest<'a> {
    job_id: Uuid,
    attempt_count: u32,
    payload: &'a TradeOfferCreatePayload,
}

/// Envia ofertas de troca por meio de um gateway HTTP.
pub struct HttpTradeOfferHandler {
    client: Client,
    endpoint: String,
}

impl HttpTradeOfferHandler {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl JobHandler for HttpTradeOfferHandler {
    async fn handle(&self, payload: &Value, ctx: &JobContext) -> Result<(), HandlerError> {
        let offer: TradeOfferCreatePayload = serde_json::from_value(payload.clone())
            .map_err(|e| HandlerError::fatal(format!("invalid trade offer payload: {e}")))?;
        offer
            .validate()
            .map_err(|e| HandlerError::fatal(format!("invalid trade offer payload: {e}")))?;

        debug!(
            job_id = %ctx.job_id,
            attempt = ctx.attempt_count,
            from = %offer.from_bot_name,
            to = %offer.to_bot_name,
            sku = %offer.sku,
            "trade_offer:send"
        );

        let request = TradeOfferRequest {
            job_id: ctx.job_id,
            attempt_count: ctx.attempt_count,
            payload: &offer,
        };
        let response = self
            .client
            .post(&self.endpoint)
            .header(IDEMPOTENCY_HEADER, ctx.job_id.to_string())
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    HandlerError::new(format!("network timeout: {e}"))
                } else {
                    HandlerError::new(format!("network error: {e}"))
                }
            })?;

        let status = response.status();
        if status.is_success() {
            debug!(job_id = %ctx.job_id, status = status.as_u16(), "trade_offer:sent");
            return Ok(());
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        Err(status_error(status, &body))
    }
}

fn status_error(status: StatusCode, body: &str) -> HandlerError {
    let code = status.as_u16();
    if status == StatusCode::TOO_MANY_REQUESTS {
        HandlerError::new(format!("gateway rate limit hit (HTTP {code}): {body}"))
    } else if status.is_server_error() {
        HandlerError::new(format!("gateway 5xx error (HTTP {code}): {body}"))
    } else if status == StatusCode::UNAUTHORIZED {
        HandlerError::new(format!("gateway unauthorized (HTTP {code}): {body}"))
    } else {
        HandlerError::fatal(format!("trade offer rejected (HTTP {code}): {body}"))
    }
}
