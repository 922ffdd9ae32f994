use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde_json::Value;
use tracing::warn;

use crate::error::ProviderError;
use crate::providers::traits::{Charge, ChargePage, PaymentProvider};
use crate::store::models::PaymentSource;

/// Stripe charges API adapter
pub struct StripeProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl StripeProvider {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
            api_key,
        }
    }

    fn check_status(&self, status: reqwest::StatusCode) -> Result<(), ProviderError> {
        match status.as_u16() {
            401 | 403 => Err(ProviderError::Auth {
                provider: "stripe".to_string(),
            }),
            429 => Err(ProviderError::RateLimited {
                provider: "stripe".to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Map one object from the charges list into the neutral Charge shape.
    /// Charges missing their id or amount are dropped with a warning - the
    /// batch must not abort on one bad object.
    fn parse_charge(&self, value: &Value) -> Option<Charge> {
        let id = value.get("id")?.as_str()?.to_string();
        let amount_minor = value.get("amount")?.as_i64()?;
        let created = value
            .get("created")
            .and_then(Value::as_i64)
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
            .unwrap_or_else(Utc::now);

        let card = value
            .get("payment_method_details")
            .and_then(|d| d.get("card"));

        Some(Charge {
            id,
            source: PaymentSource::Stripe,
            amount_minor,
            currency: value
                .get("currency")
                .and_then(Value::as_str)
                .unwrap_or("usd")
                .to_string(),
            status: value
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            paid: value.get("paid").and_then(Value::as_bool).unwrap_or(false),
            refunded: value
                .get("refunded")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            amount_refunded_minor: value
                .get("amount_refunded")
                .and_then(Value::as_i64)
                .unwrap_or(0),
            receipt_email: value
                .get("receipt_email")
                .and_then(Value::as_str)
                .map(str::to_string),
            created_at: created,
            card_brand: card
                .and_then(|c| c.get("brand"))
                .and_then(Value::as_str)
                .map(str::to_string),
            card_last4: card
                .and_then(|c| c.get("last4"))
                .and_then(Value::as_str)
                .map(str::to_string),
            raw: value.clone(),
        })
    }
}

#[async_trait]
impl PaymentProvider for StripeProvider {
    fn name(&self) -> &'static str {
        "Stripe"
    }

    fn source(&self) -> PaymentSource {
        PaymentSource::Stripe
    }

    async fn list_charges_since(
        &self,
        since: Option<DateTime<Utc>>,
        cursor: Option<String>,
        limit: u32,
    ) -> Result<ChargePage, ProviderError> {
        let url = format!("{}/v1/charges", self.base_url);
        let mut query: Vec<(String, String)> = vec![("limit".into(), limit.to_string())];
        if let Some(since) = since {
            query.push(("created[gte]".into(), since.timestamp().to_string()));
        }
        if let Some(cursor) = cursor {
            query.push(("starting_after".into(), cursor));
        }

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .query(&query)
            .send()
            .await?;
        self.check_status(response.status())?;

        let body: Value = response.json().await?;
        let data = body
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| ProviderError::UnexpectedPayload {
                provider: "stripe".to_string(),
                message: "missing data array in charges list".to_string(),
            })?;

        let mut charges = Vec::with_capacity(data.len());
        for item in data {
            match self.parse_charge(item) {
                Some(charge) => charges.push(charge),
                None => warn!("Dropping unparseable Stripe charge object"),
            }
        }

        let has_more = body
            .get("has_more")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let next_cursor = charges.last().map(|c| c.id.clone());

        Ok(ChargePage {
            charges,
            has_more,
            next_cursor,
        })
    }

    async fn get_charge(&self, charge_id: &str) -> Result<Option<Charge>, ProviderError> {
        let url = format!("{}/v1/charges/{}", self.base_url, charge_id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        self.check_status(response.status())?;

        let body: Value = response.json().await?;
        Ok(self.parse_charge(&body))
    }

    async fn is_available(&self) -> Result<bool, ProviderError> {
        let url = format!("{}/v1/balance", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        Ok(response.status().is_success())
    }
}
