use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::Value;
use tracing::warn;

use crate::error::ProviderError;
use crate::providers::traits::{Charge, ChargePage, PaymentProvider};
use crate::store::models::PaymentSource;

/// Square payments API adapter
pub struct SquareProvider {
    client: Client,
    base_url: String,
    access_token: String,
}

impl SquareProvider {
    pub fn new(base_url: String, access_token: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
            access_token,
        }
    }

    fn check_status(&self, status: reqwest::StatusCode) -> Result<(), ProviderError> {
        match status.as_u16() {
            401 | 403 => Err(ProviderError::Auth {
                provider: "square".to_string(),
            }),
            429 => Err(ProviderError::RateLimited {
                provider: "square".to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn parse_payment(&self, value: &Value) -> Option<Charge> {
        let id = value.get("id")?.as_str()?.to_string();
        let money = value.get("amount_money")?;
        let amount_minor = money.get("amount")?.as_i64()?;
        let status = value
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let created_at = value
            .get("created_at")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let refunded_minor = value
            .get("refunded_money")
            .and_then(|m| m.get("amount"))
            .and_then(Value::as_i64)
            .unwrap_or(0);

        let card = value.get("card_details").and_then(|d| d.get("card"));

        Some(Charge {
            id,
            source: PaymentSource::Square,
            amount_minor,
            currency: money
                .get("currency")
                .and_then(Value::as_str)
                .unwrap_or("USD")
                .to_lowercase(),
            paid: status == "COMPLETED",
            refunded: refunded_minor > 0,
            amount_refunded_minor: refunded_minor,
            status,
            receipt_email: value
                .get("buyer_email_address")
                .and_then(Value::as_str)
                .map(str::to_string),
            created_at,
            card_brand: card
                .and_then(|c| c.get("card_brand"))
                .and_then(Value::as_str)
                .map(str::to_string),
            card_last4: card
                .and_then(|c| c.get("last_4"))
                .and_then(Value::as_str)
                .map(str::to_string),
            raw: value.clone(),
        })
    }
}

#[async_trait]
impl PaymentProvider for SquareProvider {
    fn name(&self) -> &'static str {
        "Square"
    }

    fn source(&self) -> PaymentSource {
        PaymentSource::Square
    }

    async fn list_charges_since(
        &self,
        since: Option<DateTime<Utc>>,
        cursor: Option<String>,
        limit: u32,
    ) -> Result<ChargePage, ProviderError> {
        let url = format!("{}/v2/payments", self.base_url);
        let mut query: Vec<(String, String)> = vec![
            ("limit".into(), limit.to_string()),
            ("sort_order".into(), "ASC".into()),
        ];
        if let Some(since) = since {
            query.push(("begin_time".into(), since.to_rfc3339()));
        }
        if let Some(cursor) = cursor {
            query.push(("cursor".into(), cursor));
        }

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .query(&query)
            .send()
            .await?;
        self.check_status(response.status())?;

        let body: Value = response.json().await?;
        let payments = body
            .get("payments")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut charges = Vec::with_capacity(payments.len());
        for item in &payments {
            match self.parse_payment(item) {
                Some(charge) => charges.push(charge),
                None => warn!("Dropping unparseable Square payment object"),
            }
        }

        let next_cursor = body
            .get("cursor")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(ChargePage {
            has_more: next_cursor.is_some(),
            next_cursor,
            charges,
        })
    }

    async fn get_charge(&self, charge_id: &str) -> Result<Option<Charge>, ProviderError> {
        let url = format!("{}/v2/payments/{}", self.base_url, charge_id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;

        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        self.check_status(response.status())?;

        let body: Value = response.json().await?;
        Ok(body.get("payment").and_then(|p| self.parse_payment(p)))
    }

    async fn is_available(&self) -> Result<bool, ProviderError> {
        let url = format!("{}/v2/locations", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        Ok(response.status().is_success())
    }
}
