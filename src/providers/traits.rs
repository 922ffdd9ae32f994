use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::store::models::{Payment, PaymentSource, PaymentStatus};

/// Provider-neutral view of a charge, as consumed by the core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Charge {
    pub id: String,
    pub source: PaymentSource,
    pub amount_minor: i64,
    pub currency: String,
    /// Raw provider status string ("succeeded", "COMPLETED", ...)
    pub status: String,
    pub paid: bool,
    pub refunded: bool,
    pub amount_refunded_minor: i64,
    pub receipt_email: Option<String>,
    pub created_at: DateTime<Utc>,
    pub card_brand: Option<String>,
    pub card_last4: Option<String>,
    pub raw: serde_json::Value,
}

impl Charge {
    /// Hard-coded test-transaction filter: charges made with the well-known
    /// test card numbers never enter the ledger.
    pub fn is_test_transaction(&self) -> bool {
        matches!(self.card_last4.as_deref(), Some("4242") | Some("1111"))
    }

    pub fn payment_status(&self) -> PaymentStatus {
        if self.refunded || self.amount_refunded_minor > 0 {
            PaymentStatus::Refunded
        } else if matches!(
            self.status.as_str(),
            "failed" | "FAILED" | "canceled" | "CANCELED"
        ) {
            PaymentStatus::Failed
        } else if self.paid {
            PaymentStatus::Captured
        } else {
            PaymentStatus::Authorized
        }
    }

    /// Mirror this charge into the read-only payments collection
    pub fn into_payment(self) -> Payment {
        let status = self.payment_status();
        Payment {
            provider_payment_id: self.id,
            source: self.source,
            amount_minor: self.amount_minor,
            currency: self.currency,
            status,
            receipt_email: self.receipt_email,
            card_brand: self.card_brand,
            card_last4: self.card_last4,
            refunded_minor: self.amount_refunded_minor,
            created_at: self.created_at,
            captured_at: if self.paid { Some(self.created_at) } else { None },
            raw: self.raw,
        }
    }
}

/// One page of charges from a provider listing
#[derive(Debug, Clone)]
pub struct ChargePage {
    pub charges: Vec<Charge>,
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn source(&self) -> PaymentSource;

    /// List charges created at or after `since` (None = full history),
    /// starting from `cursor` within that window
    async fn list_charges_since(
        &self,
        since: Option<DateTime<Utc>>,
        cursor: Option<String>,
        limit: u32,
    ) -> Result<ChargePage, ProviderError>;

    /// Direct lookup by provider charge id; Ok(None) when the provider does
    /// not know the id
    async fn get_charge(&self, charge_id: &str) -> Result<Option<Charge>, ProviderError>;

    async fn is_available(&self) -> Result<bool, ProviderError> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn charge(last4: &str, status: &str, paid: bool, refunded: bool) -> Charge {
        Charge {
            id: "ch_1".into(),
            source: PaymentSource::Stripe,
            amount_minor: 11500,
            currency: "usd".into(),
            status: status.into(),
            paid,
            refunded,
            amount_refunded_minor: 0,
            receipt_email: None,
            created_at: Utc::now(),
            card_brand: Some("visa".into()),
            card_last4: Some(last4.into()),
            raw: json!({}),
        }
    }

    #[test]
    fn test_test_transaction_filter() {
        assert!(charge("4242", "succeeded", true, false).is_test_transaction());
        assert!(charge("1111", "succeeded", true, false).is_test_transaction());
        assert!(!charge("9876", "succeeded", true, false).is_test_transaction());
    }

    #[test]
    fn test_payment_status_mapping() {
        assert_eq!(
            charge("9876", "succeeded", true, false).payment_status(),
            PaymentStatus::Captured
        );
        assert_eq!(
            charge("9876", "succeeded", true, true).payment_status(),
            PaymentStatus::Refunded
        );
        assert_eq!(
            charge("9876", "failed", false, false).payment_status(),
            PaymentStatus::Failed
        );
        assert_eq!(
            charge("9876", "pending", false, false).payment_status(),
            PaymentStatus::Authorized
        );
    }
}
