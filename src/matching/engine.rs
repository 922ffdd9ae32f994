use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::store::mapping;
use crate::store::models::{Payment, Registration};

/// Match engine configuration
#[derive(Debug, Clone)]
pub struct MatchConfig {
    /// Maximum amount difference (minor units) for the email+amount strategy
    pub amount_tolerance_minor: i64,
    /// Registration/charge age difference that still counts as "close" for
    /// the confidence bonus
    pub date_proximity_days: i64,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            amount_tolerance_minor: 1,
            date_proximity_days: 7,
        }
    }
}

/// Which strategy qualified a match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchStrategy {
    ProviderId,
    EmailAmount,
    CrossReference,
}

impl MatchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStrategy::ProviderId => "provider_id",
            MatchStrategy::EmailAmount => "email_amount",
            MatchStrategy::CrossReference => "cross_reference",
        }
    }
}

/// A qualified payment-to-registration match
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    pub registration_id: Uuid,
    /// 0-100; audit/reporting only - it never alters which strategy won
    pub confidence: i16,
    pub strategy: MatchStrategy,
    pub reason: String,
}

/// Finds the best-matching registration for a payment.
///
/// Strategies are evaluated in strict priority order and the first
/// qualifying one wins. An exact provider-id match is unambiguous and must
/// never be shadowed by a weaker heuristic that happens to also qualify;
/// evaluating in order (rather than scoring all strategies and taking the
/// max) keeps every decision explainable and reproducible for audit.
pub struct MatchEngine {
    config: MatchConfig,
}

impl MatchEngine {
    pub fn new(config: MatchConfig) -> Self {
        Self { config }
    }

    pub fn find_match(&self, payment: &Payment, pool: &[Registration]) -> Option<MatchOutcome> {
        if let Some(outcome) = self.match_provider_id(payment, pool) {
            return Some(outcome);
        }
        if let Some(outcome) = self.match_email_amount(payment, pool) {
            return Some(outcome);
        }
        self.match_cross_reference(payment, pool)
    }

    /// Strategy 1: the registration carries the provider's charge id
    /// verbatim. Confidence 100.
    fn match_provider_id(&self, payment: &Payment, pool: &[Registration]) -> Option<MatchOutcome> {
        let registration = Self::first_of(
            payment,
            pool.iter()
                .filter(|r| r.provider_payment_id.as_deref() == Some(&payment.provider_payment_id)),
            "provider id",
        )?;

        Some(MatchOutcome {
            registration_id: registration.id,
            confidence: 100,
            strategy: MatchStrategy::ProviderId,
            reason: format!(
                "registration carries provider payment id {}",
                payment.provider_payment_id
            ),
        })
    }

    /// Strategy 2: receipt email equals the registration contact email and
    /// the amounts agree within tolerance. Confidence 70-90 depending on
    /// whether name and date proximity also agree.
    fn match_email_amount(&self, payment: &Payment, pool: &[Registration]) -> Option<MatchOutcome> {
        let email = payment.receipt_email.as_deref()?.trim().to_lowercase();
        if email.is_empty() {
            return None;
        }

        let registration = Self::first_of(
            payment,
            pool.iter().filter(|r| {
                r.contact_email
                    .as_deref()
                    .map(|e| e.trim().to_lowercase() == email)
                    .unwrap_or(false)
                    && (r.total_amount_minor - payment.amount_minor).abs()
                        <= self.config.amount_tolerance_minor
            }),
            "email+amount",
        )?;

        let mut confidence: i16 = 70;
        let mut agreements = vec!["email".to_string(), "amount".to_string()];

        if Self::name_agrees(payment, registration) {
            confidence += 10;
            agreements.push("name".to_string());
        }
        let age = (registration.created_at - payment.created_at).num_days().abs();
        if age <= self.config.date_proximity_days {
            confidence += 10;
            agreements.push("date".to_string());
        }
        let confidence = confidence.min(90);

        Some(MatchOutcome {
            registration_id: registration.id,
            confidence,
            strategy: MatchStrategy::EmailAmount,
            reason: format!("agreement on {}", agreements.join("+")),
        })
    }

    /// Strategy 3: a registration field explicitly embeds the provider's
    /// payment id. Confidence 100 for a verbatim confirmation number, 80 for
    /// an embedded cross-reference.
    fn match_cross_reference(
        &self,
        payment: &Payment,
        pool: &[Registration],
    ) -> Option<MatchOutcome> {
        let id = payment.provider_payment_id.as_str();

        let verbatim = Self::first_of(
            payment,
            pool.iter()
                .filter(|r| r.confirmation_number.as_deref() == Some(id)),
            "confirmation number",
        );
        if let Some(registration) = verbatim {
            return Some(MatchOutcome {
                registration_id: registration.id,
                confidence: 100,
                strategy: MatchStrategy::CrossReference,
                reason: "confirmation number equals provider payment id".to_string(),
            });
        }

        let embedded = Self::first_of(
            payment,
            pool.iter().filter(|r| {
                r.confirmation_number
                    .as_deref()
                    .map(|c| c.contains(id))
                    .unwrap_or(false)
                    || mapping::embedded_payment_reference(&r.raw).as_deref() == Some(id)
            }),
            "cross reference",
        )?;

        Some(MatchOutcome {
            registration_id: embedded.id,
            confidence: 80,
            strategy: MatchStrategy::CrossReference,
            reason: "registration embeds provider payment id".to_string(),
        })
    }

    /// The pool arrives in document order; when a strategy qualifies more
    /// than one registration the first wins and the tie is logged for
    /// manual review.
    fn first_of<'a>(
        payment: &Payment,
        mut candidates: impl Iterator<Item = &'a Registration>,
        strategy: &str,
    ) -> Option<&'a Registration> {
        let first = candidates.next()?;
        if let Some(second) = candidates.next() {
            warn!(
                payment = %payment.provider_payment_id,
                winner = %first.id,
                also_matched = %second.id,
                strategy,
                "Ambiguous match; first registration by document order wins"
            );
        }
        Some(first)
    }

    fn name_agrees(payment: &Payment, registration: &Registration) -> bool {
        let billing_name = payment
            .raw
            .get("billing_details")
            .and_then(|d| d.get("name"))
            .and_then(|n| n.as_str())
            .map(str::to_lowercase);
        let Some(billing_name) = billing_name else {
            return false;
        };

        let last = registration
            .contact_last_name
            .as_deref()
            .map(|n| n.trim().to_lowercase())
            .unwrap_or_default();
        !last.is_empty() && billing_name.contains(&last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::{PaymentSource, PaymentStatus, RegistrationPaymentStatus};
    use chrono::Utc;
    use serde_json::json;

    fn payment(id: &str, amount: i64, email: Option<&str>) -> Payment {
        Payment {
            provider_payment_id: id.into(),
            source: PaymentSource::Stripe,
            amount_minor: amount,
            currency: "usd".into(),
            status: PaymentStatus::Captured,
            receipt_email: email.map(str::to_string),
            card_brand: None,
            card_last4: None,
            refunded_minor: 0,
            created_at: Utc::now(),
            captured_at: Some(Utc::now()),
            raw: json!({}),
        }
    }

    fn registration(amount: i64) -> Registration {
        let now = Utc::now();
        Registration {
            id: Uuid::new_v4(),
            customer_id: None,
            contact_first_name: None,
            contact_last_name: None,
            contact_email: None,
            total_amount_minor: amount,
            payment_status: RegistrationPaymentStatus::Unpaid,
            provider_payment_id: None,
            confirmation_number: None,
            matched_confidence: None,
            matched_reason: None,
            resolved_after_checks: None,
            ticket_ids: vec![],
            raw: json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_exact_provider_id_beats_weaker_strategies() {
        let engine = MatchEngine::new(MatchConfig::default());

        let mut r1 = registration(11500);
        r1.provider_payment_id = Some("ch_1".into());
        let mut r2 = registration(11500);
        r2.contact_email = Some("a@b.com".into());

        let payment = payment("ch_1", 11500, Some("a@b.com"));
        // r2 appears first in document order but must not shadow the exact
        // provider-id match on r1
        let outcome = engine.find_match(&payment, &[r2, r1.clone()]).unwrap();

        assert_eq!(outcome.registration_id, r1.id);
        assert_eq!(outcome.confidence, 100);
        assert_eq!(outcome.strategy, MatchStrategy::ProviderId);
    }

    #[test]
    fn test_email_amount_within_tolerance() {
        let engine = MatchEngine::new(MatchConfig::default());

        let mut reg = registration(11501);
        reg.contact_email = Some("A@B.com".into());

        let outcome = engine
            .find_match(&payment("ch_2", 11500, Some("a@b.com")), &[reg.clone()])
            .unwrap();
        assert_eq!(outcome.registration_id, reg.id);
        assert_eq!(outcome.strategy, MatchStrategy::EmailAmount);
        // email+amount plus date proximity (created just now)
        assert_eq!(outcome.confidence, 80);

        // Outside tolerance: no match at all
        let mut far = registration(11503);
        far.contact_email = Some("a@b.com".into());
        assert!(engine
            .find_match(&payment("ch_2", 11500, Some("a@b.com")), &[far])
            .is_none());
    }

    #[test]
    fn test_email_amount_confidence_caps_at_90() {
        let engine = MatchEngine::new(MatchConfig::default());

        let mut reg = registration(11500);
        reg.contact_email = Some("a@b.com".into());
        reg.contact_last_name = Some("Lovelace".into());

        let mut pay = payment("ch_3", 11500, Some("a@b.com"));
        pay.raw = json!({"billing_details": {"name": "Ada Lovelace"}});

        let outcome = engine.find_match(&pay, &[reg]).unwrap();
        assert_eq!(outcome.confidence, 90);
    }

    #[test]
    fn test_confirmation_number_verbatim_scores_100() {
        let engine = MatchEngine::new(MatchConfig::default());

        let mut reg = registration(9900);
        reg.confirmation_number = Some("ch_4".into());

        let outcome = engine
            .find_match(&payment("ch_4", 9900, None), &[reg.clone()])
            .unwrap();
        assert_eq!(outcome.registration_id, reg.id);
        assert_eq!(outcome.strategy, MatchStrategy::CrossReference);
        assert_eq!(outcome.confidence, 100);
    }

    #[test]
    fn test_embedded_cross_reference_scores_80() {
        let engine = MatchEngine::new(MatchConfig::default());

        let mut reg = registration(9900);
        reg.raw = json!({"payment": {"reference": "ch_5"}});

        let outcome = engine.find_match(&payment("ch_5", 9900, None), &[reg]).unwrap();
        assert_eq!(outcome.confidence, 80);
    }

    #[test]
    fn test_no_strategy_qualifies() {
        let engine = MatchEngine::new(MatchConfig::default());
        let reg = registration(5000);
        assert!(engine
            .find_match(&payment("ch_6", 11500, Some("a@b.com")), &[reg])
            .is_none());
    }

    #[test]
    fn test_ambiguous_exact_match_takes_first_by_document_order() {
        let engine = MatchEngine::new(MatchConfig::default());

        let mut r1 = registration(1000);
        r1.provider_payment_id = Some("ch_7".into());
        let mut r2 = registration(1000);
        r2.provider_payment_id = Some("ch_7".into());

        let outcome = engine
            .find_match(&payment("ch_7", 1000, None), &[r1.clone(), r2])
            .unwrap();
        assert_eq!(outcome.registration_id, r1.id);
    }
}
