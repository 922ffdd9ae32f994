use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::AppResult;
use crate::matching::MatchEngine;
use crate::providers::{Charge, ProviderRegistry};
use crate::reconcile::context::RunContext;
use crate::reconcile::resolve::ImportResolver;
use crate::store::models::{FailedImport, Payment, PendingImport, PendingSubject, Registration};
use crate::store::ReconStore;

/// Bounded-retry state machine over unresolved imports.
///
/// The only transitions are pending -> resolved (removed, promoted to the
/// main store) and pending -> failed (removed, inserted into the terminal
/// failed store). Items are processed oldest-pending_since-first so
/// long-stuck items get priority for the per-run provider lookup budget.
pub struct PendingQueue {
    store: Arc<dyn ReconStore>,
    engine: Arc<MatchEngine>,
    providers: Arc<ProviderRegistry>,
    resolver: Arc<ImportResolver>,
    max_retries: i32,
}

impl PendingQueue {
    pub fn new(
        store: Arc<dyn ReconStore>,
        engine: Arc<MatchEngine>,
        providers: Arc<ProviderRegistry>,
        resolver: Arc<ImportResolver>,
        max_retries: i32,
    ) -> Self {
        Self {
            store,
            engine,
            providers,
            resolver,
            max_retries,
        }
    }

    /// Park a payment that found no registration this run
    pub async fn enqueue_payment(
        &self,
        ctx: &mut RunContext,
        payment: Payment,
        reason: impl Into<String>,
    ) -> AppResult<()> {
        let reason = reason.into();
        let item = PendingImport {
            id: Uuid::new_v4(),
            provider_payment_id: Some(payment.provider_payment_id.clone()),
            subject: PendingSubject::Payment { payment },
            check_count: 0,
            last_check_at: None,
            pending_since: Utc::now(),
            reason,
        };
        self.store.insert_pending(&item).await?;
        ctx.stats.pending += 1;
        debug!(item = %item.subject.describe(), "Enqueued pending import");
        Ok(())
    }

    /// Park a registration whose referenced payment is not locally mirrored
    pub async fn enqueue_registration(
        &self,
        ctx: &mut RunContext,
        registration: Registration,
        provider_payment_id: Option<String>,
        reason: impl Into<String>,
    ) -> AppResult<()> {
        let item = PendingImport {
            id: Uuid::new_v4(),
            provider_payment_id,
            subject: PendingSubject::Registration { registration },
            check_count: 0,
            last_check_at: None,
            pending_since: Utc::now(),
            reason: reason.into(),
        };
        self.store.insert_pending(&item).await?;
        ctx.stats.pending += 1;
        debug!(item = %item.subject.describe(), "Enqueued pending import");
        Ok(())
    }

    /// Advance every pending item one step. Items enqueued during this run
    /// have already seen this run's data and wait for the next one.
    pub async fn process(&self, ctx: &mut RunContext) -> AppResult<()> {
        let items: Vec<PendingImport> = self
            .store
            .pending_oldest_first()
            .await?
            .into_iter()
            .filter(|item| item.pending_since < ctx.run_started_at())
            .collect();
        if items.is_empty() {
            return Ok(());
        }
        info!(count = items.len(), "Processing pending imports");

        for item in items {
            self.advance(ctx, item).await?;
        }
        Ok(())
    }

    async fn advance(&self, ctx: &mut RunContext, mut item: PendingImport) -> AppResult<()> {
        // The invariant says an item never stays pending at the bound; an
        // item found here in that state is from an older, buggier writer.
        if item.check_count >= self.max_retries {
            return self.fail(ctx, item).await;
        }

        if self.try_resolve(ctx, &item).await? {
            self.store.remove_pending(item.id).await?;
            return Ok(());
        }

        item.check_count += 1;
        item.last_check_at = Some(Utc::now());
        item.reason = format!(
            "unresolved after check {}: {}",
            item.check_count,
            match &item.subject {
                PendingSubject::Payment { .. } => "no matching registration",
                PendingSubject::Registration { .. } => "payment not found",
            }
        );

        if item.check_count >= self.max_retries {
            self.fail(ctx, item).await
        } else {
            self.store.update_pending(&item).await
        }
    }

    /// One resolution attempt: local data first, then (when permitted and
    /// budgeted) a single direct provider lookup.
    async fn try_resolve(&self, ctx: &mut RunContext, item: &PendingImport) -> AppResult<bool> {
        match &item.subject {
            PendingSubject::Payment { payment } => {
                if self.try_match_payment(ctx, item, payment.clone()).await? {
                    return Ok(true);
                }
                // Re-fetch the charge: a refreshed status or receipt email
                // may unlock a match that raw local data could not make.
                if item.may_query_provider() && ctx.take_provider_lookup() {
                    if let Some(charge) = self.provider_lookup(item).await {
                        let refreshed = charge.into_payment();
                        self.store.upsert_payment(&refreshed).await?;
                        return self.try_match_payment(ctx, item, refreshed).await;
                    }
                }
                Ok(false)
            }
            PendingSubject::Registration { registration } => {
                let Some(payment_id) = item.provider_payment_id.as_deref() else {
                    return Ok(false);
                };

                // Local store first
                if let Some(payment) = self.store.get_payment(payment_id).await? {
                    return self
                        .try_attach_registration(ctx, item, registration, &payment)
                        .await;
                }

                // Catch payments visible upstream but not yet mirrored
                if item.may_query_provider() && ctx.take_provider_lookup() {
                    if let Some(charge) = self.provider_lookup(item).await {
                        let payment = charge.into_payment();
                        self.store.upsert_payment(&payment).await?;
                        return self
                            .try_attach_registration(ctx, item, registration, &payment)
                            .await;
                    }
                }
                Ok(false)
            }
        }
    }

    async fn try_match_payment(
        &self,
        ctx: &mut RunContext,
        item: &PendingImport,
        payment: Payment,
    ) -> AppResult<bool> {
        let pool = self.store.unmatched_registrations().await?;
        let Some(outcome) = self.engine.find_match(&payment, &pool) else {
            return Ok(false);
        };
        let Some(mut registration) = pool.into_iter().find(|r| r.id == outcome.registration_id)
        else {
            return Ok(false);
        };

        registration.resolved_after_checks = Some(item.check_count + 1);
        self.resolver
            .resolve(ctx, registration, &payment, &outcome)
            .await?;
        Ok(true)
    }

    async fn try_attach_registration(
        &self,
        ctx: &mut RunContext,
        item: &PendingImport,
        embedded: &Registration,
        payment: &Payment,
    ) -> AppResult<bool> {
        // Prefer the live row over the snapshot embedded at enqueue time
        let registration = self
            .store
            .get_registration(embedded.id)
            .await?
            .unwrap_or_else(|| embedded.clone());
        if registration.is_matched() {
            // Someone else resolved it between runs; nothing left to do
            return Ok(true);
        }

        let Some(outcome) = self.engine.find_match(payment, &[registration.clone()]) else {
            return Ok(false);
        };

        let mut registration = registration;
        registration.resolved_after_checks = Some(item.check_count + 1);
        self.resolver
            .resolve(ctx, registration, payment, &outcome)
            .await?;
        Ok(true)
    }

    /// The only state in which an external network call is permitted. A
    /// failing call means "still unresolved this run", never a run failure.
    async fn provider_lookup(&self, item: &PendingImport) -> Option<Charge> {
        let payment_id = item.provider_payment_id.as_deref()?;
        for provider in self.providers.all() {
            match provider.get_charge(payment_id).await {
                Ok(Some(charge)) => {
                    debug!(
                        provider = provider.name(),
                        payment_id, "Pending item found upstream"
                    );
                    return Some(charge);
                }
                Ok(None) => continue,
                Err(e) => {
                    warn!(
                        provider = provider.name(),
                        payment_id,
                        error = %e,
                        "Provider lookup failed; item stays pending this run"
                    );
                }
            }
        }
        None
    }

    async fn fail(&self, ctx: &mut RunContext, item: PendingImport) -> AppResult<()> {
        let failed = FailedImport {
            id: Uuid::new_v4(),
            registration_id: item.subject.registration_id(),
            provider_payment_id: item.provider_payment_id.clone(),
            subject: serde_json::to_value(&item.subject)?,
            history: vec![
                format!("pending since {}", item.pending_since.to_rfc3339()),
                item.reason.clone(),
            ],
            reason: format!("retries exhausted after {} checks", item.check_count),
            failed_at: Utc::now(),
        };
        self.store.fail_pending(item.id, &failed).await?;
        ctx.stats.failed += 1;
        warn!(
            item = %item.subject.describe(),
            checks = item.check_count,
            "Pending import moved to failed store"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::identity::IdentityResolver;
    use crate::matching::MatchConfig;
    use crate::packages::PackageExpander;
    use crate::providers::{ChargePage, PaymentProvider};
    use crate::store::models::{
        PaymentSource, PaymentStatus, RegistrationPaymentStatus,
    };
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct MockProvider {
        charge: Option<Charge>,
        calls: AtomicU32,
    }

    impl MockProvider {
        fn with_charge(charge: Charge) -> Self {
            Self {
                charge: Some(charge),
                calls: AtomicU32::new(0),
            }
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PaymentProvider for MockProvider {
        fn name(&self) -> &'static str {
            "Mock"
        }

        fn source(&self) -> PaymentSource {
            PaymentSource::Stripe
        }

        async fn list_charges_since(
            &self,
            _since: Option<DateTime<Utc>>,
            _cursor: Option<String>,
            _limit: u32,
        ) -> Result<ChargePage, ProviderError> {
            Ok(ChargePage {
                charges: vec![],
                has_more: false,
                next_cursor: None,
            })
        }

        async fn get_charge(&self, charge_id: &str) -> Result<Option<Charge>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .charge
                .as_ref()
                .filter(|c| c.id == charge_id)
                .cloned())
        }
    }

    fn queue_with(
        store: Arc<MemoryStore>,
        providers: ProviderRegistry,
        max_retries: i32,
    ) -> PendingQueue {
        let engine = Arc::new(MatchEngine::new(MatchConfig::default()));
        let resolver = Arc::new(ImportResolver::new(
            store.clone(),
            IdentityResolver::new(store.clone()),
            PackageExpander::new(store.clone()),
        ));
        PendingQueue::new(store, engine, Arc::new(providers), resolver, max_retries)
    }

    fn registration(amount: i64) -> Registration {
        let now = Utc::now();
        Registration {
            id: Uuid::new_v4(),
            customer_id: None,
            contact_first_name: Some("Ada".into()),
            contact_last_name: Some("Lovelace".into()),
            contact_email: Some("ada@example.com".into()),
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

    fn payment(id: &str, amount: i64) -> Payment {
        Payment {
            provider_payment_id: id.into(),
            source: PaymentSource::Stripe,
            amount_minor: amount,
            currency: "usd".into(),
            status: PaymentStatus::Captured,
            receipt_email: Some("ada@example.com".into()),
            card_brand: None,
            card_last4: None,
            refunded_minor: 0,
            created_at: Utc::now(),
            captured_at: Some(Utc::now()),
            raw: json!({}),
        }
    }

    fn charge(id: &str, amount: i64) -> Charge {
        Charge {
            id: id.into(),
            source: PaymentSource::Stripe,
            amount_minor: amount,
            currency: "usd".into(),
            status: "succeeded".into(),
            paid: true,
            refunded: false,
            amount_refunded_minor: 0,
            receipt_email: Some("ada@example.com".into()),
            created_at: Utc::now(),
            card_brand: None,
            card_last4: None,
            raw: json!({}),
        }
    }

    /// One queue pass with a fresh per-run context, the way the
    /// orchestrator drives it
    async fn run_once(queue: &PendingQueue, budget: u32) -> RunContext {
        let mut ctx = RunContext::new(budget);
        queue.process(&mut ctx).await.unwrap();
        ctx
    }

    #[tokio::test]
    async fn test_never_resolving_item_terminates_in_failed_store() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue_with(store.clone(), ProviderRegistry::new(), 5);

        let mut reg = registration(5000);
        reg.confirmation_number = Some("ch_missing".into());
        let mut enqueue_ctx = RunContext::new(0);
        queue
            .enqueue_registration(&mut enqueue_ctx, reg, Some("ch_missing".into()), "no payment")
            .await
            .unwrap();

        // Four runs leave it pending with check counts 1..4
        for expected in 1..=4 {
            run_once(&queue, 0).await;
            let items = store.pending_oldest_first().await.unwrap();
            assert_eq!(items.len(), 1, "still pending after check {}", expected);
            assert_eq!(items[0].check_count, expected);
        }

        // The fifth attempt transitions to failed, not pending
        let final_ctx = run_once(&queue, 0).await;
        assert_eq!(store.pending_count().await, 0);
        let failed = store.failed_imports().await;
        assert_eq!(failed.len(), 1);
        assert_eq!(final_ctx.stats.failed, 1);
    }

    #[tokio::test]
    async fn test_pending_payment_resolves_when_registration_appears() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue_with(store.clone(), ProviderRegistry::new(), 5);

        let mut enqueue_ctx = RunContext::new(0);
        queue
            .enqueue_payment(&mut enqueue_ctx, payment("ch_10", 5000), "no match")
            .await
            .unwrap();

        // First run: still nothing to match against
        run_once(&queue, 0).await;
        assert_eq!(store.pending_count().await, 1);

        // Registration intake catches up between runs
        let mut reg = registration(5000);
        reg.provider_payment_id = Some("ch_10".into());
        store.upsert_registration(&reg).await.unwrap();

        run_once(&queue, 0).await;
        assert_eq!(store.pending_count().await, 0);

        let resolved = store.get_registration(reg.id).await.unwrap().unwrap();
        assert_eq!(resolved.payment_status, RegistrationPaymentStatus::Paid);
        assert_eq!(resolved.matched_confidence, Some(100));
        assert_eq!(resolved.resolved_after_checks, Some(2));
        assert!(resolved.customer_id.is_some());
    }

    #[tokio::test]
    async fn test_provider_lookup_waits_for_two_local_failures() {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(MockProvider::with_charge(charge("ch_20", 7500)));
        let mut providers = ProviderRegistry::new();
        providers.register(provider.clone());
        let queue = queue_with(store.clone(), providers, 5);

        let mut reg = registration(7500);
        reg.confirmation_number = Some("ch_20".into());
        store.upsert_registration(&reg).await.unwrap();
        let mut enqueue_ctx = RunContext::new(0);
        queue
            .enqueue_registration(
                &mut enqueue_ctx,
                reg.clone(),
                Some("ch_20".into()),
                "not mirrored",
            )
            .await
            .unwrap();

        // check_count 0 and 1: local only, no network
        run_once(&queue, 10).await;
        run_once(&queue, 10).await;
        assert_eq!(provider.call_count(), 0);
        assert_eq!(store.pending_count().await, 1);

        // check_count 2: one direct provider lookup is permitted
        run_once(&queue, 10).await;
        assert_eq!(provider.call_count(), 1);
        assert_eq!(store.pending_count().await, 0);

        let resolved = store.get_registration(reg.id).await.unwrap().unwrap();
        assert_eq!(resolved.resolved_after_checks, Some(3));
        // The upstream charge is now mirrored locally
        assert!(store.get_payment("ch_20").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_exhausted_budget_blocks_provider_lookup() {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(MockProvider::with_charge(charge("ch_30", 7500)));
        let mut providers = ProviderRegistry::new();
        providers.register(provider.clone());
        let queue = queue_with(store.clone(), providers, 5);

        let mut reg = registration(7500);
        reg.confirmation_number = Some("ch_30".into());
        store.upsert_registration(&reg).await.unwrap();
        let mut enqueue_ctx = RunContext::new(0);
        queue
            .enqueue_registration(&mut enqueue_ctx, reg, Some("ch_30".into()), "not mirrored")
            .await
            .unwrap();

        // Budget of zero: the lookup never happens no matter the check count
        for _ in 0..4 {
            run_once(&queue, 0).await;
        }
        assert_eq!(provider.call_count(), 0);
        assert_eq!(store.pending_count().await, 1);
    }
}
