use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use reconciler::error::ProviderError;
use reconciler::identity::{IdentityCandidate, IdentityResolver};
use reconciler::matching::{MatchConfig, MatchEngine};
use reconciler::packages::PackageExpander;
use reconciler::pending::PendingQueue;
use reconciler::providers::{Charge, ChargePage, PaymentProvider, ProviderRegistry};
use reconciler::reconcile::{ImportResolver, OrchestratorConfig, ReconciliationOrchestrator};
use reconciler::store::models::*;
use reconciler::store::{MemoryStore, ReconStore};
use reconciler::sync::SessionTracker;

/// Serves a fixed charge list, honouring the incremental `since` watermark
struct FixtureProvider {
    charges: Vec<Charge>,
    fail_listing: bool,
}

#[async_trait]
impl PaymentProvider for FixtureProvider {
    fn name(&self) -> &'static str {
        "Fixture"
    }

    fn source(&self) -> PaymentSource {
        PaymentSource::Stripe
    }

    async fn list_charges_since(
        &self,
        since: Option<DateTime<Utc>>,
        _cursor: Option<String>,
        _limit: u32,
    ) -> Result<ChargePage, ProviderError> {
        if self.fail_listing {
            return Err(ProviderError::RateLimited {
                provider: "fixture".to_string(),
            });
        }
        let charges: Vec<Charge> = self
            .charges
            .iter()
            .filter(|c| since.map(|s| c.created_at >= s).unwrap_or(true))
            .cloned()
            .collect();
        Ok(ChargePage {
            charges,
            has_more: false,
            next_cursor: None,
        })
    }

    async fn get_charge(&self, charge_id: &str) -> Result<Option<Charge>, ProviderError> {
        Ok(self.charges.iter().find(|c| c.id == charge_id).cloned())
    }
}

fn charge(id: &str, amount: i64, email: Option<&str>) -> Charge {
    Charge {
        id: id.into(),
        source: PaymentSource::Stripe,
        amount_minor: amount,
        currency: "usd".into(),
        status: "succeeded".into(),
        paid: true,
        refunded: false,
        amount_refunded_minor: 0,
        receipt_email: email.map(str::to_string),
        created_at: Utc::now() - Duration::minutes(10),
        card_brand: Some("visa".into()),
        card_last4: Some("9876".into()),
        raw: json!({"id": id, "amount": amount}),
    }
}

fn registration(total: i64) -> Registration {
    let now = Utc::now() - Duration::hours(1);
    Registration {
        id: Uuid::new_v4(),
        customer_id: None,
        contact_first_name: Some("Ada".into()),
        contact_last_name: Some("Lovelace".into()),
        contact_email: None,
        total_amount_minor: total,
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

fn orchestrator_over(
    store: Arc<MemoryStore>,
    provider: FixtureProvider,
    require_all_providers: bool,
) -> ReconciliationOrchestrator {
    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(provider));
    let providers = Arc::new(registry);

    let engine = Arc::new(MatchEngine::new(MatchConfig::default()));
    let resolver = Arc::new(ImportResolver::new(
        store.clone(),
        IdentityResolver::new(store.clone()),
        PackageExpander::new(store.clone()),
    ));
    let queue = Arc::new(PendingQueue::new(
        store.clone(),
        engine.clone(),
        providers.clone(),
        resolver.clone(),
        5,
    ));
    let sessions = SessionTracker::new(store.clone());

    ReconciliationOrchestrator::new(
        store,
        providers,
        engine,
        resolver,
        queue,
        sessions,
        OrchestratorConfig {
            page_size: 100,
            provider_lookup_budget: 10,
            require_all_providers,
        },
    )
}

#[tokio::test]
async fn full_run_resolves_confirmation_number_scenario() {
    let store = Arc::new(MemoryStore::new());

    let mut reg = registration(11500);
    reg.confirmation_number = Some("ch_1".into());
    store.upsert_registration(&reg).await.unwrap();

    let orchestrator = orchestrator_over(
        store.clone(),
        FixtureProvider {
            charges: vec![charge("ch_1", 11500, Some("a@b.com"))],
            fail_listing: false,
        },
        false,
    );

    let stats = orchestrator.run().await.unwrap();
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.resolved, 1);
    assert_eq!(stats.pending, 0);

    let resolved = store.get_registration(reg.id).await.unwrap().unwrap();
    assert_eq!(resolved.payment_status, RegistrationPaymentStatus::Paid);
    assert_eq!(resolved.matched_confidence, Some(100));
    assert_eq!(resolved.provider_payment_id.as_deref(), Some("ch_1"));

    // The customer was created for the charge's receipt email
    let customer_id = resolved.customer_id.expect("customer attached");
    let expected_hash = IdentityCandidate {
        first_name: "Ada".into(),
        last_name: "Lovelace".into(),
        email: "a@b.com".into(),
        ..Default::default()
    }
    .identity_hash();
    let customer = store
        .get_customer_by_hash(&expected_hash)
        .await
        .unwrap()
        .expect("customer exists under the identity hash");
    assert_eq!(customer.id, customer_id);
    assert_eq!(customer.email, "a@b.com");

    // The charge is mirrored and the session closed as completed
    assert!(store.get_payment("ch_1").await.unwrap().is_some());
    let sessions = store.sessions().await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].status, SessionStatus::Completed);
    assert!(sessions[0].ended_at.is_some());
}

#[tokio::test]
async fn second_run_is_incremental_and_idempotent() {
    let store = Arc::new(MemoryStore::new());

    let mut reg = registration(11500);
    reg.confirmation_number = Some("ch_1".into());
    store.upsert_registration(&reg).await.unwrap();

    let charges = vec![charge("ch_1", 11500, Some("a@b.com"))];
    let first = orchestrator_over(
        store.clone(),
        FixtureProvider {
            charges: charges.clone(),
            fail_listing: false,
        },
        false,
    );
    first.run().await.unwrap();

    // Same provider data again; the watermark excludes the old charge
    let second = orchestrator_over(
        store.clone(),
        FixtureProvider {
            charges,
            fail_listing: false,
        },
        false,
    );
    let stats = second.run().await.unwrap();
    assert_eq!(stats.processed, 0);
    assert_eq!(stats.resolved, 0);

    // Still exactly one customer
    let hash = IdentityCandidate {
        first_name: "Ada".into(),
        last_name: "Lovelace".into(),
        email: "a@b.com".into(),
        ..Default::default()
    }
    .identity_hash();
    assert!(store.get_customer_by_hash(&hash).await.unwrap().is_some());
}

#[tokio::test]
async fn test_card_charges_never_enter_the_ledger() {
    let store = Arc::new(MemoryStore::new());

    let mut test_charge = charge("ch_test", 5000, Some("qa@example.com"));
    test_charge.card_last4 = Some("4242".into());

    let orchestrator = orchestrator_over(
        store.clone(),
        FixtureProvider {
            charges: vec![test_charge],
            fail_listing: false,
        },
        false,
    );

    let stats = orchestrator.run().await.unwrap();
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.skipped, 1);
    assert!(store.get_payment("ch_test").await.unwrap().is_none());
    assert_eq!(store.pending_count().await, 0);
}

#[tokio::test]
async fn unmatched_charge_parks_in_pending_queue() {
    let store = Arc::new(MemoryStore::new());

    let orchestrator = orchestrator_over(
        store.clone(),
        FixtureProvider {
            charges: vec![charge("ch_orphan", 9900, Some("nobody@example.com"))],
            fail_listing: false,
        },
        false,
    );

    let stats = orchestrator.run().await.unwrap();
    assert_eq!(stats.resolved, 0);
    assert_eq!(stats.pending, 1);
    assert_eq!(store.pending_count().await, 1);

    // Intake catches up; the next run drains the queue without any new
    // provider data
    let mut reg = registration(9900);
    reg.contact_email = Some("nobody@example.com".into());
    store.upsert_registration(&reg).await.unwrap();

    let next = orchestrator_over(
        store.clone(),
        FixtureProvider {
            charges: vec![],
            fail_listing: false,
        },
        false,
    );
    let stats = next.run().await.unwrap();
    assert_eq!(stats.resolved, 1);
    assert_eq!(store.pending_count().await, 0);

    let resolved = store.get_registration(reg.id).await.unwrap().unwrap();
    assert_eq!(resolved.payment_status, RegistrationPaymentStatus::Paid);
    assert_eq!(resolved.resolved_after_checks, Some(1));
}

#[tokio::test]
async fn matched_package_ticket_is_replaced_by_expansion() {
    let store = Arc::new(MemoryStore::new());

    let dinner = Uuid::new_v4();
    let ceremony = Uuid::new_v4();
    store
        .seed_event_ticket_type(EventTicketType {
            id: dinner,
            name: "Gala Dinner".into(),
            price_minor: 5000,
            is_active: true,
        })
        .await;
    store
        .seed_event_ticket_type(EventTicketType {
            id: ceremony,
            name: "Ceremony".into(),
            price_minor: 3000,
            is_active: true,
        })
        .await;

    let package_id = Uuid::new_v4();
    store
        .seed_package(Package {
            id: package_id,
            name: "Weekend Pass".into(),
            included_items: vec![
                PackageItem {
                    event_ticket_id: dinner,
                    quantity: 1,
                    price_minor: 5000,
                    name: "Gala Dinner".into(),
                },
                PackageItem {
                    event_ticket_id: ceremony,
                    quantity: 1,
                    price_minor: 3000,
                    name: "Ceremony".into(),
                },
            ],
        })
        .await;

    let now = Utc::now();
    let package_ticket = Ticket {
        id: Uuid::new_v4(),
        event_ticket_id: Uuid::new_v4(),
        owner_type: OwnerType::Organisation,
        owner_id: Uuid::new_v4(),
        price_minor: 8000,
        quantity: 1,
        status: TicketStatus::Active,
        is_package: true,
        package_id: Some(package_id),
        parent_package_id: None,
        modification_history: vec![],
        created_at: now,
        updated_at: now,
    };
    store.insert_tickets(&[package_ticket.clone()]).await.unwrap();

    let mut reg = registration(8000);
    reg.provider_payment_id = Some("ch_pkg".into());
    reg.ticket_ids = vec![package_ticket.id];
    store.upsert_registration(&reg).await.unwrap();

    let orchestrator = orchestrator_over(
        store.clone(),
        FixtureProvider {
            charges: vec![charge("ch_pkg", 8000, Some("a@b.com"))],
            fail_listing: false,
        },
        false,
    );

    let stats = orchestrator.run().await.unwrap();
    assert_eq!(stats.resolved, 1);
    assert_eq!(stats.tickets_expanded, 2);

    // Original package ticket is gone, replaced by its expansion set
    assert!(store.get_ticket(package_ticket.id).await.unwrap().is_none());

    let resolved = store.get_registration(reg.id).await.unwrap().unwrap();
    assert_eq!(resolved.ticket_ids.len(), 2);
    assert!(!resolved.ticket_ids.contains(&package_ticket.id));

    let owner = resolved.customer_id.unwrap();
    let active = store.active_tickets_for_owner(owner).await.unwrap();
    assert_eq!(active.len(), 2);
    let mut prices: Vec<i64> = active.iter().map(|t| t.price_minor).collect();
    prices.sort();
    assert_eq!(prices, vec![3000, 5000]);
    for ticket in &active {
        assert_eq!(ticket.parent_package_id, Some(package_ticket.id));
        assert_eq!(ticket.owner_type, OwnerType::Attendee);
    }
    assert!(store.package_tickets_with_children().await.unwrap().is_empty());
}

#[tokio::test]
async fn failing_provider_is_skipped_but_session_completes() {
    let store = Arc::new(MemoryStore::new());

    let orchestrator = orchestrator_over(
        store.clone(),
        FixtureProvider {
            charges: vec![],
            fail_listing: true,
        },
        false,
    );

    let stats = orchestrator.run().await.unwrap();
    assert!(!stats.errors.is_empty());

    let sessions = store.sessions().await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].status, SessionStatus::Completed);
}

#[tokio::test]
async fn requiring_all_providers_fails_the_run() {
    let store = Arc::new(MemoryStore::new());

    let orchestrator = orchestrator_over(
        store.clone(),
        FixtureProvider {
            charges: vec![],
            fail_listing: true,
        },
        true,
    );

    assert!(orchestrator.run().await.is_err());

    // The failed session never advances the watermark
    let sessions = store.sessions().await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].status, SessionStatus::Failed);
    assert_eq!(store.last_successful_sync().await.unwrap(), None);
}
