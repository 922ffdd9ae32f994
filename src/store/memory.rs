use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::AppResult;
use crate::store::models::*;
use crate::store::traits::ReconStore;

/// In-memory store - backs tests and doubles as the secondary/staging store
/// for identity resolution. Same surface as the Postgres store.
#[derive(Default)]
pub struct MemoryStore {
    payments: tokio::sync::RwLock<HashMap<String, Payment>>,
    registrations: tokio::sync::RwLock<HashMap<Uuid, Registration>>,
    customers: tokio::sync::RwLock<HashMap<String, Customer>>,
    tickets: tokio::sync::RwLock<HashMap<Uuid, Ticket>>,
    packages: tokio::sync::RwLock<HashMap<Uuid, Package>>,
    event_ticket_types: tokio::sync::RwLock<HashMap<Uuid, EventTicketType>>,
    pending: tokio::sync::RwLock<HashMap<Uuid, PendingImport>>,
    failed: tokio::sync::RwLock<HashMap<Uuid, FailedImport>>,
    sessions: tokio::sync::RwLock<HashMap<Uuid, SyncSession>>,
    import_errors: tokio::sync::RwLock<Vec<ImportErrorRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // Catalog data is read-only to the core; tests seed it directly.

    pub async fn seed_package(&self, package: Package) {
        self.packages.write().await.insert(package.id, package);
    }

    pub async fn seed_event_ticket_type(&self, ticket_type: EventTicketType) {
        self.event_ticket_types
            .write()
            .await
            .insert(ticket_type.id, ticket_type);
    }

    pub async fn failed_imports(&self) -> Vec<FailedImport> {
        self.failed.read().await.values().cloned().collect()
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    pub async fn import_errors(&self) -> Vec<ImportErrorRecord> {
        self.import_errors.read().await.clone()
    }

    pub async fn sessions(&self) -> Vec<SyncSession> {
        self.sessions.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl ReconStore for MemoryStore {
    async fn upsert_payment(&self, payment: &Payment) -> AppResult<()> {
        self.payments
            .write()
            .await
            .insert(payment.provider_payment_id.clone(), payment.clone());
        Ok(())
    }

    async fn get_payment(&self, provider_payment_id: &str) -> AppResult<Option<Payment>> {
        Ok(self.payments.read().await.get(provider_payment_id).cloned())
    }

    async fn unmatched_registrations(&self) -> AppResult<Vec<Registration>> {
        let mut result: Vec<Registration> = self
            .registrations
            .read()
            .await
            .values()
            .filter(|r| !r.is_matched())
            .cloned()
            .collect();
        result.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(result)
    }

    async fn get_registration(&self, id: Uuid) -> AppResult<Option<Registration>> {
        Ok(self.registrations.read().await.get(&id).cloned())
    }

    async fn find_registration_by_payment(
        &self,
        provider_payment_id: &str,
    ) -> AppResult<Option<Registration>> {
        Ok(self
            .registrations
            .read()
            .await
            .values()
            .find(|r| r.provider_payment_id.as_deref() == Some(provider_payment_id))
            .cloned())
    }

    async fn upsert_registration(&self, registration: &Registration) -> AppResult<()> {
        self.registrations
            .write()
            .await
            .insert(registration.id, registration.clone());
        Ok(())
    }

    async fn get_customer_by_hash(&self, identity_hash: &str) -> AppResult<Option<Customer>> {
        Ok(self.customers.read().await.get(identity_hash).cloned())
    }

    async fn upsert_customer(&self, customer: &Customer) -> AppResult<()> {
        self.customers
            .write()
            .await
            .insert(customer.identity_hash.clone(), customer.clone());
        Ok(())
    }

    async fn get_ticket(&self, id: Uuid) -> AppResult<Option<Ticket>> {
        Ok(self.tickets.read().await.get(&id).cloned())
    }

    async fn insert_tickets(&self, tickets: &[Ticket]) -> AppResult<()> {
        let mut map = self.tickets.write().await;
        for ticket in tickets {
            map.insert(ticket.id, ticket.clone());
        }
        Ok(())
    }

    async fn remove_ticket(&self, id: Uuid) -> AppResult<()> {
        self.tickets.write().await.remove(&id);
        Ok(())
    }

    async fn active_tickets_for_owner(&self, owner_id: Uuid) -> AppResult<Vec<Ticket>> {
        let mut result: Vec<Ticket> = self
            .tickets
            .read()
            .await
            .values()
            .filter(|t| t.owner_id == owner_id && t.status == TicketStatus::Active && !t.is_package)
            .cloned()
            .collect();
        result.sort_by_key(|t| t.id);
        Ok(result)
    }

    async fn package_tickets_with_children(&self) -> AppResult<Vec<Uuid>> {
        let tickets = self.tickets.read().await;
        let remnants = tickets
            .values()
            .filter(|t| t.is_package)
            .filter(|t| {
                tickets
                    .values()
                    .any(|child| child.parent_package_id == Some(t.id))
            })
            .map(|t| t.id)
            .collect();
        Ok(remnants)
    }

    async fn get_package(&self, id: Uuid) -> AppResult<Option<Package>> {
        Ok(self.packages.read().await.get(&id).cloned())
    }

    async fn get_event_ticket_type(&self, id: Uuid) -> AppResult<Option<EventTicketType>> {
        Ok(self.event_ticket_types.read().await.get(&id).cloned())
    }

    async fn insert_pending(&self, item: &PendingImport) -> AppResult<()> {
        self.pending.write().await.insert(item.id, item.clone());
        Ok(())
    }

    async fn pending_oldest_first(&self) -> AppResult<Vec<PendingImport>> {
        let mut result: Vec<PendingImport> =
            self.pending.read().await.values().cloned().collect();
        result.sort_by(|a, b| (a.pending_since, a.id).cmp(&(b.pending_since, b.id)));
        Ok(result)
    }

    async fn update_pending(&self, item: &PendingImport) -> AppResult<()> {
        self.pending.write().await.insert(item.id, item.clone());
        Ok(())
    }

    async fn remove_pending(&self, id: Uuid) -> AppResult<()> {
        self.pending.write().await.remove(&id);
        Ok(())
    }

    async fn fail_pending(&self, id: Uuid, failed: &FailedImport) -> AppResult<()> {
        // Hold both collection locks for the swap
        let mut pending = self.pending.write().await;
        let mut failed_map = self.failed.write().await;
        pending.remove(&id);
        failed_map.insert(failed.id, failed.clone());
        Ok(())
    }

    async fn insert_session(&self, session: &SyncSession) -> AppResult<()> {
        self.sessions
            .write()
            .await
            .insert(session.id, session.clone());
        Ok(())
    }

    async fn update_session(&self, session: &SyncSession) -> AppResult<()> {
        self.sessions
            .write()
            .await
            .insert(session.id, session.clone());
        Ok(())
    }

    async fn last_successful_sync(&self) -> AppResult<Option<DateTime<Utc>>> {
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.status == SessionStatus::Completed)
            .filter_map(|s| s.ended_at)
            .max())
    }

    async fn record_import_error(&self, record: &ImportErrorRecord) -> AppResult<()> {
        self.import_errors.write().await.push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::statistics::RunStatistics;
    use serde_json::json;

    fn registration(created_offset_secs: i64) -> Registration {
        let now = Utc::now();
        Registration {
            id: Uuid::new_v4(),
            customer_id: None,
            contact_first_name: None,
            contact_last_name: None,
            contact_email: None,
            total_amount_minor: 1000,
            payment_status: RegistrationPaymentStatus::Unpaid,
            provider_payment_id: None,
            confirmation_number: None,
            matched_confidence: None,
            matched_reason: None,
            resolved_after_checks: None,
            ticket_ids: vec![],
            raw: json!({}),
            created_at: now + chrono::Duration::seconds(created_offset_secs),
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_unmatched_registrations_ordered_by_creation() {
        let store = MemoryStore::new();
        let older = registration(-60);
        let newer = registration(0);
        store.upsert_registration(&newer).await.unwrap();
        store.upsert_registration(&older).await.unwrap();

        let unmatched = store.unmatched_registrations().await.unwrap();
        assert_eq!(unmatched.len(), 2);
        assert_eq!(unmatched[0].id, older.id);
    }

    #[tokio::test]
    async fn test_fail_pending_moves_item_exactly_once() {
        let store = MemoryStore::new();
        let reg = registration(0);
        let item = PendingImport {
            id: Uuid::new_v4(),
            subject: PendingSubject::Registration {
                registration: reg.clone(),
            },
            provider_payment_id: None,
            check_count: 5,
            last_check_at: None,
            pending_since: Utc::now(),
            reason: "no match".into(),
        };
        store.insert_pending(&item).await.unwrap();

        let failed = FailedImport {
            id: Uuid::new_v4(),
            registration_id: Some(reg.id),
            provider_payment_id: None,
            subject: json!({}),
            history: vec!["no match".into()],
            reason: "retries exhausted".into(),
            failed_at: Utc::now(),
        };
        store.fail_pending(item.id, &failed).await.unwrap();

        assert_eq!(store.pending_count().await, 0);
        assert_eq!(store.failed_imports().await.len(), 1);
    }

    #[tokio::test]
    async fn test_last_successful_sync_ignores_failed_and_running() {
        let store = MemoryStore::new();
        let t1 = Utc::now() - chrono::Duration::hours(2);
        let t2 = Utc::now() - chrono::Duration::hours(1);

        let completed = SyncSession {
            id: Uuid::new_v4(),
            status: SessionStatus::Completed,
            started_at: t1 - chrono::Duration::minutes(5),
            ended_at: Some(t1),
            statistics: RunStatistics::default(),
        };
        let failed = SyncSession {
            id: Uuid::new_v4(),
            status: SessionStatus::Failed,
            started_at: t2 - chrono::Duration::minutes(5),
            ended_at: Some(t2),
            statistics: RunStatistics::default(),
        };
        let running = SyncSession {
            id: Uuid::new_v4(),
            status: SessionStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            statistics: RunStatistics::default(),
        };
        store.insert_session(&completed).await.unwrap();
        store.insert_session(&failed).await.unwrap();
        store.insert_session(&running).await.unwrap();

        assert_eq!(store.last_successful_sync().await.unwrap(), Some(t1));
    }
}
