use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppResult;
use crate::store::models::*;

/// Repository surface over the document store.
///
/// Consistency expectations: the store guarantees per-document atomicity
/// only. There is no cross-collection transaction; read-after-write is not
/// guaranteed across collections. Every write is an idempotent upsert keyed
/// by a natural key (provider payment id, registration id, identity hash,
/// deterministic ticket id) so that re-running a step converges rather than
/// duplicates. The one place a backend may do better is `fail_pending`,
/// which removes from pendingImports and inserts into failedRegistrations
/// as atomically as it can - callers must still not assume more than
/// per-document atomicity.
#[async_trait]
pub trait ReconStore: Send + Sync {
    // ========== PAYMENTS ==========

    async fn upsert_payment(&self, payment: &Payment) -> AppResult<()>;

    async fn get_payment(&self, provider_payment_id: &str) -> AppResult<Option<Payment>>;

    // ========== REGISTRATIONS ==========

    /// Registrations not yet matched to a payment, oldest first (creation
    /// order is the "document order" ambiguous matches are broken by)
    async fn unmatched_registrations(&self) -> AppResult<Vec<Registration>>;

    async fn get_registration(&self, id: Uuid) -> AppResult<Option<Registration>>;

    /// The registration already attached to a provider payment id, if any -
    /// this is what makes re-processing a mirrored charge idempotent
    async fn find_registration_by_payment(
        &self,
        provider_payment_id: &str,
    ) -> AppResult<Option<Registration>>;

    async fn upsert_registration(&self, registration: &Registration) -> AppResult<()>;

    // ========== CUSTOMERS ==========

    async fn get_customer_by_hash(&self, identity_hash: &str) -> AppResult<Option<Customer>>;

    async fn upsert_customer(&self, customer: &Customer) -> AppResult<()>;

    // ========== TICKETS ==========

    async fn get_ticket(&self, id: Uuid) -> AppResult<Option<Ticket>>;

    /// Idempotent: tickets are keyed by their (deterministic) id
    async fn insert_tickets(&self, tickets: &[Ticket]) -> AppResult<()>;

    async fn remove_ticket(&self, id: Uuid) -> AppResult<()>;

    async fn active_tickets_for_owner(&self, owner_id: Uuid) -> AppResult<Vec<Ticket>>;

    /// Corrective-pass query: package tickets still present alongside
    /// expanded children that reference them (the narrow crash window
    /// between the two replacement writes)
    async fn package_tickets_with_children(&self) -> AppResult<Vec<Uuid>>;

    // ========== CATALOG (read-only reference data) ==========

    async fn get_package(&self, id: Uuid) -> AppResult<Option<Package>>;

    async fn get_event_ticket_type(&self, id: Uuid) -> AppResult<Option<EventTicketType>>;

    // ========== PENDING / FAILED IMPORTS ==========

    async fn insert_pending(&self, item: &PendingImport) -> AppResult<()>;

    /// Ordered oldest-`pending_since`-first so long-stuck items get priority
    /// for the per-run provider lookup budget
    async fn pending_oldest_first(&self) -> AppResult<Vec<PendingImport>>;

    async fn update_pending(&self, item: &PendingImport) -> AppResult<()>;

    async fn remove_pending(&self, id: Uuid) -> AppResult<()>;

    /// Terminal transition: remove from pendingImports, insert into
    /// failedRegistrations. Never both present, never neither, to the extent
    /// the backend can guarantee it.
    async fn fail_pending(&self, id: Uuid, failed: &FailedImport) -> AppResult<()>;

    // ========== SYNC SESSIONS ==========

    async fn insert_session(&self, session: &SyncSession) -> AppResult<()>;

    async fn update_session(&self, session: &SyncSession) -> AppResult<()>;

    /// Max ended_at among Completed sessions; Running/Failed rows are
    /// ignored even when more recent. None = no completed run yet = full
    /// historical sync.
    async fn last_successful_sync(&self) -> AppResult<Option<DateTime<Utc>>>;

    // ========== DIAGNOSTICS ==========

    async fn record_import_error(&self, record: &ImportErrorRecord) -> AppResult<()>;
}
