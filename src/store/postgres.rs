use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::AppResult;
use crate::store::models::*;
use crate::store::traits::ReconStore;

/// Postgres-backed store
pub struct PgStore {
    pub pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// Rows with JSONB-typed aggregates need an explicit mapping step; the flat
// entities decode straight into their models.

#[derive(sqlx::FromRow)]
struct TicketRow {
    id: Uuid,
    event_ticket_id: Uuid,
    /// TEXT column: rows written by older intake versions carry legacy
    /// owner-type strings and are migrated on read
    owner_type: String,
    owner_id: Uuid,
    price_minor: i64,
    quantity: i32,
    status: TicketStatus,
    is_package: bool,
    package_id: Option<Uuid>,
    parent_package_id: Option<Uuid>,
    modification_history: Json<Vec<AuditEntry>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TicketRow {
    fn into_ticket(self) -> AppResult<Ticket> {
        Ok(Ticket {
            id: self.id,
            event_ticket_id: self.event_ticket_id,
            owner_type: OwnerType::from_stored(&self.owner_type)?,
            owner_id: self.owner_id,
            price_minor: self.price_minor,
            quantity: self.quantity,
            status: self.status,
            is_package: self.is_package,
            package_id: self.package_id,
            parent_package_id: self.parent_package_id,
            modification_history: self.modification_history.0,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PackageRow {
    id: Uuid,
    name: String,
    included_items: Json<Vec<PackageItem>>,
}

#[derive(sqlx::FromRow)]
struct PendingImportRow {
    id: Uuid,
    subject: Json<PendingSubject>,
    provider_payment_id: Option<String>,
    check_count: i32,
    last_check_at: Option<DateTime<Utc>>,
    pending_since: DateTime<Utc>,
    reason: String,
}

impl PendingImportRow {
    fn into_item(self) -> PendingImport {
        PendingImport {
            id: self.id,
            subject: self.subject.0,
            provider_payment_id: self.provider_payment_id,
            check_count: self.check_count,
            last_check_at: self.last_check_at,
            pending_since: self.pending_since,
            reason: self.reason,
        }
    }
}

#[async_trait]
impl ReconStore for PgStore {
    // ========== PAYMENTS ==========

    async fn upsert_payment(&self, payment: &Payment) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payments (
                provider_payment_id, source, amount_minor, currency, status,
                receipt_email, card_brand, card_last4, refunded_minor,
                created_at, captured_at, raw
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (provider_payment_id)
            DO UPDATE SET
                status = EXCLUDED.status,
                refunded_minor = EXCLUDED.refunded_minor,
                captured_at = EXCLUDED.captured_at,
                receipt_email = EXCLUDED.receipt_email,
                raw = EXCLUDED.raw
            "#,
        )
        .bind(&payment.provider_payment_id)
        .bind(payment.source)
        .bind(payment.amount_minor)
        .bind(&payment.currency)
        .bind(payment.status)
        .bind(&payment.receipt_email)
        .bind(&payment.card_brand)
        .bind(&payment.card_last4)
        .bind(payment.refunded_minor)
        .bind(payment.created_at)
        .bind(payment.captured_at)
        .bind(&payment.raw)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_payment(&self, provider_payment_id: &str) -> AppResult<Option<Payment>> {
        let payment = sqlx::query_as::<_, Payment>(
            r#"
            SELECT provider_payment_id, source, amount_minor, currency, status,
                   receipt_email, card_brand, card_last4, refunded_minor,
                   created_at, captured_at, raw
            FROM payments
            WHERE provider_payment_id = $1
            "#,
        )
        .bind(provider_payment_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(payment)
    }

    // ========== REGISTRATIONS ==========

    async fn unmatched_registrations(&self) -> AppResult<Vec<Registration>> {
        let registrations = sqlx::query_as::<_, Registration>(
            r#"
            SELECT id, customer_id, contact_first_name, contact_last_name,
                   contact_email, total_amount_minor, payment_status,
                   provider_payment_id, confirmation_number, matched_confidence,
                   matched_reason, resolved_after_checks, ticket_ids, raw,
                   created_at, updated_at
            FROM registrations
            WHERE payment_status = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(RegistrationPaymentStatus::Unpaid)
        .fetch_all(&self.pool)
        .await?;

        Ok(registrations)
    }

    async fn get_registration(&self, id: Uuid) -> AppResult<Option<Registration>> {
        let registration = sqlx::query_as::<_, Registration>(
            r#"
            SELECT id, customer_id, contact_first_name, contact_last_name,
                   contact_email, total_amount_minor, payment_status,
                   provider_payment_id, confirmation_number, matched_confidence,
                   matched_reason, resolved_after_checks, ticket_ids, raw,
                   created_at, updated_at
            FROM registrations
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(registration)
    }

    async fn find_registration_by_payment(
        &self,
        provider_payment_id: &str,
    ) -> AppResult<Option<Registration>> {
        let registration = sqlx::query_as::<_, Registration>(
            r#"
            SELECT id, customer_id, contact_first_name, contact_last_name,
                   contact_email, total_amount_minor, payment_status,
                   provider_payment_id, confirmation_number, matched_confidence,
                   matched_reason, resolved_after_checks, ticket_ids, raw,
                   created_at, updated_at
            FROM registrations
            WHERE provider_payment_id = $1
            ORDER BY created_at, id
            LIMIT 1
            "#,
        )
        .bind(provider_payment_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(registration)
    }

    async fn upsert_registration(&self, registration: &Registration) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO registrations (
                id, customer_id, contact_first_name, contact_last_name,
                contact_email, total_amount_minor, payment_status,
                provider_payment_id, confirmation_number, matched_confidence,
                matched_reason, resolved_after_checks, ticket_ids, raw,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (id)
            DO UPDATE SET
                customer_id = EXCLUDED.customer_id,
                payment_status = EXCLUDED.payment_status,
                provider_payment_id = EXCLUDED.provider_payment_id,
                matched_confidence = EXCLUDED.matched_confidence,
                matched_reason = EXCLUDED.matched_reason,
                resolved_after_checks = EXCLUDED.resolved_after_checks,
                ticket_ids = EXCLUDED.ticket_ids,
                updated_at = NOW()
            "#,
        )
        .bind(registration.id)
        .bind(registration.customer_id)
        .bind(&registration.contact_first_name)
        .bind(&registration.contact_last_name)
        .bind(&registration.contact_email)
        .bind(registration.total_amount_minor)
        .bind(registration.payment_status)
        .bind(&registration.provider_payment_id)
        .bind(&registration.confirmation_number)
        .bind(registration.matched_confidence)
        .bind(&registration.matched_reason)
        .bind(registration.resolved_after_checks)
        .bind(&registration.ticket_ids)
        .bind(&registration.raw)
        .bind(registration.created_at)
        .bind(registration.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ========== CUSTOMERS ==========

    async fn get_customer_by_hash(&self, identity_hash: &str) -> AppResult<Option<Customer>> {
        let customer = sqlx::query_as::<_, Customer>(
            r#"
            SELECT id, identity_hash, first_name, last_name, email,
                   business_name, phone, address, customer_type,
                   created_at, updated_at
            FROM customers
            WHERE identity_hash = $1
            "#,
        )
        .bind(identity_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(customer)
    }

    async fn upsert_customer(&self, customer: &Customer) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO customers (
                id, identity_hash, first_name, last_name, email,
                business_name, phone, address, customer_type,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (identity_hash)
            DO UPDATE SET
                first_name = EXCLUDED.first_name,
                last_name = EXCLUDED.last_name,
                email = EXCLUDED.email,
                business_name = EXCLUDED.business_name,
                phone = EXCLUDED.phone,
                address = EXCLUDED.address,
                updated_at = NOW()
            "#,
        )
        .bind(customer.id)
        .bind(&customer.identity_hash)
        .bind(&customer.first_name)
        .bind(&customer.last_name)
        .bind(&customer.email)
        .bind(&customer.business_name)
        .bind(&customer.phone)
        .bind(&customer.address)
        .bind(customer.customer_type)
        .bind(customer.created_at)
        .bind(customer.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ========== TICKETS ==========

    async fn get_ticket(&self, id: Uuid) -> AppResult<Option<Ticket>> {
        let row = sqlx::query_as::<_, TicketRow>(
            r#"
            SELECT id, event_ticket_id, owner_type, owner_id, price_minor,
                   quantity, status, is_package, package_id, parent_package_id,
                   modification_history, created_at, updated_at
            FROM tickets
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TicketRow::into_ticket).transpose()
    }

    async fn insert_tickets(&self, tickets: &[Ticket]) -> AppResult<()> {
        for ticket in tickets {
            sqlx::query(
                r#"
                INSERT INTO tickets (
                    id, event_ticket_id, owner_type, owner_id, price_minor,
                    quantity, status, is_package, package_id, parent_package_id,
                    modification_history, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                ON CONFLICT (id)
                DO UPDATE SET
                    status = EXCLUDED.status,
                    price_minor = EXCLUDED.price_minor,
                    modification_history = EXCLUDED.modification_history,
                    updated_at = NOW()
                "#,
            )
            .bind(ticket.id)
            .bind(ticket.event_ticket_id)
            .bind(ticket.owner_type.as_str())
            .bind(ticket.owner_id)
            .bind(ticket.price_minor)
            .bind(ticket.quantity)
            .bind(ticket.status)
            .bind(ticket.is_package)
            .bind(ticket.package_id)
            .bind(ticket.parent_package_id)
            .bind(Json(&ticket.modification_history))
            .bind(ticket.created_at)
            .bind(ticket.updated_at)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    async fn remove_ticket(&self, id: Uuid) -> AppResult<()> {
        sqlx::query("DELETE FROM tickets WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn active_tickets_for_owner(&self, owner_id: Uuid) -> AppResult<Vec<Ticket>> {
        let rows = sqlx::query_as::<_, TicketRow>(
            r#"
            SELECT id, event_ticket_id, owner_type, owner_id, price_minor,
                   quantity, status, is_package, package_id, parent_package_id,
                   modification_history, created_at, updated_at
            FROM tickets
            WHERE owner_id = $1 AND status = $2 AND is_package = FALSE
            ORDER BY id
            "#,
        )
        .bind(owner_id)
        .bind(TicketStatus::Active)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TicketRow::into_ticket).collect()
    }

    async fn package_tickets_with_children(&self) -> AppResult<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT DISTINCT p.id
            FROM tickets p
            INNER JOIN tickets c ON c.parent_package_id = p.id
            WHERE p.is_package = TRUE
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    // ========== CATALOG ==========

    async fn get_package(&self, id: Uuid) -> AppResult<Option<Package>> {
        let row = sqlx::query_as::<_, PackageRow>(
            "SELECT id, name, included_items FROM packages WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Package {
            id: r.id,
            name: r.name,
            included_items: r.included_items.0,
        }))
    }

    async fn get_event_ticket_type(&self, id: Uuid) -> AppResult<Option<EventTicketType>> {
        let ticket_type = sqlx::query_as::<_, EventTicketType>(
            "SELECT id, name, price_minor, is_active FROM event_ticket_types WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(ticket_type)
    }

    // ========== PENDING / FAILED IMPORTS ==========

    async fn insert_pending(&self, item: &PendingImport) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pending_imports (
                id, subject, provider_payment_id, check_count,
                last_check_at, pending_since, reason
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(item.id)
        .bind(Json(&item.subject))
        .bind(&item.provider_payment_id)
        .bind(item.check_count)
        .bind(item.last_check_at)
        .bind(item.pending_since)
        .bind(&item.reason)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn pending_oldest_first(&self) -> AppResult<Vec<PendingImport>> {
        let rows = sqlx::query_as::<_, PendingImportRow>(
            r#"
            SELECT id, subject, provider_payment_id, check_count,
                   last_check_at, pending_since, reason
            FROM pending_imports
            ORDER BY pending_since, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(PendingImportRow::into_item).collect())
    }

    async fn update_pending(&self, item: &PendingImport) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE pending_imports
            SET check_count = $2, last_check_at = $3, reason = $4
            WHERE id = $1
            "#,
        )
        .bind(item.id)
        .bind(item.check_count)
        .bind(item.last_check_at)
        .bind(&item.reason)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn remove_pending(&self, id: Uuid) -> AppResult<()> {
        sqlx::query("DELETE FROM pending_imports WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn fail_pending(&self, id: Uuid, failed: &FailedImport) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM pending_imports WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO failed_registrations (
                id, registration_id, provider_payment_id, subject, history,
                reason, failed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(failed.id)
        .bind(failed.registration_id)
        .bind(&failed.provider_payment_id)
        .bind(&failed.subject)
        .bind(&failed.history)
        .bind(&failed.reason)
        .bind(failed.failed_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }

    // ========== SYNC SESSIONS ==========

    async fn insert_session(&self, session: &SyncSession) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_sessions (id, status, started_at, ended_at, statistics)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(session.id)
        .bind(session.status)
        .bind(session.started_at)
        .bind(session.ended_at)
        .bind(Json(&session.statistics))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_session(&self, session: &SyncSession) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE sync_sessions
            SET status = $2, ended_at = $3, statistics = $4
            WHERE id = $1
            "#,
        )
        .bind(session.id)
        .bind(session.status)
        .bind(session.ended_at)
        .bind(Json(&session.statistics))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn last_successful_sync(&self) -> AppResult<Option<DateTime<Utc>>> {
        let latest = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT MAX(ended_at) FROM sync_sessions WHERE status = $1",
        )
        .bind(SessionStatus::Completed)
        .fetch_one(&self.pool)
        .await?;

        Ok(latest)
    }

    // ========== DIAGNOSTICS ==========

    async fn record_import_error(&self, record: &ImportErrorRecord) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO import_errors (id, source, message, payload, recorded_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(record.id)
        .bind(&record.source)
        .bind(&record.message)
        .bind(&record.payload)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
