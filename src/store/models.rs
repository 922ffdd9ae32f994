use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Type;
use std::fmt;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::sync::statistics::RunStatistics;

/// Payment processor a charge originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "payment_source", rename_all = "lowercase")]
pub enum PaymentSource {
    Stripe,
    Square,
}

impl fmt::Display for PaymentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl PaymentSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentSource::Stripe => "stripe",
            PaymentSource::Square => "square",
        }
    }

    pub fn all() -> Vec<PaymentSource> {
        vec![PaymentSource::Stripe, PaymentSource::Square]
    }
}

/// Payment status enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "payment_status", rename_all = "lowercase")]
pub enum PaymentStatus {
    Authorized,
    Captured,
    Refunded,
    Failed,
}

/// Registration payment status enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "registration_payment_status", rename_all = "lowercase")]
pub enum RegistrationPaymentStatus {
    Unpaid,
    Matched,
    Paid,
    Refunded,
}

/// Customer type enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "customer_type", rename_all = "lowercase")]
pub enum CustomerType {
    Person,
    Business,
}

/// Ticket owner type - closed enum
///
/// Stored data from earlier intake versions carries free-form strings
/// ("lodge", "contact", "customer"); those are migrated on read through
/// `from_stored`, never rewritten ad hoc at call sites. The column stays
/// TEXT so legacy rows keep decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OwnerType {
    Attendee,
    Organisation,
}

impl OwnerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerType::Attendee => "attendee",
            OwnerType::Organisation => "organisation",
        }
    }

    /// Migrate a stored owner-type string, accepting legacy values.
    pub fn from_stored(value: &str) -> AppResult<OwnerType> {
        match value {
            "attendee" => Ok(OwnerType::Attendee),
            "organisation" => Ok(OwnerType::Organisation),
            // Legacy intake values
            "lodge" | "organization" => {
                tracing::warn!("Migrating legacy owner type '{}' to organisation", value);
                Ok(OwnerType::Organisation)
            }
            "contact" | "customer" => {
                tracing::warn!("Migrating legacy owner type '{}' to attendee", value);
                Ok(OwnerType::Attendee)
            }
            other => Err(AppError::Validation(format!(
                "Unknown owner type: {}",
                other
            ))),
        }
    }
}

/// Ticket status enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "ticket_status", rename_all = "lowercase")]
pub enum TicketStatus {
    Active,
    Cancelled,
    Refunded,
}

/// Sync session status enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "session_status", rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }
}

/// Payment entity - read-only mirror of a provider charge
///
/// Owned by the provider; immutable once captured, superseded only by
/// refund/void status transitions.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Payment {
    /// Natural key: the provider's charge/payment id (e.g. "ch_...")
    pub provider_payment_id: String,
    pub source: PaymentSource,
    pub amount_minor: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub receipt_email: Option<String>,
    pub card_brand: Option<String>,
    pub card_last4: Option<String>,
    pub refunded_minor: i64,
    pub created_at: DateTime<Utc>,
    pub captured_at: Option<DateTime<Utc>>,
    pub raw: serde_json::Value,
}

impl Payment {
    pub fn is_refunded(&self) -> bool {
        self.status == PaymentStatus::Refunded || self.refunded_minor > 0
    }
}

/// Registration entity - created by the intake collaborator, mutated here
/// only to attach match results and expanded tickets
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Registration {
    pub id: Uuid,
    pub customer_id: Option<Uuid>,
    pub contact_first_name: Option<String>,
    pub contact_last_name: Option<String>,
    pub contact_email: Option<String>,
    pub total_amount_minor: i64,
    pub payment_status: RegistrationPaymentStatus,
    pub provider_payment_id: Option<String>,
    pub confirmation_number: Option<String>,
    pub matched_confidence: Option<i16>,
    pub matched_reason: Option<String>,
    /// Set when the match was made out of the pending queue: how many
    /// checks it took
    pub resolved_after_checks: Option<i32>,
    pub ticket_ids: Vec<Uuid>,
    /// Original intake payload, consumed by the field-mapping table
    pub raw: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Registration {
    pub fn is_matched(&self) -> bool {
        !matches!(self.payment_status, RegistrationPaymentStatus::Unpaid)
    }
}

/// Customer entity - exactly one row per identity hash
///
/// The hash is a pure function of the normalized identity fields; it is
/// derived by the resolver and never independently settable.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Customer {
    pub id: Uuid,
    pub identity_hash: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub business_name: String,
    /// Contact/address fields; carried on the customer but never part of
    /// the identity hash
    pub phone: String,
    pub address: String,
    pub customer_type: CustomerType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Customer {
    /// Merge non-conflicting fields from a later candidate: empty fields
    /// fill in, populated fields are never overwritten.
    pub fn merge_from(&mut self, other: &Customer) -> bool {
        let mut changed = false;
        if self.first_name.is_empty() && !other.first_name.is_empty() {
            self.first_name = other.first_name.clone();
            changed = true;
        }
        if self.last_name.is_empty() && !other.last_name.is_empty() {
            self.last_name = other.last_name.clone();
            changed = true;
        }
        if self.email.is_empty() && !other.email.is_empty() {
            self.email = other.email.clone();
            changed = true;
        }
        if self.business_name.is_empty() && !other.business_name.is_empty() {
            self.business_name = other.business_name.clone();
            changed = true;
        }
        if self.phone.is_empty() && !other.phone.is_empty() {
            self.phone = other.phone.clone();
            changed = true;
        }
        if self.address.is_empty() && !other.address.is_empty() {
            self.address = other.address.clone();
            changed = true;
        }
        changed
    }
}

/// Append-only audit entry on tickets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub detail: String,
}

/// Ticket entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: Uuid,
    pub event_ticket_id: Uuid,
    pub owner_type: OwnerType,
    pub owner_id: Uuid,
    pub price_minor: i64,
    pub quantity: i32,
    pub status: TicketStatus,
    /// True for a bundle line item awaiting expansion. INVARIANT: once
    /// expansion succeeds this ticket is replaced by its expansion set and
    /// must not appear in active listings.
    pub is_package: bool,
    /// Catalog package this ticket sells (set when is_package)
    pub package_id: Option<Uuid>,
    /// Parent package *ticket* id, set only on expanded children
    pub parent_package_id: Option<Uuid>,
    pub modification_history: Vec<AuditEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One item included in a package definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageItem {
    pub event_ticket_id: Uuid,
    pub quantity: i32,
    /// Price recorded at package definition time; fallback only - expansion
    /// re-prices from the live catalog
    pub price_minor: i64,
    pub name: String,
}

/// Package catalog definition - read-only reference data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    pub id: Uuid,
    pub name: String,
    pub included_items: Vec<PackageItem>,
}

/// Event ticket type catalog row, used for fresh price lookup at expansion
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EventTicketType {
    pub id: Uuid,
    pub name: String,
    pub price_minor: i64,
    pub is_active: bool,
}

/// What an unresolved import wraps: a payment waiting for its registration,
/// or a registration waiting for its payment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PendingSubject {
    Payment { payment: Payment },
    Registration { registration: Registration },
}

impl PendingSubject {
    pub fn registration_id(&self) -> Option<Uuid> {
        match self {
            PendingSubject::Registration { registration } => Some(registration.id),
            PendingSubject::Payment { .. } => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            PendingSubject::Payment { payment } => {
                format!("payment {}", payment.provider_payment_id)
            }
            PendingSubject::Registration { registration } => {
                format!("registration {}", registration.id)
            }
        }
    }
}

/// A registration/payment that could not be resolved immediately
///
/// INVARIANT: check_count is monotonically non-decreasing and bounded by
/// max_retries; reaching the bound moves the item to the failed store -
/// never both stores, never neither.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingImport {
    pub id: Uuid,
    pub subject: PendingSubject,
    /// Provider charge id this item is waiting on, when one is known
    pub provider_payment_id: Option<String>,
    pub check_count: i32,
    pub last_check_at: Option<DateTime<Utc>>,
    pub pending_since: DateTime<Utc>,
    pub reason: String,
}

impl PendingImport {
    /// Direct provider lookups are only permitted once local re-matching has
    /// failed twice.
    pub fn may_query_provider(&self) -> bool {
        self.check_count >= 2 && self.provider_payment_id.is_some()
    }
}

/// Terminal store for imports that exhausted their retries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedImport {
    pub id: Uuid,
    pub registration_id: Option<Uuid>,
    pub provider_payment_id: Option<String>,
    /// Original subject payload, kept for replay
    pub subject: serde_json::Value,
    pub history: Vec<String>,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// One discrete batch run's record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSession {
    pub id: Uuid,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    /// Set only on terminal states
    pub ended_at: Option<DateTime<Utc>>,
    pub statistics: RunStatistics,
}

/// Malformed-record capture for replay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportErrorRecord {
    pub id: Uuid,
    pub source: String,
    pub message: String,
    pub payload: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}
