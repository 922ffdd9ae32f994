use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::AppResult;
use crate::reconcile::context::RunContext;
use crate::store::models::{AuditEntry, OwnerType, Ticket};
use crate::store::ReconStore;

/// Converts a bundle/package ticket line into its individual ticket records.
///
/// Fails soft: every data problem (missing package id, unknown package,
/// empty package) yields an empty result plus a diagnostic in the run
/// context - one bad package must not abort the batch. Only store errors
/// propagate.
pub struct PackageExpander {
    store: Arc<dyn ReconStore>,
}

impl PackageExpander {
    pub fn new(store: Arc<dyn ReconStore>) -> Self {
        Self { store }
    }

    /// Deterministic child ticket id from (parent ticket id, item index) so
    /// re-running expansion on the same package ticket is idempotent at the
    /// ticket-id level.
    fn child_ticket_id(parent_ticket_id: Uuid, index: usize) -> Uuid {
        Uuid::new_v5(
            &Uuid::NAMESPACE_OID,
            format!("{}:{}", parent_ticket_id, index).as_bytes(),
        )
    }

    pub async fn expand(
        &self,
        ctx: &mut RunContext,
        package_ticket: &Ticket,
        owner_id: Uuid,
    ) -> AppResult<Vec<Ticket>> {
        let package_id = match package_ticket.package_id {
            Some(id) => id,
            None => {
                ctx.diagnostic(format!(
                    "Ticket {} is flagged as a package but carries no package id",
                    package_ticket.id
                ));
                return Ok(vec![]);
            }
        };

        let package = match self.store.get_package(package_id).await? {
            Some(package) => package,
            None => {
                warn!(package_id = %package_id, "Package not found in catalog");
                ctx.diagnostic(format!("Package not found: {}", package_id));
                return Ok(vec![]);
            }
        };

        if package.included_items.is_empty() {
            ctx.diagnostic(format!(
                "Package {} ({}) defines no included items",
                package.id, package.name
            ));
            return Ok(vec![]);
        }

        let now = Utc::now();
        let mut tickets = Vec::with_capacity(package.included_items.len());

        for (index, item) in package.included_items.iter().enumerate() {
            // Fresh catalog lookup: catalog prices may have moved since the
            // package was defined. The price recorded on the item is only a
            // fallback for retired ticket types.
            let (price_minor, name) = match self
                .store
                .get_event_ticket_type(item.event_ticket_id)
                .await?
            {
                Some(ticket_type) => (ticket_type.price_minor, ticket_type.name),
                None => {
                    ctx.diagnostic(format!(
                        "Event ticket type {} no longer in catalog; using package item price",
                        item.event_ticket_id
                    ));
                    (item.price_minor, item.name.clone())
                }
            };

            tickets.push(Ticket {
                id: Self::child_ticket_id(package_ticket.id, index),
                event_ticket_id: item.event_ticket_id,
                // Package-level ownership is never retained on expanded
                // tickets: they belong to the individual attendee.
                owner_type: OwnerType::Attendee,
                owner_id,
                price_minor,
                quantity: item.quantity,
                status: package_ticket.status,
                is_package: false,
                package_id: None,
                parent_package_id: Some(package_ticket.id),
                modification_history: vec![AuditEntry {
                    at: now,
                    actor: "system".to_string(),
                    action: "package_expansion".to_string(),
                    detail: format!("Expanded from package {} ({})", package.id, name),
                }],
                created_at: now,
                updated_at: now,
            });
        }

        debug!(
            package_ticket = %package_ticket.id,
            count = tickets.len(),
            "Expanded package ticket"
        );
        ctx.stats.tickets_expanded += tickets.len() as u64;
        Ok(tickets)
    }
}
